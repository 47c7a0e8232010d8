use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;

use crate::connection_manager::{AutoConnect, ConnectionBackend, ConnectionManager};

/// When the deferred auto-connect may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupTrigger {
    /// As soon as the registry reports hydration complete.
    AfterHydration,
    /// Fixed deferral for hosts that hydrate without signalling it.
    AfterDelay(Duration),
}

pub async fn run_auto_connect<B: ConnectionBackend>(
    manager: &ConnectionManager<B>,
    trigger: StartupTrigger,
) -> AutoConnect {
    match trigger {
        StartupTrigger::AfterHydration => manager.registry().wait_hydrated().await,
        StartupTrigger::AfterDelay(delay) => tokio::time::sleep(delay).await,
    }
    let outcome = manager.initialize().await;
    debug!(?outcome, "auto-connect finished");
    outcome
}

/// Runs auto-connect in the background so startup never waits on it. The
/// handle resolves to the decision taken; it never carries an error.
pub fn spawn_auto_connect<B>(
    manager: Arc<ConnectionManager<B>>,
    trigger: StartupTrigger,
) -> JoinHandle<AutoConnect>
where
    B: ConnectionBackend + 'static,
{
    tokio::spawn(async move { run_auto_connect(&manager, trigger).await })
}
