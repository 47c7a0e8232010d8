use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::credentials::{CredentialError, CredentialResolver, Secret};
use crate::registry::{Connection, ConnectionRegistry, RegistryError};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct BackendError {
    message: String,
}

impl BackendError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait ConnectionBackend: Send + Sync {
    type Session: Send;

    async fn connect(
        &self,
        connection: &Connection,
        secret: &Secret,
    ) -> Result<Self::Session, BackendError>;
    async fn ping(&self, session: &mut Self::Session) -> Result<(), BackendError>;
    async fn disconnect(&self, session: Self::Session) -> Result<(), BackendError>;
}

/// Failure of a single connect attempt. Cloned to every caller that joined
/// the attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectError {
    #[error("connection `{0}` is not registered")]
    UnknownConnection(String),
    #[error(transparent)]
    CredentialsUnavailable(#[from] CredentialError),
    #[error("connection `{connection_id}` is unreachable: {source}")]
    Unreachable {
        connection_id: String,
        #[source]
        source: BackendError,
    },
}

impl ConnectError {
    fn unreachable(connection_id: &str, source: BackendError) -> Self {
        Self::Unreachable {
            connection_id: connection_id.to_string(),
            source,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConnectionManagerError {
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error("connection backend failed: {0}")]
    Backend(#[source] BackendError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// This call opened the session.
    Established { latency: Duration },
    /// Another caller's attempt was already in flight and succeeded.
    Joined,
    AlreadyConnected,
}

/// What `initialize` decided. Informational only; it never carries an error
/// back to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AutoConnect {
    Disabled,
    NoLastActive,
    UnknownConnection(String),
    AlreadyConnected,
    Connected(ConnectOutcome),
    Failed(ConnectError),
}

type AttemptResult = Option<Result<(), ConnectError>>;

enum Attempt {
    Leader(watch::Sender<AttemptResult>),
    Follower(watch::Receiver<AttemptResult>),
}

struct InFlightGuard<'a> {
    in_flight: &'a Mutex<HashMap<String, watch::Receiver<AttemptResult>>>,
    connection_id: &'a str,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.in_flight.lock().remove(self.connection_id);
    }
}

pub struct ConnectionManager<B: ConnectionBackend> {
    backend: B,
    credentials: Arc<dyn CredentialResolver>,
    registry: Arc<ConnectionRegistry>,
    sessions: Mutex<HashMap<String, B::Session>>,
    in_flight: Mutex<HashMap<String, watch::Receiver<AttemptResult>>>,
}

impl<B: ConnectionBackend> std::fmt::Debug for ConnectionManager<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sessions = self.sessions.lock().keys().cloned().collect::<Vec<_>>();
        let in_flight = self.in_flight.lock().keys().cloned().collect::<Vec<_>>();
        f.debug_struct("ConnectionManager")
            .field("sessions", &sessions)
            .field("in_flight", &in_flight)
            .finish_non_exhaustive()
    }
}

impl<B: ConnectionBackend> ConnectionManager<B> {
    #[must_use]
    pub fn new(
        backend: B,
        credentials: Arc<dyn CredentialResolver>,
        registry: Arc<ConnectionRegistry>,
    ) -> Self {
        Self {
            backend,
            credentials,
            registry,
            sessions: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    #[must_use]
    pub fn is_connected(&self, connection_id: &str) -> bool {
        self.sessions.lock().contains_key(connection_id)
    }

    #[must_use]
    pub fn is_connecting(&self, connection_id: &str) -> bool {
        self.in_flight.lock().contains_key(connection_id)
    }

    /// Opens a session for `connection_id`, or attaches to the attempt that is
    /// already running for it. Never retries on failure.
    pub async fn connect(&self, connection_id: &str) -> Result<ConnectOutcome, ConnectError> {
        let attempt = {
            let mut in_flight = self.in_flight.lock();
            if let Some(receiver) = in_flight.get(connection_id) {
                Attempt::Follower(receiver.clone())
            } else if self.sessions.lock().contains_key(connection_id) {
                debug!(connection_id, "connect skipped, session already open");
                return Ok(ConnectOutcome::AlreadyConnected);
            } else {
                let (sender, receiver) = watch::channel(None);
                in_flight.insert(connection_id.to_string(), receiver);
                Attempt::Leader(sender)
            }
        };

        match attempt {
            Attempt::Follower(receiver) => Self::join_attempt(connection_id, receiver).await,
            Attempt::Leader(sender) => {
                let _guard = InFlightGuard {
                    in_flight: &self.in_flight,
                    connection_id,
                };
                let result = self.establish(connection_id).await;
                sender.send_replace(Some(result.clone().map(|_| ())));
                result.map(|latency| ConnectOutcome::Established { latency })
            }
        }
    }

    async fn join_attempt(
        connection_id: &str,
        mut receiver: watch::Receiver<AttemptResult>,
    ) -> Result<ConnectOutcome, ConnectError> {
        debug!(connection_id, "joining in-flight connect attempt");
        let settled = receiver
            .wait_for(Option::is_some)
            .await
            .map(|settled| (*settled).clone())
            .ok()
            .flatten();
        match settled {
            Some(Ok(())) => Ok(ConnectOutcome::Joined),
            Some(Err(error)) => Err(error),
            None => Err(ConnectError::unreachable(
                connection_id,
                BackendError::new("connect attempt was abandoned"),
            )),
        }
    }

    async fn establish(&self, connection_id: &str) -> Result<Duration, ConnectError> {
        let connection = self
            .registry
            .find(connection_id)
            .ok_or_else(|| ConnectError::UnknownConnection(connection_id.to_string()))?;

        let started_at = Instant::now();
        let secret = self.credentials.resolve(connection_id).await?;
        let mut session = self
            .backend
            .connect(&connection, &secret)
            .await
            .map_err(|source| ConnectError::unreachable(connection_id, source))?;
        if let Err(source) = self.backend.ping(&mut session).await {
            if let Err(error) = self.backend.disconnect(session).await {
                debug!(connection_id, %error, "failed to close unhealthy session");
            }
            return Err(ConnectError::unreachable(connection_id, source));
        }
        let latency = started_at.elapsed();

        let registered = match self
            .registry
            .set_connected(connection_id, true, Some(Utc::now()))
            .await
        {
            // The connection may have been removed while the write was pending.
            Ok(found) => found && self.registry.find(connection_id).is_some(),
            Err(error) => {
                warn!(connection_id, %error, "failed to persist connected status");
                self.registry.find(connection_id).is_some()
            }
        };
        if !registered {
            if let Err(error) = self.backend.disconnect(session).await {
                debug!(connection_id, %error, "failed to close orphaned session");
            }
            return Err(ConnectError::UnknownConnection(connection_id.to_string()));
        }
        self.sessions.lock().insert(connection_id.to_string(), session);

        if let Err(error) = self
            .registry
            .set_last_active(Some(connection_id.to_string()))
            .await
        {
            warn!(connection_id, %error, "failed to persist last active connection");
        }

        info!(connection_id, ?latency, "connection established");
        Ok(latency)
    }

    /// Closes the session if one is open. A connect attempt still running for
    /// the id is allowed to settle first, so the session it opens is closed
    /// too. The connection stays the last active one.
    pub async fn disconnect(&self, connection_id: &str) -> Result<(), ConnectionManagerError> {
        self.settle_in_flight(connection_id).await;
        let session = self.sessions.lock().remove(connection_id);
        let Some(session) = session else {
            return Ok(());
        };

        let closed = self.backend.disconnect(session).await;
        self.registry
            .set_connected(connection_id, false, None)
            .await?;
        closed.map_err(ConnectionManagerError::Backend)?;

        info!(connection_id, "connection closed");
        Ok(())
    }

    pub async fn disconnect_all(&self) {
        let mut connection_ids = self.sessions.lock().keys().cloned().collect::<Vec<_>>();
        connection_ids.extend(self.in_flight.lock().keys().cloned());
        connection_ids.sort();
        connection_ids.dedup();
        for connection_id in connection_ids {
            if let Err(error) = self.disconnect(&connection_id).await {
                warn!(%connection_id, %error, "failed to disconnect");
            }
        }
    }

    async fn settle_in_flight(&self, connection_id: &str) {
        let receiver = self.in_flight.lock().get(connection_id).cloned();
        let Some(mut receiver) = receiver else {
            return;
        };
        debug!(connection_id, "waiting for in-flight connect to settle");
        if receiver.wait_for(Option::is_some).await.is_err() {
            debug!(connection_id, "in-flight connect was abandoned");
        }
    }

    pub async fn set_active_connection(
        &self,
        connection_id: Option<&str>,
    ) -> Result<(), ConnectionManagerError> {
        self.registry
            .set_last_active(connection_id.map(str::to_string))
            .await?;
        Ok(())
    }

    /// Takes effect on the next `initialize`.
    pub async fn set_auto_connect(&self, enabled: bool) -> Result<(), ConnectionManagerError> {
        self.registry.set_auto_connect(enabled).await?;
        Ok(())
    }

    pub async fn add_connection(&self, connection: Connection) -> Result<(), ConnectionManagerError> {
        self.registry.add(connection).await?;
        Ok(())
    }

    pub async fn remove_connection(
        &self,
        connection_id: &str,
    ) -> Result<Option<Connection>, ConnectionManagerError> {
        if let Err(error) = self.disconnect(connection_id).await {
            warn!(connection_id, %error, "failed to close session of removed connection");
        }
        Ok(self.registry.remove(connection_id).await?)
    }

    /// Startup auto-connect to the last active connection. Fail-open: every
    /// failure is logged and reported in the returned value only.
    pub async fn initialize(&self) -> AutoConnect {
        if !self.registry.auto_connect_enabled() {
            debug!("auto-connect disabled");
            return AutoConnect::Disabled;
        }
        let Some(connection_id) = self.registry.last_active_connection_id() else {
            debug!("auto-connect skipped, no last active connection");
            return AutoConnect::NoLastActive;
        };
        let Some(connection) = self.registry.find(&connection_id) else {
            debug!(connection_id, "auto-connect skipped, last active connection is gone");
            return AutoConnect::UnknownConnection(connection_id);
        };
        if connection.is_connected {
            debug!(connection_id, "auto-connect skipped, already connected");
            return AutoConnect::AlreadyConnected;
        }

        match self.connect(&connection_id).await {
            Ok(outcome) => AutoConnect::Connected(outcome),
            Err(error) => {
                warn!(connection_id, %error, "auto-connect failed");
                AutoConnect::Failed(error)
            }
        }
    }
}
