use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::store::{StateStore, StoreError};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TlsMode {
    Disabled,
    #[default]
    Prefer,
    Require,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub is_connected: bool,
    #[serde(default)]
    pub last_used_at: Option<DateTime<Utc>>,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub tls_mode: TlsMode,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3306
}

fn default_user() -> String {
    "root".to_string()
}

impl Connection {
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            is_connected: false,
            last_used_at: None,
            host: default_host(),
            port: default_port(),
            user: default_user(),
            database: None,
            tls_mode: TlsMode::Prefer,
        }
    }
}

fn default_auto_connect() -> bool {
    true
}

/// Persisted shape of the registry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RegistryDocument {
    #[serde(default)]
    pub connections: Vec<Connection>,
    #[serde(default)]
    pub last_active_connection_id: Option<String>,
    #[serde(default = "default_auto_connect")]
    pub auto_connect_enabled: bool,
}

impl Default for RegistryDocument {
    fn default() -> Self {
        Self {
            connections: Vec::new(),
            last_active_connection_id: None,
            auto_connect_enabled: true,
        }
    }
}

impl RegistryDocument {
    pub fn from_json(raw: &str) -> Result<Self, RegistryError> {
        serde_json::from_str(raw).map_err(|source| RegistryError::Parse { source })
    }

    pub fn to_json(&self) -> Result<String, RegistryError> {
        serde_json::to_string_pretty(self).map_err(|source| RegistryError::Serialize { source })
    }

    fn normalize(&mut self) {
        let mut seen = HashSet::new();
        self.connections
            .retain(|connection| seen.insert(connection.id.clone()));
        for connection in &mut self.connections {
            connection.is_connected = false;
        }
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("connection id must not be blank")]
    BlankId,
    #[error("connection `{0}` already exists")]
    DuplicateId(String),
    #[error("connection registry is not hydrated yet")]
    NotHydrated,
    #[error("failed to parse registry state: {source}")]
    Parse {
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to serialize registry state: {source}")]
    Serialize {
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// In-memory mirror of the connection catalog, written through to a
/// [`StateStore`] on every mutation. Reads never touch the store.
pub struct ConnectionRegistry {
    store: Arc<dyn StateStore>,
    state: Mutex<RegistryDocument>,
    write_gate: tokio::sync::Mutex<()>,
    hydrated: watch::Sender<bool>,
    clear_last_active_on_remove: bool,
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("state", &*self.state.lock())
            .field("hydrated", &*self.hydrated.borrow())
            .finish_non_exhaustive()
    }
}

impl ConnectionRegistry {
    #[must_use]
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        let (hydrated, _) = watch::channel(false);
        Self {
            store,
            state: Mutex::new(RegistryDocument::default()),
            write_gate: tokio::sync::Mutex::new(()),
            hydrated,
            clear_last_active_on_remove: false,
        }
    }

    #[must_use]
    pub fn with_clear_last_active_on_remove(mut self, enabled: bool) -> Self {
        self.clear_last_active_on_remove = enabled;
        self
    }

    /// Loads persisted state into the mirror. Hydration counts as complete
    /// even when loading fails, so startup can proceed on an empty catalog.
    pub async fn hydrate(&self) -> Result<(), RegistryError> {
        let loaded = self.load_document().await;
        if let Ok(document) = &loaded {
            info!(
                connections = document.connections.len(),
                last_active = ?document.last_active_connection_id,
                auto_connect = document.auto_connect_enabled,
                "connection registry hydrated"
            );
            *self.state.lock() = document.clone();
        }
        self.mark_hydrated();
        loaded.map(|_| ())
    }

    async fn load_document(&self) -> Result<RegistryDocument, RegistryError> {
        let Some(raw) = self.store.load().await? else {
            return Ok(RegistryDocument::default());
        };
        let mut document = RegistryDocument::from_json(&raw)?;
        document.normalize();
        Ok(document)
    }

    pub fn mark_hydrated(&self) {
        self.hydrated.send_replace(true);
    }

    #[must_use]
    pub fn is_hydrated(&self) -> bool {
        *self.hydrated.borrow()
    }

    pub async fn wait_hydrated(&self) {
        let mut receiver = self.hydrated.subscribe();
        // The sender lives as long as `self`, so the channel cannot close here.
        let _ = receiver.wait_for(|hydrated| *hydrated).await;
    }

    #[must_use]
    pub fn list(&self) -> Vec<Connection> {
        self.state.lock().connections.clone()
    }

    #[must_use]
    pub fn find(&self, id: &str) -> Option<Connection> {
        self.state
            .lock()
            .connections
            .iter()
            .find(|connection| connection.id == id)
            .cloned()
    }

    #[must_use]
    pub fn last_active_connection_id(&self) -> Option<String> {
        self.state.lock().last_active_connection_id.clone()
    }

    #[must_use]
    pub fn auto_connect_enabled(&self) -> bool {
        self.state.lock().auto_connect_enabled
    }

    #[must_use]
    pub fn snapshot(&self) -> RegistryDocument {
        self.state.lock().clone()
    }

    /// Mutating before hydration would persist over state not yet loaded.
    fn ensure_hydrated(&self) -> Result<(), RegistryError> {
        if self.is_hydrated() {
            Ok(())
        } else {
            Err(RegistryError::NotHydrated)
        }
    }

    pub(crate) async fn add(&self, connection: Connection) -> Result<(), RegistryError> {
        self.ensure_hydrated()?;
        if connection.id.trim().is_empty() {
            return Err(RegistryError::BlankId);
        }
        {
            let mut state = self.state.lock();
            if state
                .connections
                .iter()
                .any(|existing| existing.id == connection.id)
            {
                return Err(RegistryError::DuplicateId(connection.id));
            }
            let mut connection = connection;
            connection.is_connected = false;
            state.connections.push(connection);
        }
        self.persist().await
    }

    pub(crate) async fn remove(&self, id: &str) -> Result<Option<Connection>, RegistryError> {
        self.ensure_hydrated()?;
        let removed = {
            let mut state = self.state.lock();
            let Some(index) = state
                .connections
                .iter()
                .position(|connection| connection.id == id)
            else {
                return Ok(None);
            };
            let removed = state.connections.remove(index);
            if self.clear_last_active_on_remove
                && state.last_active_connection_id.as_deref() == Some(id)
            {
                state.last_active_connection_id = None;
            }
            removed
        };
        self.persist().await?;
        Ok(Some(removed))
    }

    /// Returns `false` when the id is unknown.
    pub(crate) async fn set_connected(
        &self,
        id: &str,
        connected: bool,
        used_at: Option<DateTime<Utc>>,
    ) -> Result<bool, RegistryError> {
        self.ensure_hydrated()?;
        let found = {
            let mut state = self.state.lock();
            match state
                .connections
                .iter_mut()
                .find(|connection| connection.id == id)
            {
                Some(connection) => {
                    connection.is_connected = connected;
                    if used_at.is_some() {
                        connection.last_used_at = used_at;
                    }
                    true
                }
                None => false,
            }
        };
        if !found {
            return Ok(false);
        }
        self.persist().await?;
        Ok(true)
    }

    pub(crate) async fn set_last_active(&self, id: Option<String>) -> Result<(), RegistryError> {
        self.ensure_hydrated()?;
        {
            let mut state = self.state.lock();
            if state.last_active_connection_id == id {
                return Ok(());
            }
            state.last_active_connection_id = id;
        }
        self.persist().await
    }

    pub(crate) async fn set_auto_connect(&self, enabled: bool) -> Result<(), RegistryError> {
        self.ensure_hydrated()?;
        self.state.lock().auto_connect_enabled = enabled;
        self.persist().await
    }

    async fn persist(&self) -> Result<(), RegistryError> {
        let _gate = self.write_gate.lock().await;
        // Snapshot after taking the gate so the newest state is written last.
        let blob = self.state.lock().to_json()?;
        self.store.save(blob).await?;
        debug!("connection registry persisted");
        Ok(())
    }
}
