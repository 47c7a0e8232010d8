use async_trait::async_trait;
use thiserror::Error;

/// Opaque secret handed to a backend when opening a session. Never persisted
/// and never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Secret(***)")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("credentials unavailable for connection `{connection_id}`: {message}")]
pub struct CredentialError {
    pub connection_id: String,
    message: String,
}

impl CredentialError {
    #[must_use]
    pub fn new(connection_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            connection_id: connection_id.into(),
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait CredentialResolver: Send + Sync {
    async fn resolve(&self, connection_id: &str) -> Result<Secret, CredentialError>;
}
