use async_trait::async_trait;
use pagewise_core::credentials::{CredentialError, CredentialResolver, Secret};
use tracing::{debug, warn};

pub const PASSWORD_ENV_VAR: &str = "PAGEWISE_DB_PASSWORD";

/// Resolves connection passwords from the OS keychain, one entry per
/// connection id under a shared service name. A non-empty
/// `PAGEWISE_DB_PASSWORD` takes precedence for every connection.
#[derive(Debug, Clone)]
pub struct KeyringCredentialResolver {
    service: String,
    env_override: Option<String>,
}

impl KeyringCredentialResolver {
    #[must_use]
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            env_override: Some(PASSWORD_ENV_VAR.to_string()),
        }
    }

    #[must_use]
    pub fn with_env_override(mut self, variable: Option<&str>) -> Self {
        self.env_override = variable.map(str::to_string);
        self
    }

    #[must_use]
    pub fn service(&self) -> &str {
        &self.service
    }

    fn env_password(&self) -> Option<String> {
        let variable = self.env_override.as_deref()?;
        std::env::var(variable).ok().filter(|pw| !pw.is_empty())
    }
}

#[async_trait]
impl CredentialResolver for KeyringCredentialResolver {
    async fn resolve(&self, connection_id: &str) -> Result<Secret, CredentialError> {
        if let Some(password) = self.env_password() {
            debug!(%connection_id, "using password from environment");
            return Ok(Secret::new(password));
        }

        match load_keyring_password(&self.service, connection_id) {
            Ok(password) => Ok(Secret::new(password)),
            Err(message) => {
                warn!(service = %self.service, %connection_id, %message, "keychain lookup failed");
                Err(CredentialError::new(connection_id, message))
            }
        }
    }
}

#[cfg(any(target_os = "linux", target_os = "macos", target_os = "windows"))]
fn load_keyring_password(service: &str, account: &str) -> Result<String, String> {
    let entry = ::keyring::Entry::new(service, account).map_err(|error| error.to_string())?;
    match entry.get_password() {
        Ok(password) if password.is_empty() => Err("stored password is empty".to_string()),
        Ok(password) => Ok(password),
        Err(::keyring::Error::NoEntry) => Err("no password stored in keychain".to_string()),
        Err(error) => Err(error.to_string()),
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
fn load_keyring_password(_service: &str, _account: &str) -> Result<String, String> {
    Err("keychain is not supported on this platform".to_string())
}
