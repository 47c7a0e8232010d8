use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pagination::{is_valid_page_size, DEFAULT_PAGE_SIZE};
use crate::startup::StartupTrigger;

const CONFIG_FILE_NAME: &str = "config.toml";
const STATE_FILE_NAME: &str = "state.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config directory is unavailable for this platform")]
    ConfigDirUnavailable,
    #[error("failed to read config file at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("default_page_size {0} is not one of the supported page sizes")]
    InvalidPageSize(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AutoConnectTrigger {
    #[default]
    Hydration,
    Delay,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub default_page_size: u32,
    pub auto_connect_trigger: AutoConnectTrigger,
    pub auto_connect_delay_ms: u64,
    /// When set, removing the last active connection also forgets it.
    pub clear_last_active_on_remove: bool,
    pub state_file: Option<PathBuf>,
    pub keyring_service: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            default_page_size: DEFAULT_PAGE_SIZE,
            auto_connect_trigger: AutoConnectTrigger::Hydration,
            auto_connect_delay_ms: 100,
            clear_last_active_on_remove: false,
            state_file: None,
            keyring_service: "pagewise".to_string(),
        }
    }
}

impl AppConfig {
    pub fn load_default() -> Result<Self, ConfigError> {
        Self::load_from_path(config_dir()?.join(CONFIG_FILE_NAME))
    }

    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        let config: Self = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !is_valid_page_size(self.default_page_size) {
            return Err(ConfigError::InvalidPageSize(self.default_page_size));
        }
        Ok(())
    }

    #[must_use]
    pub fn startup_trigger(&self) -> StartupTrigger {
        match self.auto_connect_trigger {
            AutoConnectTrigger::Hydration => StartupTrigger::AfterHydration,
            AutoConnectTrigger::Delay => {
                StartupTrigger::AfterDelay(Duration::from_millis(self.auto_connect_delay_ms))
            }
        }
    }

    /// Registry state file, honoring the `state_file` override.
    pub fn state_path(&self) -> Result<PathBuf, ConfigError> {
        match &self.state_file {
            Some(path) => Ok(path.clone()),
            None => Ok(config_dir()?.join(STATE_FILE_NAME)),
        }
    }
}

pub fn config_dir() -> Result<PathBuf, ConfigError> {
    let base_dir = if let Some(custom) = env::var_os("PAGEWISE_CONFIG_DIR") {
        PathBuf::from(custom)
    } else if cfg!(target_os = "windows") {
        env::var_os("APPDATA")
            .map(PathBuf::from)
            .ok_or(ConfigError::ConfigDirUnavailable)?
    } else if let Some(xdg_config_home) = env::var_os("XDG_CONFIG_HOME") {
        PathBuf::from(xdg_config_home)
    } else {
        let home = env::var_os("HOME").ok_or(ConfigError::ConfigDirUnavailable)?;
        PathBuf::from(home).join(".config")
    };

    Ok(base_dir.join("pagewise"))
}
