//! Session configuration persistence
//!
//! Saves and loads the client's session settings to/from disk

use crate::auth::types::AuthError;
use log::{debug, error, info};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

const CONFIG_FILE: &str = "session.json";
const APP_NAME: &str = "RentNest";
/// Tokens are treated as expired this long before their `exp` at most
const MAX_EXPIRY_LEEWAY_SECS: i64 = 86_400;

/// Paths of the session-lifecycle endpoints on the API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Endpoints {
    pub login: String,
    pub signup: String,
    pub refresh: String,
    pub logout: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            login: "/login".to_string(),
            signup: "/signup".to_string(),
            refresh: "/refresh".to_string(),
            logout: "/logout".to_string(),
        }
    }
}

/// Bounded retry for transient refresh failures (network errors, 5xx)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshRetry {
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles for each attempt after that
    pub base_delay_ms: u64,
}

impl Default for RefreshRetry {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
        }
    }
}

impl RefreshRetry {
    const MAX_DELAY_MS: u64 = 30_000;

    pub fn attempts(&self) -> u32 {
        self.max_attempts.clamp(1, 10)
    }

    /// Wait after failed attempt number `attempt` (1-based): 1s, 2s, 4s...
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor).min(Self::MAX_DELAY_MS))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusBackend {
    /// Direct publish/subscribe between contexts in one process
    Channel,
    /// Shared-storage writes observed by polling; works across processes
    Storage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastSettings {
    /// Topic shared by every context of the same origin
    pub channel: String,
    pub backend: BusBackend,
    pub poll_interval_ms: u64,
}

impl Default for BroadcastSettings {
    fn default() -> Self {
        Self {
            channel: "rentnest-auth".to_string(),
            backend: BusBackend::Channel,
            poll_interval_ms: 500,
        }
    }
}

/// Client session configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub api_base_url: String,
    pub user_agent: String,
    pub request_timeout_secs: u64,
    pub endpoints: Endpoints,
    /// Path prefixes that never carry credentials
    pub public_paths: Vec<String>,
    /// Protected paths that also carry the device identifier
    pub device_scoped_paths: Vec<String>,
    pub refresh_retry: RefreshRetry,
    /// Treat the token as expired this many seconds before its `exp` claim
    pub expiry_leeway_secs: i64,
    pub broadcast: BroadcastSettings,
    /// Directory for the durable store; the platform data dir when unset
    pub storage_dir: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        let endpoints = Endpoints::default();
        Self {
            api_base_url: "https://api.rentnest.app".to_string(),
            user_agent: format!("RentNest-Client/{}", env!("CARGO_PKG_VERSION")),
            request_timeout_secs: 30,
            device_scoped_paths: vec![endpoints.logout.clone()],
            endpoints,
            public_paths: vec![
                "/public".to_string(),
                "/health".to_string(),
                "/listings/search".to_string(),
            ],
            refresh_retry: RefreshRetry::default(),
            expiry_leeway_secs: 10,
            broadcast: BroadcastSettings::default(),
            storage_dir: None,
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), AuthError> {
        if !(self.api_base_url.starts_with("http://") || self.api_base_url.starts_with("https://"))
        {
            return Err(AuthError::Config(format!(
                "api_base_url must be http(s): {}",
                self.api_base_url
            )));
        }
        let endpoints = [
            &self.endpoints.login,
            &self.endpoints.signup,
            &self.endpoints.refresh,
            &self.endpoints.logout,
        ];
        if let Some(bad) = endpoints.iter().find(|path| !path.starts_with('/')) {
            return Err(AuthError::Config(format!(
                "endpoint paths must start with '/': {}",
                bad
            )));
        }
        if !(0..=MAX_EXPIRY_LEEWAY_SECS).contains(&self.expiry_leeway_secs) {
            return Err(AuthError::Config(format!(
                "expiry_leeway_secs must be within 0..={}: {}",
                MAX_EXPIRY_LEEWAY_SECS, self.expiry_leeway_secs
            )));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.broadcast.poll_interval_ms.max(1))
    }

    pub fn expiry_leeway(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.expiry_leeway_secs.clamp(0, MAX_EXPIRY_LEEWAY_SECS))
    }

    /// Location of a durable store file, honoring `storage_dir`
    pub fn storage_file(&self, file_name: &str) -> Option<PathBuf> {
        match &self.storage_dir {
            Some(dir) => Some(dir.join(file_name)),
            None => crate::auth::storage::FileStore::default_path(file_name),
        }
    }
}

/// Get the config directory path
/// Linux: ~/.config/RentNest/, Windows: %APPDATA%\RentNest\
fn get_config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join(APP_NAME))
}

pub fn get_config_path() -> Option<PathBuf> {
    get_config_dir().map(|p| p.join(CONFIG_FILE))
}

/// Load configuration from the default location
pub fn load_config() -> SessionConfig {
    match get_config_path() {
        Some(path) => load_config_from(&path),
        None => {
            debug!("Could not determine config path, using defaults");
            SessionConfig::default()
        }
    }
}

/// Load configuration from `path`, falling back to defaults when the file is
/// missing, unreadable or invalid
pub fn load_config_from(path: &std::path::Path) -> SessionConfig {
    if !path.exists() {
        debug!("Config file does not exist, using defaults");
        return SessionConfig::default();
    }

    let config = match fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str::<SessionConfig>(&contents) {
            Ok(config) => config,
            Err(e) => {
                error!("Failed to parse config file: {}", e);
                return SessionConfig::default();
            }
        },
        Err(e) => {
            error!("Failed to read config file: {}", e);
            return SessionConfig::default();
        }
    };

    match config.validate() {
        Ok(()) => {
            info!("Loaded config from {}", path.display());
            config
        }
        Err(e) => {
            error!("Ignoring invalid config: {}", e);
            SessionConfig::default()
        }
    }
}

/// Save configuration to the default location
pub fn save_config(config: &SessionConfig) -> Result<PathBuf, AuthError> {
    let path = get_config_path()
        .ok_or_else(|| AuthError::Config("Could not determine config directory".to_string()))?;
    save_config_to(config, &path)?;
    Ok(path)
}

pub fn save_config_to(config: &SessionConfig, path: &std::path::Path) -> Result<(), AuthError> {
    config.validate()?;

    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)
            .map_err(|e| AuthError::Config(format!("Failed to create config directory: {}", e)))?;
    }

    let json = serde_json::to_string_pretty(config)
        .map_err(|e| AuthError::Config(format!("Failed to serialize config: {}", e)))?;
    fs::write(path, json)
        .map_err(|e| AuthError::Config(format!("Failed to write config file: {}", e)))?;

    info!("Config saved to {}", path.display());
    Ok(())
}
