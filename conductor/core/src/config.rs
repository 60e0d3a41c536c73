//! Launcher Configuration
//!
//! Loads launcher settings from a TOML file at
//! `$XDG_CONFIG_HOME/whist/launcher.toml`, the environment and CLI flags.
//!
//! # Configuration Priority
//!
//! Values are applied with the following priority (highest first):
//! 1. CLI arguments ([`ConfigOverrides`])
//! 2. Environment variables
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [webserver]
//! url = "https://prod-server.whist.com"
//! region = "us-east-1"
//!
//! [protocol]
//! path = "/opt/whist/WhistClient"
//!
//! [timeouts]
//! policy_ms = 10000
//! mandelbox_ms = 45000
//! autoupdate_interval_secs = 600
//! token_refresh_interval_secs = 1800
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::flows::{DEFAULT_MANDELBOX_TIMEOUT, DEFAULT_POLICY_TIMEOUT};
use crate::mock::MOCK_SCHEMA_ENV;

/// Environment variable names
pub mod env {
    /// Webserver base URL
    pub const WEBSERVER_URL: &str = "WHIST_WEBSERVER_URL";
    /// Mandelbox region
    pub const REGION: &str = "WHIST_REGION";
    /// Protocol binary
    pub const PROTOCOL_PATH: &str = "WHIST_PROTOCOL_PATH";
    /// Persisted store file
    pub const STORE_PATH: &str = "WHIST_STORE_PATH";
    /// Auth and policy deadline
    pub const POLICY_TIMEOUT_MS: &str = "WHIST_POLICY_TIMEOUT_MS";
    /// Mandelbox and host deadline
    pub const MANDELBOX_TIMEOUT_MS: &str = "WHIST_MANDELBOX_TIMEOUT_MS";
    /// Autoupdate period
    pub const AUTOUPDATE_INTERVAL_SECS: &str = "WHIST_AUTOUPDATE_INTERVAL_SECS";
    /// Token refresh period
    pub const TOKEN_REFRESH_INTERVAL_SECS: &str = "WHIST_TOKEN_REFRESH_INTERVAL_SECS";
}

/// Default webserver
pub const DEFAULT_WEBSERVER_URL: &str = "https://prod-server.whist.com";
/// Default mandelbox region
pub const DEFAULT_REGION: &str = "us-east-1";
/// Default protocol binary, looked up on `PATH`
pub const DEFAULT_PROTOCOL_PATH: &str = "WhistClient";
/// Default period between update checks
pub const DEFAULT_AUTOUPDATE_INTERVAL: Duration = Duration::from_secs(10 * 60);
/// Default period between token refreshes
pub const DEFAULT_TOKEN_REFRESH_INTERVAL: Duration = Duration::from_secs(30 * 60);

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    Read {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Where the highest-priority value in a configuration came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Command-line argument
    Cli,
    /// Environment variable
    Env,
    /// TOML configuration file
    File,
    /// Built-in default
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// `[webserver]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WebserverToml {
    /// Base URL
    pub url: Option<String>,
    /// Mandelbox region
    pub region: Option<String>,
}

/// `[protocol]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolToml {
    /// Protocol binary
    pub path: Option<PathBuf>,
}

/// `[store]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreToml {
    /// Persisted store file
    pub path: Option<PathBuf>,
}

/// `[timeouts]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutsToml {
    /// Auth and policy deadline in milliseconds
    pub policy_ms: Option<u64>,
    /// Mandelbox and host deadline in milliseconds
    pub mandelbox_ms: Option<u64>,
    /// Seconds between update checks
    pub autoupdate_interval_secs: Option<u64>,
    /// Seconds between token refreshes
    pub token_refresh_interval_secs: Option<u64>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LauncherToml {
    /// Webserver section
    pub webserver: WebserverToml,
    /// Protocol section
    pub protocol: ProtocolToml,
    /// Store section
    pub store: StoreToml,
    /// Timeouts section
    pub timeouts: TimeoutsToml,
    /// Name of a mock schema to install
    pub mock_schema: Option<String>,
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Resolved launcher configuration
#[derive(Clone, Debug)]
pub struct LauncherConfig {
    /// Webserver base URL
    pub webserver_url: String,
    /// Mandelbox region
    pub region: String,
    /// Protocol binary
    pub protocol_path: PathBuf,
    /// Persisted store file
    pub store_path: PathBuf,
    /// Mock schema name, when running against doubles
    pub mock_schema: Option<String>,
    /// Auth and policy deadline
    pub policy_timeout: Duration,
    /// Mandelbox and host deadline
    pub mandelbox_timeout: Duration,
    /// Period between update checks
    pub autoupdate_interval: Duration,
    /// Period between token refreshes
    pub token_refresh_interval: Duration,
    /// File the configuration was read from
    pub config_file_path: Option<PathBuf>,
    source: ConfigSource,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            webserver_url: DEFAULT_WEBSERVER_URL.to_string(),
            region: DEFAULT_REGION.to_string(),
            protocol_path: PathBuf::from(DEFAULT_PROTOCOL_PATH),
            store_path: default_store_path(),
            mock_schema: None,
            policy_timeout: DEFAULT_POLICY_TIMEOUT,
            mandelbox_timeout: DEFAULT_MANDELBOX_TIMEOUT,
            autoupdate_interval: DEFAULT_AUTOUPDATE_INTERVAL,
            token_refresh_interval: DEFAULT_TOKEN_REFRESH_INTERVAL,
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl LauncherConfig {
    /// Highest-priority source that contributed a value
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Reject values the launcher cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.webserver_url.starts_with("http://") || self.webserver_url.starts_with("https://")) {
            return Err(ConfigError::Invalid(format!(
                "webserver url must be http(s): {}",
                self.webserver_url
            )));
        }
        let periods = [
            ("policy timeout", self.policy_timeout),
            ("mandelbox timeout", self.mandelbox_timeout),
            ("autoupdate interval", self.autoupdate_interval),
            ("token refresh interval", self.token_refresh_interval),
        ];
        if let Some((name, _)) = periods.iter().find(|(_, d)| d.is_zero()) {
            return Err(ConfigError::Invalid(format!("{name} must be positive")));
        }
        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// `$XDG_CONFIG_HOME/whist/launcher.toml`
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("whist").join("launcher.toml"))
}

/// `$XDG_DATA_HOME/whist/store.json`, or `./whist-store.json` without a home
#[must_use]
pub fn default_store_path() -> PathBuf {
    dirs::data_dir().map_or_else(
        || PathBuf::from("whist-store.json"),
        |p| p.join("whist").join("store.json"),
    )
}

/// Load from the default file and the process environment
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed.
pub fn load_config() -> Result<LauncherConfig, ConfigError> {
    load_config_from(default_config_path(), |key| std::env::var(key).ok())
}

/// Load from `path` (if any) and the variables `lookup` resolves
///
/// A missing file is not an error.
pub fn load_config_from<E>(path: Option<PathBuf>, lookup: E) -> Result<LauncherConfig, ConfigError>
where
    E: Fn(&str) -> Option<String>,
{
    let mut config = LauncherConfig::default();

    if let Some(config_path) = path {
        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path).map_err(|source| ConfigError::Read {
                path: config_path.clone(),
                source,
            })?;
            let file: LauncherToml = toml::from_str(&content)?;
            apply_toml_config(&mut config, &file);
            tracing::info!(path = %config_path.display(), "Loaded configuration from file");
            config.config_file_path = Some(config_path);
            config.source = ConfigSource::File;
        } else {
            tracing::debug!(path = %config_path.display(), "Config file not found, using defaults");
        }
    }

    apply_env_config(&mut config, lookup);
    Ok(config)
}

fn apply_toml_config(config: &mut LauncherConfig, file: &LauncherToml) {
    if let Some(url) = &file.webserver.url {
        config.webserver_url = url.clone();
    }
    if let Some(region) = &file.webserver.region {
        config.region = region.clone();
    }
    if let Some(path) = &file.protocol.path {
        config.protocol_path = path.clone();
    }
    if let Some(path) = &file.store.path {
        config.store_path = path.clone();
    }
    if file.mock_schema.is_some() {
        config.mock_schema = file.mock_schema.clone();
    }

    let t = &file.timeouts;
    if let Some(ms) = t.policy_ms {
        config.policy_timeout = Duration::from_millis(ms);
    }
    if let Some(ms) = t.mandelbox_ms {
        config.mandelbox_timeout = Duration::from_millis(ms);
    }
    if let Some(secs) = t.autoupdate_interval_secs {
        config.autoupdate_interval = Duration::from_secs(secs);
    }
    if let Some(secs) = t.token_refresh_interval_secs {
        config.token_refresh_interval = Duration::from_secs(secs);
    }
}

fn apply_env_config<E>(config: &mut LauncherConfig, lookup: E)
where
    E: Fn(&str) -> Option<String>,
{
    let mut touched = false;
    let mut string = |key: &str, slot: &mut String| {
        if let Some(value) = lookup(key).filter(|v| !v.is_empty()) {
            *slot = value;
            touched = true;
        }
    };
    string(env::WEBSERVER_URL, &mut config.webserver_url);
    string(env::REGION, &mut config.region);

    if let Some(path) = lookup(env::PROTOCOL_PATH).filter(|v| !v.is_empty()) {
        config.protocol_path = PathBuf::from(path);
        touched = true;
    }
    if let Some(path) = lookup(env::STORE_PATH).filter(|v| !v.is_empty()) {
        config.store_path = PathBuf::from(path);
        touched = true;
    }
    if let Some(name) = lookup(MOCK_SCHEMA_ENV).filter(|v| !v.is_empty()) {
        config.mock_schema = Some(name);
        touched = true;
    }

    let number = |key: &str| -> Option<u64> {
        let raw = lookup(key)?;
        match raw.parse() {
            Ok(n) => Some(n),
            Err(_) => {
                tracing::warn!(key, value = %raw, "Ignoring non-numeric environment value");
                None
            }
        }
    };
    if let Some(ms) = number(env::POLICY_TIMEOUT_MS) {
        config.policy_timeout = Duration::from_millis(ms);
        touched = true;
    }
    if let Some(ms) = number(env::MANDELBOX_TIMEOUT_MS) {
        config.mandelbox_timeout = Duration::from_millis(ms);
        touched = true;
    }
    if let Some(secs) = number(env::AUTOUPDATE_INTERVAL_SECS) {
        config.autoupdate_interval = Duration::from_secs(secs);
        touched = true;
    }
    if let Some(secs) = number(env::TOKEN_REFRESH_INTERVAL_SECS) {
        config.token_refresh_interval = Duration::from_secs(secs);
        touched = true;
    }

    if touched {
        config.source = ConfigSource::Env;
    }
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Command-line overrides, applied after [`load_config`]
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Webserver base URL
    pub webserver_url: Option<String>,
    /// Mandelbox region
    pub region: Option<String>,
    /// Protocol binary
    pub protocol_path: Option<PathBuf>,
    /// Persisted store file
    pub store_path: Option<PathBuf>,
    /// Mock schema name
    pub mock_schema: Option<String>,
}

impl ConfigOverrides {
    /// No overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the webserver URL
    #[must_use]
    pub fn with_webserver_url(mut self, url: String) -> Self {
        self.webserver_url = Some(url);
        self
    }

    /// Override the region
    #[must_use]
    pub fn with_region(mut self, region: String) -> Self {
        self.region = Some(region);
        self
    }

    /// Override the protocol binary
    #[must_use]
    pub fn with_protocol_path(mut self, path: PathBuf) -> Self {
        self.protocol_path = Some(path);
        self
    }

    /// Override the store file
    #[must_use]
    pub fn with_store_path(mut self, path: PathBuf) -> Self {
        self.store_path = Some(path);
        self
    }

    /// Install a mock schema
    #[must_use]
    pub fn with_mock_schema(mut self, name: String) -> Self {
        self.mock_schema = Some(name);
        self
    }

    /// Apply overrides to a configuration
    pub fn apply(&self, config: &mut LauncherConfig) {
        let mut touched = false;
        if let Some(url) = &self.webserver_url {
            config.webserver_url = url.clone();
            touched = true;
        }
        if let Some(region) = &self.region {
            config.region = region.clone();
            touched = true;
        }
        if let Some(path) = &self.protocol_path {
            config.protocol_path = path.clone();
            touched = true;
        }
        if let Some(path) = &self.store_path {
            config.store_path = path.clone();
            touched = true;
        }
        if let Some(name) = &self.mock_schema {
            config.mock_schema = Some(name.clone());
            touched = true;
        }
        if touched {
            config.source = ConfigSource::Cli;
        }
    }
}
