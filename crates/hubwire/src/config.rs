//! # Configuration
//!
//! [`HubConfig`] holds everything needed to reach the event hub and its
//! token endpoint.
//!
//! ## Loading Priority
//!
//! Configuration is loaded from the first source that provides a value:
//!
//! 1. Explicit struct fields (programmatic construction)
//! 2. TOML config file at an explicit path
//! 3. The file named by `HUBWIRE_CONFIG`
//! 4. `./hubwire.toml` in the current directory
//! 5. `~/.config/hubwire/hubwire.toml`
//! 6. Environment variables only
//!
//! `HUBWIRE_REALTIME_URL`, `HUBWIRE_USERNAME`, `HUBWIRE_PASSWORD` and
//! `HUBWIRE_GROUP` always override file values.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{HubError, HubResult};

/// Documented default hub URL. Nothing enforces it; [`HubConfig::validate`]
/// only rejects an empty URL.
pub const DEFAULT_REALTIME_URL: &str = "wss://localhost:5001/hub";

/// Path of the token endpoint relative to the hub authority.
pub const AUTH_TOKEN_PATH: &str = "/auth/token";

/// Default group joined after every successful connect.
const DEFAULT_GROUP: &str = "events";

const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_INVOKE_TIMEOUT_SECS: u64 = 15;
const DEFAULT_CLOSE_TIMEOUT_SECS: u64 = 5;
const DEFAULT_KEEP_ALIVE_SECS: u64 = 15;
const DEFAULT_SERVER_TIMEOUT_SECS: u64 = 30;

/// Idle-poll cadence of the retry loop while a session is up.
const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;

/// Fixed delay between failed connect attempts.
const DEFAULT_RETRY_DELAY_MS: u64 = 1000;

/// Automatic-reconnect schedule applied after a live session drops.
const DEFAULT_RECONNECT_DELAYS_MS: [u64; 4] = [0, 2_000, 10_000, 30_000];

/// Configuration for the hub client.
///
/// # Examples
///
/// ```
/// use hubwire::config::HubConfig;
///
/// let mut config = HubConfig::new("wss://hub.example.com/events");
/// config.username = "svc".into();
/// config.password = "secret".into();
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    /// WebSocket URL of the event hub.
    #[serde(default = "default_realtime_url")]
    pub realtime_url: String,

    /// Username exchanged for a bearer token.
    #[serde(default)]
    pub username: String,

    /// Password exchanged for a bearer token.
    #[serde(default)]
    pub password: String,

    /// Group joined (and left) during the post-connect handshake.
    #[serde(default = "default_group")]
    pub group: String,

    /// Token endpoint. Derived from `realtime_url` when absent.
    #[serde(default)]
    pub auth_url: Option<String>,

    /// Skip server certificate validation for both the WebSocket and the
    /// token endpoint. Development only.
    #[serde(default)]
    pub accept_invalid_certs: bool,

    /// Timeout configuration.
    #[serde(default)]
    pub timeouts: TimeoutConfig,

    /// Retry and automatic-reconnect configuration.
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

/// Timeout settings for hub operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// WebSocket upgrade plus protocol handshake, in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Wait for the completion of a hub invocation, in seconds.
    #[serde(default = "default_invoke_timeout")]
    pub invoke_timeout_secs: u64,

    /// Upper bound on the supervisor's graceful close of a live session
    /// during `stop`, in seconds.
    #[serde(default = "default_close_timeout")]
    pub close_timeout_secs: u64,

    /// Interval between client keep-alive pings, in seconds.
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,

    /// Silence from the hub after which the connection is considered lost, in seconds.
    #[serde(default = "default_server_timeout")]
    pub server_timeout_secs: u64,
}

/// What the retry loop does when the token endpoint fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthFailurePolicy {
    /// Treat like a connectivity failure: wait the retry delay and try again.
    #[default]
    Retry,

    /// Stop the retry loop and leave the session closed.
    Fatal,
}

/// Retry-loop and automatic-reconnect behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Enable automatic reconnect when a live session drops.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Idle-poll cadence while connected, in milliseconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Delay between failed connect attempts, in milliseconds.
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,

    /// Reaction to token endpoint failures.
    #[serde(default)]
    pub auth_failure: AuthFailurePolicy,

    /// Automatic-reconnect delays in milliseconds; one attempt per entry.
    #[serde(default = "default_reconnect_delays")]
    pub delays_ms: Vec<u64>,
}

// ─── Defaults ───────────────────────────────────────────────────────────

fn default_realtime_url() -> String {
    DEFAULT_REALTIME_URL.to_string()
}

fn default_group() -> String {
    DEFAULT_GROUP.to_string()
}

fn default_true() -> bool {
    true
}

fn default_connect_timeout() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_SECS
}

fn default_invoke_timeout() -> u64 {
    DEFAULT_INVOKE_TIMEOUT_SECS
}

fn default_close_timeout() -> u64 {
    DEFAULT_CLOSE_TIMEOUT_SECS
}

fn default_keep_alive() -> u64 {
    DEFAULT_KEEP_ALIVE_SECS
}

fn default_server_timeout() -> u64 {
    DEFAULT_SERVER_TIMEOUT_SECS
}

fn default_poll_interval() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

fn default_retry_delay() -> u64 {
    DEFAULT_RETRY_DELAY_MS
}

fn default_reconnect_delays() -> Vec<u64> {
    DEFAULT_RECONNECT_DELAYS_MS.to_vec()
}

// ─── Default impls ──────────────────────────────────────────────────────

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            invoke_timeout_secs: DEFAULT_INVOKE_TIMEOUT_SECS,
            close_timeout_secs: DEFAULT_CLOSE_TIMEOUT_SECS,
            keep_alive_secs: DEFAULT_KEEP_ALIVE_SECS,
            server_timeout_secs: DEFAULT_SERVER_TIMEOUT_SECS,
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            auth_failure: AuthFailurePolicy::default(),
            delays_ms: default_reconnect_delays(),
        }
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self::new(DEFAULT_REALTIME_URL)
    }
}

impl TimeoutConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn invoke_timeout(&self) -> Duration {
        Duration::from_secs(self.invoke_timeout_secs)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_secs(self.close_timeout_secs)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn server_timeout(&self) -> Duration {
        Duration::from_secs(self.server_timeout_secs)
    }
}

impl ReconnectConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn delays(&self) -> Vec<Duration> {
        self.delays_ms
            .iter()
            .copied()
            .map(Duration::from_millis)
            .collect()
    }
}

// ─── HubConfig impl ────────────────────────────────────────────────────

impl HubConfig {
    /// Create a config for the given hub URL (all other fields use defaults).
    pub fn new(realtime_url: impl Into<String>) -> Self {
        Self {
            realtime_url: realtime_url.into(),
            username: String::new(),
            password: String::new(),
            group: default_group(),
            auth_url: None,
            accept_invalid_certs: false,
            timeouts: TimeoutConfig::default(),
            reconnect: ReconnectConfig::default(),
        }
    }

    /// Load config from environment variables.
    ///
    /// All variables are optional; an unset `HUBWIRE_REALTIME_URL` falls
    /// back to [`DEFAULT_REALTIME_URL`].
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Load config from a TOML file, with environment variable overrides.
    ///
    /// # Errors
    /// Returns [`HubError::ConfigError`] if the file cannot be read or parsed.
    #[cfg(feature = "config-toml")]
    pub fn from_file(path: impl AsRef<Path>) -> HubResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| HubError::ConfigError {
            reason: format!("Failed to read config file '{}': {}", path.display(), e),
        })?;
        let mut config: Self = toml::from_str(&contents)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Discover and load config from the standard search path.
    ///
    /// Falls back to environment-variable-only config if no file is found.
    ///
    /// # Errors
    /// Returns [`HubError::ConfigError`] if a discovered file is malformed.
    #[cfg(feature = "config-toml")]
    pub fn discover(explicit_path: Option<&Path>) -> HubResult<Self> {
        if let Some(path) = explicit_path {
            return Self::from_file(path);
        }

        if let Ok(path) = std::env::var("HUBWIRE_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Self::from_file(&path);
            }
        }

        let local_path = PathBuf::from("hubwire.toml");
        if local_path.exists() {
            return Self::from_file(&local_path);
        }

        if let Some(config_path) = dirs_config_path() {
            if config_path.exists() {
                return Self::from_file(&config_path);
            }
        }

        Ok(Self::from_env())
    }

    /// Reject configurations that can never connect.
    ///
    /// # Errors
    /// Returns [`HubError::ConfigError`] when `realtime_url` is empty.
    pub fn validate(&self) -> HubResult<()> {
        if self.realtime_url.trim().is_empty() {
            return Err(HubError::ConfigError {
                reason: "realtime_url must not be empty".into(),
            });
        }
        Ok(())
    }

    /// Resolve the token endpoint.
    ///
    /// Uses `auth_url` verbatim when set. Otherwise keeps the authority of
    /// `realtime_url`, maps `ws`/`wss` to `http`/`https`, and replaces the
    /// path with [`AUTH_TOKEN_PATH`].
    ///
    /// # Errors
    /// Returns [`HubError::ConfigError`] if the URL cannot be parsed.
    pub fn auth_endpoint(&self) -> HubResult<reqwest::Url> {
        if let Some(explicit) = &self.auth_url {
            return reqwest::Url::parse(explicit).map_err(|e| HubError::ConfigError {
                reason: format!("Invalid auth_url '{explicit}': {e}"),
            });
        }

        let mut url =
            reqwest::Url::parse(&self.realtime_url).map_err(|e| HubError::ConfigError {
                reason: format!("Invalid realtime_url '{}': {e}", self.realtime_url),
            })?;

        let scheme = match url.scheme() {
            "wss" | "https" => "https",
            "ws" | "http" => "http",
            other => {
                return Err(HubError::ConfigError {
                    reason: format!("Unsupported realtime_url scheme '{other}'"),
                });
            }
        };
        url.set_scheme(scheme).map_err(|()| HubError::ConfigError {
            reason: format!("Cannot derive auth endpoint from '{}'", self.realtime_url),
        })?;
        url.set_path(AUTH_TOKEN_PATH);
        url.set_query(None);
        url.set_fragment(None);
        Ok(url)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("HUBWIRE_REALTIME_URL") {
            self.realtime_url = url;
        }
        if let Ok(username) = std::env::var("HUBWIRE_USERNAME") {
            self.username = username;
        }
        if let Ok(password) = std::env::var("HUBWIRE_PASSWORD") {
            self.password = password;
        }
        if let Ok(group) = std::env::var("HUBWIRE_GROUP") {
            self.group = group;
        }
    }
}

// ─── Helpers ────────────────────────────────────────────────────────────

/// Platform-appropriate config file path.
#[cfg(feature = "config-toml")]
fn dirs_config_path() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("APPDATA")
            .ok()
            .map(|dir| PathBuf::from(dir).join("hubwire").join("hubwire.toml"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME").ok().map(|dir| {
            PathBuf::from(dir)
                .join(".config")
                .join("hubwire")
                .join("hubwire.toml")
        })
    }
}
