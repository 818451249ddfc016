//! # Engine Configuration
//!
//! Configuration management for the sync engine.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     DROVER_WORKER_ID=42                                                 │
//! │     DROVER_SESSION_URL=wss://dispatch.example.com/session               │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/drover/engine.toml (Linux)                               │
//! │     ~/Library/Application Support/com.drover.drover/engine.toml (macOS)│
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! │     localhost endpoints, 3 s ack window, 1 Hz sweep                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! # engine.toml
//! [worker]
//! id = 42
//!
//! [endpoints]
//! session_url = "wss://dispatch.example.com/session"
//! topic_url = "wss://dispatch.example.com/topics"
//! rest_url = "https://dispatch.example.com/api/"
//!
//! [channel]
//! ack_timeout_ms = 3000
//! initial_backoff_ms = 500
//! max_backoff_secs = 60
//!
//! [engine]
//! telemetry_min_interval_secs = 5
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use drover_core::types::WorkerId;

use crate::channel::BackoffSettings;
use crate::error::{EngineError, EngineResult};

// =============================================================================
// Worker Settings
// =============================================================================

/// The worker account this engine instance acts for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSettings {
    /// Backend-issued worker id. `0` means not configured yet; the engine
    /// refuses to start until a real id is set.
    #[serde(default)]
    pub id: u64,

    /// Bearer token from the last login, sent with the register handshake.
    /// The persisted session file overrides this once a login happened.
    #[serde(default)]
    pub auth_token: Option<String>,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        WorkerSettings {
            id: 0,
            auth_token: None,
        }
    }
}

// =============================================================================
// Endpoint Settings
// =============================================================================

/// Where the dispatch backend lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointSettings {
    /// Session channel (commands + acks + direct pushes). `ws://` or `wss://`.
    #[serde(default = "default_session_url")]
    pub session_url: String,

    /// Topic channel (broker-style pub/sub). `ws://` or `wss://`.
    #[serde(default = "default_topic_url")]
    pub topic_url: String,

    /// REST fallback used to seed state. `http://` or `https://`.
    #[serde(default = "default_rest_url")]
    pub rest_url: String,
}

fn default_session_url() -> String {
    "ws://localhost:9100/session".to_string()
}

fn default_topic_url() -> String {
    "ws://localhost:9101/topics".to_string()
}

fn default_rest_url() -> String {
    "http://localhost:9102/api/".to_string()
}

impl Default for EndpointSettings {
    fn default() -> Self {
        EndpointSettings {
            session_url: default_session_url(),
            topic_url: default_topic_url(),
            rest_url: default_rest_url(),
        }
    }
}

// =============================================================================
// Channel Settings
// =============================================================================

/// Behavior shared by both push channels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelSettings {
    /// Connection (and register handshake) timeout in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// How long a command waits for its acknowledgement before resolving
    /// optimistically, in milliseconds.
    #[serde(default = "default_ack_timeout")]
    pub ack_timeout_ms: u64,

    /// Keepalive ping interval in seconds.
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,

    /// Initial backoff duration (milliseconds) for reconnection.
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Maximum backoff duration (seconds) for reconnection.
    /// Retries never stop; they just never wait longer than this.
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,

    /// How many outbound frames may queue while disconnected.
    #[serde(default = "default_command_queue")]
    pub command_queue: usize,
}

fn default_connect_timeout() -> u64 {
    10
}
fn default_ack_timeout() -> u64 {
    3_000
}
fn default_ping_interval() -> u64 {
    30
}
fn default_initial_backoff() -> u64 {
    500
}
fn default_max_backoff() -> u64 {
    60
}
fn default_command_queue() -> usize {
    64
}

impl Default for ChannelSettings {
    fn default() -> Self {
        ChannelSettings {
            connect_timeout_secs: default_connect_timeout(),
            ack_timeout_ms: default_ack_timeout(),
            ping_interval_secs: default_ping_interval(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_secs: default_max_backoff(),
            command_queue: default_command_queue(),
        }
    }
}

// =============================================================================
// Engine Settings
// =============================================================================

/// Engine loop behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Interval between offer expiry sweeps, in milliseconds.
    /// One shared timer regardless of offer count; 1 Hz in production.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_ms: u64,

    /// Minimum seconds between location telemetry sends, whatever the GPS
    /// sample rate is.
    #[serde(default = "default_telemetry_interval")]
    pub telemetry_min_interval_secs: u64,

    /// Timeout for REST seed/reconcile requests, in seconds.
    #[serde(default = "default_rest_timeout")]
    pub rest_timeout_secs: u64,
}

fn default_sweep_interval() -> u64 {
    1_000
}
fn default_telemetry_interval() -> u64 {
    5
}
fn default_rest_timeout() -> u64 {
    10
}

impl Default for EngineSettings {
    fn default() -> Self {
        EngineSettings {
            sweep_interval_ms: default_sweep_interval(),
            telemetry_min_interval_secs: default_telemetry_interval(),
            rest_timeout_secs: default_rest_timeout(),
        }
    }
}

// =============================================================================
// Main Engine Configuration
// =============================================================================

/// Complete engine configuration.
///
/// ## Example Config File
/// ```toml
/// [worker]
/// id = 42
///
/// [endpoints]
/// session_url = "wss://dispatch.example.com/session"
/// topic_url = "wss://dispatch.example.com/topics"
/// rest_url = "https://dispatch.example.com/api/"
///
/// [channel]
/// connect_timeout_secs = 10
/// ack_timeout_ms = 3000
///
/// [engine]
/// sweep_interval_ms = 1000
/// telemetry_min_interval_secs = 5
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Worker identity.
    #[serde(default)]
    pub worker: WorkerSettings,

    /// Backend endpoints.
    #[serde(default)]
    pub endpoints: EndpointSettings,

    /// Push channel behavior.
    #[serde(default)]
    pub channel: ChannelSettings,

    /// Engine loop behavior.
    #[serde(default)]
    pub engine: EngineSettings,
}

impl EngineConfig {
    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (engine.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> EngineResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading engine config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load engine config: {}. Using defaults.", e);
            Self::default()
        })
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> EngineResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| EngineError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents)?;

        info!(?path, "Engine config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> EngineResult<()> {
        if self.worker.id == 0 {
            return Err(EngineError::MissingWorkerId);
        }

        for (name, url) in [
            ("session_url", &self.endpoints.session_url),
            ("topic_url", &self.endpoints.topic_url),
        ] {
            if !url.starts_with("ws://") && !url.starts_with("wss://") {
                return Err(EngineError::InvalidUrl(format!(
                    "{} must start with ws:// or wss://, got: {}",
                    name, url
                )));
            }
        }

        if !self.endpoints.rest_url.starts_with("http://")
            && !self.endpoints.rest_url.starts_with("https://")
        {
            return Err(EngineError::InvalidUrl(format!(
                "rest_url must start with http:// or https://, got: {}",
                self.endpoints.rest_url
            )));
        }

        if self.channel.ack_timeout_ms == 0 {
            return Err(EngineError::InvalidConfig(
                "ack_timeout_ms must be greater than 0".into(),
            ));
        }

        if self.channel.command_queue == 0 {
            return Err(EngineError::InvalidConfig(
                "command_queue must be greater than 0".into(),
            ));
        }

        if self.engine.sweep_interval_ms == 0 {
            return Err(EngineError::InvalidConfig(
                "sweep_interval_ms must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    /// Applies environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(id) = std::env::var("DROVER_WORKER_ID") {
            if let Ok(parsed) = id.parse::<u64>() {
                debug!(worker_id = parsed, "Overriding worker id from environment");
                self.worker.id = parsed;
            }
        }

        if let Ok(token) = std::env::var("DROVER_AUTH_TOKEN") {
            self.worker.auth_token = Some(token);
        }

        if let Ok(url) = std::env::var("DROVER_SESSION_URL") {
            debug!(url = %url, "Overriding session URL from environment");
            self.endpoints.session_url = url;
        }

        if let Ok(url) = std::env::var("DROVER_TOPIC_URL") {
            debug!(url = %url, "Overriding topic URL from environment");
            self.endpoints.topic_url = url;
        }

        if let Ok(url) = std::env::var("DROVER_REST_URL") {
            debug!(url = %url, "Overriding REST URL from environment");
            self.endpoints.rest_url = url;
        }

        if let Ok(ms) = std::env::var("DROVER_ACK_TIMEOUT_MS") {
            if let Ok(parsed) = ms.parse::<u64>() {
                self.channel.ack_timeout_ms = parsed;
            }
        }

        if let Ok(secs) = std::env::var("DROVER_TELEMETRY_INTERVAL_SECS") {
            if let Ok(parsed) = secs.parse::<u64>() {
                self.engine.telemetry_min_interval_secs = parsed;
            }
        }
    }

    /// Returns the default config file path.
    fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "drover", "drover").map(|dirs| {
            let config_dir = dirs.config_dir();
            config_dir.join("engine.toml")
        })
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    /// Returns the worker id as the domain newtype.
    pub fn worker_id(&self) -> WorkerId {
        WorkerId::new(self.worker.id)
    }

    /// Connection (and handshake) timeout.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.channel.connect_timeout_secs)
    }

    /// Command acknowledgement window.
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.channel.ack_timeout_ms)
    }

    /// Keepalive ping interval.
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.channel.ping_interval_secs)
    }

    /// Reconnect backoff parameters for both channels.
    pub fn backoff_settings(&self) -> BackoffSettings {
        BackoffSettings {
            initial: Duration::from_millis(self.channel.initial_backoff_ms),
            max: Duration::from_secs(self.channel.max_backoff_secs),
        }
    }

    /// Offer expiry sweep cadence.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.engine.sweep_interval_ms)
    }

    /// Minimum gap between location telemetry sends.
    pub fn telemetry_min_interval(&self) -> Duration {
        Duration::from_secs(self.engine.telemetry_min_interval_secs)
    }

    /// REST request timeout.
    pub fn rest_timeout(&self) -> Duration {
        Duration::from_secs(self.engine.rest_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.worker.id = 42;
        config
    }

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.channel.ack_timeout_ms, 3_000);
        assert_eq!(config.engine.sweep_interval_ms, 1_000);
        assert_eq!(config.engine.telemetry_min_interval_secs, 5);
        assert!(config.endpoints.session_url.starts_with("ws://"));
    }

    #[test]
    fn test_validation_requires_worker_id() {
        let config = EngineConfig::default();
        assert!(matches!(
            config.validate(),
            Err(EngineError::MissingWorkerId)
        ));

        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_bad_urls() {
        let mut config = valid_config();
        config.endpoints.session_url = "http://not-a-socket".into();
        assert!(matches!(
            config.validate(),
            Err(EngineError::InvalidUrl(_))
        ));

        let mut config = valid_config();
        config.endpoints.rest_url = "ws://not-http".into();
        assert!(matches!(
            config.validate(),
            Err(EngineError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_validation_rejects_zero_timings() {
        let mut config = valid_config();
        config.channel.ack_timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.engine.sweep_interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_round_trip() {
        let config = valid_config();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("[worker]"));
        assert!(toml_str.contains("[endpoints]"));

        let parsed: EngineConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.worker.id, 42);
        assert_eq!(parsed.channel.ack_timeout_ms, 3_000);
    }

    #[test]
    fn test_sparse_file_fills_defaults() {
        let parsed: EngineConfig = toml::from_str(
            r#"
            [worker]
            id = 7
            "#,
        )
        .unwrap();
        assert_eq!(parsed.worker.id, 7);
        assert_eq!(parsed.channel.ack_timeout_ms, 3_000);
        assert_eq!(parsed.engine.rest_timeout_secs, 10);
    }

    #[test]
    fn test_save_and_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("engine.toml");

        let mut config = valid_config();
        config.endpoints.session_url = "wss://dispatch.example.com/session".into();
        config.save(Some(path.clone())).unwrap();

        let loaded = EngineConfig::load(Some(path)).unwrap();
        assert_eq!(loaded.worker.id, 42);
        assert_eq!(
            loaded.endpoints.session_url,
            "wss://dispatch.example.com/session"
        );
    }

    #[test]
    fn test_duration_accessors() {
        let config = valid_config();
        assert_eq!(config.ack_timeout(), Duration::from_millis(3_000));
        assert_eq!(config.sweep_interval(), Duration::from_secs(1));
        assert_eq!(config.backoff_settings().initial, Duration::from_millis(500));
    }

    #[test]
    fn test_env_overrides_file_values() {
        // Only vars whose fields no other test asserts through load(), so
        // parallel test runs cannot observe each other's process environment.
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.toml");
        valid_config().save(Some(path.clone())).unwrap();

        std::env::set_var("DROVER_AUTH_TOKEN", "env-token");
        std::env::set_var("DROVER_TELEMETRY_INTERVAL_SECS", "45");
        let loaded = EngineConfig::load(Some(path));
        std::env::remove_var("DROVER_AUTH_TOKEN");
        std::env::remove_var("DROVER_TELEMETRY_INTERVAL_SECS");

        let loaded = loaded.unwrap();
        assert_eq!(loaded.worker.auth_token.as_deref(), Some("env-token"));
        assert_eq!(loaded.engine.telemetry_min_interval_secs, 45);
    }
}
