//! # Agent Configuration
//!
//! Tuning knobs for the dispatch engine, one block per transport protocol.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority, applied to every block)   │
//! │     DATABRIDGE_WORKER_COUNT=8                                          │
//! │     DATABRIDGE_QUEUE_CAPACITY=10000                                    │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/databridge-agent/agent.toml (Linux)                      │
//! │     ~/Library/Application Support/org.databridge.agent/agent.toml      │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! │     one "tcp" block with the defaults below                            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The configuration is an explicit value handed to `Agent::new`; nothing is
//! read from process-wide state after that.
//!
//! ## Configuration File Format
//! ```toml
//! # agent.toml
//! [[transport]]
//! name = "tcp"
//! worker_count = 4
//! queue_capacity = 32768
//! batch_size = 200
//! max_attempts = 5
//! retry_backoff_ms = 1000
//! reconnection_strategy = "exponential"   # fixed | exponential
//! reconnection_interval_ms = 5000
//! max_reconnection_interval_ms = 60000
//! connect_timeout_ms = 10000
//! send_timeout_ms = 30000
//! busy_backoff_ms = 500
//! shutdown_grace_ms = 10000
//! session_refresh_margin_ms = 5000
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{AgentError, AgentResult};
use crate::transport::TCP_PROTOCOL;

// =============================================================================
// Reconnection Strategy
// =============================================================================

/// How the wait between reconnection attempts of a FAILED endpoint evolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconnectionStrategy {
    /// Always wait `reconnection_interval`.
    Fixed,

    /// Double the wait after each failed attempt, capped at
    /// `max_reconnection_interval`. Reset when the endpoint becomes ACTIVE.
    #[default]
    Exponential,
}

impl std::fmt::Display for ReconnectionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReconnectionStrategy::Fixed => write!(f, "fixed"),
            ReconnectionStrategy::Exponential => write!(f, "exponential"),
        }
    }
}

impl std::str::FromStr for ReconnectionStrategy {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fixed" | "constant" => Ok(ReconnectionStrategy::Fixed),
            "exponential" | "backoff" => Ok(ReconnectionStrategy::Exponential),
            other => Err(AgentError::Configuration(format!(
                "Unknown reconnection strategy: '{}'. Valid options: fixed, exponential",
                other
            ))),
        }
    }
}

// =============================================================================
// Transport Settings
// =============================================================================

/// Dispatch settings for one transport protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportSettings {
    /// Protocol name publishers refer to (e.g. `"tcp"`).
    pub name: String,

    /// Number of dispatch workers per publisher.
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// Bound of the per-publisher event queue.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Maximum events a worker sends in one request.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Send attempts per event before it is dropped as undeliverable.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Longest a worker waits for an endpoint when every tier is unavailable.
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,

    /// Reconnection wait policy.
    #[serde(default)]
    pub reconnection_strategy: ReconnectionStrategy,

    /// Initial wait between reconnection attempts (milliseconds).
    #[serde(default = "default_reconnection_interval")]
    pub reconnection_interval_ms: u64,

    /// Upper bound for exponential reconnection waits (milliseconds).
    #[serde(default = "default_max_reconnection_interval")]
    pub max_reconnection_interval_ms: u64,

    /// Connect timeout for data and control channels (milliseconds).
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Timeout for one send or login round-trip (milliseconds).
    #[serde(default = "default_send_timeout")]
    pub send_timeout_ms: u64,

    /// How long an endpoint stays BUSY after a receiver backpressure signal.
    #[serde(default = "default_busy_backoff")]
    pub busy_backoff_ms: u64,

    /// How long shutdown waits for queued events to drain (milliseconds).
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_ms: u64,

    /// A session this close to its expiry is renewed before use.
    #[serde(default = "default_session_refresh_margin")]
    pub session_refresh_margin_ms: u64,
}

fn default_worker_count() -> usize {
    4
}
fn default_queue_capacity() -> usize {
    32_768
}
fn default_batch_size() -> usize {
    200
}
fn default_max_attempts() -> u32 {
    5
}
fn default_retry_backoff() -> u64 {
    1_000
}
fn default_reconnection_interval() -> u64 {
    5_000
}
fn default_max_reconnection_interval() -> u64 {
    60_000
}
fn default_connect_timeout() -> u64 {
    10_000
}
fn default_send_timeout() -> u64 {
    30_000
}
fn default_busy_backoff() -> u64 {
    500
}
fn default_shutdown_grace() -> u64 {
    10_000
}
fn default_session_refresh_margin() -> u64 {
    5_000
}

impl TransportSettings {
    /// Creates settings with defaults for the given protocol name.
    pub fn named(name: impl Into<String>) -> Self {
        TransportSettings {
            name: name.into(),
            worker_count: default_worker_count(),
            queue_capacity: default_queue_capacity(),
            batch_size: default_batch_size(),
            max_attempts: default_max_attempts(),
            retry_backoff_ms: default_retry_backoff(),
            reconnection_strategy: ReconnectionStrategy::default(),
            reconnection_interval_ms: default_reconnection_interval(),
            max_reconnection_interval_ms: default_max_reconnection_interval(),
            connect_timeout_ms: default_connect_timeout(),
            send_timeout_ms: default_send_timeout(),
            busy_backoff_ms: default_busy_backoff(),
            shutdown_grace_ms: default_shutdown_grace(),
            session_refresh_margin_ms: default_session_refresh_margin(),
        }
    }

    /// Validates one block.
    pub fn validate(&self) -> AgentResult<()> {
        let invalid = |msg: String| Err(AgentError::Configuration(msg));

        if self.name.trim().is_empty() {
            return invalid("transport name must not be empty".into());
        }
        if self.worker_count == 0 {
            return invalid(format!("[{}] worker_count must be greater than 0", self.name));
        }
        if self.queue_capacity == 0 {
            return invalid(format!("[{}] queue_capacity must be greater than 0", self.name));
        }
        if self.batch_size == 0 || self.batch_size > self.queue_capacity {
            return invalid(format!(
                "[{}] batch_size must be between 1 and queue_capacity ({})",
                self.name, self.queue_capacity
            ));
        }
        if self.max_attempts == 0 {
            return invalid(format!("[{}] max_attempts must be greater than 0", self.name));
        }
        if self.reconnection_interval_ms == 0 {
            return invalid(format!(
                "[{}] reconnection_interval_ms must be greater than 0",
                self.name
            ));
        }
        if self.max_reconnection_interval_ms < self.reconnection_interval_ms {
            return invalid(format!(
                "[{}] max_reconnection_interval_ms must be >= reconnection_interval_ms",
                self.name
            ));
        }
        if self.connect_timeout_ms == 0 || self.send_timeout_ms == 0 {
            return invalid(format!("[{}] timeouts must be greater than 0", self.name));
        }

        Ok(())
    }

    // =========================================================================
    // Duration Accessors
    // =========================================================================

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn reconnection_interval(&self) -> Duration {
        Duration::from_millis(self.reconnection_interval_ms)
    }

    pub fn max_reconnection_interval(&self) -> Duration {
        Duration::from_millis(self.max_reconnection_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn busy_backoff(&self) -> Duration {
        Duration::from_millis(self.busy_backoff_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn session_refresh_margin(&self) -> Duration {
        Duration::from_millis(self.session_refresh_margin_ms)
    }
}

// =============================================================================
// Main Agent Configuration
// =============================================================================

/// Complete agent configuration.
///
/// ## Example Config File
/// ```toml
/// [[transport]]
/// name = "tcp"
/// worker_count = 2
/// queue_capacity = 1000
///
/// [[transport]]
/// name = "binary"
/// worker_count = 8
/// reconnection_strategy = "fixed"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// One settings block per protocol.
    #[serde(rename = "transport", default = "default_transports")]
    pub transports: Vec<TransportSettings>,
}

fn default_transports() -> Vec<TransportSettings> {
    vec![TransportSettings::named(TCP_PROTOCOL)]
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            transports: default_transports(),
        }
    }
}

impl AgentConfig {
    /// Creates a config with a single default `tcp` block.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a TOML document and validates it. No environment overrides.
    pub fn from_toml_str(contents: &str) -> AgentResult<Self> {
        let config: AgentConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (agent.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> AgentResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading agent config from file");
                let contents = std::fs::read_to_string(&path)
                    .map_err(|e| AgentError::ConfigLoadFailed(format!("{}: {}", path.display(), e)))?;
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
            warn!("Failed to load agent config: {}. Using defaults.", e);
            Self::default()
        })
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> AgentResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| AgentError::ConfigLoadFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| AgentError::ConfigLoadFailed(e.to_string()))?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents).map_err(|e| AgentError::ConfigLoadFailed(e.to_string()))?;

        info!(?path, "Agent config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> AgentResult<()> {
        if self.transports.is_empty() {
            return Err(AgentError::Configuration(
                "at least one [[transport]] block is required".into(),
            ));
        }

        let mut seen = HashSet::new();
        for settings in &self.transports {
            settings.validate()?;
            if !seen.insert(settings.name.to_lowercase()) {
                return Err(AgentError::Configuration(format!(
                    "duplicate transport block '{}'",
                    settings.name
                )));
            }
        }

        Ok(())
    }

    /// Returns the settings block for a protocol (case-insensitive).
    pub fn settings(&self, protocol: &str) -> Option<&TransportSettings> {
        self.transports
            .iter()
            .find(|t| t.name.eq_ignore_ascii_case(protocol))
    }

    /// Inserts or replaces the block with the same name.
    pub fn upsert(&mut self, settings: TransportSettings) {
        match self
            .transports
            .iter_mut()
            .find(|t| t.name.eq_ignore_ascii_case(&settings.name))
        {
            Some(existing) => *existing = settings,
            None => self.transports.push(settings),
        }
    }

    /// Applies environment variable overrides to every transport block.
    fn apply_env_overrides(&mut self) {
        fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
            let raw = std::env::var(key).ok()?;
            match raw.parse() {
                Ok(v) => Some(v),
                Err(_) => {
                    warn!(key, value = %raw, "Ignoring unparseable environment override");
                    None
                }
            }
        }

        let worker_count = env_parse::<usize>("DATABRIDGE_WORKER_COUNT");
        let queue_capacity = env_parse::<usize>("DATABRIDGE_QUEUE_CAPACITY");
        let batch_size = env_parse::<usize>("DATABRIDGE_BATCH_SIZE");
        let max_attempts = env_parse::<u32>("DATABRIDGE_MAX_ATTEMPTS");
        let reconnection_interval = env_parse::<u64>("DATABRIDGE_RECONNECTION_INTERVAL_MS");
        let strategy = env_parse::<ReconnectionStrategy>("DATABRIDGE_RECONNECTION_STRATEGY");
        let send_timeout = env_parse::<u64>("DATABRIDGE_SEND_TIMEOUT_MS");
        let shutdown_grace = env_parse::<u64>("DATABRIDGE_SHUTDOWN_GRACE_MS");

        for settings in &mut self.transports {
            if let Some(v) = worker_count {
                debug!(transport = %settings.name, worker_count = v, "Overriding worker count from environment");
                settings.worker_count = v;
            }
            if let Some(v) = queue_capacity {
                settings.queue_capacity = v;
            }
            if let Some(v) = batch_size {
                settings.batch_size = v;
            }
            if let Some(v) = max_attempts {
                settings.max_attempts = v;
            }
            if let Some(v) = reconnection_interval {
                settings.reconnection_interval_ms = v;
            }
            if let Some(v) = strategy {
                settings.reconnection_strategy = v;
            }
            if let Some(v) = send_timeout {
                settings.send_timeout_ms = v;
            }
            if let Some(v) = shutdown_grace {
                settings.shutdown_grace_ms = v;
            }
        }
    }

    /// Returns the default config file path.
    fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("org", "databridge", "agent")
            .map(|dirs| dirs.config_dir().join("agent.toml"))
    }
}
