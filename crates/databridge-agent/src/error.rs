//! # Agent Error Types
//!
//! Error types for publisher construction and event dispatch.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Agent Error Categories                            │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │ Authentication  │  │     Transport           │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  Configuration  │  │  Authentication │  │  Transport              │ │
//! │  │  UnknownProtocol│  │  SessionExpired │  │  Timeout                │ │
//! │  │                 │  │                 │  │  Disconnected           │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │    Receiver     │  │    Selection    │  │      Lifecycle          │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  ReceiverBusy   │  │  Endpoints      │  │  ShuttingDown           │ │
//! │  │  Protocol       │  │  Exhausted      │  │  Internal               │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Propagation Policy
//! Only configuration errors ever reach a caller synchronously (from
//! `EventPublisher::connect`). Everything else is absorbed by the dispatcher:
//! it changes endpoint health, consumes a task's retry budget, and shows up in
//! `DispatcherStats` and the logs. A batch that hits a non-retryable error
//! (see [`AgentError::is_retryable`]) is dropped at once.

use std::time::Duration;

use databridge_core::{CoreError, UrlError};
use thiserror::Error;

/// Result type alias for agent operations.
pub type AgentResult<T> = Result<T, AgentError>;

/// Agent error type covering all possible agent failures.
#[derive(Debug, Error, Clone)]
pub enum AgentError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Malformed or mismatched topology, or invalid agent configuration.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// No transport is registered under the requested protocol name.
    #[error("No transport registered for protocol '{0}'")]
    UnknownProtocol(String),

    /// Failed to load or parse the agent configuration file.
    #[error("Failed to load agent config: {0}")]
    ConfigLoadFailed(String),

    // =========================================================================
    // Authentication Errors
    // =========================================================================
    /// The control channel rejected the configured credentials.
    #[error("Authentication failed at {endpoint}: {reason}")]
    Authentication { endpoint: String, reason: String },

    /// The receiver no longer accepts the session; log in again.
    #[error("Session expired at {0}")]
    SessionExpired(String),

    // =========================================================================
    // Transport Errors
    // =========================================================================
    /// I/O failure while connecting, authenticating or sending.
    #[error("Transport error at {endpoint}: {reason}")]
    Transport { endpoint: String, reason: String },

    /// An operation did not complete within its deadline.
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: String,
        timeout: Duration,
    },

    /// The peer closed the connection.
    #[error("Disconnected from {0}")]
    Disconnected(String),

    /// The peer sent something the transport does not understand.
    #[error("Protocol error: {0}")]
    Protocol(String),

    // =========================================================================
    // Receiver Signals
    // =========================================================================
    /// The receiver asked us to back off temporarily.
    #[error("Receiver {0} is busy")]
    ReceiverBusy(String),

    // =========================================================================
    // Selection Errors
    // =========================================================================
    /// No endpoint in any failover tier is currently usable.
    #[error("No receiver endpoint available in any of {tiers} failover groups")]
    EndpointsExhausted { tiers: usize },

    // =========================================================================
    // Lifecycle Errors
    // =========================================================================
    /// The publisher or agent is shutting down.
    #[error("Publisher is shutting down")]
    ShuttingDown,

    /// Internal agent error.
    #[error("Internal error: {0}")]
    Internal(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<CoreError> for AgentError {
    fn from(err: CoreError) -> Self {
        AgentError::Configuration(err.to_string())
    }
}

impl From<UrlError> for AgentError {
    fn from(err: UrlError) -> Self {
        AgentError::Configuration(err.to_string())
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(err: serde_json::Error) -> Self {
        AgentError::Protocol(err.to_string())
    }
}

impl From<toml::de::Error> for AgentError {
    fn from(err: toml::de::Error) -> Self {
        AgentError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for AgentError {
    fn from(err: toml::ser::Error) -> Self {
        AgentError::ConfigLoadFailed(err.to_string())
    }
}

// =============================================================================
// Error Categorization (for dispatch decisions)
// =============================================================================

impl AgentError {
    /// Wraps an I/O error with the endpoint it happened on.
    pub fn transport(endpoint: impl ToString, err: impl ToString) -> Self {
        AgentError::Transport {
            endpoint: endpoint.to_string(),
            reason: err.to_string(),
        }
    }

    /// Returns true if a task that hit this error may be sent again.
    ///
    /// ## Retryable Errors
    /// - Transport failures, timeouts, disconnects and protocol errors
    ///   (the endpoint is failed, another one may work)
    /// - Authentication failures and expired sessions (per endpoint)
    /// - Busy receivers and exhausted endpoints (transient)
    ///
    /// ## Non-Retryable Errors
    /// - Configuration errors
    /// - Shutdown and internal errors
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AgentError::Transport { .. }
                | AgentError::Timeout { .. }
                | AgentError::Disconnected(_)
                | AgentError::Protocol(_)
                | AgentError::Authentication { .. }
                | AgentError::SessionExpired(_)
                | AgentError::ReceiverBusy(_)
                | AgentError::EndpointsExhausted { .. }
        )
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            AgentError::Configuration(_)
                | AgentError::UnknownProtocol(_)
                | AgentError::ConfigLoadFailed(_)
        )
    }

    /// Returns true if the endpoint that produced this error must be marked FAILED.
    pub fn is_endpoint_failure(&self) -> bool {
        matches!(
            self,
            AgentError::Transport { .. }
                | AgentError::Timeout { .. }
                | AgentError::Disconnected(_)
                | AgentError::Authentication { .. }
                | AgentError::Protocol(_)
        )
    }
}
