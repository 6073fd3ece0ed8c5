//! # Error Types
//!
//! Domain-specific error types for databridge-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  databridge-core errors (this file)                                    │
//! │  ├── CoreError        - Topology / event construction failures         │
//! │  └── UrlError         - A single receiver URL could not be parsed      │
//! │                                                                         │
//! │  databridge-agent errors (separate crate)                              │
//! │  └── AgentError       - Runtime failures (auth, transport, dispatch)   │
//! │                                                                         │
//! │  Flow: UrlError → CoreError → AgentError::Configuration → caller       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Design Principles
//! 1. Use `thiserror` for derive macros (not manual impl)
//! 2. Include the offending expression or URL in the message
//! 3. Everything raised here is a configuration problem: it is detected
//!    before any connection is attempted and is never retried

use thiserror::Error;

// =============================================================================
// Core Error
// =============================================================================

/// Errors raised while building topologies and events.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// A receiver or authentication URL is malformed.
    #[error("Invalid receiver URL: {0}")]
    InvalidUrl(#[from] UrlError),

    /// The topology expression itself is malformed.
    ///
    /// ## When This Occurs
    /// - Empty expression, or an empty alternative (`"a,,b"`)
    /// - Empty endpoint between pipes (`"a||b"`)
    /// - Unbalanced or nested braces (`"{a,b"`, `"{{a}}"`)
    #[error("Malformed topology '{expression}': {reason}")]
    MalformedTopology { expression: String, reason: String },

    /// Receiver and authentication topologies declare a different number of
    /// failover alternatives.
    #[error("Receiver topology has {receiver} failover groups but auth topology has {auth}")]
    GroupCountMismatch { receiver: usize, auth: usize },

    /// One failover alternative has a different number of load-balanced
    /// endpoints on the receiver side and on the auth side.
    ///
    /// ## Example
    /// ```text
    /// receiver: {tcp://h:9129|tcp://h:9229 , tcp://h:9229}
    ///            └──── group 0: 2 URLs ───┘
    /// auth:     {ssl://h:9130 , ssl://h:9230}
    ///            └ group 0: 1 ┘
    ///
    /// → EndpointCountMismatch { group: 0, receiver: 2, auth: 1 }
    /// ```
    #[error("Failover group {group} has {receiver} receiver URLs but {auth} auth URLs")]
    EndpointCountMismatch {
        group: usize,
        receiver: usize,
        auth: usize,
    },

    /// A required event field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },
}

// =============================================================================
// URL Error
// =============================================================================

/// Reasons a single `scheme://host:port` URL is rejected.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UrlError {
    /// The URL could not be parsed at all.
    #[error("'{url}' is not a valid URL: {reason}")]
    Unparseable { url: String, reason: String },

    /// The scheme contains characters outside `[a-z0-9+.-]`.
    #[error("'{url}' has an invalid scheme")]
    InvalidScheme { url: String },

    /// No host component.
    #[error("'{url}' has no host")]
    MissingHost { url: String },

    /// No explicit port. Receivers have no well-known default port.
    #[error("'{url}' has no port")]
    MissingPort { url: String },

    /// Path, query or fragment present; receiver URLs are `scheme://host:port` only.
    #[error("'{url}' must not contain a path, query or fragment")]
    UnexpectedComponent { url: String },
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;

// =============================================================================
// Unit Tests
// =============================================================================
