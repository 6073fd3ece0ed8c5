//! # Receiver Protocol Messages
//!
//! Message types spoken by the built-in `tcp` transport.
//!
//! ## Protocol Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     Receiver Protocol Messages                          │
//! │                                                                         │
//! │  AUTHENTICATION (control channel, auth URL)                            │
//! │  ──────────────────────────────────────────                            │
//! │  AGENT    ───► Login { username, password }                            │
//! │  RECEIVER ◄─── LoginOk { session_id, ttl_ms }                          │
//! │  RECEIVER ◄─── Error { AUTH_FAILED, ... }                              │
//! │                                                                         │
//! │  AGENT    ───► Logout { session_id }                                   │
//! │  RECEIVER ◄─── Ack { count: 0 }                                        │
//! │                                                                         │
//! │  PUBLISHING (data channel, receiver URL)                               │
//! │  ───────────────────────────────────────                               │
//! │  AGENT    ───► Publish { session_id, events: [...] }                   │
//! │  RECEIVER ◄─── Ack { count }                                           │
//! │  RECEIVER ◄─── Error { SESSION_EXPIRED | BUSY, ... }                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Wire Format
//! One JSON document per line, adjacently tagged:
//! ```json
//! { "type": "Publish", "payload": { "session_id": "...", "events": [ ... ] } }
//! ```
//! Every request gets exactly one response line.

use databridge_core::Event;
use serde::{Deserialize, Serialize};

use crate::error::AgentError;

/// Current protocol version, sent with every login.
pub const PROTOCOL_VERSION: u32 = 1;

/// Error codes a receiver may answer with.
pub mod codes {
    /// Credentials rejected.
    pub const AUTH_FAILED: &str = "AUTH_FAILED";
    /// Session unknown or expired; log in again.
    pub const SESSION_EXPIRED: &str = "SESSION_EXPIRED";
    /// Receiver is overloaded; back off and retry.
    pub const BUSY: &str = "BUSY";
    /// Request could not be understood.
    pub const BAD_REQUEST: &str = "BAD_REQUEST";
}

// =============================================================================
// Main Message Enum (Tagged Union)
// =============================================================================

/// All receiver protocol messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum WireMessage {
    /// Opens a session on the control channel.
    Login(LoginPayload),

    /// Successful login.
    LoginOk(LoginOkPayload),

    /// Closes a session.
    Logout { session_id: String },

    /// Batch of events for the data channel.
    Publish(PublishPayload),

    /// Positive acknowledgement; `count` is the number of events accepted.
    Ack { count: usize },

    /// Negative acknowledgement.
    Error { code: String, message: String },
}

/// Login request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoginPayload {
    pub username: String,
    pub password: String,
    pub protocol_version: u32,
}

/// Login response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoginOkPayload {
    pub session_id: String,

    /// Session lifetime granted by the receiver; `None` means no expiry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_ms: Option<u64>,
}

/// Publish request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishPayload {
    pub session_id: String,
    pub events: Vec<Event>,
}

// =============================================================================
// Message Helpers
// =============================================================================

impl WireMessage {
    /// Returns the message type name for logging.
    pub fn type_name(&self) -> &'static str {
        match self {
            WireMessage::Login(_) => "Login",
            WireMessage::LoginOk(_) => "LoginOk",
            WireMessage::Logout { .. } => "Logout",
            WireMessage::Publish(_) => "Publish",
            WireMessage::Ack { .. } => "Ack",
            WireMessage::Error { .. } => "Error",
        }
    }

    /// Creates a Login message.
    pub fn login(username: &str, password: &str) -> Self {
        WireMessage::Login(LoginPayload {
            username: username.to_string(),
            password: password.to_string(),
            protocol_version: PROTOCOL_VERSION,
        })
    }

    /// Creates a Publish message.
    pub fn publish(session_id: &str, events: &[Event]) -> Self {
        WireMessage::Publish(PublishPayload {
            session_id: session_id.to_string(),
            events: events.to_vec(),
        })
    }

    /// Creates an Error message.
    pub fn error(code: &str, message: &str) -> Self {
        WireMessage::Error {
            code: code.to_string(),
            message: message.to_string(),
        }
    }

    /// Serializes to a JSON string (without the trailing newline).
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserializes from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json.trim_end())
    }
}

/// Maps a receiver error code to the agent error the dispatcher acts on.
pub fn error_from_code(endpoint: &str, code: &str, message: &str) -> AgentError {
    match code {
        codes::AUTH_FAILED => AgentError::Authentication {
            endpoint: endpoint.to_string(),
            reason: message.to_string(),
        },
        codes::SESSION_EXPIRED => AgentError::SessionExpired(endpoint.to_string()),
        codes::BUSY => AgentError::ReceiverBusy(endpoint.to_string()),
        _ => AgentError::Protocol(format!("{} answered {}: {}", endpoint, code, message)),
    }
}
