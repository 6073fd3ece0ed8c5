//! # Authentication Manager
//!
//! Per-endpoint session handling over the control channel.
//!
//! ## Authentication Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     Endpoint Authentication Flow                        │
//! │                                                                         │
//! │  ┌────────────────┐     ┌──────────────────┐     ┌─────────────────┐   │
//! │  │ Dispatch worker│     │ Endpoint auth    │     │ Receiver        │   │
//! │  │                │     │ slot (RwLock)    │     │ (auth URL)      │   │
//! │  └───────┬────────┘     └────────┬─────────┘     └────────┬────────┘   │
//! │          │ 1. ensure_authenticated │                       │            │
//! │          │────────────────────────►│                       │            │
//! │          │                         │ cached & fresh?       │            │
//! │          │◄────────────────────────│ yes: return session   │            │
//! │          │                         │                       │            │
//! │          │                         │ no: 2. Login          │            │
//! │          │                         │──────────────────────►│            │
//! │          │                         │◄──────────────────────│            │
//! │          │◄────────────────────────│ 3. LoginOk(session)   │            │
//! │          │                         │                       │            │
//! │          │ [Later: SESSION_EXPIRED on a send]              │            │
//! │          │ 4. invalidate ─────────►│ drop session          │            │
//! │          │                         │ next send logs in     │            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Rules
//! - The slot is double-checked after taking the write lock, so concurrent
//!   workers log in to one endpoint once.
//! - A session within the refresh margin of its expiry counts as expired.
//! - A failed login marks the endpoint Failed for that attempt only. It is
//!   never fatal to the publisher.

use std::fmt;
use std::time::Duration;

use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use crate::endpoint::DataEndpoint;
use crate::error::{AgentError, AgentResult};
use crate::transport::ControlChannel;

// =============================================================================
// Session
// =============================================================================

/// A session granted by a receiver's control channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    id: String,
    issued_at: Instant,
    expires_at: Option<Instant>,
}

impl Session {
    /// Creates a session issued now. `ttl = None` means it never expires.
    pub fn new(id: impl Into<String>, ttl: Option<Duration>) -> Self {
        let issued_at = Instant::now();
        Session {
            id: id.into(),
            issued_at,
            expires_at: ttl.map(|ttl| issued_at + ttl),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn issued_at(&self) -> Instant {
        self.issued_at
    }

    /// Check if the session is expired or about to expire
    pub fn needs_refresh(&self, margin: Duration) -> bool {
        self.expires_at
            .map_or(false, |expires_at| Instant::now() + margin >= expires_at)
    }

    /// Check if the session is completely expired (no grace period)
    pub fn is_expired(&self) -> bool {
        self.needs_refresh(Duration::ZERO)
    }

    /// Remaining lifetime, `None` for sessions without expiry.
    pub fn remaining(&self) -> Option<Duration> {
        self.expires_at
            .map(|expires_at| expires_at.saturating_duration_since(Instant::now()))
    }
}

/// Control channel and session of one endpoint.
#[derive(Default)]
pub(crate) struct AuthSlot {
    control: Option<Box<dyn ControlChannel>>,
    session: Option<Session>,
}

// =============================================================================
// Credentials
// =============================================================================

/// Username and password sent on login.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    username: String,
    password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Credentials {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

// =============================================================================
// Authentication Manager
// =============================================================================

/// Logs endpoints in on demand and caches their sessions.
#[derive(Debug)]
pub struct AuthenticationManager {
    credentials: Credentials,
}

impl AuthenticationManager {
    pub fn new(credentials: Credentials) -> Self {
        AuthenticationManager { credentials }
    }

    /// Returns the endpoint's session, logging in when there is none or it
    /// is about to expire.
    ///
    /// `generation` is the data-channel generation the caller is about to
    /// send on; a failed login reports the endpoint Failed for it.
    pub async fn ensure_authenticated(
        &self,
        endpoint: &DataEndpoint,
        generation: u64,
    ) -> AgentResult<Session> {
        let margin = endpoint.settings().session_refresh_margin();

        {
            let slot = endpoint.auth_slot().read().await;
            if let Some(session) = slot.session.as_ref() {
                if !session.needs_refresh(margin) {
                    return Ok(session.clone());
                }
            }
        }

        let mut slot = endpoint.auth_slot().write().await;

        // Double-check after acquiring write lock
        if let Some(session) = slot.session.as_ref() {
            if !session.needs_refresh(margin) {
                return Ok(session.clone());
            }
            debug!(endpoint = %endpoint.auth_url(), "Session near expiry, logging in again");
        }
        slot.session = None;

        let control = match slot.control.take() {
            Some(control) => control,
            None => match self.connect_control(endpoint).await {
                Ok(control) => control,
                Err(e) => return Err(self.fail(endpoint, generation, e)),
            },
        };

        let send_timeout = endpoint.settings().send_timeout();
        let result = match timeout(
            send_timeout,
            control.login(&self.credentials.username, &self.credentials.password),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(AgentError::Timeout {
                operation: format!("login at {}", endpoint.auth_url()),
                timeout: send_timeout,
            }),
        };

        match result {
            Ok(session) => {
                info!(
                    endpoint = %endpoint.auth_url(),
                    username = %self.credentials.username,
                    expires_in_ms = session.remaining().map(|d| d.as_millis() as u64),
                    "Authenticated with receiver"
                );
                slot.control = Some(control);
                slot.session = Some(session.clone());
                Ok(session)
            }
            Err(e) => {
                control.close().await;
                Err(self.fail(endpoint, generation, e))
            }
        }
    }

    /// Drops the cached session if it is still `session_id`.
    pub async fn invalidate(&self, endpoint: &DataEndpoint, session_id: &str) {
        let mut slot = endpoint.auth_slot().write().await;
        if slot.session.as_ref().map(Session::id) == Some(session_id) {
            slot.session = None;
            debug!(endpoint = %endpoint.auth_url(), "Session invalidated");
        }
    }

    /// Ends the endpoint's session and closes its control channel.
    ///
    /// Best effort: errors are logged, never returned.
    pub async fn logout(&self, endpoint: &DataEndpoint) {
        let (control, session) = {
            let mut slot = endpoint.auth_slot().write().await;
            (slot.control.take(), slot.session.take())
        };

        let Some(control) = control else {
            return;
        };

        if let Some(session) = session {
            let send_timeout = endpoint.settings().send_timeout();
            match timeout(send_timeout, control.logout(&session)).await {
                Ok(Ok(())) => debug!(endpoint = %endpoint.auth_url(), "Logged out"),
                Ok(Err(e)) => debug!(endpoint = %endpoint.auth_url(), error = %e, "Logout failed"),
                Err(_) => debug!(endpoint = %endpoint.auth_url(), "Logout timed out"),
            }
        }

        control.close().await;
    }

    async fn connect_control(&self, endpoint: &DataEndpoint) -> AgentResult<Box<dyn ControlChannel>> {
        let connect_timeout = endpoint.settings().connect_timeout();
        match timeout(
            connect_timeout,
            endpoint.transport().connect_control(endpoint.auth_url()),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(AgentError::Timeout {
                operation: format!("connect to {}", endpoint.auth_url()),
                timeout: connect_timeout,
            }),
        }
    }

    fn fail(&self, endpoint: &DataEndpoint, generation: u64, error: AgentError) -> AgentError {
        let error = match error {
            AgentError::Authentication { .. } => error,
            other => AgentError::Authentication {
                endpoint: endpoint.auth_url().to_string(),
                reason: other.to_string(),
            },
        };

        warn!(endpoint = %endpoint.auth_url(), error = %error, "Authentication failed");
        endpoint.mark_failed(generation, &error);
        error
    }
}
