//! # Data Endpoint
//!
//! One receiver (data channel + control channel pair) and its health.
//!
//! ## Endpoint State Machine
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Endpoint States                                   │
//! │                                                                         │
//! │  ┌────────────┐   reconnector   ┌────────────┐   success  ┌──────────┐ │
//! │  │Unconnected │ ──────────────► │ Connecting │ ─────────► │  Active  │ │
//! │  └────────────┘                 └─────┬──────┘            └──┬────▲──┘ │
//! │                                       │ failure      BUSY    │    │    │
//! │                                       ▼              signal  ▼    │    │
//! │                                 ┌────────────┐          ┌────────┴─┐  │
//! │      send/auth error ─────────► │   Failed   │          │   Busy   │  │
//! │                                 └─────┬──────┘          └──────────┘  │
//! │                                       │ backoff expired   deadline    │
//! │                                       └──► Connecting     passed      │
//! │                                                                         │
//! │  Any state ──► Closed on shutdown (terminal)                           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Rules
//! - Every successful connect bumps the connection generation.
//! - A failure report carries the generation its sender used. Reports for an
//!   older generation, or for an endpoint that is already Failed or Closed,
//!   are ignored, so concurrent failures of one connection count once.
//! - The consecutive-failure counter grows on each Failed transition and
//!   resets on Active.

use std::fmt;
use std::sync::Arc;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use databridge_core::{EndpointUrls, ReceiverUrl};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{Notify, RwLock};
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use crate::auth::AuthSlot;
use crate::config::{ReconnectionStrategy, TransportSettings};
use crate::error::{AgentError, AgentResult};
use crate::transport::{DataChannel, Transport};

// =============================================================================
// Endpoint State
// =============================================================================

/// Health state of a [`DataEndpoint`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointState {
    /// Never connected yet.
    Unconnected,
    /// A connect attempt is in progress.
    Connecting,
    /// Selectable for sends.
    Active,
    /// Receiver asked for backpressure; skipped until the deadline passes.
    Busy,
    /// Waiting for the reconnector.
    Failed,
    /// Shut down. Terminal.
    Closed,
}

impl fmt::Display for EndpointState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointState::Unconnected => write!(f, "unconnected"),
            EndpointState::Connecting => write!(f, "connecting"),
            EndpointState::Active => write!(f, "active"),
            EndpointState::Busy => write!(f, "busy"),
            EndpointState::Failed => write!(f, "failed"),
            EndpointState::Closed => write!(f, "closed"),
        }
    }
}

/// Point-in-time view of an endpoint, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EndpointSnapshot {
    pub receiver_url: String,
    pub auth_url: String,
    pub tier: usize,
    pub state: EndpointState,
    pub consecutive_failures: u32,
    pub generation: u64,
}

// =============================================================================
// Health (guarded by the endpoint lock)
// =============================================================================

struct Health {
    state: EndpointState,
    consecutive_failures: u32,
    generation: u64,
    busy_until: Option<Instant>,
    retry_at: Option<Instant>,
    backoff: ExponentialBackoff,
    data: Option<Arc<dyn DataChannel>>,
}

impl Health {
    /// Promotes an expired Busy state back to Active.
    fn refresh(&mut self, now: Instant) {
        if self.state == EndpointState::Busy && self.busy_until.map_or(true, |t| t <= now) {
            self.state = EndpointState::Active;
            self.busy_until = None;
        }
    }
}

/// Builds the reconnection backoff for a transport block.
pub(crate) fn reconnect_backoff(settings: &TransportSettings) -> ExponentialBackoff {
    let multiplier = match settings.reconnection_strategy {
        ReconnectionStrategy::Fixed => 1.0,
        ReconnectionStrategy::Exponential => 2.0,
    };

    ExponentialBackoff {
        current_interval: settings.reconnection_interval(),
        initial_interval: settings.reconnection_interval(),
        max_interval: settings.max_reconnection_interval(),
        randomization_factor: 0.0,
        multiplier,
        max_elapsed_time: None,
        ..Default::default()
    }
}

// =============================================================================
// Data Endpoint
// =============================================================================

/// One receiver endpoint.
pub struct DataEndpoint {
    tier: usize,
    urls: EndpointUrls,
    transport: Arc<dyn Transport>,
    settings: Arc<TransportSettings>,
    health: Mutex<Health>,
    auth: RwLock<AuthSlot>,
    reconnect_wake: Arc<Notify>,
}

impl DataEndpoint {
    /// Creates an Unconnected endpoint. Nothing is dialed here.
    pub fn new(
        tier: usize,
        urls: EndpointUrls,
        transport: Arc<dyn Transport>,
        settings: Arc<TransportSettings>,
        reconnect_wake: Arc<Notify>,
    ) -> Self {
        let backoff = reconnect_backoff(&settings);
        DataEndpoint {
            tier,
            urls,
            transport,
            settings,
            health: Mutex::new(Health {
                state: EndpointState::Unconnected,
                consecutive_failures: 0,
                generation: 0,
                busy_until: None,
                retry_at: None,
                backoff,
                data: None,
            }),
            auth: RwLock::new(AuthSlot::default()),
            reconnect_wake,
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn receiver_url(&self) -> &ReceiverUrl {
        &self.urls.receiver
    }

    pub fn auth_url(&self) -> &ReceiverUrl {
        &self.urls.auth
    }

    /// Failover tier this endpoint belongs to (0 = primary).
    pub fn tier(&self) -> usize {
        self.tier
    }

    pub fn settings(&self) -> &TransportSettings {
        &self.settings
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub(crate) fn auth_slot(&self) -> &RwLock<AuthSlot> {
        &self.auth
    }

    /// Current state, with an expired Busy already promoted to Active.
    pub fn state(&self) -> EndpointState {
        let mut health = self.health.lock();
        health.refresh(Instant::now());
        health.state
    }

    /// Returns true if the endpoint may be selected for a send.
    pub fn is_eligible(&self) -> bool {
        self.state() == EndpointState::Active
    }

    pub fn generation(&self) -> u64 {
        self.health.lock().generation
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.health.lock().consecutive_failures
    }

    /// The data channel and the generation it belongs to.
    ///
    /// `None` unless the endpoint is Active or Busy.
    pub fn channel(&self) -> Option<(u64, Arc<dyn DataChannel>)> {
        let health = self.health.lock();
        match health.state {
            EndpointState::Active | EndpointState::Busy => health
                .data
                .as_ref()
                .map(|data| (health.generation, Arc::clone(data))),
            _ => None,
        }
    }

    /// When the reconnector should next try this endpoint, if at all.
    pub fn reconnect_at(&self) -> Option<Instant> {
        let health = self.health.lock();
        match health.state {
            EndpointState::Unconnected => Some(Instant::now()),
            EndpointState::Failed => Some(health.retry_at.unwrap_or_else(Instant::now)),
            _ => None,
        }
    }

    pub fn snapshot(&self) -> EndpointSnapshot {
        let mut health = self.health.lock();
        health.refresh(Instant::now());
        EndpointSnapshot {
            receiver_url: self.urls.receiver.to_string(),
            auth_url: self.urls.auth.to_string(),
            tier: self.tier,
            state: health.state,
            consecutive_failures: health.consecutive_failures,
            generation: health.generation,
        }
    }

    // =========================================================================
    // Transitions
    // =========================================================================

    /// Connects the data channel if the endpoint is due for it.
    ///
    /// Returns `Ok(true)` when the endpoint became Active, `Ok(false)` when it
    /// was not due (already connected, connecting elsewhere, or still in
    /// backoff).
    pub async fn connect(&self) -> AgentResult<bool> {
        {
            let mut health = self.health.lock();
            let due = match health.state {
                EndpointState::Unconnected => true,
                EndpointState::Failed => health.retry_at.map_or(true, |t| t <= Instant::now()),
                _ => false,
            };
            if !due {
                return Ok(false);
            }
            health.state = EndpointState::Connecting;
        }

        debug!(endpoint = %self.urls.receiver, tier = self.tier, "Connecting endpoint");

        let connect_timeout = self.settings.connect_timeout();
        let result = match timeout(connect_timeout, self.transport.connect_data(&self.urls.receiver)).await {
            Ok(result) => result,
            Err(_) => Err(AgentError::Timeout {
                operation: format!("connect to {}", self.urls.receiver),
                timeout: connect_timeout,
            }),
        };

        let orphan = {
            let mut health = self.health.lock();
            if health.state == EndpointState::Closed {
                result.ok()
            } else {
                match result {
                    Ok(channel) => {
                        health.generation += 1;
                        health.data = Some(channel);
                        health.state = EndpointState::Active;
                        health.consecutive_failures = 0;
                        health.busy_until = None;
                        health.retry_at = None;
                        health.backoff.reset();
                        info!(
                            endpoint = %self.urls.receiver,
                            tier = self.tier,
                            generation = health.generation,
                            "Endpoint active"
                        );
                        return Ok(true);
                    }
                    Err(e) => {
                        self.record_failure(&mut health, &e);
                        return Err(e);
                    }
                }
            }
        };

        // Closed while we were dialing
        if let Some(channel) = orphan {
            channel.close().await;
        }
        Err(AgentError::ShuttingDown)
    }

    /// Reports a failed send, login or handshake made on `generation`.
    ///
    /// Returns true if this report caused the Failed transition.
    pub fn mark_failed(&self, generation: u64, error: &AgentError) -> bool {
        let mut health = self.health.lock();
        let current = matches!(health.state, EndpointState::Active | EndpointState::Busy);
        if !current || health.generation != generation {
            debug!(
                endpoint = %self.urls.receiver,
                reported = generation,
                current = health.generation,
                state = %health.state,
                "Ignoring stale failure report"
            );
            return false;
        }

        self.record_failure(&mut health, error);
        true
    }

    /// Reports a receiver backpressure signal seen on `generation`.
    pub fn mark_busy(&self, generation: u64) -> bool {
        let mut health = self.health.lock();
        let current = matches!(health.state, EndpointState::Active | EndpointState::Busy);
        if !current || health.generation != generation {
            return false;
        }

        health.state = EndpointState::Busy;
        health.busy_until = Some(Instant::now() + self.settings.busy_backoff());
        debug!(endpoint = %self.urls.receiver, "Endpoint busy");
        true
    }

    /// Moves the endpoint to Closed and closes its data channel.
    pub async fn close(&self) {
        let channel = {
            let mut health = self.health.lock();
            health.state = EndpointState::Closed;
            health.data.take()
        };

        if let Some(channel) = channel {
            channel.close().await;
        }
        debug!(endpoint = %self.urls.receiver, "Endpoint closed");
    }

    fn record_failure(&self, health: &mut Health, error: &AgentError) {
        health.state = EndpointState::Failed;
        health.data = None;
        health.busy_until = None;
        health.consecutive_failures += 1;

        let delay = health
            .backoff
            .next_backoff()
            .unwrap_or_else(|| self.settings.max_reconnection_interval());
        health.retry_at = Some(Instant::now() + delay);

        warn!(
            endpoint = %self.urls.receiver,
            tier = self.tier,
            consecutive_failures = health.consecutive_failures,
            retry_in_ms = delay.as_millis() as u64,
            error = %error,
            "Endpoint failed"
        );
        self.reconnect_wake.notify_one();
    }
}

impl fmt::Debug for DataEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataEndpoint")
            .field("receiver", &self.urls.receiver.to_string())
            .field("auth", &self.urls.auth.to_string())
            .field("tier", &self.tier)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{endpoint_urls, MockTransport};
    use std::time::Duration;

    fn endpoint(transport: Arc<MockTransport>, settings: TransportSettings) -> DataEndpoint {
        DataEndpoint::new(
            0,
            endpoint_urls("h1", 7611),
            transport,
            Arc::new(settings),
            Arc::new(Notify::new()),
        )
    }

    fn fast_settings() -> TransportSettings {
        let mut settings = TransportSettings::named("mock");
        settings.reconnection_interval_ms = 20;
        settings.max_reconnection_interval_ms = 80;
        settings.busy_backoff_ms = 30;
        settings
    }

    #[tokio::test]
    async fn test_connect_moves_to_active() {
        let ep = endpoint(MockTransport::new(), fast_settings());
        assert_eq!(ep.state(), EndpointState::Unconnected);
        assert!(ep.reconnect_at().is_some());

        assert!(ep.connect().await.unwrap());
        assert_eq!(ep.state(), EndpointState::Active);
        assert_eq!(ep.generation(), 1);
        assert!(ep.channel().is_some());

        // Already active: nothing to do
        assert!(!ep.connect().await.unwrap());
        assert_eq!(ep.generation(), 1);
    }

    #[tokio::test]
    async fn test_failed_connect_schedules_retry() {
        let transport = MockTransport::new();
        transport.refuse("h1", 7611);
        let ep = endpoint(transport.clone(), fast_settings());

        assert!(ep.connect().await.is_err());
        assert_eq!(ep.state(), EndpointState::Failed);
        assert_eq!(ep.consecutive_failures(), 1);
        assert!(ep.reconnect_at().unwrap() > Instant::now());

        // Still inside the backoff window
        assert!(!ep.connect().await.unwrap());

        transport.accept("h1", 7611);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(ep.connect().await.unwrap());
        assert_eq!(ep.consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_failure_reports_count_once() {
        let ep = endpoint(MockTransport::new(), fast_settings());
        ep.connect().await.unwrap();
        let generation = ep.generation();
        let err = AgentError::Disconnected("h1".into());

        assert!(ep.mark_failed(generation, &err));
        assert!(!ep.mark_failed(generation, &err));
        assert_eq!(ep.consecutive_failures(), 1);
    }

    #[tokio::test]
    async fn test_stale_generation_is_ignored() {
        let ep = endpoint(MockTransport::new(), fast_settings());
        ep.connect().await.unwrap();
        let old = ep.generation();
        ep.mark_failed(old, &AgentError::Disconnected("h1".into()));

        tokio::time::sleep(Duration::from_millis(30)).await;
        ep.connect().await.unwrap();
        assert_eq!(ep.generation(), old + 1);

        // A late report about the previous connection changes nothing
        assert!(!ep.mark_failed(old, &AgentError::Disconnected("h1".into())));
        assert_eq!(ep.state(), EndpointState::Active);
    }

    #[tokio::test]
    async fn test_busy_expires_back_to_active() {
        let ep = endpoint(MockTransport::new(), fast_settings());
        ep.connect().await.unwrap();

        assert!(ep.mark_busy(ep.generation()));
        assert_eq!(ep.state(), EndpointState::Busy);
        assert!(!ep.is_eligible());
        assert_eq!(ep.consecutive_failures(), 0);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(ep.is_eligible());
    }

    #[tokio::test]
    async fn test_close_is_terminal() {
        let ep = endpoint(MockTransport::new(), fast_settings());
        ep.connect().await.unwrap();
        ep.close().await;

        assert_eq!(ep.state(), EndpointState::Closed);
        assert!(ep.channel().is_none());
        assert!(ep.reconnect_at().is_none());
        assert!(!ep.connect().await.unwrap());
    }

    #[test]
    fn test_fixed_strategy_keeps_interval() {
        let mut settings = fast_settings();
        settings.reconnection_strategy = ReconnectionStrategy::Fixed;
        let mut backoff = reconnect_backoff(&settings);
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(20)));
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(20)));

        settings.reconnection_strategy = ReconnectionStrategy::Exponential;
        let mut backoff = reconnect_backoff(&settings);
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(20)));
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(40)));
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(80)));
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(80)));
    }
}
