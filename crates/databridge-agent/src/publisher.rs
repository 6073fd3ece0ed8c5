//! # Event Publisher
//!
//! Public facade: one receiver topology, one queue, one worker pool.
//!
//! ## Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Publisher Lifecycle                               │
//! │                                                                         │
//! │  connect()                                                              │
//! │    │  parse + validate topology  ──► Err(Configuration), nothing started│
//! │    ▼                                                                    │
//! │  ┌─────────┐   publish / try_publish / try_publish_timeout / flush     │
//! │  │ Running │ ◄──────────────────────────────────────────────────────   │
//! │  └────┬────┘                                                            │
//! │       │ shutdown()                                                      │
//! │       ▼                                                                 │
//! │  ┌──────────────┐  1. stop accepting, release waiting producers        │
//! │  │ ShuttingDown │  2. drain queue for up to shutdown_grace              │
//! │  └──────┬───────┘  3. stop workers, count leftovers as dropped          │
//! │         │          4. stop reconnector, log out, close endpoints        │
//! │         ▼                                                               │
//! │  ┌─────────┐                                                            │
//! │  │ Closed  │   further publishes return Dropped(ShuttingDown)           │
//! │  └─────────┘                                                            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//! ```rust,no_run
//! use databridge_agent::{Agent, AgentConfig, EventPublisher};
//! use databridge_core::{stream_id, Event};
//!
//! # async fn run() -> databridge_agent::AgentResult<()> {
//! let agent = Agent::new(AgentConfig::default())?;
//! let publisher = EventPublisher::builder("tcp", "{tcp://10.0.0.1:7611|tcp://10.0.0.2:7611}")
//!     .credentials("admin", "admin")
//!     .connect(&agent)?;
//!
//! let event = Event::builder(stream_id("org.example.Stats", "1.0.0"))
//!     .payload_data(vec!["ok".into()])
//!     .build()?;
//! publisher.publish(event).await;
//!
//! publisher.shutdown_with_agent().await;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use databridge_core::{Event, Topology};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::agent::Agent;
use crate::auth::{AuthenticationManager, Credentials};
use crate::dispatcher::{AsyncDispatcher, DispatcherStats, PublishMode, PublishOutcome};
use crate::endpoint::{DataEndpoint, EndpointSnapshot};
use crate::error::{AgentError, AgentResult};
use crate::failover::FailoverChain;
use crate::group::LoadBalancingGroup;
use crate::reconnect::Reconnector;

// =============================================================================
// Publisher Configuration
// =============================================================================

/// What a publisher connects to.
///
/// ## URL Syntax
/// - `tcp://h1:7611` - one receiver
/// - `{tcp://h1:7611|tcp://h2:7611}` - one tier, round-robin between two
/// - `{tcp://h1:7611},{tcp://h2:7611}` - primary tier, then a failover tier
///
/// `auth_urls` must have the same shape. When absent, each auth URL is
/// derived from its receiver URL as `ssl://host:port+100`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublisherConfig {
    /// Transport protocol name (e.g. `"tcp"`).
    pub protocol: String,

    /// Receiver topology expression.
    pub receiver_urls: String,

    /// Auth topology expression.
    #[serde(default)]
    pub auth_urls: Option<String>,

    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub password: String,
}

impl PublisherConfig {
    pub fn new(
        protocol: impl Into<String>,
        receiver_urls: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        PublisherConfig {
            protocol: protocol.into(),
            receiver_urls: receiver_urls.into(),
            auth_urls: None,
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn with_auth_urls(mut self, auth_urls: impl Into<String>) -> Self {
        self.auth_urls = Some(auth_urls.into());
        self
    }

    /// Parses the topology. No I/O.
    pub fn topology(&self) -> AgentResult<Topology> {
        if self.protocol.trim().is_empty() {
            return Err(AgentError::Configuration("protocol must not be empty".into()));
        }
        Ok(Topology::parse(&self.receiver_urls, self.auth_urls.as_deref())?)
    }
}

impl fmt::Debug for PublisherConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublisherConfig")
            .field("protocol", &self.protocol)
            .field("receiver_urls", &self.receiver_urls)
            .field("auth_urls", &self.auth_urls)
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Builder for [`EventPublisher`].
#[derive(Debug, Clone)]
pub struct PublisherBuilder {
    config: PublisherConfig,
}

impl PublisherBuilder {
    pub fn auth_urls(mut self, auth_urls: impl Into<String>) -> Self {
        self.config.auth_urls = Some(auth_urls.into());
        self
    }

    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.config.username = username.into();
        self.config.password = password.into();
        self
    }

    pub fn config(self) -> PublisherConfig {
        self.config
    }

    pub fn connect(self, agent: &Arc<Agent>) -> AgentResult<EventPublisher> {
        EventPublisher::connect(agent, self.config)
    }
}

// =============================================================================
// Publisher State
// =============================================================================

/// Lifecycle state of an [`EventPublisher`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PublisherState {
    Created,
    Running,
    ShuttingDown,
    Closed,
}

impl fmt::Display for PublisherState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PublisherState::Created => write!(f, "created"),
            PublisherState::Running => write!(f, "running"),
            PublisherState::ShuttingDown => write!(f, "shutting_down"),
            PublisherState::Closed => write!(f, "closed"),
        }
    }
}

// =============================================================================
// Event Publisher
// =============================================================================

/// Publishes events to a receiver topology.
pub struct EventPublisher {
    id: Uuid,
    protocol: String,
    agent: Arc<Agent>,
    chain: Arc<FailoverChain>,
    auth: Arc<AuthenticationManager>,
    dispatcher: AsyncDispatcher,
    reconnector_token: CancellationToken,
    reconnector: parking_lot::Mutex<Option<JoinHandle<()>>>,
    state: watch::Sender<PublisherState>,
}

impl EventPublisher {
    /// Starts a builder for the given protocol and receiver topology.
    pub fn builder(protocol: impl Into<String>, receiver_urls: impl Into<String>) -> PublisherBuilder {
        PublisherBuilder {
            config: PublisherConfig::new(protocol, receiver_urls, "", ""),
        }
    }

    /// Validates the configuration and starts the publisher.
    ///
    /// Connections are opened in the background; this returns as soon as
    /// the workers and the reconnector are running. Must be called from
    /// within a Tokio runtime.
    ///
    /// ## Errors
    /// - [`AgentError::Configuration`] for malformed or mismatched topologies,
    ///   invalid settings, or an agent that has been shut down
    /// - [`AgentError::UnknownProtocol`] when no transport is registered
    pub fn connect(agent: &Arc<Agent>, config: PublisherConfig) -> AgentResult<Self> {
        let topology = config.topology()?;
        let transport = agent.transport(&config.protocol)?;
        let settings = agent.settings(&config.protocol);
        settings.validate()?;

        if tokio::runtime::Handle::try_current().is_err() {
            return Err(AgentError::Internal(
                "EventPublisher::connect must be called within a Tokio runtime".into(),
            ));
        }
        let reconnector_token = agent.child_token()?;

        let id = Uuid::new_v4();
        let settings = Arc::new(settings);
        let wake = Arc::new(Notify::new());

        let groups = topology
            .groups()
            .iter()
            .enumerate()
            .map(|(tier, group)| {
                let endpoints = group
                    .endpoints()
                    .iter()
                    .map(|urls| {
                        Arc::new(DataEndpoint::new(
                            tier,
                            urls.clone(),
                            Arc::clone(&transport),
                            Arc::clone(&settings),
                            Arc::clone(&wake),
                        ))
                    })
                    .collect();
                LoadBalancingGroup::new(tier, endpoints)
            })
            .collect();
        let chain = Arc::new(FailoverChain::new(groups));

        let auth = Arc::new(AuthenticationManager::new(Credentials::new(
            config.username.clone(),
            config.password.clone(),
        )));

        let (state, _) = watch::channel(PublisherState::Created);

        let reconnector =
            Reconnector::new(Arc::clone(&chain), wake, reconnector_token.clone()).spawn();
        let dispatcher = AsyncDispatcher::start(Arc::clone(&chain), Arc::clone(&auth), settings);
        state.send_replace(PublisherState::Running);

        info!(
            publisher_id = %id,
            protocol = %config.protocol,
            tiers = topology.group_count(),
            endpoints = topology.endpoint_count(),
            "Publisher connected"
        );

        Ok(EventPublisher {
            id,
            protocol: config.protocol.to_lowercase(),
            agent: Arc::clone(agent),
            chain,
            auth,
            dispatcher,
            reconnector_token,
            reconnector: parking_lot::Mutex::new(Some(reconnector)),
            state,
        })
    }

    // =========================================================================
    // Publishing
    // =========================================================================

    /// Enqueues an event, waiting for capacity as long as it takes.
    ///
    /// Only shutdown interrupts the wait.
    pub async fn publish(&self, event: Event) -> PublishOutcome {
        self.publish_with(event, PublishMode::Blocking).await
    }

    /// Enqueues an event if there is capacity right now.
    pub async fn try_publish(&self, event: Event) -> PublishOutcome {
        self.publish_with(event, PublishMode::NonBlocking).await
    }

    /// Enqueues an event, waiting at most `wait` for capacity.
    pub async fn try_publish_timeout(&self, event: Event, wait: Duration) -> PublishOutcome {
        self.publish_with(event, PublishMode::Timeout(wait)).await
    }

    /// Enqueues an event with an explicit wait policy.
    pub async fn publish_with(&self, event: Event, mode: PublishMode) -> PublishOutcome {
        self.dispatcher.enqueue(event, mode).await
    }

    /// Waits until every accepted event was delivered or dropped.
    pub async fn flush(&self) {
        self.dispatcher.flush().await;
    }

    /// Like [`flush`](Self::flush), bounded. Returns true if it drained.
    pub async fn flush_timeout(&self, wait: Duration) -> bool {
        self.dispatcher.flush_timeout(wait).await
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn agent(&self) -> &Arc<Agent> {
        &self.agent
    }

    pub fn state(&self) -> PublisherState {
        *self.state.borrow()
    }

    pub fn stats(&self) -> DispatcherStats {
        self.dispatcher.stats()
    }

    /// Failover tier selections currently come from.
    pub fn active_tier(&self) -> usize {
        self.chain.active_tier()
    }

    pub fn endpoints(&self) -> Vec<EndpointSnapshot> {
        self.chain.snapshots()
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Shuts the publisher down. Idempotent; concurrent callers all return
    /// once the publisher is Closed.
    pub async fn shutdown(&self) {
        let mut owner = false;
        self.state.send_if_modified(|state| match state {
            PublisherState::Created | PublisherState::Running => {
                *state = PublisherState::ShuttingDown;
                owner = true;
                true
            }
            _ => false,
        });

        if !owner {
            let mut closed = self.state.subscribe();
            let _ = closed.wait_for(|s| *s == PublisherState::Closed).await;
            return;
        }

        info!(publisher_id = %self.id, "Publisher shutting down");

        self.dispatcher.shutdown().await;

        self.reconnector_token.cancel();
        let reconnector = self.reconnector.lock().take();
        if let Some(handle) = reconnector {
            let _ = handle.await;
        }

        for endpoint in self.chain.endpoints() {
            self.auth.logout(endpoint).await;
            endpoint.close().await;
        }

        self.state.send_replace(PublisherState::Closed);
        info!(publisher_id = %self.id, stats = ?self.stats(), "Publisher closed");
    }

    /// Shuts the publisher down, then the agent it was created from.
    pub async fn shutdown_with_agent(&self) {
        self.shutdown().await;
        self.agent.shutdown();
    }
}

impl Drop for EventPublisher {
    fn drop(&mut self) {
        if self.state() != PublisherState::Closed {
            debug!(publisher_id = %self.id, "Publisher dropped without shutdown");
            self.reconnector_token.cancel();
        }
    }
}

impl fmt::Debug for EventPublisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventPublisher")
            .field("id", &self.id)
            .field("protocol", &self.protocol)
            .field("state", &self.state())
            .field("tiers", &self.chain.tier_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::DropReason;
    use crate::endpoint::EndpointState;
    use crate::testing::MockTransport;
    use crate::config::{AgentConfig, TransportSettings};

    fn agent_with_mock() -> (Arc<Agent>, Arc<MockTransport>) {
        let mut config = AgentConfig::default();
        let mut mock = TransportSettings::named("mock");
        mock.worker_count = 2;
        mock.queue_capacity = 256;
        mock.batch_size = 16;
        mock.retry_backoff_ms = 20;
        mock.reconnection_interval_ms = 20;
        mock.shutdown_grace_ms = 500;
        config.upsert(mock);

        let agent = Agent::new(config).unwrap();
        let transport = MockTransport::new();
        agent.register_transport("mock", transport.clone());
        (agent, transport)
    }

    fn event(n: i32) -> Event {
        Event::builder("org.example.MediatorStatistics:1.0.0")
            .meta_data(vec!["127.0.0.1".into()])
            .payload_data(vec!["example".into(), 123.4.into(), n.into(), 12.4.into(), 1.3.into()])
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_configuration_errors_start_nothing() {
        let (agent, _) = agent_with_mock();

        let err = EventPublisher::builder("mock", "{tcp://h:7611},{tcp://h:7612}")
            .auth_urls("{ssl://h:7711}")
            .connect(&agent)
            .unwrap_err();
        assert!(matches!(err, AgentError::Configuration(_)));

        let err = EventPublisher::builder("mock", "{tcp://h:7611|tcp://h:7612}")
            .auth_urls("{ssl://h:7711}")
            .connect(&agent)
            .unwrap_err();
        assert!(matches!(err, AgentError::Configuration(_)));

        let err = EventPublisher::builder("thrift", "tcp://h:7611")
            .connect(&agent)
            .unwrap_err();
        assert!(matches!(err, AgentError::UnknownProtocol(_)));
    }

    #[tokio::test]
    async fn test_auth_urls_derived_when_absent() {
        let (agent, _) = agent_with_mock();
        let publisher = EventPublisher::builder("mock", "tcp://h:9661")
            .credentials("admin", "admin")
            .connect(&agent)
            .unwrap();

        let endpoints = publisher.endpoints();
        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0].receiver_url, "tcp://h:9661");
        assert_eq!(endpoints[0].auth_url, "ssl://h:9761");

        publisher.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_publish_flush_shutdown() {
        let (agent, transport) = agent_with_mock();
        let publisher = EventPublisher::builder("mock", "{tcp://h:1|tcp://h:2}")
            .credentials("admin", "admin")
            .connect(&agent)
            .unwrap();
        assert_eq!(publisher.state(), PublisherState::Running);

        for n in 0..100 {
            assert!(publisher.publish(event(n)).await.is_enqueued());
        }
        assert!(publisher.flush_timeout(Duration::from_secs(5)).await);
        assert_eq!(transport.total_delivered(), 100);
        assert_eq!(publisher.stats().delivered, 100);

        publisher.shutdown().await;
        assert_eq!(publisher.state(), PublisherState::Closed);
        assert!(publisher
            .endpoints()
            .iter()
            .all(|e| e.state == EndpointState::Closed));
        assert!(transport.logouts() >= 1);

        assert_eq!(
            publisher.try_publish(event(0)).await,
            PublishOutcome::Dropped(DropReason::ShuttingDown)
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_shutdown_is_idempotent() {
        let (agent, _) = agent_with_mock();
        let publisher = Arc::new(
            EventPublisher::builder("mock", "tcp://h:1")
                .connect(&agent)
                .unwrap(),
        );

        let a = {
            let p = publisher.clone();
            tokio::spawn(async move { p.shutdown().await })
        };
        let b = {
            let p = publisher.clone();
            tokio::spawn(async move { p.shutdown().await })
        };
        a.await.unwrap();
        b.await.unwrap();
        publisher.shutdown().await;

        assert_eq!(publisher.state(), PublisherState::Closed);
        assert!(!agent.is_shut_down());
    }

    #[tokio::test]
    async fn test_shutdown_with_agent() {
        let (agent, _) = agent_with_mock();
        let publisher = EventPublisher::builder("mock", "tcp://h:1")
            .connect(&agent)
            .unwrap();

        publisher.shutdown_with_agent().await;
        assert!(agent.is_shut_down());

        let err = EventPublisher::builder("mock", "tcp://h:1")
            .connect(&agent)
            .unwrap_err();
        assert!(err.is_config_error());
    }

    #[test]
    fn test_connect_outside_runtime_fails() {
        let (agent, _) = agent_with_mock();
        let err = EventPublisher::builder("mock", "tcp://h:1")
            .connect(&agent)
            .unwrap_err();
        assert!(matches!(err, AgentError::Internal(_)));
    }

    #[test]
    fn test_config_debug_hides_password() {
        let config = PublisherConfig::new("tcp", "tcp://h:1", "admin", "hunter2");
        assert!(!format!("{:?}", config).contains("hunter2"));
    }
}
