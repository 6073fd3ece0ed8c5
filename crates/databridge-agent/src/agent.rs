//! # Agent
//!
//! Shared owner of the agent configuration, the transport registry and the
//! background resources every publisher created through it uses.
//!
//! ## Agent Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          Agent Architecture                             │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                        Arc<Agent>                                │  │
//! │  │                                                                  │  │
//! │  │  • AgentConfig: one TransportSettings block per protocol         │  │
//! │  │  • Transport registry: "tcp" built in, more via register_*      │  │
//! │  │  • Root CancellationToken: parent of every reconnector           │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │ EventPublisher::connect(&agent, ..)     │
//! │         ┌─────────────────────┼─────────────────────┐                  │
//! │         ▼                     ▼                     ▼                   │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────┐            │
//! │  │ EventPublisher │  │ EventPublisher │  │ EventPublisher │            │
//! │  │ ("tcp")        │  │ ("tcp")        │  │ ("binary")     │            │
//! │  └────────────────┘  └────────────────┘  └────────────────┘            │
//! │                                                                         │
//! │  Agent::shutdown() cancels every reconnector and refuses new           │
//! │  publishers.                                                           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! There is no process-wide agent. Create one with [`Agent::new`] and pass it
//! to the publishers that should share it.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::{AgentConfig, TransportSettings};
use crate::error::{AgentError, AgentResult};
use crate::transport::{TcpTransport, Transport, TCP_PROTOCOL};

/// Shared agent state. Always used through `Arc<Agent>`.
pub struct Agent {
    config: AgentConfig,
    transports: RwLock<HashMap<String, Arc<dyn Transport>>>,
    shutdown: CancellationToken,
}

impl Agent {
    /// Validates the configuration and creates the agent with the built-in
    /// `tcp` transport registered.
    pub fn new(config: AgentConfig) -> AgentResult<Arc<Self>> {
        config.validate()?;

        let mut transports: HashMap<String, Arc<dyn Transport>> = HashMap::new();
        transports.insert(TCP_PROTOCOL.to_string(), Arc::new(TcpTransport::new()));

        info!(
            transports = config.transports.len(),
            "Agent created"
        );

        Ok(Arc::new(Agent {
            config,
            transports: RwLock::new(transports),
            shutdown: CancellationToken::new(),
        }))
    }

    /// Creates an agent with the default configuration.
    pub fn with_defaults() -> AgentResult<Arc<Self>> {
        Self::new(AgentConfig::default())
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Registers (or replaces) the transport for a protocol name.
    pub fn register_transport(&self, protocol: &str, transport: Arc<dyn Transport>) {
        let protocol = protocol.to_lowercase();
        debug!(protocol = %protocol, "Registering transport");
        self.transports.write().insert(protocol, transport);
    }

    /// Looks up the transport for a protocol (case-insensitive).
    pub fn transport(&self, protocol: &str) -> AgentResult<Arc<dyn Transport>> {
        self.transports
            .read()
            .get(&protocol.to_lowercase())
            .cloned()
            .ok_or_else(|| AgentError::UnknownProtocol(protocol.to_string()))
    }

    /// Settings for a protocol.
    ///
    /// A protocol with a registered transport but no `[[transport]]` block
    /// gets the defaults.
    pub fn settings(&self, protocol: &str) -> TransportSettings {
        match self.config.settings(protocol) {
            Some(settings) => settings.clone(),
            None => {
                debug!(protocol, "No transport block configured, using defaults");
                TransportSettings::named(protocol.to_lowercase())
            }
        }
    }

    /// Returns true once [`shutdown`](Self::shutdown) was called.
    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// A token cancelled when the agent shuts down.
    ///
    /// ## Errors
    /// - [`AgentError::Configuration`] if the agent is already shut down
    pub(crate) fn child_token(&self) -> AgentResult<CancellationToken> {
        if self.is_shut_down() {
            return Err(AgentError::Configuration(
                "agent has been shut down".into(),
            ));
        }
        Ok(self.shutdown.child_token())
    }

    /// Cancels every reconnector started through this agent. Idempotent.
    pub fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            self.shutdown.cancel();
            info!("Agent shut down");
        }
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut protocols: Vec<String> = self.transports.read().keys().cloned().collect();
        protocols.sort();
        f.debug_struct("Agent")
            .field("transports", &protocols)
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}
