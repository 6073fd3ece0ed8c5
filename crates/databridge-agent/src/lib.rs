//! # databridge-agent: Event Publishing Agent
//!
//! Client-side agent that ships structured events to one or more remote
//! receivers, with authentication, load balancing, failover and background
//! reconnection.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Publishing Architecture                          │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                 EventPublisher (public facade)                   │  │
//! │  │                                                                  │  │
//! │  │  publish / try_publish / try_publish_timeout / flush / shutdown  │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │                                         │
//! │                               ▼                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │  AsyncDispatcher: bounded queue + N dispatch workers (batching)  │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │ select_endpoint()                       │
//! │                               ▼                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │  FailoverChain                                                   │  │
//! │  │   tier 0: LoadBalancingGroup [ DataEndpoint | DataEndpoint ]     │  │
//! │  │   tier 1: LoadBalancingGroup [ DataEndpoint ]                    │  │
//! │  └───────────────┬──────────────────────────────┬───────────────────┘  │
//! │                  │                              │                       │
//! │                  ▼                              ▼                       │
//! │  ┌────────────────────────────┐  ┌──────────────────────────────────┐  │
//! │  │  AuthenticationManager     │  │  Reconnector (background task)   │  │
//! │  │  one session per endpoint  │  │  Failed ──backoff──► Active      │  │
//! │  └─────────────┬──────────────┘  └───────────────┬──────────────────┘  │
//! │                │ control channel                 │ data channel         │
//! │                ▼                                 ▼                      │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │  Transport (trait): built-in "tcp", more via Agent registration  │  │
//! │  └──────────────────────────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//! - [`agent`] - Shared `Agent`: configuration + transport registry
//! - [`config`] - Per-protocol tuning (`TransportSettings`), TOML + env
//! - [`error`] - Agent error types
//! - [`protocol`] - Wire messages of the built-in TCP transport
//! - [`transport`] - Transport traits and the built-in TCP transport
//! - [`endpoint`] - One receiver: connection state machine + backoff
//! - [`auth`] - Sessions and the authentication manager
//! - [`group`] - Round-robin load balancing within a tier
//! - [`failover`] - Ordered tiers with failover and failback
//! - [`reconnect`] - Background reconnection task
//! - [`dispatcher`] - Bounded queue and dispatch workers
//! - [`publisher`] - `EventPublisher` facade
//!
//! ## Usage
//!
//! ```rust,no_run
//! use databridge_agent::{Agent, AgentConfig, EventPublisher};
//! use databridge_core::Event;
//!
//! # async fn run() -> databridge_agent::AgentResult<()> {
//! let agent = Agent::new(AgentConfig::load_or_default(None))?;
//! let publisher = EventPublisher::builder("tcp", "{tcp://localhost:7611},{tcp://backup:7611}")
//!     .credentials("admin", "admin")
//!     .connect(&agent)?;
//!
//! let event = Event::builder("org.example.Stats:1.0.0")
//!     .payload_data(vec!["ok".into(), 42.into()])
//!     .build()?;
//! publisher.try_publish(event).await;
//!
//! publisher.flush().await;
//! publisher.shutdown_with_agent().await;
//! # Ok(())
//! # }
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

// Shared agent + configuration
pub mod agent;
pub mod config;
pub mod error;

// Wire level
pub mod protocol;
pub mod transport;

// Endpoint management
pub mod auth;
pub mod endpoint;
pub mod failover;
pub mod group;
pub mod reconnect;

// Dispatch
pub mod dispatcher;
pub mod publisher;

#[cfg(test)]
mod testing;

// =============================================================================
// Re-exports
// =============================================================================

pub use agent::Agent;
pub use auth::{AuthenticationManager, Credentials, Session};
pub use config::{AgentConfig, ReconnectionStrategy, TransportSettings};
pub use dispatcher::{DispatcherStats, DropReason, PublishMode, PublishOutcome};
pub use endpoint::{EndpointSnapshot, EndpointState};
pub use error::{AgentError, AgentResult};
pub use protocol::WireMessage;
pub use publisher::{EventPublisher, PublisherBuilder, PublisherConfig, PublisherState};
pub use transport::{ControlChannel, DataChannel, TcpTransport, Transport, TCP_PROTOCOL};

// Core types
pub use databridge_core::{Event, EventBuilder, Topology, Value};
