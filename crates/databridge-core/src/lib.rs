//! # databridge-core: Pure Types for the Databridge Agent
//!
//! This crate contains everything about the event agent that can be decided
//! without touching the network: the event model and the receiver topology
//! grammar.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Databridge Agent Architecture                      │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                 Producer (application code)                     │   │
//! │  │        Event::builder(..) ──► EventPublisher::publish(..)      │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │            databridge-agent (Runtime Layer)                     │   │
//! │  │   queue, workers, endpoints, failover, auth, transports         │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │            ★ databridge-core (THIS CRATE) ★                      │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌─────────────┐  ┌───────────┐                │   │
//! │  │   │   event   │  │  topology   │  │   error   │                │   │
//! │  │   │   Event   │  │ ReceiverUrl │  │ CoreError │                │   │
//! │  │   │   Value   │  │  Topology   │  │ UrlError  │                │   │
//! │  │   └───────────┘  └─────────────┘  └───────────┘                │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO NETWORK • NO RUNTIME                              │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`event`] - `Event`, `Value`, stream ids
//! - [`topology`] - Receiver/auth URL grammar and shape validation
//! - [`error`] - Domain error types
//!
//! ## Example Usage
//!
//! ```rust
//! use databridge_core::{stream_id, Event, Topology};
//!
//! let topology = Topology::parse(
//!     "{tcp://a:7611|tcp://b:7611,tcp://c:7611}",
//!     Some("{ssl://a:7711|ssl://b:7711,ssl://c:7711}"),
//! ).unwrap();
//! assert_eq!(topology.group_count(), 2);
//!
//! let event = Event::builder(stream_id("org.example.Stats", "1.0.0"))
//!     .payload_data(vec!["ok".into()])
//!     .build()
//!     .unwrap();
//! assert_eq!(event.stream_id(), "org.example.Stats:1.0.0");
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod event;
pub mod topology;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use error::{CoreError, CoreResult, UrlError};
pub use event::{stream_id, Event, EventBuilder, Value};
pub use topology::{EndpointUrls, ReceiverUrl, Topology, TopologyGroup};
