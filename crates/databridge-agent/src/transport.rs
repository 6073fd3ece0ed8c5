//! # Receiver Transports
//!
//! The seam between the dispatch engine and the bytes on the wire.
//!
//! ## Channel Model
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Transport Channels                              │
//! │                                                                         │
//! │   DataEndpoint                                                          │
//! │   ├── receiver URL ──► Transport::connect_data()    ──► DataChannel    │
//! │   │                                                      send(batch)    │
//! │   │                                                                     │
//! │   └── auth URL ──────► Transport::connect_control() ──► ControlChannel │
//! │                                                          login/logout   │
//! │                                                                         │
//! │   Built-in "tcp" transport: one JSON message per line, one response    │
//! │   line per request (see `protocol`). Any other codec plugs in by       │
//! │   implementing the three traits and registering it on the `Agent`.     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Channels are shared between dispatch workers, so every method takes
//! `&self`. Timeouts are applied by the caller, not by the transport.

use std::sync::Arc;

use async_trait::async_trait;
use databridge_core::{Event, ReceiverUrl};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::auth::Session;
use crate::error::{AgentError, AgentResult};
use crate::protocol::{error_from_code, WireMessage};

/// Protocol name of the built-in transport.
pub const TCP_PROTOCOL: &str = "tcp";

/// Longest response line the built-in transport will buffer, newline included.
pub const MAX_RESPONSE_LINE: usize = 64 * 1024;

// =============================================================================
// Transport Traits
// =============================================================================

/// Opens data and control channels to receiver URLs.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connects the data channel of an endpoint.
    async fn connect_data(&self, url: &ReceiverUrl) -> AgentResult<Arc<dyn DataChannel>>;

    /// Connects the control (authentication) channel of an endpoint.
    async fn connect_control(&self, url: &ReceiverUrl) -> AgentResult<Box<dyn ControlChannel>>;
}

/// Sends event batches within an authenticated session.
#[async_trait]
pub trait DataChannel: Send + Sync {
    /// Sends a batch. `Ok` means the receiver accepted every event.
    ///
    /// ## Errors
    /// - `ReceiverBusy` / `SessionExpired` for receiver signals
    /// - `Transport` / `Disconnected` / `Protocol` when the channel is unusable
    async fn send(&self, session: &Session, events: &[Event]) -> AgentResult<()>;

    /// Closes the channel. Best effort.
    async fn close(&self);
}

/// Opens and closes sessions.
#[async_trait]
pub trait ControlChannel: Send + Sync {
    /// Logs in with the configured credentials.
    async fn login(&self, username: &str, password: &str) -> AgentResult<Session>;

    /// Ends a session. Best effort.
    async fn logout(&self, session: &Session) -> AgentResult<()>;

    /// Closes the channel.
    async fn close(&self);
}

// =============================================================================
// Built-in Line-Delimited JSON Transport
// =============================================================================

/// Line-delimited JSON over TCP.
///
/// TLS termination is left to the network layer: `ssl://` URLs are dialed
/// the same way as `tcp://` URLs.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpTransport;

impl TcpTransport {
    pub fn new() -> Self {
        TcpTransport
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect_data(&self, url: &ReceiverUrl) -> AgentResult<Arc<dyn DataChannel>> {
        Ok(Arc::new(LineChannel::open(url).await?))
    }

    async fn connect_control(&self, url: &ReceiverUrl) -> AgentResult<Box<dyn ControlChannel>> {
        Ok(Box::new(LineChannel::open(url).await?))
    }
}

struct LineStream {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

/// One TCP connection, used strictly request/response.
///
/// The stream is taken out of its slot for the duration of a request. A
/// request that fails or is cancelled halfway never puts it back, so a
/// half-read response can never be attributed to a later request.
pub struct LineChannel {
    peer: String,
    stream: Mutex<Option<LineStream>>,
}

impl LineChannel {
    /// Dials the URL's host and port.
    pub async fn open(url: &ReceiverUrl) -> AgentResult<Self> {
        let peer = url.to_string();
        let stream = TcpStream::connect(url.authority())
            .await
            .map_err(|e| AgentError::transport(&peer, e))?;
        stream
            .set_nodelay(true)
            .map_err(|e| AgentError::transport(&peer, e))?;

        let (read, write) = stream.into_split();
        debug!(peer = %peer, "Channel connected");

        Ok(LineChannel {
            peer,
            stream: Mutex::new(Some(LineStream {
                reader: BufReader::new(read),
                writer: write,
            })),
        })
    }

    /// Sends one message and reads one response.
    pub async fn request(&self, message: &WireMessage) -> AgentResult<WireMessage> {
        let mut slot = self.stream.lock().await;
        let mut stream = slot
            .take()
            .ok_or_else(|| AgentError::Disconnected(self.peer.clone()))?;

        let response = self.round_trip(&mut stream, message).await?;
        *slot = Some(stream);
        Ok(response)
    }

    async fn round_trip(
        &self,
        stream: &mut LineStream,
        message: &WireMessage,
    ) -> AgentResult<WireMessage> {
        let mut line = message.to_json()?;
        line.push('\n');

        trace!(peer = %self.peer, msg_type = message.type_name(), "Sending message");
        stream
            .writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| AgentError::transport(&self.peer, e))?;
        stream
            .writer
            .flush()
            .await
            .map_err(|e| AgentError::transport(&self.peer, e))?;

        let mut response = String::new();
        let read = (&mut stream.reader)
            .take(MAX_RESPONSE_LINE as u64)
            .read_line(&mut response)
            .await
            .map_err(|e| AgentError::transport(&self.peer, e))?;
        if read == 0 {
            return Err(AgentError::Disconnected(self.peer.clone()));
        }
        if read >= MAX_RESPONSE_LINE && !response.ends_with('\n') {
            return Err(AgentError::Protocol(format!(
                "{} sent a response line longer than {} bytes",
                self.peer, MAX_RESPONSE_LINE
            )));
        }

        let response = WireMessage::from_json(&response)?;
        trace!(peer = %self.peer, msg_type = response.type_name(), "Received message");
        Ok(response)
    }

    async fn shutdown(&self) {
        if let Some(mut stream) = self.stream.lock().await.take() {
            let _ = stream.writer.shutdown().await;
            debug!(peer = %self.peer, "Channel closed");
        }
    }

    fn unexpected(&self, response: WireMessage) -> AgentError {
        AgentError::Protocol(format!(
            "{} sent unexpected {} response",
            self.peer,
            response.type_name()
        ))
    }
}

#[async_trait]
impl DataChannel for LineChannel {
    async fn send(&self, session: &Session, events: &[Event]) -> AgentResult<()> {
        match self.request(&WireMessage::publish(session.id(), events)).await? {
            WireMessage::Ack { count } if count == events.len() => Ok(()),
            WireMessage::Ack { count } => Err(AgentError::Protocol(format!(
                "{} acknowledged {} of {} events",
                self.peer,
                count,
                events.len()
            ))),
            WireMessage::Error { code, message } => Err(error_from_code(&self.peer, &code, &message)),
            other => Err(self.unexpected(other)),
        }
    }

    async fn close(&self) {
        self.shutdown().await;
    }
}

#[async_trait]
impl ControlChannel for LineChannel {
    async fn login(&self, username: &str, password: &str) -> AgentResult<Session> {
        match self.request(&WireMessage::login(username, password)).await? {
            WireMessage::LoginOk(ok) => Ok(Session::new(
                ok.session_id,
                ok.ttl_ms.map(std::time::Duration::from_millis),
            )),
            WireMessage::Error { code, message } => Err(error_from_code(&self.peer, &code, &message)),
            other => Err(self.unexpected(other)),
        }
    }

    async fn logout(&self, session: &Session) -> AgentResult<()> {
        let request = WireMessage::Logout {
            session_id: session.id().to_string(),
        };
        match self.request(&request).await? {
            WireMessage::Ack { .. } => Ok(()),
            WireMessage::Error { code, message } => Err(error_from_code(&self.peer, &code, &message)),
            other => Err(self.unexpected(other)),
        }
    }

    async fn close(&self) {
        self.shutdown().await;
    }
}
