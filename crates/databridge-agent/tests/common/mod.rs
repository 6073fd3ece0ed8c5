//! Line-delimited JSON test receiver for the integration tests.

#![allow(dead_code)]

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use databridge_agent::protocol::{codes, LoginOkPayload};
use databridge_agent::{AgentConfig, TransportSettings, WireMessage, TCP_PROTOCOL};
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Default)]
struct ReceiverState {
    received: AtomicUsize,
    logins: AtomicUsize,
    busy_remaining: AtomicU32,
    sessions: Mutex<HashSet<String>>,
}

/// Accepts Login / Publish / Logout on a single port.
pub struct TestReceiver {
    addr: SocketAddr,
    username: String,
    password: String,
    state: Arc<ReceiverState>,
    stop: CancellationToken,
}

impl TestReceiver {
    /// Starts a receiver on an ephemeral port accepting `admin` / `admin`.
    pub async fn start() -> Self {
        Self::start_with_credentials("admin", "admin").await
    }

    pub async fn start_with_credentials(username: &str, password: &str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let receiver = TestReceiver {
            addr,
            username: username.to_string(),
            password: password.to_string(),
            state: Arc::new(ReceiverState::default()),
            stop: CancellationToken::new(),
        };

        let state = receiver.state.clone();
        let stop = receiver.stop.clone();
        let credentials = (receiver.username.clone(), receiver.password.clone());
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    accepted = listener.accept() => {
                        let Ok((socket, _)) = accepted else { continue };
                        tokio::spawn(serve(socket, state.clone(), stop.clone(), credentials.clone()));
                    }
                }
            }
        });

        receiver
    }

    /// `tcp://127.0.0.1:<port>`
    pub fn url(&self) -> String {
        format!("tcp://{}", self.addr)
    }

    pub fn received(&self) -> usize {
        self.state.received.load(Ordering::SeqCst)
    }

    pub fn logins(&self) -> usize {
        self.state.logins.load(Ordering::SeqCst)
    }

    /// Answers the next `times` publishes with BUSY.
    pub fn busy(&self, times: u32) {
        self.state.busy_remaining.store(times, Ordering::SeqCst);
    }

    /// Closes the listener and every open connection.
    pub fn stop(&self) {
        self.stop.cancel();
    }
}

impl Drop for TestReceiver {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

async fn serve(
    socket: TcpStream,
    state: Arc<ReceiverState>,
    stop: CancellationToken,
    (username, password): (String, String),
) {
    let (read, mut write) = socket.into_split();
    let mut lines = BufReader::new(read).lines();

    loop {
        let line = tokio::select! {
            _ = stop.cancelled() => return,
            line = lines.next_line() => match line {
                Ok(Some(line)) => line,
                _ => return,
            },
        };

        let response = match WireMessage::from_json(&line) {
            Ok(WireMessage::Login(login)) => {
                if login.username == username && login.password == password {
                    state.logins.fetch_add(1, Ordering::SeqCst);
                    let session_id = Uuid::new_v4().to_string();
                    state.sessions.lock().insert(session_id.clone());
                    WireMessage::LoginOk(LoginOkPayload {
                        session_id,
                        ttl_ms: None,
                    })
                } else {
                    WireMessage::error(codes::AUTH_FAILED, "invalid credentials")
                }
            }
            Ok(WireMessage::Publish(publish)) => {
                let busy = state
                    .busy_remaining
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
                if busy {
                    WireMessage::error(codes::BUSY, "try again")
                } else if !state.sessions.lock().contains(&publish.session_id) {
                    WireMessage::error(codes::SESSION_EXPIRED, "unknown session")
                } else {
                    state.received.fetch_add(publish.events.len(), Ordering::SeqCst);
                    WireMessage::Ack {
                        count: publish.events.len(),
                    }
                }
            }
            Ok(WireMessage::Logout { session_id }) => {
                state.sessions.lock().remove(&session_id);
                WireMessage::Ack { count: 0 }
            }
            Ok(_) => WireMessage::error(codes::BAD_REQUEST, "unexpected message"),
            Err(e) => WireMessage::error(codes::BAD_REQUEST, &e.to_string()),
        };

        let mut out = response.to_json().unwrap();
        out.push('\n');
        if write.write_all(out.as_bytes()).await.is_err() {
            return;
        }
    }
}

/// Agent config with short timers so failure paths finish quickly.
pub fn fast_config() -> AgentConfig {
    let mut settings = TransportSettings::named(TCP_PROTOCOL);
    settings.worker_count = 4;
    settings.queue_capacity = 1024;
    settings.batch_size = 50;
    settings.max_attempts = 20;
    settings.retry_backoff_ms = 50;
    settings.reconnection_interval_ms = 50;
    settings.max_reconnection_interval_ms = 200;
    settings.connect_timeout_ms = 1000;
    settings.send_timeout_ms = 2000;
    settings.busy_backoff_ms = 20;
    settings.shutdown_grace_ms = 2000;

    let mut config = AgentConfig::default();
    config.upsert(settings);
    config
}

/// Polls `check` until it holds or `wait` elapses.
pub async fn eventually(wait: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + wait;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
