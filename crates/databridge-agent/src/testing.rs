//! In-memory transport for unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use databridge_core::{EndpointUrls, Event, ReceiverUrl};
use parking_lot::Mutex;

use crate::auth::Session;
use crate::error::{AgentError, AgentResult};
use crate::transport::{ControlChannel, DataChannel, Transport};

/// Receiver URL `tcp://host:port` paired with `ssl://host:port+100`.
pub(crate) fn endpoint_urls(host: &str, port: u16) -> EndpointUrls {
    EndpointUrls {
        receiver: ReceiverUrl::new("tcp", host, port),
        auth: ReceiverUrl::new("ssl", host, port + 100),
    }
}

fn key(host: &str, port: u16) -> String {
    format!("{}:{}", host, port)
}

#[derive(Default)]
struct MockState {
    refused: HashSet<String>,
    failing_sends: HashSet<String>,
    rejected_batches: HashSet<String>,
    busy_remaining: HashMap<String, u32>,
    expire_remaining: HashMap<String, u32>,
    reject_logins: bool,
    delivered: HashMap<String, usize>,
    logins: usize,
    logouts: usize,
}

/// Scriptable transport; receivers are addressed by `host:port`.
#[derive(Default)]
pub(crate) struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn refuse(&self, host: &str, port: u16) {
        self.state.lock().refused.insert(key(host, port));
    }

    pub(crate) fn accept(&self, host: &str, port: u16) {
        self.state.lock().refused.remove(&key(host, port));
    }

    pub(crate) fn fail_sends(&self, host: &str, port: u16, fail: bool) {
        let mut state = self.state.lock();
        if fail {
            state.failing_sends.insert(key(host, port));
        } else {
            state.failing_sends.remove(&key(host, port));
        }
    }

    /// Sends fail with an error no retry can fix.
    pub(crate) fn reject_batches(&self, host: &str, port: u16) {
        self.state.lock().rejected_batches.insert(key(host, port));
    }

    pub(crate) fn busy(&self, host: &str, port: u16, times: u32) {
        self.state.lock().busy_remaining.insert(key(host, port), times);
    }

    pub(crate) fn expire_sessions(&self, host: &str, port: u16, times: u32) {
        self.state.lock().expire_remaining.insert(key(host, port), times);
    }

    pub(crate) fn reject_logins(&self, reject: bool) {
        self.state.lock().reject_logins = reject;
    }

    pub(crate) fn delivered(&self, host: &str, port: u16) -> usize {
        self.state
            .lock()
            .delivered
            .get(&key(host, port))
            .copied()
            .unwrap_or(0)
    }

    pub(crate) fn total_delivered(&self) -> usize {
        self.state.lock().delivered.values().sum()
    }

    pub(crate) fn logins(&self) -> usize {
        self.state.lock().logins
    }

    pub(crate) fn logouts(&self) -> usize {
        self.state.lock().logouts
    }

    fn check_refused(&self, url: &ReceiverUrl) -> AgentResult<()> {
        if self.state.lock().refused.contains(&url.authority()) {
            return Err(AgentError::transport(url, "connection refused"));
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect_data(&self, url: &ReceiverUrl) -> AgentResult<Arc<dyn DataChannel>> {
        self.check_refused(url)?;
        Ok(Arc::new(MockChannel {
            key: url.authority(),
            state: Arc::clone(&self.state),
        }))
    }

    async fn connect_control(&self, url: &ReceiverUrl) -> AgentResult<Box<dyn ControlChannel>> {
        self.check_refused(url)?;
        Ok(Box::new(MockChannel {
            key: url.authority(),
            state: Arc::clone(&self.state),
        }))
    }
}

struct MockChannel {
    key: String,
    state: Arc<Mutex<MockState>>,
}

fn take_one(counts: &mut HashMap<String, u32>, key: &str) -> bool {
    match counts.get_mut(key) {
        Some(n) if *n > 0 => {
            *n -= 1;
            true
        }
        _ => false,
    }
}

#[async_trait]
impl DataChannel for MockChannel {
    async fn send(&self, _session: &Session, events: &[Event]) -> AgentResult<()> {
        let mut state = self.state.lock();
        if state.failing_sends.contains(&self.key) {
            return Err(AgentError::Disconnected(self.key.clone()));
        }
        if state.rejected_batches.contains(&self.key) {
            return Err(AgentError::Internal(format!("{} rejected the batch", self.key)));
        }
        if take_one(&mut state.busy_remaining, &self.key) {
            return Err(AgentError::ReceiverBusy(self.key.clone()));
        }
        if take_one(&mut state.expire_remaining, &self.key) {
            return Err(AgentError::SessionExpired(self.key.clone()));
        }
        *state.delivered.entry(self.key.clone()).or_default() += events.len();
        Ok(())
    }

    async fn close(&self) {}
}

#[async_trait]
impl ControlChannel for MockChannel {
    async fn login(&self, _username: &str, _password: &str) -> AgentResult<Session> {
        let mut state = self.state.lock();
        if state.reject_logins {
            return Err(AgentError::Authentication {
                endpoint: self.key.clone(),
                reason: "invalid credentials".into(),
            });
        }
        state.logins += 1;
        Ok(Session::new(format!("session-{}", state.logins), None))
    }

    async fn logout(&self, _session: &Session) -> AgentResult<()> {
        self.state.lock().logouts += 1;
        Ok(())
    }

    async fn close(&self) {}
}
