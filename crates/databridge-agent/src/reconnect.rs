//! # Reconnector
//!
//! Background task that brings endpoints (back) online.
//!
//! ## Loop
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Reconnector Loop                                 │
//! │                                                                         │
//! │   for each endpoint:                                                    │
//! │     Unconnected            ──► connect now                              │
//! │     Failed, backoff over   ──► connect now                              │
//! │     Failed, backoff running──► remember its deadline                    │
//! │                                                                         │
//! │   sleep until: earliest deadline | an endpoint fails | cancelled        │
//! │                                                                         │
//! │   connect ok ──► chain.notify_active() wakes waiting dispatch workers  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Connect attempts run as their own tasks, so one slow receiver never delays
//! the others. The wait between attempts of one endpoint is its
//! [`ReconnectionStrategy`](crate::config::ReconnectionStrategy) backoff.

use std::sync::Arc;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::failover::FailoverChain;

/// Drives endpoint reconnection for one failover chain.
pub struct Reconnector {
    chain: Arc<FailoverChain>,
    wake: Arc<Notify>,
    token: CancellationToken,
}

impl Reconnector {
    /// `wake` must be the notifier the chain's endpoints were created with.
    pub fn new(chain: Arc<FailoverChain>, wake: Arc<Notify>, token: CancellationToken) -> Self {
        Reconnector { chain, wake, token }
    }

    /// Spawns the reconnection loop. It runs until the token is cancelled.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        info!(
            endpoints = self.chain.endpoints().count(),
            tiers = self.chain.tier_count(),
            "Reconnector started"
        );

        loop {
            let next = self.connect_due();

            tokio::select! {
                _ = self.token.cancelled() => break,
                _ = self.wake.notified() => {}
                _ = sleep_until_or_forever(next) => {}
            }
        }

        info!("Reconnector stopped");
    }

    /// Starts a connect for every due endpoint and returns the earliest
    /// future deadline.
    fn connect_due(&self) -> Option<Instant> {
        let now = Instant::now();
        let mut next: Option<Instant> = None;

        for endpoint in self.chain.endpoints() {
            match endpoint.reconnect_at() {
                Some(at) if at <= now => {
                    let endpoint = Arc::clone(endpoint);
                    let chain = Arc::clone(&self.chain);
                    let token = self.token.clone();

                    tokio::spawn(async move {
                        tokio::select! {
                            _ = token.cancelled() => {}
                            result = endpoint.connect() => match result {
                                Ok(true) => chain.notify_active(),
                                Ok(false) => {}
                                Err(e) => debug!(
                                    endpoint = %endpoint.receiver_url(),
                                    error = %e,
                                    "Reconnect attempt failed"
                                ),
                            },
                        }
                    });
                }
                Some(at) => next = Some(next.map_or(at, |n| n.min(at))),
                None => {}
            }
        }

        next
    }
}

async fn sleep_until_or_forever(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}
