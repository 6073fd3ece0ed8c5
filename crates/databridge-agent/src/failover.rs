//! # Failover Chain
//!
//! Ordered failover tiers, each a [`LoadBalancingGroup`].
//!
//! ## Tier Advancement
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  tier 0 (primary)   tier 1           tier 2                             │
//! │  [ A | B ]    ──►   [ C | D ]   ──►  [ E ]   ──► EndpointsExhausted     │
//! │      ▲                  │                                               │
//! │      └── failback ──────┘  as soon as A or B is Active again            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Rules
//! - Before selecting, the chain fails back to the highest-priority tier
//!   that has an Active endpoint, if that tier is above the current one.
//! - An empty tier advances the chain strictly forward. There is no wrap.
//! - The active tier index is only read and written under its lock.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::endpoint::{DataEndpoint, EndpointSnapshot, EndpointState};
use crate::error::{AgentError, AgentResult};
use crate::group::LoadBalancingGroup;

/// Ordered failover tiers with failback.
#[derive(Debug)]
pub struct FailoverChain {
    groups: Vec<LoadBalancingGroup>,
    active: Mutex<usize>,
    activations: watch::Sender<u64>,
}

impl FailoverChain {
    /// Creates a chain; the first group is the primary tier.
    pub fn new(groups: Vec<LoadBalancingGroup>) -> Self {
        let (activations, _) = watch::channel(0);
        FailoverChain {
            groups,
            active: Mutex::new(0),
            activations,
        }
    }

    pub fn groups(&self) -> &[LoadBalancingGroup] {
        &self.groups
    }

    pub fn tier_count(&self) -> usize {
        self.groups.len()
    }

    /// Index of the tier selections currently come from.
    pub fn active_tier(&self) -> usize {
        *self.active.lock()
    }

    /// Every endpoint, tier by tier.
    pub fn endpoints(&self) -> impl Iterator<Item = &Arc<DataEndpoint>> {
        self.groups.iter().flat_map(|group| group.endpoints().iter())
    }

    pub fn snapshots(&self) -> Vec<EndpointSnapshot> {
        self.endpoints().map(|endpoint| endpoint.snapshot()).collect()
    }

    /// Selects the endpoint for the next send.
    ///
    /// ## Errors
    /// - [`AgentError::EndpointsExhausted`] when no tier from the active one
    ///   onward has an Active endpoint
    pub fn select_endpoint(&self) -> AgentResult<Arc<DataEndpoint>> {
        let mut active = self.active.lock();

        // Failback
        if let Some(tier) = self.groups[..*active].iter().position(|g| g.has_active()) {
            info!(from = *active, to = tier, "Failing back to higher-priority tier");
            *active = tier;
        }

        for tier in *active..self.groups.len() {
            if let Some(endpoint) = self.groups[tier].select_endpoint() {
                if tier != *active {
                    info!(from = *active, to = tier, "Failing over to next tier");
                    *active = tier;
                }
                return Ok(endpoint);
            }
        }

        if let Some(last) = self.groups.len().checked_sub(1) {
            *active = last;
        }
        debug!(tiers = self.groups.len(), "No endpoint available");
        Err(AgentError::EndpointsExhausted {
            tiers: self.groups.len(),
        })
    }

    /// Returns true if some endpoint is Busy, i.e. will be usable again soon
    /// without reconnecting.
    pub fn has_busy(&self) -> bool {
        self.endpoints()
            .any(|endpoint| endpoint.state() == EndpointState::Busy)
    }

    /// Signals waiters that an endpoint became Active.
    pub fn notify_active(&self) {
        self.activations.send_modify(|count| *count = count.wrapping_add(1));
    }

    /// Subscribes to "endpoint became Active" signals.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.activations.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportSettings;
    use crate::testing::{endpoint_urls, MockTransport};
    use std::time::Duration;
    use tokio::sync::Notify;

    /// Builds a chain with one group per entry, ports as given, all connected.
    async fn chain(tiers: &[&[u16]]) -> FailoverChain {
        let transport = MockTransport::new();
        let mut settings = TransportSettings::named("mock");
        settings.reconnection_interval_ms = 10;
        let settings = Arc::new(settings);
        let wake = Arc::new(Notify::new());

        let mut groups = Vec::new();
        for (tier, ports) in tiers.iter().enumerate() {
            let mut endpoints = Vec::new();
            for port in *ports {
                let ep = Arc::new(DataEndpoint::new(
                    tier,
                    endpoint_urls("h", *port),
                    transport.clone(),
                    settings.clone(),
                    wake.clone(),
                ));
                ep.connect().await.unwrap();
                endpoints.push(ep);
            }
            groups.push(LoadBalancingGroup::new(tier, endpoints));
        }
        FailoverChain::new(groups)
    }

    fn fail_tier(chain: &FailoverChain, tier: usize) {
        for ep in chain.groups()[tier].endpoints() {
            ep.mark_failed(ep.generation(), &AgentError::Disconnected("h".into()));
        }
    }

    #[tokio::test]
    async fn test_primary_tier_preferred() {
        let chain = chain(&[&[1, 2], &[3]]).await;
        for _ in 0..4 {
            assert_eq!(chain.select_endpoint().unwrap().tier(), 0);
        }
        assert_eq!(chain.active_tier(), 0);
    }

    #[tokio::test]
    async fn test_advances_then_fails_back() {
        let chain = chain(&[&[1], &[2]]).await;

        fail_tier(&chain, 0);
        let ep = chain.select_endpoint().unwrap();
        assert_eq!(ep.receiver_url().port(), 2);
        assert_eq!(chain.active_tier(), 1);

        // Primary comes back
        tokio::time::sleep(Duration::from_millis(20)).await;
        chain.groups()[0].endpoints()[0].connect().await.unwrap();

        let ep = chain.select_endpoint().unwrap();
        assert_eq!(ep.receiver_url().port(), 1);
        assert_eq!(chain.active_tier(), 0);
    }

    #[tokio::test]
    async fn test_exhausted_when_every_tier_down() {
        let chain = chain(&[&[1], &[2]]).await;
        fail_tier(&chain, 0);
        fail_tier(&chain, 1);

        let err = chain.select_endpoint().unwrap_err();
        assert!(matches!(err, AgentError::EndpointsExhausted { tiers: 2 }));
    }

    #[tokio::test]
    async fn test_no_wrap_to_earlier_tier_without_active() {
        let chain = chain(&[&[1], &[2], &[3]]).await;
        fail_tier(&chain, 0);
        fail_tier(&chain, 1);

        assert_eq!(chain.select_endpoint().unwrap().tier(), 2);
        fail_tier(&chain, 2);
        assert!(chain.select_endpoint().is_err());
    }

    #[tokio::test]
    async fn test_activation_signal() {
        let chain = chain(&[&[1]]).await;
        let mut rx = chain.subscribe();
        chain.notify_active();
        tokio::time::timeout(Duration::from_millis(100), rx.changed())
            .await
            .unwrap()
            .unwrap();
    }
}
