//! # Load-Balancing Group
//!
//! Round-robin selection among the endpoints of one failover tier.
//!
//! ## Selection
//! ```text
//!   cursor
//!     │
//!     ▼
//!   [ A:active ][ B:busy ][ C:failed ][ D:active ]
//!
//!   select() -> A, cursor -> B
//!   select() -> D (B skipped without penalty, C skipped), cursor -> A
//!   select() -> A ...
//! ```
//! With N Active endpoints, N consecutive selections return each exactly once.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::endpoint::DataEndpoint;

/// Ordered, non-empty set of endpoints sharing one failover tier.
#[derive(Debug)]
pub struct LoadBalancingGroup {
    tier: usize,
    endpoints: Vec<Arc<DataEndpoint>>,
    cursor: Mutex<usize>,
}

impl LoadBalancingGroup {
    pub fn new(tier: usize, endpoints: Vec<Arc<DataEndpoint>>) -> Self {
        LoadBalancingGroup {
            tier,
            endpoints,
            cursor: Mutex::new(0),
        }
    }

    pub fn tier(&self) -> usize {
        self.tier
    }

    pub fn endpoints(&self) -> &[Arc<DataEndpoint>] {
        &self.endpoints
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Returns the next Active endpoint in rotation, or `None` when every
    /// endpoint is ineligible.
    pub fn select_endpoint(&self) -> Option<Arc<DataEndpoint>> {
        let count = self.endpoints.len();
        if count == 0 {
            return None;
        }

        let mut cursor = self.cursor.lock();
        for offset in 0..count {
            let index = (*cursor + offset) % count;
            let endpoint = &self.endpoints[index];
            if endpoint.is_eligible() {
                *cursor = (index + 1) % count;
                return Some(Arc::clone(endpoint));
            }
        }
        None
    }

    /// Returns true if at least one endpoint is Active.
    pub fn has_active(&self) -> bool {
        self.endpoints.iter().any(|endpoint| endpoint.is_eligible())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportSettings;
    use crate::error::AgentError;
    use crate::testing::{endpoint_urls, MockTransport};
    use std::collections::HashSet;
    use tokio::sync::Notify;

    async fn group(ports: &[u16]) -> LoadBalancingGroup {
        let transport = MockTransport::new();
        let settings = Arc::new(TransportSettings::named("mock"));
        let wake = Arc::new(Notify::new());

        let mut endpoints = Vec::new();
        for port in ports {
            let ep = Arc::new(DataEndpoint::new(
                0,
                endpoint_urls("h", *port),
                transport.clone(),
                settings.clone(),
                wake.clone(),
            ));
            ep.connect().await.unwrap();
            endpoints.push(ep);
        }
        LoadBalancingGroup::new(0, endpoints)
    }

    fn port_of(ep: &DataEndpoint) -> u16 {
        ep.receiver_url().port()
    }

    #[tokio::test]
    async fn test_round_robin_visits_each_once() {
        let group = group(&[1, 2, 3]).await;

        let picked: Vec<u16> = (0..3)
            .map(|_| port_of(&group.select_endpoint().unwrap()))
            .collect();
        assert_eq!(picked, vec![1, 2, 3]);

        let distinct: HashSet<u16> = (0..3)
            .map(|_| port_of(&group.select_endpoint().unwrap()))
            .collect();
        assert_eq!(distinct.len(), 3);
    }

    #[tokio::test]
    async fn test_busy_and_failed_are_skipped() {
        let group = group(&[1, 2, 3]).await;
        let eps = group.endpoints().to_vec();

        eps[0].mark_busy(eps[0].generation());
        eps[1].mark_failed(eps[1].generation(), &AgentError::Disconnected("h:2".into()));

        for _ in 0..4 {
            assert_eq!(port_of(&group.select_endpoint().unwrap()), 3);
        }
        // Busy is not a failure
        assert_eq!(eps[0].consecutive_failures(), 0);
        assert!(group.has_active());
    }

    #[tokio::test]
    async fn test_all_ineligible_returns_none() {
        let group = group(&[1, 2]).await;
        for ep in group.endpoints() {
            ep.mark_failed(ep.generation(), &AgentError::Disconnected("h".into()));
        }

        assert!(group.select_endpoint().is_none());
        assert!(!group.has_active());
    }
}
