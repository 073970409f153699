//! # Router Metrics
//!
//! Counters the router keeps about its own traffic. A [`RouterMetrics`]
//! handle is created by whoever builds the router and shared by `Arc`;
//! there is no process-wide instance, so two routers in one test process
//! never see each other's numbers.
//!
//! [`RouterMetrics::report`] renders the operator status document:
//!
//! ```json
//! {
//!   "Connections":      { "<peer hex>": 1 },
//!   "Packets_sent":     { "<peer hex>": 12 },
//!   "Packets_received": { "<peer hex>": 9 },
//!   "Packets_dropped":  0,
//!   "Id":               "<self hex>"
//! }
//! ```

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::crypto::NodeAddress;

/// Live traffic counters for one router.
#[derive(Debug)]
pub struct RouterMetrics {
    id: NodeAddress,
    connections: DashMap<NodeAddress, u64>,
    packets_sent: DashMap<NodeAddress, u64>,
    packets_received: DashMap<NodeAddress, u64>,
    packets_dropped: AtomicU64,
}

impl RouterMetrics {
    pub fn new(id: NodeAddress) -> Self {
        Self {
            id,
            connections: DashMap::new(),
            packets_sent: DashMap::new(),
            packets_received: DashMap::new(),
            packets_dropped: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> NodeAddress {
        self.id
    }

    pub fn connection_opened(&self, peer: NodeAddress) {
        *self.connections.entry(peer).or_insert(0) += 1;
    }

    pub fn connection_closed(&self, peer: NodeAddress) {
        self.connections.remove_if_mut(&peer, |_, count| {
            *count = count.saturating_sub(1);
            *count == 0
        });
    }

    /// A packet went out to `peer`.
    pub fn packet_sent(&self, peer: NodeAddress) {
        *self.packets_sent.entry(peer).or_insert(0) += 1;
    }

    /// A packet arrived from `peer` (ourselves for locally sent packets).
    pub fn packet_received(&self, peer: NodeAddress) {
        *self.packets_received.entry(peer).or_insert(0) += 1;
    }

    pub fn packet_dropped(&self) {
        self.packets_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn packets_dropped(&self) -> u64 {
        self.packets_dropped.load(Ordering::Relaxed)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn total_sent(&self) -> u64 {
        self.packets_sent.iter().map(|e| *e.value()).sum()
    }

    pub fn total_received(&self) -> u64 {
        self.packets_received.iter().map(|e| *e.value()).sum()
    }

    /// Snapshot as a status document.
    pub fn report(&self) -> StatusReport {
        StatusReport {
            connections: snapshot(&self.connections),
            packets_sent: snapshot(&self.packets_sent),
            packets_received: snapshot(&self.packets_received),
            packets_dropped: self.packets_dropped(),
            id: self.id.to_hex(),
        }
    }
}

fn snapshot(map: &DashMap<NodeAddress, u64>) -> BTreeMap<String, u64> {
    map.iter()
        .map(|e| (e.key().to_hex(), *e.value()))
        .collect()
}

/// The operator-facing status document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    #[serde(rename = "Connections")]
    pub connections: BTreeMap<String, u64>,
    #[serde(rename = "Packets_sent")]
    pub packets_sent: BTreeMap<String, u64>,
    #[serde(rename = "Packets_received")]
    pub packets_received: BTreeMap<String, u64>,
    #[serde(rename = "Packets_dropped")]
    pub packets_dropped: u64,
    #[serde(rename = "Id")]
    pub id: String,
}
