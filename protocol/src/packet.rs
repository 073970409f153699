//! # Packets and Routing Decisions
//!
//! A [`Packet`] is the unit of forwarding: an opaque payload, the address
//! it is headed for, and the amount the sender is willing to pay for
//! delivery. A [`RoutingDecision`] is the record a node keeps after it
//! handles one packet; receipts and the ledger both join on its hash.

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::crypto::hash::hex_bytes;
use crate::crypto::{NodeAddress, PacketHash};

/// A data packet as carried on the `packet` stream and the local socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    /// Final destination.
    pub dest: NodeAddress,
    /// Amount paid for delivery. Never negative on a valid packet.
    pub amt: i64,
    /// Opaque payload, hex in JSON.
    #[serde(with = "hex_bytes")]
    pub data: Vec<u8>,
}

impl Packet {
    pub fn new(dest: NodeAddress, amt: i64, data: impl Into<Vec<u8>>) -> Self {
        Self {
            dest,
            amt,
            data: data.into(),
        }
    }

    /// `SHA-512(dest ‖ data)`. The amount is not part of the identity.
    pub fn hash(&self) -> PacketHash {
        PacketHash::compute(&self.dest, &self.data)
    }

    /// Packets with a negative amount are dropped on sight.
    pub fn is_valid(&self) -> bool {
        self.amt >= 0
    }

    /// Size used for bandwidth sampling.
    pub fn wire_len(&self) -> usize {
        self.data.len()
    }
}

/// What this node did with one packet: it came from `source`, was headed
/// for `destination`, and went out to `nexthop`.
///
/// For packets originated locally `source` is our own address; for packets
/// delivered locally `nexthop` is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub hash: PacketHash,
    pub amount: i64,
    pub source: NodeAddress,
    pub destination: NodeAddress,
    pub nexthop: NodeAddress,
}

impl RoutingDecision {
    /// Build the record for `packet` moving `source → self → nexthop`.
    pub fn new(packet: &Packet, source: NodeAddress, nexthop: NodeAddress) -> Self {
        Self {
            hash: packet.hash(),
            amount: packet.amt,
            source,
            destination: packet.dest,
            nexthop,
        }
    }
}

// ---------------------------------------------------------------------------
// DecisionTable
// ---------------------------------------------------------------------------

/// Outstanding [`RoutingDecision`]s keyed by packet hash, capped at a fixed
/// size. Past the cap the oldest record is evicted, so a peer that never
/// returns receipts cannot grow the table without bound.
#[derive(Debug)]
pub struct DecisionTable {
    capacity: usize,
    order: VecDeque<PacketHash>,
    entries: HashMap<PacketHash, RoutingDecision>,
}

impl DecisionTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            entries: HashMap::new(),
        }
    }

    /// Record `decision`, replacing any earlier record for the same hash.
    pub fn insert(&mut self, decision: RoutingDecision) {
        if self.entries.insert(decision.hash, decision).is_none() {
            self.order.push_back(decision.hash);
        }
        while self.entries.len() > self.capacity {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            if self.entries.remove(&oldest).is_some() {
                debug!(hash = %oldest, "evicting unreceipted decision");
            }
        }
        // Removed entries leave stale hashes behind in `order`; compact
        // once they dominate.
        if self.order.len() > self.capacity * 2 {
            let entries = &self.entries;
            self.order.retain(|h| entries.contains_key(h));
        }
    }

    pub fn get(&self, hash: &PacketHash) -> Option<&RoutingDecision> {
        self.entries.get(hash)
    }

    pub fn remove(&mut self, hash: &PacketHash) -> Option<RoutingDecision> {
        self.entries.remove(hash)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::sha512;

    fn addr(tag: &[u8]) -> NodeAddress {
        NodeAddress::from_bytes(sha512(tag))
    }

    #[test]
    fn hash_ignores_amount() {
        let a = Packet::new(addr(b"b"), 3, b"data".to_vec());
        let b = Packet::new(addr(b"b"), 99, b"data".to_vec());
        assert_eq!(a.hash(), b.hash());
        assert_ne!(a.hash(), Packet::new(addr(b"c"), 3, b"data".to_vec()).hash());
    }

    #[test]
    fn negative_amount_is_invalid() {
        assert!(Packet::new(addr(b"x"), 0, Vec::new()).is_valid());
        assert!(!Packet::new(addr(b"x"), -1, Vec::new()).is_valid());
    }

    #[test]
    fn json_shape() {
        let packet = Packet::new(addr(b"dest"), 3, b"data".to_vec());
        let value = serde_json::to_value(&packet).unwrap();
        assert_eq!(value["amt"], 3);
        assert_eq!(value["data"], "64617461");
        assert_eq!(value["dest"], addr(b"dest").to_hex());

        let back: Packet = serde_json::from_value(value).unwrap();
        assert_eq!(back, packet);
    }

    #[test]
    fn decision_copies_packet_fields() {
        let packet = Packet::new(addr(b"d"), 7, b"x".to_vec());
        let decision = RoutingDecision::new(&packet, addr(b"s"), addr(b"n"));
        assert_eq!(decision.hash, packet.hash());
        assert_eq!(decision.amount, 7);
        assert_eq!(decision.destination, addr(b"d"));
        assert_eq!(decision.source, addr(b"s"));
        assert_eq!(decision.nexthop, addr(b"n"));
    }

    #[test]
    fn table_evicts_oldest_past_capacity() {
        let mut table = DecisionTable::new(2);
        let decisions: Vec<_> = (0..3u8)
            .map(|i| {
                let packet = Packet::new(addr(b"d"), 1, vec![i]);
                RoutingDecision::new(&packet, addr(b"s"), addr(b"n"))
            })
            .collect();
        for d in &decisions {
            table.insert(*d);
        }

        assert_eq!(table.len(), 2);
        assert!(table.get(&decisions[0].hash).is_none());
        assert!(table.get(&decisions[2].hash).is_some());
    }

    #[test]
    fn removed_entries_do_not_count_against_capacity() {
        let mut table = DecisionTable::new(2);
        let make = |i: u8| {
            RoutingDecision::new(&Packet::new(addr(b"d"), 1, vec![i]), addr(b"s"), addr(b"n"))
        };
        table.insert(make(0));
        assert!(table.remove(&make(0).hash).is_some());
        assert!(table.remove(&make(0).hash).is_none());

        table.insert(make(1));
        table.insert(make(2));
        assert_eq!(table.len(), 2);
        assert!(table.get(&make(1).hash).is_some());
    }
}
