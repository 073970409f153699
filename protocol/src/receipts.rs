//! # Receipt Handler
//!
//! Delivery receipts travel the reverse path of the packets they cover, one
//! hop at a time.
//!
//! Every [`RoutingDecision`] the router makes is recorded here before the
//! packet moves on, through [`DecisionRecorder`]. Decisions
//! whose next hop is this node are deliveries; their hashes are buffered
//! until [`ReceiptHandler::flush`] bundles them into one signed Merkle
//! receipt.
//!
//! A receipt, local or received from a peer, is processed as follows:
//!
//! - It must verify, or it is dropped.
//! - Each hash must match a recorded decision whose destination is the
//!   receipt's signer. Unknown hashes and wrong-destination hashes are
//!   skipped; the rest of the receipt still counts.
//! - A receipt arriving from a peer other than the one we forwarded to is
//!   suspicious but accepted.
//! - Each matched hash is emitted as delivered and its decision is removed,
//!   so a replayed receipt earns nothing.
//! - The receipt is relayed verbatim to every upstream source that is not
//!   us.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::crypto::{NodeAddress, PacketHash, PrivateKey, SignatureError};
use crate::merkle::{make_receipt, PacketReceipt};
use crate::packet::{DecisionTable, RoutingDecision};
use crate::routing::DecisionRecorder;
use crate::shutdown::Shutdown;
use crate::transport::Connection;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReceiptError {
    #[error("receipt signature rejected: {0}")]
    InvalidSignature(#[from] SignatureError),

    #[error("receipt covers unknown packet {0}")]
    UnknownHash(PacketHash),

    #[error("receipt for {hash} signed by {signer}, expected {expected}")]
    WrongDestination {
        hash: PacketHash,
        signer: NodeAddress,
        expected: NodeAddress,
    },

    #[error("delivery stream closed")]
    Closed,
}

/// What processing one receipt achieved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReceiptOutcome {
    /// Hashes credited as delivered.
    pub delivered: Vec<PacketHash>,
    /// Hashes skipped, with the reason.
    pub skipped: Vec<ReceiptError>,
    /// Peers the receipt was relayed to.
    pub relayed: Vec<NodeAddress>,
}

struct ReceiptState {
    conns: HashMap<NodeAddress, Arc<Connection>>,
    packets: DecisionTable,
    pending: Vec<PacketHash>,
}

pub struct ReceiptHandler {
    key: Arc<PrivateKey>,
    me: NodeAddress,
    state: Mutex<ReceiptState>,
    delivered: mpsc::Sender<PacketHash>,
    shutdown: Shutdown,
}

impl ReceiptHandler {
    /// Matched hashes are sent on `delivered`. At most `capacity`
    /// unreceipted decisions are kept.
    pub fn new(key: Arc<PrivateKey>, delivered: mpsc::Sender<PacketHash>, capacity: usize) -> Self {
        let me = key.address();
        Self {
            key,
            me,
            state: Mutex::new(ReceiptState {
                conns: HashMap::new(),
                packets: DecisionTable::new(capacity),
                pending: Vec::new(),
            }),
            delivered,
            shutdown: Shutdown::new(),
        }
    }

    pub fn add_connection(self: &Arc<Self>, conn: Arc<Connection>) {
        let peer = conn.peer();
        self.state.lock().conns.insert(peer, conn.clone());

        match conn.take_receipts() {
            Some(receipts) => {
                tokio::spawn(Arc::clone(self).read_receipts(peer, receipts));
            }
            None => debug!(peer = %peer, "receipt stream already taken"),
        }
    }

    async fn read_receipts(
        self: Arc<Self>,
        peer: NodeAddress,
        mut receipts: mpsc::UnboundedReceiver<PacketReceipt>,
    ) {
        let stop = self.shutdown.wait();
        tokio::pin!(stop);

        loop {
            let receipt = tokio::select! {
                next = receipts.recv() => match next {
                    Some(receipt) => receipt,
                    None => break,
                },
                _ = &mut stop => break,
            };
            if let Err(e) = self.process_receipt(&receipt, peer).await {
                warn!(peer = %peer, error = %e, "dropping receipt");
            }
        }
        debug!(peer = %peer, "receipt stream ended");
    }

    /// Number of deliveries waiting for the next flush.
    pub fn pending(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Number of decisions still waiting for a receipt.
    pub fn outstanding(&self) -> usize {
        self.state.lock().packets.len()
    }

    /// Bundle buffered deliveries into one signed receipt and process it
    /// as if we had received it from ourselves. `None` when nothing was
    /// delivered since the last flush.
    pub async fn flush(&self) -> Result<Option<ReceiptOutcome>, ReceiptError> {
        let pending = std::mem::take(&mut self.state.lock().pending);
        let Some(receipt) = make_receipt(&self.key, &pending) else {
            return Ok(None);
        };
        info!(packets = pending.len(), "issuing delivery receipt");
        self.process_receipt(&receipt, self.me).await.map(Some)
    }

    /// Validate `receipt`, which came from `from`, credit what it covers
    /// and relay it upstream.
    pub async fn process_receipt(
        &self,
        receipt: &PacketReceipt,
        from: NodeAddress,
    ) -> Result<ReceiptOutcome, ReceiptError> {
        receipt.verify()?;
        let signer = receipt
            .source()
            .ok_or(ReceiptError::InvalidSignature(SignatureError::Missing("key")))?;

        let mut outcome = ReceiptOutcome::default();
        let mut upstream = BTreeSet::new();
        let mut relay_to = Vec::new();
        {
            let mut state = self.state.lock();
            for hash in receipt.list_packets() {
                let Some(decision) = state.packets.get(&hash).copied() else {
                    debug!(hash = %hash, from = %from, "receipt for unknown packet");
                    outcome.skipped.push(ReceiptError::UnknownHash(hash));
                    continue;
                };
                if decision.destination != signer {
                    warn!(hash = %hash, signer = %signer, "receipt signed by wrong destination");
                    outcome.skipped.push(ReceiptError::WrongDestination {
                        hash,
                        signer,
                        expected: decision.destination,
                    });
                    continue;
                }
                if decision.nexthop != from {
                    warn!(
                        hash = %hash,
                        from = %from,
                        nexthop = %decision.nexthop,
                        "receipt returned by a peer we did not forward to"
                    );
                }
                state.packets.remove(&hash);
                outcome.delivered.push(hash);
                upstream.insert(decision.source);
            }

            for source in upstream {
                if source == self.me {
                    continue;
                }
                match state.conns.get(&source) {
                    Some(conn) => relay_to.push(conn.clone()),
                    None => debug!(source = %source, "upstream peer gone, receipt not relayed"),
                }
            }
        }

        for hash in &outcome.delivered {
            self.delivered
                .send(*hash)
                .await
                .map_err(|_| ReceiptError::Closed)?;
        }
        for conn in relay_to {
            match conn.send_receipt(receipt).await {
                Ok(()) => outcome.relayed.push(conn.peer()),
                Err(e) => debug!(peer = %conn.peer(), error = %e, "receipt relay failed"),
            }
        }
        Ok(outcome)
    }

    pub fn remove_peer(&self, peer: &NodeAddress) {
        self.state.lock().conns.remove(peer);
    }

    pub fn close(&self) {
        self.shutdown.trigger();
        self.state.lock().conns.clear();
    }
}

impl DecisionRecorder for ReceiptHandler {
    /// Remember `decision` until a receipt for it arrives.
    fn record_decision(&self, decision: RoutingDecision) {
        let mut state = self.state.lock();
        state.packets.insert(decision);
        if decision.nexthop == self.me {
            state.pending.push(decision.hash);
        }
    }

    fn forget_decision(&self, hash: &PacketHash) {
        let mut state = self.state.lock();
        state.packets.remove(hash);
        state.pending.retain(|pending| pending != hash);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::sha512;
    use crate::packet::Packet;

    fn addr(tag: &str) -> NodeAddress {
        NodeAddress::from_bytes(sha512(tag.as_bytes()))
    }

    fn handler(key: PrivateKey) -> (ReceiptHandler, mpsc::Receiver<PacketHash>) {
        let (tx, rx) = mpsc::channel(16);
        (ReceiptHandler::new(Arc::new(key), tx, 16), rx)
    }

    #[tokio::test]
    async fn local_deliveries_are_flushed_into_one_receipt() {
        let key = PrivateKey::generate();
        let me = key.address();
        let (h, mut delivered) = handler(key);

        let p1 = Packet::new(me, 1, b"one".to_vec());
        let p2 = Packet::new(me, 2, b"two".to_vec());
        h.record_decision(RoutingDecision::new(&p1, addr("up"), me));
        h.record_decision(RoutingDecision::new(&p2, addr("up"), me));
        assert_eq!(h.pending(), 2);

        let outcome = h.flush().await.unwrap().unwrap();
        assert_eq!(outcome.delivered, vec![p1.hash(), p2.hash()]);
        assert!(outcome.skipped.is_empty());
        assert_eq!(delivered.recv().await, Some(p1.hash()));
        assert_eq!(delivered.recv().await, Some(p2.hash()));
        assert_eq!(h.pending(), 0);
        assert_eq!(h.outstanding(), 0);

        assert_eq!(h.flush().await.unwrap(), None);
    }

    #[tokio::test]
    async fn forwarded_packet_is_credited_once() {
        let dest_key = PrivateKey::generate();
        let dest = dest_key.address();
        let (h, mut delivered) = handler(PrivateKey::generate());

        let packet = Packet::new(dest, 3, b"data".to_vec());
        h.record_decision(RoutingDecision::new(&packet, addr("up"), dest));

        let receipt = make_receipt(&dest_key, &[packet.hash()]).unwrap();
        let outcome = h.process_receipt(&receipt, dest).await.unwrap();
        assert_eq!(outcome.delivered, vec![packet.hash()]);
        assert_eq!(delivered.recv().await, Some(packet.hash()));

        let replay = h.process_receipt(&receipt, dest).await.unwrap();
        assert!(replay.delivered.is_empty());
        assert_eq!(replay.skipped, vec![ReceiptError::UnknownHash(packet.hash())]);
    }

    #[tokio::test]
    async fn receipt_from_wrong_signer_is_not_credited() {
        let dest = addr("dest");
        let imposter = PrivateKey::generate();
        let (h, _delivered) = handler(PrivateKey::generate());

        let packet = Packet::new(dest, 3, b"data".to_vec());
        h.record_decision(RoutingDecision::new(&packet, addr("up"), dest));

        let receipt = make_receipt(&imposter, &[packet.hash()]).unwrap();
        let outcome = h.process_receipt(&receipt, dest).await.unwrap();
        assert!(outcome.delivered.is_empty());
        assert!(matches!(
            outcome.skipped.as_slice(),
            [ReceiptError::WrongDestination { .. }]
        ));
        // The record survives for the real destination's receipt.
        assert_eq!(h.outstanding(), 1);
    }

    #[tokio::test]
    async fn unknown_entries_do_not_spoil_the_rest() {
        let dest_key = PrivateKey::generate();
        let dest = dest_key.address();
        let (h, _delivered) = handler(PrivateKey::generate());

        let known = Packet::new(dest, 1, b"known".to_vec());
        let unknown = Packet::new(dest, 1, b"unknown".to_vec());
        h.record_decision(RoutingDecision::new(&known, addr("up"), dest));

        let receipt = make_receipt(&dest_key, &[unknown.hash(), known.hash()]).unwrap();
        let outcome = h.process_receipt(&receipt, dest).await.unwrap();
        assert_eq!(outcome.delivered, vec![known.hash()]);
        assert_eq!(outcome.skipped, vec![ReceiptError::UnknownHash(unknown.hash())]);
    }

    #[tokio::test]
    async fn forgotten_delivery_is_not_receipted() {
        let key = PrivateKey::generate();
        let me = key.address();
        let (h, _delivered) = handler(key);

        let packet = Packet::new(me, 1, b"undelivered".to_vec());
        let decision = RoutingDecision::new(&packet, addr("up"), me);
        h.record_decision(decision);
        h.forget_decision(&decision.hash);
        assert_eq!(h.pending(), 0);
        assert_eq!(h.outstanding(), 0);
        assert_eq!(h.flush().await.unwrap(), None);
    }

    #[tokio::test]
    async fn tampered_receipt_is_rejected() {
        let dest_key = PrivateKey::generate();
        let (h, _delivered) = handler(PrivateKey::generate());
        let h1 = PacketHash::from_bytes(sha512(b"1"));
        let h2 = PacketHash::from_bytes(sha512(b"2"));

        let mut receipt = make_receipt(&dest_key, &[h1]).unwrap();
        receipt.tree = crate::merkle::MerkleNode::build(&[h2]).unwrap();
        let err = h.process_receipt(&receipt, dest_key.address()).await.unwrap_err();
        assert_eq!(err, ReceiptError::InvalidSignature(SignatureError::Invalid));
    }
}
