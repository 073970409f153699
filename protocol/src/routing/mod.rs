//! # Packet Routing
//!
//! The routing handler moves packets. Every packet, whether it arrived on a
//! peer's `packet` stream or was handed in locally, goes through
//! [`RoutingHandler::route`]:
//!
//! 1. Packets with a negative amount are dropped.
//! 2. A packet for us is pushed onto the local incoming queue and recorded
//!    as a [`RoutingDecision`] whose next hop is ourselves.
//! 3. Anything else goes to the peer the [`RoutingAlgorithm`] picks, and is
//!    recorded with that peer as next hop.
//!
//! Each decision is handed to every [`DecisionRecorder`] (the ledger, then
//! the receipt handler) before the packet leaves this node, so a receipt
//! can never overtake the decision it covers. If the hand-off then fails
//! the recorders are told to forget it.
//!
//! Any failure drops the packet and bumps `packets_dropped`.

pub mod algorithm;
pub mod bandwidth;
pub mod basic;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::crypto::{NodeAddress, PacketHash};
use crate::metrics::RouterMetrics;
use crate::packet::{Packet, RoutingDecision};
use crate::shutdown::Shutdown;
use crate::transport::{Connection, TransportError};

pub use algorithm::{build as build_algorithm, RoutingAlgorithm};
pub use bandwidth::{weighted_choice, BandwidthAlgorithm};
pub use basic::BasicAlgorithm;

/// Why a packet was not delivered or forwarded.
#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("no route to {0}")]
    NoRoute(NodeAddress),

    #[error("invalid packet amount {0}")]
    InvalidAmount(i64),

    #[error("send to {peer} failed: {source}")]
    Send {
        peer: NodeAddress,
        #[source]
        source: TransportError,
    },

    /// The local packet consumer is gone.
    #[error("router is closed")]
    Closed,
}

/// Keeps routing decisions until their receipts come back.
pub trait DecisionRecorder: Send + Sync {
    fn record_decision(&self, decision: RoutingDecision);

    /// Drop a decision whose packet never left.
    fn forget_decision(&self, hash: &PacketHash);
}

/// Forwards packets and records what it did with each.
pub struct RoutingHandler {
    me: NodeAddress,
    algorithm: Box<dyn RoutingAlgorithm>,
    conns: Mutex<HashMap<NodeAddress, Arc<Connection>>>,
    recorders: Vec<Arc<dyn DecisionRecorder>>,
    incoming: mpsc::Sender<Packet>,
    metrics: Arc<RouterMetrics>,
    shutdown: Shutdown,
}

impl RoutingHandler {
    pub fn new(
        me: NodeAddress,
        algorithm: Box<dyn RoutingAlgorithm>,
        recorders: Vec<Arc<dyn DecisionRecorder>>,
        incoming: mpsc::Sender<Packet>,
        metrics: Arc<RouterMetrics>,
    ) -> Self {
        Self {
            me,
            algorithm,
            conns: Mutex::new(HashMap::new()),
            recorders,
            incoming,
            metrics,
            shutdown: Shutdown::new(),
        }
    }

    pub fn algorithm_name(&self) -> &'static str {
        self.algorithm.name()
    }

    /// Make `conn` available as a next hop and start routing what it sends.
    pub fn add_connection(self: &Arc<Self>, conn: Arc<Connection>) {
        let peer = conn.peer();
        self.conns.lock().insert(peer, conn.clone());
        self.algorithm.add_connection(&conn);

        match conn.take_packets() {
            Some(packets) => {
                tokio::spawn(Arc::clone(self).read_packets(peer, packets));
            }
            None => debug!(peer = %peer, "packet stream already taken"),
        }
    }

    async fn read_packets(self: Arc<Self>, peer: NodeAddress, mut packets: mpsc::Receiver<Packet>) {
        let stop = self.shutdown.wait();
        tokio::pin!(stop);

        loop {
            let packet = tokio::select! {
                next = packets.recv() => match next {
                    Some(packet) => packet,
                    None => break,
                },
                _ = &mut stop => break,
            };
            // Failures are counted and logged inside `route`.
            let _ = self.route(packet, peer).await;
        }
        debug!(peer = %peer, "packet stream ended");
    }

    /// Route a packet originated on this node.
    pub async fn send_packet(&self, packet: Packet) -> Result<RoutingDecision, RoutingError> {
        self.route(packet, self.me).await
    }

    /// Route `packet`, which arrived from `from` (ourselves for local
    /// packets).
    pub async fn route(
        &self,
        packet: Packet,
        from: NodeAddress,
    ) -> Result<RoutingDecision, RoutingError> {
        let hash = packet.hash();
        let result = self.forward(packet, from).await;
        match &result {
            Ok(decision) => {
                debug!(hash = %hash, from = %from, next = %decision.nexthop, "packet routed")
            }
            Err(e) => {
                self.metrics.packet_dropped();
                warn!(hash = %hash, from = %from, error = %e, "packet dropped");
            }
        }
        result
    }

    async fn forward(
        &self,
        packet: Packet,
        from: NodeAddress,
    ) -> Result<RoutingDecision, RoutingError> {
        if !packet.is_valid() {
            return Err(RoutingError::InvalidAmount(packet.amt));
        }
        self.metrics.packet_received(from);

        if packet.dest == self.me {
            let decision = RoutingDecision::new(&packet, from, self.me);
            // Recorded before the application sees the packet, so a receipt
            // flush right after delivery already knows about it.
            self.record(decision);
            if self.incoming.send(packet).await.is_err() {
                self.forget(&decision);
                return Err(RoutingError::Closed);
            }
            return Ok(decision);
        }

        let next = self.algorithm.find_next_hop(&packet.dest, &from)?;
        let conn = self
            .conns
            .lock()
            .get(&next)
            .cloned()
            .ok_or(RoutingError::NoRoute(packet.dest))?;

        let decision = RoutingDecision::new(&packet, from, next);
        self.record(decision);
        if let Err(e) = self.algorithm.send_packet(&conn, &packet).await {
            self.forget(&decision);
            return Err(e);
        }
        self.metrics.packet_sent(next);
        Ok(decision)
    }

    fn record(&self, decision: RoutingDecision) {
        for recorder in &self.recorders {
            recorder.record_decision(decision);
        }
    }

    fn forget(&self, decision: &RoutingDecision) {
        for recorder in &self.recorders {
            recorder.forget_decision(&decision.hash);
        }
    }

    pub fn remove_peer(&self, peer: &NodeAddress) {
        self.conns.lock().remove(peer);
        self.algorithm.remove_peer(peer);
    }

    pub fn close(&self) {
        self.shutdown.trigger();
        self.conns.lock().clear();
        self.algorithm.cleanup();
    }
}
