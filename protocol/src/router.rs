//! # Router
//!
//! Composes the per-node handlers and owns the connection table.
//!
//! ```text
//!                    ┌──────────────┐  record  ┌────────┐
//!  packet streams ──▶│   routing    │─────────▶│ ledger │◀──────────┐
//!  send_packet() ───▶│              │─────────▶│receipts│──delivered┘
//!                    └──────────────┘          └────────┘
//!                           └──▶ incoming
//!  map streams ─────▶ reachability
//!  receipt streams ─▶ receipts
//! ```
//!
//! Decisions are recorded by the routing task itself, before the packet
//! leaves, so they are in place before any receipt for them can arrive.
//!
//! Handlers keep their own per-peer tables keyed by node address and never
//! point back at the router. The router registers a connection with every
//! handler under its table lock, and removes it the same way once the
//! connection closes, so the handlers never disagree about who is
//! connected.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::bloom::{BloomError, BloomMap};
use crate::config::{NodeConfig, EVENT_CHANNEL_CAPACITY};
use crate::crypto::{NodeAddress, PacketHash, PrivateKey};
use crate::ledger::Ledger;
use crate::metrics::{RouterMetrics, StatusReport};
use crate::packet::{Packet, RoutingDecision};
use crate::receipts::ReceiptHandler;
use crate::reachability::ReachabilityHandler;
use crate::routing::{build_algorithm, DecisionRecorder, RoutingError, RoutingHandler};
use crate::shutdown::Shutdown;
use crate::transport::Connection;

#[derive(Debug, Error)]
pub enum RouterError {
    /// We already have a live connection to this peer. The new one has
    /// been closed.
    #[error("already connected to {0}")]
    DuplicateConnection(NodeAddress),

    #[error("connection to {0} closed before it was added")]
    ConnectionClosed(NodeAddress),

    #[error("router is closed")]
    Closed,

    #[error(transparent)]
    Bloom(#[from] BloomError),
}

pub struct Router {
    key: Arc<PrivateKey>,
    me: NodeAddress,
    connections: Mutex<HashMap<NodeAddress, Arc<Connection>>>,
    reachability: Arc<ReachabilityHandler>,
    routing: Arc<RoutingHandler>,
    receipts: Arc<ReceiptHandler>,
    ledger: Arc<Ledger>,
    metrics: Arc<RouterMetrics>,
    incoming: Mutex<Option<mpsc::Receiver<Packet>>>,
    shutdown: Shutdown,
}

impl Router {
    /// Build a router and start its internal tasks. Must be called inside
    /// a Tokio runtime.
    pub fn new(
        key: Arc<PrivateKey>,
        config: &NodeConfig,
        metrics: Arc<RouterMetrics>,
    ) -> Result<Arc<Self>, RouterError> {
        let me = key.address();
        let template = BloomMap::new(config.bloom_bits, config.bloom_hashes, config.max_map_depth)?;

        let (delivered_tx, delivered_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (incoming_tx, incoming_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let reachability = Arc::new(ReachabilityHandler::new(me, template));
        let receipts = Arc::new(ReceiptHandler::new(
            key.clone(),
            delivered_tx,
            config.receipt_table_capacity,
        ));
        let ledger = Arc::new(Ledger::new(me, config.receipt_table_capacity));
        let recorders: Vec<Arc<dyn DecisionRecorder>> = vec![ledger.clone(), receipts.clone()];

        let algorithm = build_algorithm(me, reachability.clone(), config);
        let routing = Arc::new(RoutingHandler::new(
            me,
            algorithm,
            recorders,
            incoming_tx,
            metrics.clone(),
        ));
        let shutdown = Shutdown::new();

        tokio::spawn(Arc::clone(&ledger).run(delivered_rx));

        info!(
            id = %me,
            algorithm = routing.algorithm_name(),
            "router started"
        );

        Ok(Arc::new(Self {
            key,
            me,
            connections: Mutex::new(HashMap::new()),
            reachability,
            routing,
            receipts,
            ledger,
            metrics,
            incoming: Mutex::new(Some(incoming_rx)),
            shutdown,
        }))
    }

    pub fn address(&self) -> NodeAddress {
        self.me
    }

    pub fn key(&self) -> &Arc<PrivateKey> {
        &self.key
    }

    /// Register `conn` with every handler. A second connection to a peer we
    /// are already connected to is closed and rejected.
    pub fn add_connection(self: &Arc<Self>, conn: Arc<Connection>) -> Result<(), RouterError> {
        let peer = conn.peer();
        if self.shutdown.is_triggered() {
            conn.close();
            return Err(RouterError::Closed);
        }

        {
            let mut connections = self.connections.lock();
            if connections.contains_key(&peer) {
                warn!(peer = %peer, "duplicate connection, closing the new one");
                conn.close();
                return Err(RouterError::DuplicateConnection(peer));
            }
            if conn.is_closed() {
                return Err(RouterError::ConnectionClosed(peer));
            }
            connections.insert(peer, conn.clone());
            self.metrics.connection_opened(peer);
            self.reachability.add_connection(conn.clone());
            self.routing.add_connection(conn.clone());
            self.receipts.add_connection(conn.clone());
        }
        info!(peer = %peer, payment_address = %conn.remote_metadata().payment_address, "peer connected");

        let router = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = conn.closed() => {}
                _ = router.shutdown.wait() => {}
            }
            router.remove_connection(&conn);
        });
        Ok(())
    }

    fn remove_connection(&self, conn: &Arc<Connection>) {
        let peer = conn.peer();
        let mut connections = self.connections.lock();
        let is_current = connections
            .get(&peer)
            .is_some_and(|current| Arc::ptr_eq(current, conn));
        if !is_current {
            return;
        }
        connections.remove(&peer);
        self.reachability.remove_peer(&peer);
        self.routing.remove_peer(&peer);
        self.receipts.remove_peer(&peer);
        self.metrics.connection_closed(peer);
        info!(peer = %peer, "peer disconnected");
    }

    pub fn is_connected(&self, peer: &NodeAddress) -> bool {
        self.connections.lock().contains_key(peer)
    }

    pub fn connection(&self, peer: &NodeAddress) -> Option<Arc<Connection>> {
        self.connections.lock().get(peer).cloned()
    }

    pub fn peers(&self) -> Vec<NodeAddress> {
        let mut peers: Vec<_> = self.connections.lock().keys().copied().collect();
        peers.sort_unstable();
        peers
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    /// Route a locally originated packet.
    pub async fn send_packet(&self, packet: Packet) -> Result<RoutingDecision, RoutingError> {
        self.routing.send_packet(packet).await
    }

    /// Packets addressed to this node. Can be taken once.
    pub fn take_packets(&self) -> Option<mpsc::Receiver<Packet>> {
        self.incoming.lock().take()
    }

    /// Issue a receipt for everything delivered since the last call.
    pub async fn flush_receipts(&self) -> Result<Vec<PacketHash>, crate::receipts::ReceiptError> {
        Ok(self
            .receipts
            .flush()
            .await?
            .map(|outcome| outcome.delivered)
            .unwrap_or_default())
    }

    pub fn reachability(&self) -> &Arc<ReachabilityHandler> {
        &self.reachability
    }

    pub fn receipts(&self) -> &Arc<ReceiptHandler> {
        &self.receipts
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    pub fn metrics(&self) -> &Arc<RouterMetrics> {
        &self.metrics
    }

    pub fn status(&self) -> StatusReport {
        self.metrics.report()
    }

    /// Close every connection and stop every handler.
    pub fn close(&self) {
        if self.shutdown.is_triggered() {
            return;
        }
        self.shutdown.trigger();

        let connections: Vec<_> = self.connections.lock().drain().collect();
        for (peer, conn) in connections {
            conn.close();
            self.metrics.connection_closed(peer);
        }
        self.reachability.close();
        self.routing.close();
        self.receipts.close();
        self.ledger.close();
        info!(id = %self.me, "router closed");
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("id", &self.me)
            .field("peers", &self.connection_count())
            .finish_non_exhaustive()
    }
}
