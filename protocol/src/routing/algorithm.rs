//! The seam between the routing handler and next-hop policy.

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{AlgorithmKind, NodeConfig};
use crate::crypto::NodeAddress;
use crate::packet::Packet;
use crate::reachability::ReachabilityHandler;
use crate::transport::Connection;

use super::bandwidth::BandwidthAlgorithm;
use super::basic::BasicAlgorithm;
use super::RoutingError;

/// A next-hop policy.
///
/// An algorithm is bound to the node's [`ReachabilityHandler`] when it is
/// built and owned by the routing handler from then on. Every new link is
/// shown to it through `add_connection`, so policies that learn from
/// traffic (bandwidth sampling) can watch the link's writes.
#[async_trait]
pub trait RoutingAlgorithm: Send + Sync {
    /// Short name for logs and the CLI.
    fn name(&self) -> &'static str;

    /// Pick the peer to hand a packet for `dest` to. `src` is the peer the
    /// packet arrived from, or our own address for local packets.
    fn find_next_hop(&self, dest: &NodeAddress, src: &NodeAddress)
        -> Result<NodeAddress, RoutingError>;

    /// A link to a new peer is up.
    fn add_connection(&self, _conn: &Arc<Connection>) {}

    /// Put `packet` on `conn`'s packet stream.
    async fn send_packet(&self, conn: &Connection, packet: &Packet) -> Result<(), RoutingError> {
        conn.send_packet(packet)
            .await
            .map_err(|source| RoutingError::Send {
                peer: conn.peer(),
                source,
            })
    }

    /// Drop per-peer state for a peer that went away.
    fn remove_peer(&self, _peer: &NodeAddress) {}

    /// Release everything; called when the router closes.
    fn cleanup(&self) {}
}

/// Build the algorithm `config` asks for, bound to `reachability`.
pub fn build(
    me: NodeAddress,
    reachability: Arc<ReachabilityHandler>,
    config: &NodeConfig,
) -> Box<dyn RoutingAlgorithm> {
    match config.algorithm {
        AlgorithmKind::Basic => Box::new(BasicAlgorithm::new(me, reachability)),
        AlgorithmKind::Bandwidth => Box::new(BandwidthAlgorithm::new(
            me,
            reachability,
            config.bandwidth_alpha,
            config.rng_seed,
        )),
    }
}
