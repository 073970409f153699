//! # Reachability Handler
//!
//! Owns this node's picture of who can be reached through whom.
//!
//! ## State
//!
//! - `maps[peer]`: everything `peer` has told us, already shifted one hop
//!   further away to account for the link to `peer`.
//! - `merged`: the union of all of the above plus ourselves at distance 0.
//!   This is what we advertise.
//! - `conns[peer]`: an unbounded queue drained by a per-peer task onto the
//!   peer's `reachability` stream. Gossip is enqueued under the state lock
//!   and written outside it.
//!
//! ## Gossip
//!
//! A new peer is sent a copy of `merged`. Every map received from a peer is
//! incremented and fed to [`ReachabilityHandler::add_map`]; if it adds
//! anything to `merged`, the same map is forwarded to every *other* peer.
//! Never echoing back to the sender, the idempotence of
//! [`BloomMap::merge`] and the map depth cap together guarantee that gossip
//! stops once the network is static.
//!
//! ## Next hop
//!
//! A direct peer is always its own next hop. Otherwise peers are ranked by
//! the smallest hop level at which their map matches the destination, ties
//! broken by address, so two nodes with the same view make the same choice.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::bloom::BloomMap;
use crate::crypto::NodeAddress;
use crate::shutdown::Shutdown;
use crate::transport::Connection;

struct ReachState {
    conns: HashMap<NodeAddress, mpsc::UnboundedSender<BloomMap>>,
    maps: HashMap<NodeAddress, BloomMap>,
    merged: BloomMap,
}

/// Map gossip and next-hop lookup for one node.
pub struct ReachabilityHandler {
    me: NodeAddress,
    /// Empty map carrying our filter parameters and depth cap.
    template: BloomMap,
    state: Mutex<ReachState>,
    shutdown: Shutdown,
}

impl ReachabilityHandler {
    /// `template` is an empty map with the filter parameters and depth cap
    /// this node uses. The merged map starts as `template ∪ {me}`.
    pub fn new(me: NodeAddress, template: BloomMap) -> Self {
        let mut merged = template.copy();
        merged.add_entry(&me);
        Self {
            me,
            template,
            state: Mutex::new(ReachState {
                conns: HashMap::new(),
                maps: HashMap::new(),
                merged,
            }),
            shutdown: Shutdown::new(),
        }
    }

    /// Start gossiping with the peer behind `conn`: send it our merged map
    /// and fold everything it sends into ours.
    pub fn add_connection(self: &Arc<Self>, conn: Arc<Connection>) {
        let peer = conn.peer();
        let outbound = self.register_peer(peer);
        tokio::spawn(gossip_out(conn.clone(), outbound, self.shutdown.clone()));

        match conn.take_maps() {
            Some(maps) => {
                tokio::spawn(Arc::clone(self).read_maps(peer, maps));
            }
            None => debug!(peer = %peer, "map stream already taken"),
        }
    }

    /// Register `peer` with an empty view and queue our merged map for it.
    /// Returns the queue of maps destined for the peer.
    pub(crate) fn register_peer(&self, peer: NodeAddress) -> mpsc::UnboundedReceiver<BloomMap> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock();
        state.maps.insert(peer, self.template.copy());
        let _ = tx.send(state.merged.copy());
        state.conns.insert(peer, tx);
        rx
    }

    async fn read_maps(
        self: Arc<Self>,
        peer: NodeAddress,
        mut maps: mpsc::UnboundedReceiver<BloomMap>,
    ) {
        let stop = self.shutdown.wait();
        tokio::pin!(stop);

        loop {
            tokio::select! {
                next = maps.recv() => match next {
                    Some(mut map) => {
                        map.set_max_depth(self.template.max_depth());
                        map.increment();
                        self.add_map(peer, map);
                    }
                    None => break,
                },
                _ = &mut stop => break,
            }
        }
        debug!(peer = %peer, "map stream ended");
    }

    /// Fold a map received from `peer` (already incremented) into our
    /// state. Returns `true` when our merged map grew, in which case the
    /// map has been queued for every other peer.
    pub fn add_map(&self, peer: NodeAddress, map: BloomMap) -> bool {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let Some(theirs) = state.maps.get_mut(&peer) else {
            debug!(peer = %peer, "map from unregistered peer");
            return false;
        };
        if !theirs.merge(&map) {
            trace!(peer = %peer, "map adds nothing to peer view");
            return false;
        }
        if !state.merged.merge(&map) {
            return false;
        }

        let mut forwarded = 0usize;
        for (other, tx) in &state.conns {
            if *other != peer && tx.send(map.copy()).is_ok() {
                forwarded += 1;
            }
        }
        debug!(peer = %peer, forwarded, "merged map grew");
        true
    }

    /// Next hop towards `dest`, or `None` when nothing we know of reaches
    /// it. Returns `dest` itself for direct peers and for ourselves.
    pub fn find_next_hop(&self, dest: &NodeAddress) -> Option<NodeAddress> {
        if self.is_peer(dest) || *dest == self.me {
            return Some(*dest);
        }
        self.candidates(dest).into_iter().next()
    }

    /// Every peer whose map matches `dest`, best first.
    pub fn candidates(&self, dest: &NodeAddress) -> Vec<NodeAddress> {
        let state = self.state.lock();
        let mut ranked: Vec<(usize, NodeAddress)> = state
            .maps
            .iter()
            .filter_map(|(peer, map)| map.distance(dest).map(|d| (d, *peer)))
            .collect();
        ranked.sort_unstable();
        ranked.into_iter().map(|(_, peer)| peer).collect()
    }

    /// Whether `peer`'s map claims `addr` is reachable through it.
    pub fn peer_reaches(&self, peer: &NodeAddress, addr: &NodeAddress) -> bool {
        self.state
            .lock()
            .maps
            .get(peer)
            .is_some_and(|map| map.is_reachable(addr))
    }

    pub fn is_peer(&self, addr: &NodeAddress) -> bool {
        self.state.lock().conns.contains_key(addr)
    }

    pub fn peers(&self) -> Vec<NodeAddress> {
        let mut peers: Vec<_> = self.state.lock().conns.keys().copied().collect();
        peers.sort_unstable();
        peers
    }

    /// Snapshot of what we advertise.
    pub fn merged_map(&self) -> BloomMap {
        self.state.lock().merged.copy()
    }

    /// Whether anything we know of reaches `addr`.
    pub fn is_reachable(&self, addr: &NodeAddress) -> bool {
        self.state.lock().merged.is_reachable(addr)
    }

    /// Forget `peer`. Entries it contributed to the merged map stay until
    /// they age out of every neighbour's view.
    pub fn remove_peer(&self, peer: &NodeAddress) {
        let mut state = self.state.lock();
        state.conns.remove(peer);
        state.maps.remove(peer);
    }

    /// Stop every gossip task.
    pub fn close(&self) {
        self.shutdown.trigger();
        let mut state = self.state.lock();
        state.conns.clear();
        state.maps.clear();
    }
}

async fn gossip_out(
    conn: Arc<Connection>,
    mut outbound: mpsc::UnboundedReceiver<BloomMap>,
    shutdown: Shutdown,
) {
    let stop = shutdown.wait();
    tokio::pin!(stop);

    loop {
        tokio::select! {
            next = outbound.recv() => match next {
                Some(map) => {
                    if let Err(e) = conn.send_map(&map).await {
                        debug!(peer = %conn.peer(), error = %e, "map send failed");
                        break;
                    }
                }
                None => break,
            },
            _ = &mut stop => break,
        }
    }
}
