//! # Neighbor Finder
//!
//! Turns discovery events into peer links. Discovery itself (link-local
//! beacons, static lists) lives outside the engine and only has to produce
//! [`Neighbor`] records on a channel.
//!
//! For each event the finder skips ourselves, peers we are already linked
//! to, and peers with a dial already in flight. Everything else is dialed
//! over TCP and handed to [`Node::dial`]. [`NeighborFinder::listen`] runs
//! the matching accept loop.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr, SocketAddrV6};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{DIAL_TIMEOUT, HANDSHAKE_TIMEOUT};
use crate::crypto::NodeAddress;
use crate::error::AutoRouteError;
use crate::node::Node;
use crate::transport::Connection;

/// A discovered node and where to reach it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Neighbor {
    pub node_id: NodeAddress,
    pub address: IpAddr,
    pub port: u16,
    /// Interface index for IPv6 link-local addresses.
    #[serde(default)]
    pub scope_id: u32,
}

impl Neighbor {
    pub fn socket_addr(&self) -> SocketAddr {
        match self.address {
            IpAddr::V6(ip) if self.scope_id != 0 => {
                SocketAddr::V6(SocketAddrV6::new(ip, self.port, 0, self.scope_id))
            }
            ip => SocketAddr::new(ip, self.port),
        }
    }
}

pub struct NeighborFinder {
    node: Arc<Node>,
    dialing: Mutex<HashSet<NodeAddress>>,
    dial_timeout: Duration,
}

impl NeighborFinder {
    pub fn new(node: Arc<Node>) -> Arc<Self> {
        Arc::new(Self {
            node,
            dialing: Mutex::new(HashSet::new()),
            dial_timeout: DIAL_TIMEOUT,
        })
    }

    /// Consume discovery events until the channel closes or the node
    /// shuts down. Each dial runs in its own task.
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<Neighbor>) {
        loop {
            let neighbor = tokio::select! {
                next = events.recv() => match next {
                    Some(neighbor) => neighbor,
                    None => break,
                },
                _ = self.node.closed() => break,
            };
            let finder = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = finder.handle(neighbor.clone()).await {
                    warn!(peer = %neighbor.node_id, addr = %neighbor.socket_addr(), error = %e, "neighbor dial failed");
                }
            });
        }
        debug!("neighbor stream ended");
    }

    /// Dial `neighbor` unless it is us, already linked, or being dialed.
    /// `Ok(None)` when skipped.
    pub async fn handle(&self, neighbor: Neighbor) -> Result<Option<Arc<Connection>>, AutoRouteError> {
        let id = neighbor.node_id;
        if id == self.node.address() || self.node.router().is_connected(&id) {
            return Ok(None);
        }
        if !self.dialing.lock().insert(id) {
            return Ok(None);
        }

        let result = self.connect(neighbor.socket_addr()).await;
        self.dialing.lock().remove(&id);

        let conn = result?;
        if conn.peer() != id {
            warn!(expected = %id, actual = %conn.peer(), "neighbor answered with a different identity");
        }
        Ok(Some(conn))
    }

    /// Dial `addr` over TCP and run the handshake as the dialing side.
    pub async fn connect(&self, addr: SocketAddr) -> Result<Arc<Connection>, AutoRouteError> {
        let stream = tokio::time::timeout(self.dial_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| timed_out("dial", addr))??;
        stream.set_nodelay(true)?;

        let conn = tokio::time::timeout(HANDSHAKE_TIMEOUT, self.node.dial(stream))
            .await
            .map_err(|_| timed_out("handshake", addr))??;
        info!(peer = %conn.peer(), addr = %addr, "dialed neighbor");
        Ok(conn)
    }

    /// Bind `addr` and accept peers on it in the background. Returns the
    /// bound address, which differs from `addr` when port 0 was asked for.
    pub async fn listen(&self, addr: SocketAddr) -> std::io::Result<SocketAddr> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        info!(addr = %local, "listening for peers");

        let node = Arc::clone(&self.node);
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    accepted = listener.accept() => accepted,
                    _ = node.closed() => break,
                };
                match accepted {
                    Ok((stream, remote)) => {
                        debug!(addr = %remote, "incoming peer");
                        let node = Arc::clone(&node);
                        tokio::spawn(async move {
                            let _ = stream.set_nodelay(true);
                            match tokio::time::timeout(HANDSHAKE_TIMEOUT, node.accept(stream)).await {
                                Ok(Ok(conn)) => info!(peer = %conn.peer(), addr = %remote, "accepted peer"),
                                Ok(Err(e)) => warn!(addr = %remote, error = %e, "peer rejected"),
                                Err(_) => warn!(addr = %remote, "peer handshake timed out"),
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "accept error"),
                }
            }
        });
        Ok(local)
    }
}

fn timed_out(what: &str, addr: SocketAddr) -> AutoRouteError {
    AutoRouteError::Io(std::io::Error::new(
        std::io::ErrorKind::TimedOut,
        format!("{what} to {addr} timed out"),
    ))
}
