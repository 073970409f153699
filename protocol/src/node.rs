//! # Node
//!
//! The top-level runtime entity: a [`Router`] plus the two periodic jobs
//! that turn routing into payment.
//!
//! - The **receipt ticker** bundles everything delivered to us since the
//!   last tick into one signed receipt and starts it back upstream.
//! - The **payment ticker** pays every connected peer we owe money to.
//!
//! Both are plain methods ([`Node::flush_receipts`], [`Node::pay_debts`])
//! that the tickers call on schedule and callers can also invoke directly.
//!
//! Each peer link gets its own receiving address from the [`Money`]
//! backend; payments arriving on it reduce what that peer owes us.
//!
//! ```text
//! new() -> dial()/accept() ... send_packet() / packets() ... close()
//! ```

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::NodeConfig;
use crate::crypto::{NodeAddress, PacketHash, PrivateKey, Role};
use crate::error::AutoRouteError;
use crate::ledger::Ledger;
use crate::metrics::{RouterMetrics, StatusReport};
use crate::money::Money;
use crate::packet::{Packet, RoutingDecision};
use crate::receipts::ReceiptError;
use crate::router::Router;
use crate::routing::RoutingError;
use crate::shutdown::Shutdown;
use crate::transport::{Connection, LocalIdentity, PeerIo};

/// Outcome of one payment round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PaymentRound {
    /// Peers paid, with the amounts.
    pub paid: Vec<(NodeAddress, i64)>,
    /// Peers whose payment was not confirmed.
    pub failed: Vec<NodeAddress>,
    /// Peers owed money but not connected, so without a payment address.
    pub unreachable: Vec<NodeAddress>,
}

pub struct Node {
    key: Arc<PrivateKey>,
    config: NodeConfig,
    router: Arc<Router>,
    money: Arc<dyn Money>,
    shutdown: Shutdown,
    packets: Mutex<Option<mpsc::Receiver<Packet>>>,
}

impl Node {
    /// Build a node and start its tickers. Must be called inside a Tokio
    /// runtime.
    pub fn new(
        key: PrivateKey,
        money: Arc<dyn Money>,
        config: NodeConfig,
    ) -> Result<Arc<Self>, AutoRouteError> {
        let key = Arc::new(key);
        let metrics = Arc::new(RouterMetrics::new(key.address()));
        let router = Router::new(key.clone(), &config, metrics)?;
        let packets = router.take_packets();

        let node = Arc::new(Self {
            key,
            config,
            router,
            money,
            shutdown: Shutdown::new(),
            packets: Mutex::new(packets),
        });
        node.spawn_tickers();
        info!(id = %node.address(), "node started");
        Ok(node)
    }

    fn spawn_tickers(self: &Arc<Self>) {
        let node = Arc::clone(self);
        let every = self.config.receipt_interval;
        tokio::spawn(async move {
            node.tick(every, |node| async move {
                if let Err(e) = node.flush_receipts().await {
                    warn!(error = %e, "receipt flush failed");
                }
            })
            .await
        });

        let node = Arc::clone(self);
        let every = self.config.payment_interval;
        tokio::spawn(async move {
            node.tick(every, |node| async move {
                node.pay_debts().await;
            })
            .await
        });
    }

    async fn tick<F, Fut>(self: Arc<Self>, every: Duration, job: F)
    where
        F: Fn(Arc<Self>) -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(every.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it.
        ticker.tick().await;

        let stop = self.shutdown.wait();
        tokio::pin!(stop);
        loop {
            tokio::select! {
                _ = ticker.tick() => job(Arc::clone(&self)).await,
                _ = &mut stop => break,
            }
        }
    }

    pub fn address(&self) -> NodeAddress {
        self.key.address()
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        self.router.ledger()
    }

    /// Connect to a peer over `io` as the dialing side.
    pub async fn dial(&self, io: impl PeerIo) -> Result<Arc<Connection>, AutoRouteError> {
        self.connect(io, Role::Dialer).await
    }

    /// Accept a peer over `io` as the listening side.
    pub async fn accept(&self, io: impl PeerIo) -> Result<Arc<Connection>, AutoRouteError> {
        self.connect(io, Role::Listener).await
    }

    async fn connect(&self, io: impl PeerIo, role: Role) -> Result<Arc<Connection>, AutoRouteError> {
        if self.shutdown.is_triggered() {
            return Err(AutoRouteError::Closed);
        }
        let (payment_address, payments) = self.money.get_new_address().await?;
        let identity = LocalIdentity {
            key: self.key.clone(),
            payment_address: payment_address.clone(),
        };

        let conn = Connection::establish(io, role, &identity).await?;
        self.router.add_connection(conn.clone())?;
        self.ledger()
            .register_payment_channel(conn.peer(), payment_address, payments);
        debug!(peer = %conn.peer(), ?role, "connection added");
        Ok(conn)
    }

    /// Send a packet from this node.
    pub async fn send_packet(&self, packet: Packet) -> Result<RoutingDecision, RoutingError> {
        self.router.send_packet(packet).await
    }

    /// Packets delivered to this node. Can be taken once.
    pub fn packets(&self) -> Option<mpsc::Receiver<Packet>> {
        self.packets.lock().take()
    }

    /// Body of the receipt ticker.
    pub async fn flush_receipts(&self) -> Result<Vec<PacketHash>, ReceiptError> {
        self.router.flush_receipts().await
    }

    /// Body of the payment ticker: pay every connected peer we owe.
    pub async fn pay_debts(&self) -> PaymentRound {
        let mut round = PaymentRound::default();
        for (peer, owed) in self.ledger().outgoing_debts() {
            if owed <= 0 {
                continue;
            }
            let Some(conn) = self.router.connection(&peer) else {
                round.unreachable.push(peer);
                continue;
            };
            let address = conn.remote_metadata().payment_address.clone();
            match self.ledger().pay(self.money.as_ref(), peer, &address).await {
                Ok(paid) if paid > 0 => round.paid.push((peer, paid)),
                Ok(_) => {}
                Err(e) => {
                    warn!(peer = %peer, error = %e, "payment failed, will retry");
                    round.failed.push(peer);
                }
            }
        }
        round
    }

    pub fn status(&self) -> StatusReport {
        self.router.status()
    }

    /// Stop the tickers and close the router.
    pub fn close(&self) {
        self.shutdown.trigger();
        self.router.close();
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_triggered()
    }

    /// Resolves once [`close`](Self::close) has been called.
    pub async fn closed(&self) {
        self.shutdown.wait().await
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.address())
            .field("router", &self.router)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::money::MemoryMoney;

    fn config() -> NodeConfig {
        NodeConfig {
            receipt_interval: Duration::from_secs(3600),
            payment_interval: Duration::from_secs(3600),
            rng_seed: Some(1),
            ..NodeConfig::default()
        }
    }

    #[tokio::test]
    async fn each_peer_gets_its_own_payment_address() {
        let bank = MemoryMoney::new();
        let a = Node::new(PrivateKey::generate(), Arc::new(bank.clone()), config()).unwrap();
        let b = Node::new(PrivateKey::generate(), Arc::new(bank.clone()), config()).unwrap();

        let (x, y) = tokio::io::duplex(64 * 1024);
        let (ca, cb) = tokio::join!(a.dial(x), b.accept(y));
        let (ca, cb) = (ca.unwrap(), cb.unwrap());

        assert_eq!(ca.peer(), b.address());
        assert_eq!(cb.peer(), a.address());
        assert_ne!(
            ca.local_metadata().payment_address,
            cb.local_metadata().payment_address
        );
        assert_eq!(bank.address_count(), 2);
        assert_eq!(a.status().connections.len(), 1);
    }

    #[tokio::test]
    async fn nothing_to_flush_or_pay_on_a_quiet_node() {
        let node = Node::new(PrivateKey::generate(), Arc::new(MemoryMoney::new()), config()).unwrap();
        assert!(node.flush_receipts().await.unwrap().is_empty());
        assert_eq!(node.pay_debts().await, PaymentRound::default());
        assert!(node.packets().is_some());
        assert!(node.packets().is_none());
    }

    #[tokio::test]
    async fn closed_node_refuses_connections() {
        let node = Node::new(PrivateKey::generate(), Arc::new(MemoryMoney::new()), config()).unwrap();
        node.close();
        let (x, _y) = tokio::io::duplex(1024);
        assert!(matches!(node.dial(x).await, Err(AutoRouteError::Closed)));
    }
}
