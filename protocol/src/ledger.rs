//! # Ledger
//!
//! Per-peer debts, driven by four feeds:
//!
//! | event                                   | effect                                            |
//! |-----------------------------------------|---------------------------------------------------|
//! | routing decision (before the packet leaves) | remembered under its packet hash              |
//! | delivery of hash `h` (receipt matched)  | `incoming[source] += amt`, `outgoing[nexthop] += amt` |
//! | payment of `p` received on peer address | `incoming[peer] -= p`                             |
//! | our payment of `p` to `d` confirmed     | `incoming[self] -= p`, `outgoing[d] -= p`         |
//!
//! `incoming[peer]` is what `peer` owes us; `outgoing[peer]` is what we owe
//! `peer`. Debts are signed: lost records can leave a balance negative.
//!
//! The ledger has no payment policy of its own. The node's payment ticker
//! reads [`Ledger::outgoing_debts`] and calls [`Ledger::pay`].

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::crypto::{NodeAddress, PacketHash};
use crate::money::{Money, MoneyError};
use crate::packet::{DecisionTable, RoutingDecision};
use crate::receipts::ReceiptError;
use crate::routing::DecisionRecorder;
use crate::shutdown::Shutdown;

struct LedgerState {
    incoming_debt: HashMap<NodeAddress, i64>,
    outgoing_debt: HashMap<NodeAddress, i64>,
    packets: DecisionTable,
    /// Receiving address → the peer it was handed to.
    payment_channels: HashMap<String, NodeAddress>,
}

pub struct Ledger {
    me: NodeAddress,
    state: Mutex<LedgerState>,
    shutdown: Shutdown,
}

impl Ledger {
    pub fn new(me: NodeAddress, capacity: usize) -> Self {
        Self {
            me,
            state: Mutex::new(LedgerState {
                incoming_debt: HashMap::new(),
                outgoing_debt: HashMap::new(),
                packets: DecisionTable::new(capacity),
                payment_channels: HashMap::new(),
            }),
            shutdown: Shutdown::new(),
        }
    }

    /// Credit a confirmed delivery.
    pub fn record_delivery(&self, hash: &PacketHash) -> Result<RoutingDecision, ReceiptError> {
        let mut state = self.state.lock();
        let decision = state
            .packets
            .remove(hash)
            .ok_or(ReceiptError::UnknownHash(*hash))?;
        add(&mut state.incoming_debt, decision.source, decision.amount);
        add(&mut state.outgoing_debt, decision.nexthop, decision.amount);
        Ok(decision)
    }

    /// Apply `amount` received on one of our addresses. Returns the paying
    /// peer, or `None` for an address we never handed out.
    pub fn record_incoming_payment(&self, address: &str, amount: i64) -> Option<NodeAddress> {
        let mut state = self.state.lock();
        let peer = *state.payment_channels.get(address)?;
        add(&mut state.incoming_debt, peer, -amount);
        Some(peer)
    }

    /// Apply a confirmed outgoing payment of `amount` to `dest`.
    pub fn apply_payment(&self, dest: NodeAddress, amount: i64) {
        let mut state = self.state.lock();
        add(&mut state.incoming_debt, self.me, -amount);
        add(&mut state.outgoing_debt, dest, -amount);
    }

    /// Tie `address` to `peer` and apply whatever arrives on `payments`.
    pub fn register_payment_channel(
        self: &Arc<Self>,
        peer: NodeAddress,
        address: String,
        mut payments: mpsc::Receiver<i64>,
    ) {
        self.state
            .lock()
            .payment_channels
            .insert(address.clone(), peer);

        let ledger = Arc::clone(self);
        tokio::spawn(async move {
            let stop = ledger.shutdown.wait();
            tokio::pin!(stop);
            loop {
                tokio::select! {
                    next = payments.recv() => match next {
                        Some(amount) => {
                            ledger.record_incoming_payment(&address, amount);
                            info!(peer = %peer, amount, "payment received");
                        }
                        None => break,
                    },
                    _ = &mut stop => break,
                }
            }
        });
    }

    pub fn incoming_debt(&self, peer: &NodeAddress) -> i64 {
        self.state.lock().incoming_debt.get(peer).copied().unwrap_or(0)
    }

    pub fn outgoing_debt(&self, peer: &NodeAddress) -> i64 {
        self.state.lock().outgoing_debt.get(peer).copied().unwrap_or(0)
    }

    /// Every non-zero outgoing balance except the one we keep with
    /// ourselves, in address order.
    pub fn outgoing_debts(&self) -> Vec<(NodeAddress, i64)> {
        let state = self.state.lock();
        let mut debts: Vec<_> = state
            .outgoing_debt
            .iter()
            .filter(|(peer, owed)| **peer != self.me && **owed != 0)
            .map(|(peer, owed)| (*peer, *owed))
            .collect();
        debts.sort_unstable();
        debts
    }

    /// Pay what we owe `peer` to `address` and apply it once the backend
    /// confirms. Returns the amount paid; zero when nothing was owed.
    pub async fn pay(
        &self,
        money: &dyn Money,
        peer: NodeAddress,
        address: &str,
    ) -> Result<i64, MoneyError> {
        let owed = self.outgoing_debt(&peer);
        if owed <= 0 {
            return Ok(0);
        }

        let confirmation = money.make_payment(owed, address).await?;
        match confirmation.await {
            Ok(true) => {
                self.apply_payment(peer, owed);
                info!(peer = %peer, amount = owed, "payment confirmed");
                Ok(owed)
            }
            Ok(false) | Err(_) => {
                warn!(peer = %peer, amount = owed, "payment not confirmed");
                Err(MoneyError::PaymentFailed {
                    amount: owed,
                    address: address.to_string(),
                })
            }
        }
    }

    /// Credit deliveries matched by the receipt handler until closed.
    pub async fn run(self: Arc<Self>, mut delivered: mpsc::Receiver<PacketHash>) {
        let stop = self.shutdown.wait();
        tokio::pin!(stop);

        loop {
            tokio::select! {
                _ = &mut stop => break,
                next = delivered.recv() => match next {
                    Some(hash) => {
                        if let Err(e) = self.record_delivery(&hash) {
                            debug!(error = %e, "delivery not credited");
                        }
                    }
                    None => break,
                },
            }
        }

        // Unblock a receipt handler that is mid-send.
        delivered.close();
        while delivered.try_recv().is_ok() {}
    }

    pub fn close(&self) {
        self.shutdown.trigger();
    }
}

impl DecisionRecorder for Ledger {
    fn record_decision(&self, decision: RoutingDecision) {
        self.state.lock().packets.insert(decision);
    }

    fn forget_decision(&self, hash: &PacketHash) {
        self.state.lock().packets.remove(hash);
    }
}

fn add(book: &mut HashMap<NodeAddress, i64>, peer: NodeAddress, amount: i64) {
    let entry = book.entry(peer).or_insert(0);
    *entry = entry.saturating_add(amount);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::sha512;
    use crate::money::MemoryMoney;
    use crate::packet::Packet;

    fn addr(tag: &str) -> NodeAddress {
        NodeAddress::from_bytes(sha512(tag.as_bytes()))
    }

    fn forwarded(ledger: &Ledger, amount: i64, source: &str, nexthop: &str) -> PacketHash {
        let packet = Packet::new(addr("dest"), amount, format!("{source}{nexthop}{amount}"));
        let decision = RoutingDecision::new(&packet, addr(source), addr(nexthop));
        ledger.record_decision(decision);
        decision.hash
    }

    #[test]
    fn delivery_moves_both_balances() {
        let ledger = Ledger::new(addr("me"), 16);
        let hash = forwarded(&ledger, 3, "s", "n");
        assert_eq!(ledger.incoming_debt(&addr("s")), 0);

        ledger.record_delivery(&hash).unwrap();
        assert_eq!(ledger.incoming_debt(&addr("s")), 3);
        assert_eq!(ledger.outgoing_debt(&addr("n")), 3);

        // Credited exactly once.
        assert_eq!(
            ledger.record_delivery(&hash),
            Err(ReceiptError::UnknownHash(hash))
        );
        assert_eq!(ledger.outgoing_debt(&addr("n")), 3);
    }

    #[test]
    fn confirmed_payment_offsets_both_sides() {
        let ledger = Ledger::new(addr("me"), 16);
        let hash = forwarded(&ledger, 5, "me", "n");
        ledger.record_delivery(&hash).unwrap();

        ledger.apply_payment(addr("n"), 5);
        assert_eq!(ledger.outgoing_debt(&addr("n")), 0);
        assert_eq!(ledger.incoming_debt(&addr("me")), 0);
    }

    #[test]
    fn debts_to_self_are_not_listed() {
        let ledger = Ledger::new(addr("me"), 16);
        let h1 = forwarded(&ledger, 2, "a", "me");
        let h2 = forwarded(&ledger, 4, "me", "b");
        ledger.record_delivery(&h1).unwrap();
        ledger.record_delivery(&h2).unwrap();
        assert_eq!(ledger.outgoing_debts(), vec![(addr("b"), 4)]);
    }

    #[tokio::test]
    async fn settled_payment_clears_debt() {
        let bank = MemoryMoney::new();
        let (address, _incoming) = bank.get_new_address().await.unwrap();
        let ledger = Ledger::new(addr("me"), 16);
        let hash = forwarded(&ledger, 10, "me", "peer");
        ledger.record_delivery(&hash).unwrap();

        assert_eq!(ledger.pay(&bank, addr("peer"), &address).await, Ok(10));
        assert_eq!(ledger.outgoing_debt(&addr("peer")), 0);
        assert_eq!(ledger.pay(&bank, addr("peer"), &address).await, Ok(0));
    }

    #[tokio::test]
    async fn unconfirmed_payment_leaves_debt() {
        let bank = MemoryMoney::new();
        let ledger = Ledger::new(addr("me"), 16);
        let hash = forwarded(&ledger, 10, "me", "peer");
        ledger.record_delivery(&hash).unwrap();

        let result = ledger.pay(&bank, addr("peer"), "unknown").await;
        assert!(matches!(result, Err(MoneyError::PaymentFailed { amount: 10, .. })));
        assert_eq!(ledger.outgoing_debt(&addr("peer")), 10);
    }

    #[tokio::test]
    async fn incoming_payments_reduce_what_the_peer_owes() {
        let bank = MemoryMoney::new();
        let ledger = Arc::new(Ledger::new(addr("me"), 16));
        let hash = forwarded(&ledger, 6, "peer", "me");
        ledger.record_delivery(&hash).unwrap();

        let (address, incoming) = bank.get_new_address().await.unwrap();
        ledger.register_payment_channel(addr("peer"), address.clone(), incoming);
        assert!(bank.make_payment(6, &address).await.unwrap().await.unwrap());

        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while ledger.incoming_debt(&addr("peer")) != 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(ledger.record_incoming_payment("unknown", 1), None);
        ledger.close();
    }

    #[test]
    fn forgotten_decision_is_never_credited() {
        let ledger = Ledger::new(addr("me"), 16);
        let hash = forwarded(&ledger, 3, "s", "n");
        ledger.forget_decision(&hash);
        assert_eq!(ledger.record_delivery(&hash), Err(ReceiptError::UnknownHash(hash)));
        assert!(ledger.outgoing_debts().is_empty());
    }

    #[tokio::test]
    async fn run_loop_credits_deliveries() {
        let ledger = Arc::new(Ledger::new(addr("me"), 16));
        let (htx, hrx) = mpsc::channel(4);
        let task = tokio::spawn(Arc::clone(&ledger).run(hrx));

        let packet = Packet::new(addr("dest"), 3, b"data".to_vec());
        let decision = RoutingDecision::new(&packet, addr("me"), addr("b"));
        ledger.record_decision(decision);
        htx.send(decision.hash).await.unwrap();

        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while ledger.outgoing_debt(&addr("b")) != 3 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        ledger.close();
        task.await.unwrap();
    }
}
