//! # Money Capability
//!
//! The routing engine never moves funds itself. It asks a [`Money`]
//! backend for fresh receiving addresses, one per peer, and for outgoing
//! payments. Each address comes with a stream of incoming amounts, and each
//! payment with a one-shot confirmation.
//!
//! [`MemoryMoney`] is an in-process bank: clones share one address book, so
//! every node in a test or single-host devnet can pay every other.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::config::EVENT_CHANNEL_CAPACITY;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MoneyError {
    /// The backend refused or did not confirm the payment. The debt stands.
    #[error("payment of {amount} to {address} failed")]
    PaymentFailed { amount: i64, address: String },

    #[error("money backend unavailable: {0}")]
    Unavailable(String),
}

/// Payment backend used by a node.
#[async_trait]
pub trait Money: Send + Sync {
    /// A fresh receiving address and the stream of amounts paid into it.
    async fn get_new_address(&self) -> Result<(String, mpsc::Receiver<i64>), MoneyError>;

    /// Start a payment. The receiver resolves to `true` once the payment is
    /// confirmed, `false` if it was rejected.
    async fn make_payment(
        &self,
        amount: i64,
        address: &str,
    ) -> Result<oneshot::Receiver<bool>, MoneyError>;
}

/// In-memory bank shared by clones.
#[derive(Debug, Clone, Default)]
pub struct MemoryMoney {
    book: Arc<Mutex<HashMap<String, mpsc::Sender<i64>>>>,
    next: Arc<AtomicU64>,
}

impl MemoryMoney {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of addresses handed out so far.
    pub fn address_count(&self) -> usize {
        self.book.lock().len()
    }
}

#[async_trait]
impl Money for MemoryMoney {
    async fn get_new_address(&self) -> Result<(String, mpsc::Receiver<i64>), MoneyError> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let address = format!("mem-{:016x}", self.next.fetch_add(1, Ordering::Relaxed));
        self.book.lock().insert(address.clone(), tx);
        Ok((address, rx))
    }

    async fn make_payment(
        &self,
        amount: i64,
        address: &str,
    ) -> Result<oneshot::Receiver<bool>, MoneyError> {
        let (confirm, confirmation) = oneshot::channel();
        let payee = self.book.lock().get(address).cloned();

        let ok = match payee {
            Some(tx) if amount > 0 => tx.send(amount).await.is_ok(),
            Some(_) => false,
            None => {
                debug!(address, "payment to unknown address");
                false
            }
        };
        let _ = confirm.send(ok);
        Ok(confirmation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn payment_reaches_the_payee() {
        let bank = MemoryMoney::new();
        let payer = bank.clone();
        let (address, mut incoming) = bank.get_new_address().await.unwrap();

        let confirmed = payer.make_payment(7, &address).await.unwrap();
        assert!(confirmed.await.unwrap());
        assert_eq!(incoming.recv().await, Some(7));
    }

    #[tokio::test]
    async fn unknown_address_is_not_confirmed() {
        let bank = MemoryMoney::new();
        let confirmed = bank.make_payment(7, "nowhere").await.unwrap();
        assert!(!confirmed.await.unwrap());
    }

    #[tokio::test]
    async fn addresses_are_unique() {
        let bank = MemoryMoney::new();
        let (a, _) = bank.get_new_address().await.unwrap();
        let (b, _) = bank.get_new_address().await.unwrap();
        assert_ne!(a, b);
        assert_eq!(bank.address_count(), 2);
    }

    #[tokio::test]
    async fn non_positive_amounts_are_refused() {
        let bank = MemoryMoney::new();
        let (address, _incoming) = bank.get_new_address().await.unwrap();
        let confirmed = bank.make_payment(0, &address).await.unwrap();
        assert!(!confirmed.await.unwrap());
    }
}
