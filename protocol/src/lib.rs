//! # AutoRoute Routing Engine
//!
//! AutoRoute is a mesh router where every node is named by the hash of its
//! public key and every forwarded packet is paid for. This crate is the
//! per-node engine; the `autoroute-node` binary wraps it in sockets, a CLI
//! and an HTTP status surface.
//!
//! ## Architecture
//!
//! Leaves first:
//!
//! - **crypto**: P-521 identities, SHA-512 hashing, X25519 + AES-GCM session crypto.
//! - **packet**: packets, routing decisions, the bounded decision table.
//! - **bloom**: hop-indexed Bloom maps that summarise who is reachable.
//! - **merkle**: signed Merkle receipts bundling many deliveries.
//! - **transport**: encrypted sessions, identify, the three peer streams.
//! - **reachability**: map gossip and next-hop lookup.
//! - **routing**: the forwarder and its pluggable next-hop algorithms.
//! - **receipts**: receipt issuing, checking and upstream relay.
//! - **ledger**: per-peer debts from deliveries and payments.
//! - **money**: the payment backend capability.
//! - **router** / **node**: wiring, tickers, the public entry points.
//! - **neighbor**: discovery events in, TCP links out.
//!
//! ## Life of a packet
//!
//! ```text
//! A.send_packet ─▶ A.routing ─▶ B.routing ─▶ C.incoming
//!                     │            │             │
//!                  decision     decision      decision ─▶ C.receipts (buffered)
//!                                                              │ tick
//!        A.ledger ◀─ A.receipts ◀─ B.receipts ◀── signed receipt
//! ```
//!
//! Every hop that forwarded a packet gets the receipt exactly once, and
//! only then books the debt: what the previous hop owes it and what it owes
//! the next hop.

pub mod bloom;
pub mod config;
pub mod crypto;
pub mod error;
pub mod ledger;
pub mod merkle;
pub mod metrics;
pub mod money;
pub mod neighbor;
pub mod node;
pub mod packet;
pub mod reachability;
pub mod receipts;
pub mod router;
pub mod routing;
pub mod shutdown;
pub mod transport;

pub use config::{AlgorithmKind, NodeConfig};
pub use crypto::{NodeAddress, PacketHash, PrivateKey, PublicKey};
pub use error::AutoRouteError;
pub use metrics::{RouterMetrics, StatusReport};
pub use money::{MemoryMoney, Money, MoneyError};
pub use neighbor::{Neighbor, NeighborFinder};
pub use node::{Node, PaymentRound};
pub use packet::{Packet, RoutingDecision};
pub use router::{Router, RouterError};
pub use routing::RoutingError;
