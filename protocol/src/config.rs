//! # Protocol Configuration & Constants
//!
//! Every magic number in AutoRoute lives here, next to [`NodeConfig`], the
//! runtime knobs a node operator can actually turn.
//!
//! Constants are wire-visible (stream names, preamble magic) or defaults
//! for the tunables. Wire-visible values must match on both ends of a link;
//! tunables only need to be sane locally.

use std::time::Duration;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Protocol Version
// ---------------------------------------------------------------------------

/// Preamble magic written by both ends of a fresh peer session. Lets us
/// reject non-AutoRoute traffic before doing any key exchange.
pub const PROTOCOL_MAGIC: u32 = 0x4155_5452; // "AUTR"

/// Session wire version. Bump when the frame envelope changes.
pub const WIRE_PROTOCOL_VERSION: u16 = 1;

/// Crate-level protocol version string, reported by the status surface.
pub const PROTOCOL_VERSION: &str = "0.1.0";

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Prefix of the canonical public-key text form. The node address is the
/// SHA-512 of `prefix + dec(X) + "," + dec(Y)`.
pub const PUBLIC_KEY_TEXT_PREFIX: &str = "ecdsa:P521:";

/// SHA-512 output length. Node addresses and packet hashes are this long.
pub const HASH_LENGTH: usize = 64;

/// Length of one P-521 field element / scalar in bytes.
pub const P521_FIELD_LENGTH: usize = 66;

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// AES-256-GCM key length in bytes.
pub const AES_KEY_LENGTH: usize = 32;

/// AES-256-GCM nonce length in bytes. Twelve, always.
pub const AES_NONCE_LENGTH: usize = 12;

/// BLAKE3 KDF context for session keys. Changing it partitions the network.
pub const SESSION_KDF_CONTEXT: &str = "autoroute 2024 peer session key";

/// Domain tag appended to the handshake transcript before hashing it into
/// the session id.
pub const SESSION_ID_TAG: &[u8] = b"autoroute-session";

/// Largest sealed frame we accept off the wire.
pub const MAX_FRAME_LENGTH: usize = 4 * 1024 * 1024;

/// Name of the one-shot identification request.
pub const IDENTIFY_REQUEST: &str = "identify";

/// Stream carrying gossiped reachability maps.
pub const REACHABILITY_STREAM: &str = "reachability";

/// Stream carrying Merkle delivery receipts.
pub const RECEIPT_STREAM: &str = "receipt";

/// Stream carrying data packets.
pub const PACKET_STREAM: &str = "packet";

/// The three streams, in the order the dialer opens them.
pub const STREAM_NAMES: [&str; 3] = [REACHABILITY_STREAM, RECEIPT_STREAM, PACKET_STREAM];

/// Capacity of per-stream inbound channels and the session's outbound queue.
pub const STREAM_CHANNEL_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// Reachability
// ---------------------------------------------------------------------------

/// Bits per Bloom filter. Sized for ~1000 entries at k = 4
/// (optimal m = k·n / ln 2 ≈ 5771, rounded up to a byte multiple).
pub const DEFAULT_BLOOM_BITS: usize = 6144;

/// Hash functions per Bloom filter.
pub const DEFAULT_BLOOM_HASHES: u8 = 4;

/// Deepest hop level a reachability map keeps. Entries pushed past it by
/// `increment()` fall off, which is what lets gossip quiesce on cycles.
pub const DEFAULT_MAX_MAP_DEPTH: usize = 16;

// ---------------------------------------------------------------------------
// Routing, receipts, ledger
// ---------------------------------------------------------------------------

/// EWMA weight of a fresh bandwidth sample.
pub const DEFAULT_BANDWIDTH_ALPHA: f64 = 0.2;

/// Cap on outstanding forwarding records held by the receipt handler.
pub const DEFAULT_RECEIPT_TABLE_CAPACITY: usize = 65_536;

/// Capacity of the internal event channels (deliveries, incoming packets).
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// How often buffered deliveries are bundled into a signed receipt.
pub const DEFAULT_RECEIPT_INTERVAL: Duration = Duration::from_secs(1);

/// How often outstanding debts are paid.
pub const DEFAULT_PAYMENT_INTERVAL: Duration = Duration::from_secs(10);

/// How long a TCP dial to a discovered neighbour may take.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// How long session setup plus identify may take on a fresh link.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

// ---------------------------------------------------------------------------
// Ports
// ---------------------------------------------------------------------------

/// Default peer listening port.
pub const DEFAULT_PEER_PORT: u16 = 9650;

/// Default HTTP status port.
pub const DEFAULT_STATUS_PORT: u16 = 9651;

/// Default Prometheus metrics port.
pub const DEFAULT_METRICS_PORT: u16 = 9652;

/// Default local packet socket port.
pub const DEFAULT_LOCAL_PORT: u16 = 9653;

// ---------------------------------------------------------------------------
// Runtime configuration
// ---------------------------------------------------------------------------

/// Which next-hop algorithm the router is built with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AlgorithmKind {
    /// First peer whose reachability map matches.
    Basic,
    /// Random choice weighted by measured per-peer bandwidth.
    #[default]
    Bandwidth,
}

impl std::str::FromStr for AlgorithmKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "basic" => Ok(Self::Basic),
            "bandwidth" => Ok(Self::Bandwidth),
            other => Err(format!("unknown routing algorithm: {other}")),
        }
    }
}

/// Tunables for one node. Defaults come from the constants above.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Period of the receipt ticker.
    pub receipt_interval: Duration,
    /// Period of the payment ticker.
    pub payment_interval: Duration,
    /// Next-hop algorithm.
    pub algorithm: AlgorithmKind,
    /// EWMA weight for the bandwidth estimator, in (0, 1].
    pub bandwidth_alpha: f64,
    /// Bits per Bloom filter for maps this node creates.
    pub bloom_bits: usize,
    /// Hash functions per Bloom filter.
    pub bloom_hashes: u8,
    /// Deepest hop level kept in reachability maps.
    pub max_map_depth: usize,
    /// Cap on outstanding forwarding records in the receipt handler.
    pub receipt_table_capacity: usize,
    /// Seed for the weighted-choice RNG. `None` seeds from the OS.
    pub rng_seed: Option<u64>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            receipt_interval: DEFAULT_RECEIPT_INTERVAL,
            payment_interval: DEFAULT_PAYMENT_INTERVAL,
            algorithm: AlgorithmKind::default(),
            bandwidth_alpha: DEFAULT_BANDWIDTH_ALPHA,
            bloom_bits: DEFAULT_BLOOM_BITS,
            bloom_hashes: DEFAULT_BLOOM_HASHES,
            max_map_depth: DEFAULT_MAX_MAP_DEPTH,
            receipt_table_capacity: DEFAULT_RECEIPT_TABLE_CAPACITY,
            rng_seed: None,
        }
    }
}
