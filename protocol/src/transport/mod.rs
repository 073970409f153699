//! # Peer Transport
//!
//! Everything between a raw byte stream and the three typed event streams
//! the handlers consume.
//!
//! ```text
//!   TCP / duplex pipe
//!        │
//!   session.rs     preamble, X25519, AES-GCM sealed length-delimited frames
//!        │
//!   connection.rs  identify exchange, reachability / receipt / packet streams
//!        │
//!   handlers       BloomMap, PacketReceipt, Packet channels
//! ```
//!
//! `tunnel.rs` is unrelated to peer links: it is the small framing codec
//! used by TCP tunnel front-ends.

pub mod connection;
pub mod session;
pub mod tunnel;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::crypto::signatures::SignatureError;
use crate::crypto::EncryptionError;

pub use connection::{Connection, Identify, LocalIdentity, PeerMetadata, WriteSample};
pub use session::{Envelope, Session, SessionReader, SessionWriter};
pub use tunnel::{TunnelCodec, TunnelError, TunnelMessage};

/// Anything we can run a peer session over.
pub trait PeerIo: AsyncRead + AsyncWrite + Unpin + Send + 'static {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> PeerIo for T {}

/// Type-erased peer byte stream.
pub type BoxedIo = Box<dyn PeerIo>;

/// Errors on a peer link.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The underlying byte stream failed.
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer went away, or we closed the link ourselves.
    #[error("stream closed")]
    StreamClosed,

    #[error("bad preamble: {0}")]
    BadPreamble(String),

    #[error("frame rejected: {0}")]
    Crypto(#[from] EncryptionError),

    #[error("malformed frame: {0}")]
    Codec(String),

    #[error("unexpected message during setup: {0}")]
    UnexpectedMessage(String),

    #[error("duplicate stream: {0}")]
    DuplicateStream(String),

    #[error("identify rejected: {0}")]
    Identify(#[from] SignatureError),

    #[error("identify signature is not bound to this session")]
    SessionMismatch,

    #[error("refusing to connect to ourselves")]
    SelfConnection,
}

impl From<bincode::Error> for TransportError {
    fn from(e: bincode::Error) -> Self {
        Self::Codec(e.to_string())
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(e: serde_json::Error) -> Self {
        Self::Codec(e.to_string())
    }
}
