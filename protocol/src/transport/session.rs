//! # Encrypted Session
//!
//! Turns any async byte stream into a sealed, framed message channel.
//!
//! ## Establishment
//!
//! Both ends write a fixed 38-byte preamble and read the other's:
//!
//! ```text
//! magic "AUTR" (u32 BE) | version (u16 BE) | X25519 ephemeral public key (32)
//! ```
//!
//! A mismatched magic or version closes the link before any key material
//! is used. The ephemeral keys feed [`EphemeralExchange`], which yields the
//! AES-256-GCM session key and the public session id.
//!
//! ## Frames
//!
//! After the preamble everything is a 4-byte big-endian length followed by
//! a sealed bincode [`Envelope`]. Envelopes name the logical stream they
//! belong to; `connection.rs` does the demultiplexing.

use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::config::{HASH_LENGTH, MAX_FRAME_LENGTH, PROTOCOL_MAGIC, WIRE_PROTOCOL_VERSION};
use crate::crypto::{EphemeralExchange, FrameCipher, Role};

use super::{BoxedIo, PeerIo, TransportError};

const PREAMBLE_LENGTH: usize = 4 + 2 + 32;

type FramedIo = Framed<BoxedIo, LengthDelimitedCodec>;

/// One multiplexed message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Envelope {
    /// Announce a named stream.
    Open { name: String },
    /// A message on a named stream.
    Data { name: String, payload: Vec<u8> },
    /// The sender is done with a named stream.
    Close { name: String },
    /// A one-shot named request.
    Request { name: String, payload: Vec<u8> },
}

/// A freshly established session, not yet split into halves.
pub struct Session {
    id: [u8; HASH_LENGTH],
    role: Role,
    reader: SessionReader,
    writer: SessionWriter,
}

impl Session {
    /// Run the preamble and key exchange over `io`.
    pub async fn establish(io: impl PeerIo, role: Role) -> Result<Self, TransportError> {
        let mut io: BoxedIo = Box::new(io);
        let exchange = EphemeralExchange::new(role);

        io.write_all(&encode_preamble(&exchange.public_key_bytes()))
            .await?;
        io.flush().await?;

        let mut theirs = [0u8; PREAMBLE_LENGTH];
        io.read_exact(&mut theirs).await?;
        let peer_ephemeral = decode_preamble(&theirs)?;

        let secrets = exchange.complete(&peer_ephemeral);
        let cipher = FrameCipher::new(&secrets.key, &secrets.id);

        let codec = LengthDelimitedCodec::builder()
            .max_frame_length(MAX_FRAME_LENGTH)
            .new_codec();
        let (sink, stream) = Framed::new(io, codec).split();

        Ok(Self {
            id: secrets.id,
            role,
            reader: SessionReader {
                stream,
                cipher: cipher.clone(),
            },
            writer: SessionWriter { sink, cipher },
        })
    }

    /// The public transcript hash. Both ends compute the same value.
    pub fn id(&self) -> &[u8; HASH_LENGTH] {
        &self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn split(self) -> (SessionReader, SessionWriter) {
        (self.reader, self.writer)
    }
}

/// Receiving half.
pub struct SessionReader {
    stream: SplitStream<FramedIo>,
    cipher: FrameCipher,
}

impl SessionReader {
    /// Next envelope. `Ok(None)` on clean end-of-stream.
    pub async fn recv(&mut self) -> Result<Option<Envelope>, TransportError> {
        let Some(frame) = self.stream.next().await else {
            return Ok(None);
        };
        let plain = self.cipher.open(&frame?)?;
        Ok(Some(bincode::deserialize(&plain)?))
    }
}

/// Sending half.
pub struct SessionWriter {
    sink: SplitSink<FramedIo, Bytes>,
    cipher: FrameCipher,
}

impl SessionWriter {
    pub async fn send(&mut self, envelope: &Envelope) -> Result<(), TransportError> {
        let plain = bincode::serialize(envelope)?;
        let sealed = self.cipher.seal(&plain)?;
        self.sink.send(Bytes::from(sealed)).await?;
        Ok(())
    }

    /// Flush and shut down the write side of the byte stream.
    pub async fn close(&mut self) -> Result<(), TransportError> {
        self.sink.close().await?;
        Ok(())
    }
}

fn encode_preamble(ephemeral: &[u8; 32]) -> [u8; PREAMBLE_LENGTH] {
    let mut out = [0u8; PREAMBLE_LENGTH];
    out[..4].copy_from_slice(&PROTOCOL_MAGIC.to_be_bytes());
    out[4..6].copy_from_slice(&WIRE_PROTOCOL_VERSION.to_be_bytes());
    out[6..].copy_from_slice(ephemeral);
    out
}

fn decode_preamble(bytes: &[u8; PREAMBLE_LENGTH]) -> Result<[u8; 32], TransportError> {
    let magic = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if magic != PROTOCOL_MAGIC {
        return Err(TransportError::BadPreamble(format!("magic {magic:#010x}")));
    }
    let version = u16::from_be_bytes([bytes[4], bytes[5]]);
    if version != WIRE_PROTOCOL_VERSION {
        return Err(TransportError::BadPreamble(format!("version {version}")));
    }
    let mut ephemeral = [0u8; 32];
    ephemeral.copy_from_slice(&bytes[6..]);
    Ok(ephemeral)
}
