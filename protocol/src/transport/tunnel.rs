//! TCP tunnel framing codec.
//!
//! Each message is length-delimited (4-byte big-endian length) and starts
//! with a two-byte header `{version = 0, type}`:
//!
//! | type | body                      |
//! |------|---------------------------|
//! | 0    | Request: 64-byte address  |
//! | 1    | Response: 16-byte IP      |
//! | 2    | Data: raw payload         |
//!
//! A frame with any other version or type byte is an error, not a skip.

use std::net::Ipv6Addr;

use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::config::{HASH_LENGTH, MAX_FRAME_LENGTH};
use crate::crypto::NodeAddress;

const TUNNEL_VERSION: u8 = 0;
const TYPE_REQUEST: u8 = 0;
const TYPE_RESPONSE: u8 = 1;
const TYPE_DATA: u8 = 2;

#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("unsupported tunnel version {0}")]
    BadVersion(u8),
    #[error("unknown tunnel message type {0}")]
    BadType(u8),
    #[error("tunnel frame too short")]
    Truncated,
    #[error("tunnel {kind} body must be {expected} bytes, got {got}")]
    BadLength {
        kind: &'static str,
        expected: usize,
        got: usize,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelMessage {
    /// Ask the far end for an address to reach `NodeAddress` through.
    Request(NodeAddress),
    /// The assigned tunnel IP.
    Response(Ipv6Addr),
    /// Tunnelled bytes.
    Data(Bytes),
}

impl TunnelMessage {
    fn parse(frame: &[u8]) -> Result<Self, TunnelError> {
        let [version, kind, body @ ..] = frame else {
            return Err(TunnelError::Truncated);
        };
        if *version != TUNNEL_VERSION {
            return Err(TunnelError::BadVersion(*version));
        }
        match *kind {
            TYPE_REQUEST => {
                let bytes: [u8; HASH_LENGTH] =
                    body.try_into().map_err(|_| TunnelError::BadLength {
                        kind: "request",
                        expected: HASH_LENGTH,
                        got: body.len(),
                    })?;
                Ok(Self::Request(NodeAddress::from_bytes(bytes)))
            }
            TYPE_RESPONSE => {
                let bytes: [u8; 16] = body.try_into().map_err(|_| TunnelError::BadLength {
                    kind: "response",
                    expected: 16,
                    got: body.len(),
                })?;
                Ok(Self::Response(Ipv6Addr::from(bytes)))
            }
            TYPE_DATA => Ok(Self::Data(Bytes::copy_from_slice(body))),
            other => Err(TunnelError::BadType(other)),
        }
    }

    fn write_to(&self, dst: &mut BytesMut) {
        dst.put_u8(TUNNEL_VERSION);
        match self {
            Self::Request(addr) => {
                dst.put_u8(TYPE_REQUEST);
                dst.put_slice(addr.as_bytes());
            }
            Self::Response(ip) => {
                dst.put_u8(TYPE_RESPONSE);
                dst.put_slice(&ip.octets());
            }
            Self::Data(data) => {
                dst.put_u8(TYPE_DATA);
                dst.put_slice(data);
            }
        }
    }
}

/// Frames [`TunnelMessage`]s over a byte stream.
#[derive(Debug)]
pub struct TunnelCodec {
    inner: LengthDelimitedCodec,
}

impl Default for TunnelCodec {
    fn default() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .max_frame_length(MAX_FRAME_LENGTH)
                .new_codec(),
        }
    }
}

impl Decoder for TunnelCodec {
    type Item = TunnelMessage;
    type Error = TunnelError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src)? {
            Some(frame) => TunnelMessage::parse(&frame).map(Some),
            None => Ok(None),
        }
    }
}

impl Encoder<TunnelMessage> for TunnelCodec {
    type Error = TunnelError;

    fn encode(&mut self, item: TunnelMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mut frame = BytesMut::new();
        item.write_to(&mut frame);
        self.inner.encode(frame.freeze(), dst)?;
        Ok(())
    }
}
