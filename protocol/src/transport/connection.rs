//! # Peer Connections
//!
//! A [`Connection`] is an authenticated session with one peer, carrying
//! three named streams:
//!
//! | stream          | payload           |
//! |-----------------|-------------------|
//! | `reachability`  | [`BloomMap`]      |
//! | `receipt`       | [`PacketReceipt`] |
//! | `packet`        | [`Packet`]        |
//!
//! ## Setup
//!
//! 1. [`Session::establish`] runs the preamble and key exchange.
//! 2. Each side sends an `identify` request: its payment address and a
//!    signature over the session id. Each side then waits for the other's
//!    and checks that it verifies *and* that it signs this session's id.
//!    A signature captured from another session is useless here.
//! 3. The dialer opens the three streams in order. The listener accepts
//!    each exactly once; a duplicate open aborts setup.
//!
//! ## Runtime
//!
//! A reader task decodes inbound frames into one channel per stream. Maps
//! and receipts go on unbounded queues and are never dropped. Packets go
//! on a bounded queue without waiting: when the consumer is behind, the
//! packet is dropped, so a slow consumer on one stream never holds up the
//! other two.
//!
//! A writer task drains a single outbound queue, so frames on any one
//! stream go out in the order they were queued. Each packet frame it writes
//! yields a [`WriteSample`]: payload bytes over the time from enqueue to the
//! socket write completing. Queueing behind a slow link counts against it.
//!
//! Either task dying (EOF, I/O error, peer `Close`) marks the whole
//! connection closed; the router watches for that and drops the peer.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use crate::bloom::BloomMap;
use crate::config::{
    HASH_LENGTH, IDENTIFY_REQUEST, PACKET_STREAM, REACHABILITY_STREAM, RECEIPT_STREAM,
    STREAM_CHANNEL_CAPACITY, STREAM_NAMES,
};
use crate::crypto::signatures::SignatureError;
use crate::crypto::{NodeAddress, PrivateKey, PublicKey, Role, Signature};
use crate::merkle::PacketReceipt;
use crate::packet::Packet;
use crate::shutdown::Shutdown;

use super::session::{Envelope, Session, SessionReader, SessionWriter};
use super::{PeerIo, TransportError};

/// What we present to peers during identify.
#[derive(Clone)]
pub struct LocalIdentity {
    pub key: Arc<PrivateKey>,
    pub payment_address: String,
}

/// Payload of the `identify` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identify {
    #[serde(rename = "Payment_Address")]
    pub payment_address: String,
    #[serde(rename = "Sig")]
    pub sig: Signature,
}

/// Metadata exchanged during identify.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerMetadata {
    pub payment_address: String,
}

/// One packet frame written to the peer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WriteSample {
    /// Payload bytes in the frame.
    pub bytes: usize,
    /// From the frame being queued to the write completing.
    pub elapsed: Duration,
}

impl WriteSample {
    pub fn bytes_per_sec(&self) -> f64 {
        self.bytes as f64 / self.elapsed.as_secs_f64().max(1e-9)
    }
}

/// An envelope waiting for the writer, stamped when it was queued.
struct Outbound {
    envelope: Envelope,
    queued: Instant,
}

/// An established, identified link to one peer.
pub struct Connection {
    peer_key: PublicKey,
    peer: NodeAddress,
    local: PeerMetadata,
    remote: PeerMetadata,
    session_id: [u8; HASH_LENGTH],
    role: Role,
    outbound: mpsc::Sender<Outbound>,
    shutdown: Shutdown,
    maps: Mutex<Option<mpsc::UnboundedReceiver<BloomMap>>>,
    receipts: Mutex<Option<mpsc::UnboundedReceiver<PacketReceipt>>>,
    packets: Mutex<Option<mpsc::Receiver<Packet>>>,
    write_samples: Mutex<Option<mpsc::Receiver<WriteSample>>>,
}

impl Connection {
    /// Run session setup, identify and stream setup over `io`, then spawn
    /// the reader and writer tasks.
    pub async fn establish(
        io: impl PeerIo,
        role: Role,
        local: &LocalIdentity,
    ) -> Result<Arc<Self>, TransportError> {
        let session = Session::establish(io, role).await?;
        let session_id = *session.id();
        let (mut reader, mut writer) = session.split();

        let hello = Identify {
            payment_address: local.payment_address.clone(),
            sig: local.key.sign(&session_id),
        };
        writer
            .send(&Envelope::Request {
                name: IDENTIFY_REQUEST.to_string(),
                payload: serde_json::to_vec(&hello)?,
            })
            .await?;

        let theirs = read_identify(&mut reader).await?;
        let peer_key = check_identify(&theirs, &session_id)?;
        let peer = peer_key.address();
        if peer == local.key.address() {
            return Err(TransportError::SelfConnection);
        }

        match role {
            Role::Dialer => {
                for name in STREAM_NAMES {
                    writer
                        .send(&Envelope::Open {
                            name: name.to_string(),
                        })
                        .await?;
                }
            }
            Role::Listener => accept_streams(&mut reader).await?,
        }

        debug!(peer = %peer, ?role, "peer identified");

        let (outbound_tx, outbound_rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let (maps_tx, maps_rx) = mpsc::unbounded_channel();
        let (receipts_tx, receipts_rx) = mpsc::unbounded_channel();
        let (packets_tx, packets_rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let (samples_tx, samples_rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let shutdown = Shutdown::new();

        tokio::spawn(write_loop(writer, outbound_rx, samples_tx, shutdown.clone(), peer));
        tokio::spawn(read_loop(
            reader,
            Inbound {
                maps: maps_tx,
                receipts: receipts_tx,
                packets: packets_tx,
            },
            shutdown.clone(),
            peer,
        ));

        Ok(Arc::new(Self {
            peer_key,
            peer,
            local: PeerMetadata {
                payment_address: local.payment_address.clone(),
            },
            remote: PeerMetadata {
                payment_address: theirs.payment_address,
            },
            session_id,
            role,
            outbound: outbound_tx,
            shutdown,
            maps: Mutex::new(Some(maps_rx)),
            receipts: Mutex::new(Some(receipts_rx)),
            packets: Mutex::new(Some(packets_rx)),
            write_samples: Mutex::new(Some(samples_rx)),
        }))
    }

    /// The peer's node address.
    pub fn peer(&self) -> NodeAddress {
        self.peer
    }

    pub fn peer_key(&self) -> &PublicKey {
        &self.peer_key
    }

    pub fn local_metadata(&self) -> &PeerMetadata {
        &self.local
    }

    pub fn remote_metadata(&self) -> &PeerMetadata {
        &self.remote
    }

    pub fn session_id(&self) -> &[u8; HASH_LENGTH] {
        &self.session_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub async fn send_map(&self, map: &BloomMap) -> Result<(), TransportError> {
        self.send_data(REACHABILITY_STREAM, serde_json::to_vec(map)?)
            .await
    }

    pub async fn send_receipt(&self, receipt: &PacketReceipt) -> Result<(), TransportError> {
        self.send_data(RECEIPT_STREAM, serde_json::to_vec(receipt)?)
            .await
    }

    pub async fn send_packet(&self, packet: &Packet) -> Result<(), TransportError> {
        self.send_data(PACKET_STREAM, serde_json::to_vec(packet)?)
            .await
    }

    async fn send_data(&self, name: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::StreamClosed);
        }
        self.outbound
            .send(Outbound {
                envelope: Envelope::Data {
                    name: name.to_string(),
                    payload,
                },
                queued: Instant::now(),
            })
            .await
            .map_err(|_| TransportError::StreamClosed)
    }

    /// Inbound reachability maps. Can be taken once.
    pub fn take_maps(&self) -> Option<mpsc::UnboundedReceiver<BloomMap>> {
        self.maps.lock().take()
    }

    /// Inbound receipts. Can be taken once.
    pub fn take_receipts(&self) -> Option<mpsc::UnboundedReceiver<PacketReceipt>> {
        self.receipts.lock().take()
    }

    /// Inbound packets. Can be taken once.
    pub fn take_packets(&self) -> Option<mpsc::Receiver<Packet>> {
        self.packets.lock().take()
    }

    /// Throughput of packet frames as they reach the socket. Can be taken
    /// once; samples are dropped while nobody has taken it or the taker
    /// falls behind.
    pub fn take_write_samples(&self) -> Option<mpsc::Receiver<WriteSample>> {
        self.write_samples.lock().take()
    }

    /// Close every stream and the session.
    pub fn close(&self) {
        self.shutdown.trigger();
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_triggered()
    }

    /// Resolves once the connection is closed from either side.
    pub async fn closed(&self) {
        self.shutdown.wait().await
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .field("role", &self.role)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Setup helpers
// ---------------------------------------------------------------------------

async fn read_identify(reader: &mut SessionReader) -> Result<Identify, TransportError> {
    match reader.recv().await? {
        Some(Envelope::Request { name, payload }) if name == IDENTIFY_REQUEST => {
            Ok(serde_json::from_slice(&payload)?)
        }
        Some(other) => Err(TransportError::UnexpectedMessage(describe(&other))),
        None => Err(TransportError::StreamClosed),
    }
}

/// The signature must verify and must be over this session's id. Returns
/// the peer's key.
fn check_identify(
    identify: &Identify,
    session_id: &[u8; HASH_LENGTH],
) -> Result<PublicKey, TransportError> {
    identify.sig.verify()?;
    if identify.sig.message != session_id {
        return Err(TransportError::SessionMismatch);
    }
    identify
        .sig
        .key
        .clone()
        .ok_or(TransportError::Identify(SignatureError::Missing("key")))
}

async fn accept_streams(reader: &mut SessionReader) -> Result<(), TransportError> {
    let mut opened: HashSet<String> = HashSet::new();
    while opened.len() < STREAM_NAMES.len() {
        match reader.recv().await? {
            Some(Envelope::Open { name }) => {
                if !STREAM_NAMES.contains(&name.as_str()) {
                    return Err(TransportError::UnexpectedMessage(format!("open {name}")));
                }
                if !opened.insert(name.clone()) {
                    return Err(TransportError::DuplicateStream(name));
                }
            }
            Some(other) => return Err(TransportError::UnexpectedMessage(describe(&other))),
            None => return Err(TransportError::StreamClosed),
        }
    }
    Ok(())
}

fn describe(envelope: &Envelope) -> String {
    match envelope {
        Envelope::Open { name } => format!("open {name}"),
        Envelope::Data { name, .. } => format!("data on {name}"),
        Envelope::Close { name } => format!("close {name}"),
        Envelope::Request { name, .. } => format!("request {name}"),
    }
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

struct Inbound {
    maps: mpsc::UnboundedSender<BloomMap>,
    receipts: mpsc::UnboundedSender<PacketReceipt>,
    packets: mpsc::Sender<Packet>,
}

async fn write_loop(
    mut writer: SessionWriter,
    mut outbound: mpsc::Receiver<Outbound>,
    samples: mpsc::Sender<WriteSample>,
    shutdown: Shutdown,
    peer: NodeAddress,
) {
    let stop = shutdown.wait();
    tokio::pin!(stop);

    loop {
        tokio::select! {
            next = outbound.recv() => match next {
                Some(Outbound { envelope, queued }) => {
                    let packet_bytes = match &envelope {
                        Envelope::Data { name, payload } if name == PACKET_STREAM => Some(payload.len()),
                        _ => None,
                    };
                    if let Err(e) = writer.send(&envelope).await {
                        debug!(peer = %peer, error = %e, "write failed");
                        break;
                    }
                    if let Some(bytes) = packet_bytes {
                        let _ = samples.try_send(WriteSample {
                            bytes,
                            elapsed: queued.elapsed(),
                        });
                    }
                }
                None => break,
            },
            _ = &mut stop => break,
        }
    }

    for name in STREAM_NAMES {
        let _ = writer
            .send(&Envelope::Close {
                name: name.to_string(),
            })
            .await;
    }
    let _ = writer.close().await;
    shutdown.trigger();
}

async fn read_loop(
    mut reader: SessionReader,
    inbound: Inbound,
    shutdown: Shutdown,
    peer: NodeAddress,
) {
    let stop = shutdown.wait();
    tokio::pin!(stop);

    loop {
        let next = tokio::select! {
            next = reader.recv() => next,
            _ = &mut stop => break,
        };

        let (name, payload) = match next {
            Ok(Some(Envelope::Data { name, payload })) => (name, payload),
            Ok(Some(Envelope::Close { name })) => {
                debug!(peer = %peer, stream = %name, "peer closed stream");
                break;
            }
            Ok(Some(Envelope::Open { name })) => {
                warn!(peer = %peer, stream = %name, "rejecting duplicate stream open");
                continue;
            }
            Ok(Some(Envelope::Request { name, .. })) => {
                debug!(peer = %peer, request = %name, "ignoring late request");
                continue;
            }
            Ok(None) => {
                debug!(peer = %peer, "peer hung up");
                break;
            }
            Err(e) => {
                debug!(peer = %peer, error = %e, "read failed");
                break;
            }
        };

        // A consumer that has gone away just means nobody wants this
        // stream any more; the message is dropped.
        match name.as_str() {
            REACHABILITY_STREAM => match serde_json::from_slice::<BloomMap>(&payload) {
                Ok(map) => {
                    if inbound.maps.send(map).is_err() {
                        debug!(peer = %peer, "no map consumer, message dropped");
                    }
                }
                Err(e) => warn!(peer = %peer, error = %e, "dropping malformed map"),
            },
            RECEIPT_STREAM => match serde_json::from_slice::<PacketReceipt>(&payload) {
                Ok(receipt) => {
                    if inbound.receipts.send(receipt).is_err() {
                        debug!(peer = %peer, "no receipt consumer, message dropped");
                    }
                }
                Err(e) => warn!(peer = %peer, error = %e, "dropping malformed receipt"),
            },
            PACKET_STREAM => match serde_json::from_slice::<Packet>(&payload) {
                Ok(packet) => match inbound.packets.try_send(packet) {
                    Ok(()) => {}
                    Err(TrySendError::Full(packet)) => {
                        warn!(peer = %peer, hash = %packet.hash(), "packet consumer behind, dropping packet");
                    }
                    Err(TrySendError::Closed(_)) => {
                        debug!(peer = %peer, "no packet consumer, message dropped");
                    }
                },
                Err(e) => warn!(peer = %peer, error = %e, "dropping malformed packet"),
            },
            other => warn!(peer = %peer, stream = %other, "data on unknown stream"),
        }
    }

    shutdown.trigger();
}
