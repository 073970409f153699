//! # Local Packet Socket
//!
//! Loopback TCP endpoint through which local applications use the mesh.
//! Both directions carry length-delimited frames holding one JSON
//! [`Packet`] each: frames written by a client are sent into the mesh,
//! and every packet delivered to this node is written to every client.

use std::net::SocketAddr;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, info, warn};

use autoroute::config::EVENT_CHANNEL_CAPACITY;
use autoroute::{Node, Packet};

/// Fan delivered packets out to however many local clients are attached.
/// Packets delivered while nobody listens are dropped.
pub fn spawn_delivery_hub(
    node: &Arc<Node>,
    mut delivered: mpsc::Receiver<Packet>,
) -> broadcast::Sender<Packet> {
    let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
    let hub = tx.clone();
    let node = Arc::clone(node);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                next = delivered.recv() => match next {
                    Some(packet) => {
                        debug!(hash = %packet.hash(), "packet delivered locally");
                        let _ = hub.send(packet);
                    }
                    None => break,
                },
                _ = node.closed() => break,
            }
        }
    });
    tx
}

/// Bind `addr` and serve local clients until the node closes. Returns the
/// bound address.
pub async fn serve(
    addr: SocketAddr,
    node: Arc<Node>,
    deliveries: broadcast::Sender<Packet>,
) -> std::io::Result<SocketAddr> {
    let listener = TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;
    info!(addr = %local, "local packet socket listening");

    tokio::spawn(async move {
        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = node.closed() => break,
            };
            match accepted {
                Ok((stream, remote)) => {
                    debug!(addr = %remote, "local client attached");
                    let node = Arc::clone(&node);
                    let deliveries = deliveries.subscribe();
                    tokio::spawn(async move {
                        if let Err(e) = handle_client(stream, node, deliveries).await {
                            debug!(addr = %remote, error = %e, "local client ended");
                        }
                    });
                }
                Err(e) => warn!(error = %e, "local accept error"),
            }
        }
    });
    Ok(local)
}

async fn handle_client(
    stream: TcpStream,
    node: Arc<Node>,
    mut deliveries: broadcast::Receiver<Packet>,
) -> std::io::Result<()> {
    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());

    loop {
        tokio::select! {
            frame = framed.next() => {
                let Some(frame) = frame else { return Ok(()) };
                let packet: Packet = match serde_json::from_slice(&frame?) {
                    Ok(packet) => packet,
                    Err(e) => {
                        warn!(error = %e, "malformed packet from local client");
                        continue;
                    }
                };
                if let Err(e) = node.send_packet(packet).await {
                    warn!(error = %e, "local packet not sent");
                }
            }
            delivered = deliveries.recv() => match delivered {
                Ok(packet) => {
                    let bytes = serde_json::to_vec(&packet)?;
                    framed.send(tokio_util::bytes::Bytes::from(bytes)).await?;
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "local client fell behind, packets skipped");
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            },
            _ = node.closed() => return Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    use autoroute::{MemoryMoney, NodeConfig, PrivateKey};

    #[tokio::test]
    async fn packet_to_self_comes_back_on_the_socket() {
        let node = Node::new(
            PrivateKey::generate(),
            Arc::new(MemoryMoney::new()),
            NodeConfig::default(),
        )
        .unwrap();
        let hub = spawn_delivery_hub(&node, node.packets().unwrap());
        let addr = serve(
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
            node.clone(),
            hub,
        )
        .await
        .unwrap();

        let stream = TcpStream::connect(addr).await.unwrap();
        let mut client = Framed::new(stream, LengthDelimitedCodec::new());
        // Give the server a moment to subscribe this client.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let packet = Packet::new(node.address(), 0, b"loopback".to_vec());
        client
            .send(tokio_util::bytes::Bytes::from(serde_json::to_vec(&packet).unwrap()))
            .await
            .unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let back: Packet = serde_json::from_slice(&frame).unwrap();
        assert_eq!(back, packet);
        node.close();
    }
}
