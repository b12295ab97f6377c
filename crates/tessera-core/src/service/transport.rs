//! Cluster transports
//!
//! Discovery and election traffic only needs "send to everyone" and
//! "receive from anyone"; any broadcast-capable datagram transport
//! qualifies, with UDP multicast as the production implementation.
//! Submit/response and log-replication traffic goes over a reliable
//! point-to-point channel behind `PeerTransport`. `InMemoryHub` and
//! `InMemoryPeerNetwork` wire simulated nodes together for tests and
//! embedded clusters.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::{Mutex, broadcast, mpsc};
use tracing::info;

use tessera_api::model::NodeIdentity;
use tessera_common::TesseraError;

/// Maximum size of one discovery datagram
const MAX_DATAGRAM: usize = 8192;

/// Datagram transport used by the discovery loop
#[async_trait::async_trait]
pub trait BroadcastTransport: Send + Sync {
    /// Fire-and-forget send to every member of the group
    async fn send_to_group(&self, payload: &[u8]) -> Result<(), TesseraError>;

    /// Receive the next datagram and the sender's address
    async fn recv(&self) -> Result<(Vec<u8>, String), TesseraError>;
}

/// Reliable point-to-point channel for submit/response and log replication
///
/// The owning process dials peers with the address and credentials carried
/// in their `NodeData`; the coordination core only needs this send seam.
#[async_trait::async_trait]
pub trait PeerTransport: Send + Sync {
    async fn send_to_peer(&self, peer: &NodeIdentity, payload: &[u8]) -> Result<(), TesseraError>;
}

/// UDP multicast transport
pub struct MulticastTransport {
    socket: UdpSocket,
    group: Ipv4Addr,
    port: u16,
}

impl MulticastTransport {
    /// Join `multicast_address` and listen on `port` on all interfaces
    pub async fn bind(multicast_address: &str, port: u16) -> Result<Self, TesseraError> {
        let group: Ipv4Addr = multicast_address
            .parse()
            .map_err(|_| TesseraError::Config(format!("invalid multicast address: {}", multicast_address)))?;

        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))
            .await
            .map_err(|e| TesseraError::Network(e.to_string()))?;
        socket
            .join_multicast_v4(group, Ipv4Addr::UNSPECIFIED)
            .map_err(|e| TesseraError::Network(e.to_string()))?;
        socket
            .set_multicast_loop_v4(true)
            .map_err(|e| TesseraError::Network(e.to_string()))?;

        info!("discovery listening on multicast {}:{}", group, port);
        Ok(Self { socket, group, port })
    }
}

#[async_trait::async_trait]
impl BroadcastTransport for MulticastTransport {
    async fn send_to_group(&self, payload: &[u8]) -> Result<(), TesseraError> {
        self.socket
            .send_to(payload, (self.group, self.port))
            .await
            .map_err(|e| TesseraError::Network(e.to_string()))?;
        Ok(())
    }

    async fn recv(&self) -> Result<(Vec<u8>, String), TesseraError> {
        let mut buf = [0u8; MAX_DATAGRAM];
        let (len, addr) = self
            .socket
            .recv_from(&mut buf)
            .await
            .map_err(|e| TesseraError::Network(e.to_string()))?;
        Ok((buf[..len].to_vec(), addr.ip().to_string()))
    }
}

/// In-memory broadcast hub connecting simulated nodes
///
/// Every transport created from the hub sees every datagram, including its
/// own, matching the visibility UDP multicast gives with loopback enabled.
pub struct InMemoryHub {
    tx: broadcast::Sender<(Vec<u8>, String)>,
}

impl InMemoryHub {
    pub fn new() -> Arc<Self> {
        let (tx, _) = broadcast::channel(1024);
        Arc::new(Self { tx })
    }

    /// Create the endpoint for one simulated node
    pub fn transport(&self, address: impl Into<String>) -> InMemoryTransport {
        InMemoryTransport {
            address: address.into(),
            tx: self.tx.clone(),
            rx: Mutex::new(self.tx.subscribe()),
        }
    }
}

/// One endpoint of an `InMemoryHub`
pub struct InMemoryTransport {
    address: String,
    tx: broadcast::Sender<(Vec<u8>, String)>,
    rx: Mutex<broadcast::Receiver<(Vec<u8>, String)>>,
}

#[async_trait::async_trait]
impl BroadcastTransport for InMemoryTransport {
    async fn send_to_group(&self, payload: &[u8]) -> Result<(), TesseraError> {
        // no receivers is not an error: sends are fire-and-forget
        let _ = self.tx.send((payload.to_vec(), self.address.clone()));
        Ok(())
    }

    async fn recv(&self) -> Result<(Vec<u8>, String), TesseraError> {
        let mut rx = self.rx.lock().await;
        loop {
            match rx.recv().await {
                Ok(datagram) => return Ok(datagram),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    // dropped datagrams are recovered by the next ping cycle
                    tracing::debug!(skipped, "in-memory transport lagged");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(TesseraError::Network("hub closed".to_string()));
                }
            }
        }
    }
}

/// In-memory point-to-point network keyed by node identity
pub struct InMemoryPeerNetwork {
    inboxes: Mutex<HashMap<NodeIdentity, mpsc::UnboundedSender<Vec<u8>>>>,
}

impl InMemoryPeerNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inboxes: Mutex::new(HashMap::new()),
        })
    }

    /// Register a node and get its inbox of peer messages
    pub async fn register(&self, identity: NodeIdentity) -> mpsc::UnboundedReceiver<Vec<u8>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inboxes.lock().await.insert(identity, tx);
        rx
    }
}

#[async_trait::async_trait]
impl PeerTransport for InMemoryPeerNetwork {
    async fn send_to_peer(&self, peer: &NodeIdentity, payload: &[u8]) -> Result<(), TesseraError> {
        let inboxes = self.inboxes.lock().await;
        let inbox = inboxes
            .get(peer)
            .ok_or_else(|| TesseraError::UnknownNode(peer.to_string()))?;
        inbox
            .send(payload.to_vec())
            .map_err(|_| TesseraError::Network(format!("peer {} inbox closed", peer)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_hub_delivers_to_all_endpoints() {
        let hub = InMemoryHub::new();
        let a = hub.transport("10.0.0.1");
        let b = hub.transport("10.0.0.2");

        a.send_to_group(b"hello").await.unwrap();

        let (payload, from) = b.recv().await.unwrap();
        assert_eq!(payload, b"hello");
        assert_eq!(from, "10.0.0.1");

        // sender hears its own datagram, like multicast loopback
        let (own, _) = a.recv().await.unwrap();
        assert_eq!(own, b"hello");
    }

    #[tokio::test]
    async fn test_send_without_receivers_is_ok() {
        let hub = InMemoryHub::new();
        let a = hub.transport("10.0.0.1");
        drop(hub);
        assert!(a.send_to_group(b"ping").await.is_ok());
    }

    #[tokio::test]
    async fn test_peer_network_routes_by_identity() {
        let network = InMemoryPeerNetwork::new();
        let a = NodeIdentity::generate("node-a");
        let b = NodeIdentity::generate("node-b");
        let mut inbox_b = network.register(b.clone()).await;
        network.register(a.clone()).await;

        network.send_to_peer(&b, b"submit").await.unwrap();
        assert_eq!(inbox_b.recv().await.unwrap(), b"submit");

        let unknown = NodeIdentity::generate("node-c");
        assert!(matches!(
            network.send_to_peer(&unknown, b"x").await,
            Err(TesseraError::UnknownNode(_))
        ));
    }
}
