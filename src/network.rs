//! Transport primitives for node-to-node gossip.
//!
//! Every exchange in the mesh rides a short-lived TCP connection carrying
//! length-prefixed frames: a 4-byte big-endian length header followed by a
//! JSON-encoded [`GossipMessage`]. The encoding is self-describing, so a
//! deployment can roll protocol additions forward as long as all peers
//! agree on the field set.
//!
//! I/O failures surface as [`DiscoveryError::Transient`] (breaker
//! countable); malformed frames surface as
//! [`DiscoveryError::ProtocolDecode`] and close the connection.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use uuid::Uuid;

use crate::error::{DiscoveryError, DiscoveryResult};
use crate::types::{NodeId, RegistryDigest, ServiceId, ServiceInstance};

/// Maximum frame size (16 MB). Anything larger is a protocol error.
const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Discriminant of a gossip message, used for dispatch and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    Register,
    Deregister,
    Heartbeat,
    AntiEntropyDigest,
    AntiEntropyRequest,
    AntiEntropyResponse,
}

/// Message body. The variant is the message kind; see [`MessageKind`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Payload {
    /// New or updated service entries.
    Register(Vec<ServiceInstance>),
    /// Tombstoned service entries.
    Deregister(Vec<ServiceInstance>),
    /// Liveness refresh for the named entries; carries no content changes.
    Heartbeat(Vec<ServiceId>),
    /// Registry summary opening an anti-entropy exchange.
    AntiEntropyDigest(RegistryDigest),
    /// Pull request for full entries by id.
    AntiEntropyRequest(Vec<ServiceId>),
    /// Full entries, plus the ids the sender wants back in return.
    AntiEntropyResponse {
        entries: Vec<ServiceInstance>,
        wanted: Vec<ServiceId>,
    },
}

impl Payload {
    /// The kind tag for this payload.
    pub fn kind(&self) -> MessageKind {
        match self {
            Payload::Register(_) => MessageKind::Register,
            Payload::Deregister(_) => MessageKind::Deregister,
            Payload::Heartbeat(_) => MessageKind::Heartbeat,
            Payload::AntiEntropyDigest(_) => MessageKind::AntiEntropyDigest,
            Payload::AntiEntropyRequest(_) => MessageKind::AntiEntropyRequest,
            Payload::AntiEntropyResponse { .. } => MessageKind::AntiEntropyResponse,
        }
    }
}

/// The wire unit: a payload wrapped with routing and dedup metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipMessage {
    /// 128-bit random identifier, used for deduplication.
    pub message_id: Uuid,
    /// Identity of the transmitting node.
    pub sender: NodeId,
    /// Gossip endpoint of the transmitting node, for passive peer learning.
    pub sender_addr: SocketAddr,
    /// Relay budget; decremented on each hop.
    pub hops_remaining: u32,
    /// Wall-clock at the original sender.
    pub created_at: DateTime<Utc>,
    pub payload: Payload,
}

impl GossipMessage {
    /// Build a fresh message with a random id, stamped now.
    pub fn new(sender: NodeId, sender_addr: SocketAddr, hops: u32, payload: Payload) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            sender,
            sender_addr,
            hops_remaining: hops,
            created_at: Utc::now(),
            payload,
        }
    }

    /// The kind tag of the payload.
    pub fn kind(&self) -> MessageKind {
        self.payload.kind()
    }

    /// Whether the message is older than `max_age` at instant `now`.
    pub fn is_stale(&self, now: DateTime<Utc>, max_age: std::time::Duration) -> bool {
        let cutoff = chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::MAX);
        now.signed_duration_since(self.created_at) > cutoff
    }

    fn to_bytes(&self, peer: SocketAddr) -> DiscoveryResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| DiscoveryError::ProtocolDecode {
            peer,
            detail: format!("encode: {e}"),
        })
    }

    fn from_bytes(bytes: &[u8], peer: SocketAddr) -> DiscoveryResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| DiscoveryError::ProtocolDecode {
            peer,
            detail: format!("decode: {e}"),
        })
    }
}

/// One TCP connection to a peer, carrying framed gossip messages.
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    peer_addr: SocketAddr,
}

impl Connection {
    /// Wrap an accepted stream.
    pub fn new(stream: TcpStream, peer_addr: SocketAddr) -> Self {
        Self { stream, peer_addr }
    }

    /// Open a connection to a peer.
    pub async fn connect(addr: SocketAddr) -> DiscoveryResult<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| DiscoveryError::transient(addr, e))?;
        Ok(Self::new(stream, addr))
    }

    /// The remote address of this connection.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Send one framed message.
    pub async fn send(&mut self, message: &GossipMessage) -> DiscoveryResult<()> {
        let bytes = message.to_bytes(self.peer_addr)?;
        if bytes.len() > MAX_FRAME_SIZE {
            return Err(DiscoveryError::ProtocolDecode {
                peer: self.peer_addr,
                detail: format!("frame too large: {} bytes", bytes.len()),
            });
        }

        let len = bytes.len() as u32;
        self.stream
            .write_all(&len.to_be_bytes())
            .await
            .map_err(|e| DiscoveryError::transient(self.peer_addr, e))?;
        self.stream
            .write_all(&bytes)
            .await
            .map_err(|e| DiscoveryError::transient(self.peer_addr, e))?;
        self.stream
            .flush()
            .await
            .map_err(|e| DiscoveryError::transient(self.peer_addr, e))?;
        Ok(())
    }

    /// Receive one framed message.
    pub async fn receive(&mut self) -> DiscoveryResult<GossipMessage> {
        let mut len_bytes = [0u8; 4];
        self.stream
            .read_exact(&mut len_bytes)
            .await
            .map_err(|e| DiscoveryError::transient(self.peer_addr, e))?;

        let len = u32::from_be_bytes(len_bytes) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(DiscoveryError::ProtocolDecode {
                peer: self.peer_addr,
                detail: format!("frame length {len} exceeds cap"),
            });
        }

        let mut bytes = vec![0u8; len];
        self.stream
            .read_exact(&mut bytes)
            .await
            .map_err(|e| DiscoveryError::transient(self.peer_addr, e))?;

        GossipMessage::from_bytes(&bytes, self.peer_addr)
    }

    /// Send a message and wait for one response frame.
    pub async fn request(&mut self, message: &GossipMessage) -> DiscoveryResult<GossipMessage> {
        self.send(message).await?;
        self.receive().await
    }
}

/// TCP listener for inbound gossip connections.
pub struct Listener {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Listener {
    /// Bind to an address and start listening.
    pub async fn bind(addr: SocketAddr) -> DiscoveryResult<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| DiscoveryError::transient(addr, e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| DiscoveryError::transient(addr, e))?;
        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// The actually bound address (resolves port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept one inbound connection.
    pub async fn accept(&self) -> DiscoveryResult<Connection> {
        let (stream, peer_addr) = self
            .listener
            .accept()
            .await
            .map_err(|e| DiscoveryError::transient(self.local_addr, e))?;
        Ok(Connection::new(stream, peer_addr))
    }
}
