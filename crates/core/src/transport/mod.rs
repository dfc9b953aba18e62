/// Datagram transport
///
/// Tunnel packets are self-contained datagrams: every cell carries its own
/// nonce and circuit id, so nothing above this layer needs ordering or
/// connection state. Sending never blocks the node; a packet that cannot go
/// out right now is dropped and the protocol timeouts take care of the rest.

use hiddentunnel_common::protocol::MAX_PACKET_SIZE;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Outbound half of the network as seen by a [`crate::TunnelNode`]
pub trait Transport: Send {
    fn send(&mut self, to: SocketAddr, bytes: Vec<u8>);
}

/// A packet in flight
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub source: SocketAddr,
    pub destination: SocketAddr,
    pub payload: Vec<u8>,
}

/// Transport that queues every packet on a channel
///
/// Used to wire several nodes together inside one process.
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    local: SocketAddr,
    tx: mpsc::UnboundedSender<Datagram>,
}

impl ChannelTransport {
    pub fn new(local: SocketAddr, tx: mpsc::UnboundedSender<Datagram>) -> Self {
        Self { local, tx }
    }
}

impl Transport for ChannelTransport {
    fn send(&mut self, to: SocketAddr, bytes: Vec<u8>) {
        let datagram = Datagram {
            source: self.local,
            destination: to,
            payload: bytes,
        };
        if self.tx.send(datagram).is_err() {
            debug!("Packet from {} to {} dropped: network closed", self.local, to);
        }
    }
}

/// UDP socket transport
#[derive(Debug, Clone)]
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
}

impl UdpTransport {
    pub fn new(socket: Arc<UdpSocket>) -> Self {
        Self { socket }
    }

    pub fn socket(&self) -> &Arc<UdpSocket> {
        &self.socket
    }
}

impl Transport for UdpTransport {
    fn send(&mut self, to: SocketAddr, bytes: Vec<u8>) {
        if bytes.len() > MAX_PACKET_SIZE {
            warn!("Dropping oversized packet to {} ({} bytes)", to, bytes.len());
            return;
        }
        if let Err(e) = self.socket.try_send_to(&bytes, to) {
            debug!("Failed to send {} bytes to {}: {}", bytes.len(), to, e);
        }
    }
}
