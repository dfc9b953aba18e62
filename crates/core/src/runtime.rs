/// Async driver for a [`TunnelNode`] on a UDP socket
///
/// The node itself is synchronous. This task owns it and feeds it from four
/// sources: the socket, a command channel, a one second maintenance tick and
/// the peer discovery interval. Everything else talks to the node through a
/// cloneable [`NodeHandle`].

use crate::dht::{DhtProvider, QueryId};
use crate::identity::KeyPair;
use crate::node::TunnelNode;
use crate::transport::UdpTransport;
use anyhow::{anyhow, Context};
use hiddentunnel_common::protocol::MAX_PACKET_SIZE;
use hiddentunnel_common::swarm::PEER_DISCOVERY_INTERVAL_SECS;
use hiddentunnel_common::TunnelSettings;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

type NodeCall = Box<dyn FnOnce(&mut TunnelNode) + Send>;

enum NodeInput {
    DhtValues { query: QueryId, values: Vec<Vec<u8>> },
    Call(NodeCall),
    Shutdown,
}

/// Handle to a running node task
#[derive(Clone)]
pub struct NodeHandle {
    address: SocketAddr,
    tx: mpsc::UnboundedSender<NodeInput>,
}

impl std::fmt::Debug for NodeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeHandle")
            .field("address", &self.address)
            .finish()
    }
}

impl NodeHandle {
    /// Address the node's socket is bound to
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Run `f` on the node task and wait for its result
    pub async fn call<R, F>(&self, f: F) -> anyhow::Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut TunnelNode) -> R + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(NodeInput::Call(Box::new(move |node| {
                let _ = tx.send(f(node));
            })))
            .map_err(|_| anyhow!("tunnel node {} stopped", self.address))?;
        rx.await
            .map_err(|_| anyhow!("tunnel node {} stopped", self.address))
    }

    /// Deliver values answering a DHT lookup the node started
    pub fn dht_values(&self, query: QueryId, values: Vec<Vec<u8>>) -> anyhow::Result<()> {
        self.tx
            .send(NodeInput::DhtValues { query, values })
            .map_err(|_| anyhow!("tunnel node {} stopped", self.address))
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(NodeInput::Shutdown);
    }
}

/// Bind `bind` and run a node on it until [`NodeHandle::shutdown`]
///
/// `dht` is given the bound address, which differs from `bind` when an
/// ephemeral port was asked for.
pub async fn spawn_udp_node<F>(
    keypair: KeyPair,
    settings: TunnelSettings,
    bind: SocketAddr,
    dht: F,
) -> anyhow::Result<(NodeHandle, JoinHandle<anyhow::Result<()>>)>
where
    F: FnOnce(SocketAddr) -> Box<dyn DhtProvider>,
{
    settings.validate()?;

    let socket = Arc::new(
        UdpSocket::bind(bind)
            .await
            .with_context(|| format!("failed to bind {}", bind))?,
    );
    let address = socket.local_addr()?;

    let node = TunnelNode::new(
        keypair,
        address,
        settings,
        Box::new(UdpTransport::new(socket.clone())),
        dht(address),
    );

    let (tx, rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(run_node(node, socket, rx));
    Ok((NodeHandle { address, tx }, task))
}

async fn run_node(
    mut node: TunnelNode,
    socket: Arc<UdpSocket>,
    mut inputs: mpsc::UnboundedReceiver<NodeInput>,
) -> anyhow::Result<()> {
    let mut buf = vec![0u8; MAX_PACKET_SIZE];

    let mut tick = tokio::time::interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut discovery = tokio::time::interval(Duration::from_secs(PEER_DISCOVERY_INTERVAL_SECS));
    discovery.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!("Tunnel node listening on {}", node.address());

    loop {
        tokio::select! {
            received = socket.recv_from(&mut buf) => match received {
                Ok((len, source)) => node.on_packet(source, &buf[..len]),
                Err(e) => debug!("Receive error on {}: {}", node.address(), e),
            },
            input = inputs.recv() => match input {
                Some(NodeInput::DhtValues { query, values }) => node.on_dht_values(query, values),
                Some(NodeInput::Call(call)) => call(&mut node),
                Some(NodeInput::Shutdown) | None => break,
            },
            _ = tick.tick() => node.on_tick(Instant::now()),
            _ = discovery.tick() => node.do_peer_discovery(),
        }
    }

    node.unload();
    info!("Tunnel node on {} stopped", node.address());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::{CircuitRequest, CircuitType};
    use crate::dht::MemoryDht;
    use hiddentunnel_common::{PeerFlags, ServiceId};

    async fn spawn(flags: PeerFlags, dht: &MemoryDht) -> NodeHandle {
        let settings = TunnelSettings::default().with_peer_flags(flags);
        let bind: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let dht = dht.clone();
        let (handle, _task) = spawn_udp_node(KeyPair::generate(), settings, bind, move |address| {
            Box::new(dht.handle(address)) as Box<dyn DhtProvider>
        })
        .await
        .unwrap();
        handle
    }

    #[tokio::test]
    async fn test_one_hop_circuit_over_udp() {
        let dht = MemoryDht::new();
        let client = spawn(PeerFlags::NONE, &dht).await;
        let exit = spawn(PeerFlags::RELAY | PeerFlags::EXIT, &dht).await;

        let exit_info = exit.call(|node| node.peer_info()).await.unwrap();
        let id = client
            .call(move |node| {
                node.add_verified_peer(exit_info.peer, exit_info.flags);
                node.create_circuit(CircuitRequest::new(1, CircuitType::Data))
            })
            .await
            .unwrap()
            .unwrap();

        let mut ready = false;
        for _ in 0..100 {
            ready = client
                .call(move |node| node.circuit(id).is_some_and(|c| c.is_ready()))
                .await
                .unwrap();
            if ready {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(ready);

        client.shutdown();
        exit.shutdown();
    }

    #[tokio::test]
    async fn test_call_after_shutdown_fails() {
        let dht = MemoryDht::new();
        let node = spawn(PeerFlags::RELAY, &dht).await;
        node.shutdown();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(node.call(|node| node.is_running()).await.is_err());
    }

    #[tokio::test]
    async fn test_dht_lookup_names_bound_address() {
        let dht = MemoryDht::new();
        let node = spawn(PeerFlags::RELAY, &dht).await;
        assert_ne!(node.address().port(), 0);

        let service_id = ServiceId::from([7u8; 20]);
        node.call(move |node| node.join_swarm(service_id, 1, None, false))
            .await
            .unwrap()
            .unwrap();

        let resolved = dht.resolve_pending();
        assert_eq!(resolved.len(), 1);
        let (find, values) = &resolved[0];
        assert_eq!(find.requester, node.address());
        assert!(values.is_empty());
        node.dht_values(find.query, values.clone()).unwrap();

        node.shutdown();
    }
}
