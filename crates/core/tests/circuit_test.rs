mod common;

use common::SimNetwork;
use hiddentunnel_common::{PeerFlags, TunnelError};
use hiddentunnel_core::{protocol, CircuitRequest, CircuitType, Packet};
use std::collections::HashSet;
use std::net::SocketAddr;

#[test]
fn test_three_hop_data_circuit() {
    let mut net = SimNetwork::with_nodes(&[
        PeerFlags::NONE,
        PeerFlags::RELAY,
        PeerFlags::RELAY,
        PeerFlags::EXIT,
    ]);

    let id = net.nodes[0]
        .create_circuit(CircuitRequest::new(3, CircuitType::Data))
        .unwrap();
    net.deliver_messages();

    let circuit = net.nodes[0].circuit(id).unwrap();
    assert!(circuit.is_ready());
    assert_eq!(circuit.len(), 3);
    assert_eq!(
        circuit.last_hop().map(|hop| hop.peer.address()),
        Some(net.address(3))
    );

    let path = net.e2e_path(0, id);
    assert_eq!(path.len(), 4);
    assert_eq!(path[3], 3);
    let middle: HashSet<usize> = path[1..3].iter().copied().collect();
    assert_eq!(middle, [1, 2].into());

    let source: SocketAddr = "10.0.0.1:5000".parse().unwrap();
    let destination: SocketAddr = "10.0.0.2:443".parse().unwrap();
    net.nodes[0]
        .send_data(&[], id, source, destination, b"hello exit")
        .unwrap();
    net.deliver_messages();

    let received = net.received(3);
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].payload, b"hello exit".to_vec());
    assert_eq!(received[0].destination, destination);
    assert!(net.received(1).is_empty());
    assert!(net.received(2).is_empty());
}

#[test]
fn test_destroy_tears_down_every_hop() {
    let mut net = SimNetwork::with_nodes(&[
        PeerFlags::NONE,
        PeerFlags::RELAY,
        PeerFlags::RELAY,
        PeerFlags::EXIT,
    ]);

    let id = net.nodes[0]
        .create_circuit(CircuitRequest::new(3, CircuitType::Data))
        .unwrap();
    net.deliver_messages();
    for relay in 1..4 {
        assert_eq!(net.nodes[relay].relays().stats().sessions, 1);
    }

    assert!(net.nodes[0].destroy_circuit(id, "done"));
    net.deliver_messages();

    assert!(net.nodes[0].circuit(id).is_none());
    for relay in 1..4 {
        let stats = net.nodes[relay].relays().stats();
        assert_eq!(stats.sessions, 0);
        assert_eq!(stats.linked_pairs, 0);
    }
}

#[test]
fn test_build_fails_without_exit() {
    let mut net = SimNetwork::with_nodes(&[PeerFlags::NONE, PeerFlags::RELAY, PeerFlags::RELAY]);

    // relays exist but none of them may exit
    let id = net.nodes[0]
        .create_circuit(CircuitRequest::new(2, CircuitType::Data))
        .unwrap();
    net.deliver_messages();

    assert!(net.nodes[0].circuit(id).is_none());
    assert_eq!(net.nodes[0].circuits().count_live(CircuitType::Data), 0);
    for relay in 1..3 {
        assert_eq!(net.nodes[relay].relays().stats().sessions, 0);
    }
}

#[test]
fn test_departed_relay_breaks_circuit() {
    let mut net = SimNetwork::with_nodes(&[
        PeerFlags::NONE,
        PeerFlags::RELAY | PeerFlags::EXIT,
    ]);

    let id = net.nodes[0]
        .create_circuit(CircuitRequest::new(1, CircuitType::Data))
        .unwrap();
    net.deliver_messages();
    assert!(net.nodes[0].circuit(id).unwrap().is_ready());

    let relay = net.address(1);
    net.nodes[0].on_peer_departed(relay);
    net.deliver_messages();

    assert!(net.nodes[0].circuit(id).is_none());
    assert!(!net.nodes[0].peers().contains(&relay));
}

#[test]
fn test_garbage_cells_destroy_the_circuit() {
    let mut net = SimNetwork::with_nodes(&[
        PeerFlags::NONE,
        PeerFlags::RELAY | PeerFlags::EXIT,
    ]);

    let id = net.nodes[0]
        .create_circuit(CircuitRequest::new(1, CircuitType::Data))
        .unwrap();
    net.deliver_messages();
    assert!(net.nodes[0].circuit(id).unwrap().is_ready());

    let relay = net.address(1);
    let garbage = protocol::encode(&Packet::Cell {
        circuit_id: id,
        onion: vec![0xAB; 96],
    })
    .unwrap();
    let max = net.nodes[0].settings().max_integrity_failures;

    for _ in 1..max {
        net.nodes[0].on_packet(relay, &garbage);
    }
    assert_eq!(net.nodes[0].circuit(id).unwrap().integrity_failures, max - 1);

    net.nodes[0].on_packet(relay, &garbage);
    assert!(net.nodes[0].circuit(id).is_none());

    net.deliver_messages();
    assert_eq!(net.nodes[1].relays().stats().sessions, 0);
}

#[test]
fn test_unload_stops_the_node() {
    let mut net = SimNetwork::with_nodes(&[
        PeerFlags::NONE,
        PeerFlags::RELAY | PeerFlags::EXIT,
    ]);

    let id = net.nodes[0]
        .create_circuit(CircuitRequest::new(1, CircuitType::Data))
        .unwrap();
    net.deliver_messages();

    net.nodes[0].unload();
    net.deliver_messages();

    assert!(!net.nodes[0].is_running());
    assert!(net.nodes[0].circuits().is_empty());
    assert_eq!(net.nodes[1].relays().stats().sessions, 0);
    assert!(matches!(
        net.nodes[0].create_circuit(CircuitRequest::new(1, CircuitType::Data)),
        Err(TunnelError::NotRunning)
    ));
    assert!(net.nodes[0]
        .send_data(&[], id, relay_addr(), relay_addr(), b"late")
        .is_err());
}

fn relay_addr() -> SocketAddr {
    "10.0.0.3:1".parse().unwrap()
}
