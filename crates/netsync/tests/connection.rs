use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::mpsc;

use netsync::net::{
    ConnectDecision, ConnectingInfo, MsgState, MsgStateAck, PeerStatus, TransportEvent,
};
use netsync::{
    ConnectionId, DeliveryMethod, EntityState, GameState, GameStateProcessor, MemoryNetwork,
    MemoryTransport, NetChannel, NetConfig, NetEvent, NetManager, NetMessage, Transport,
};

type Manager = NetManager<MemoryTransport>;

fn server_config() -> NetConfig {
    NetConfig {
        bind_addresses: "127.0.0.1".to_string(),
        ..Default::default()
    }
}

fn listen(server: &mut Manager, network: &MemoryNetwork) -> SocketAddr {
    server.start_server(|addr| network.bind(addr)).unwrap();
    server.local_addrs()[0]
}

fn connect(network: &MemoryNetwork, server_addr: SocketAddr, username: &str) -> (Manager, ConnectionId) {
    let mut client = NetManager::client(NetConfig::default());
    let id = client
        .connect_client(network.bind_ephemeral().unwrap(), server_addr, username)
        .unwrap();
    (client, id)
}

fn pump(server: &mut Manager, clients: &mut [&mut Manager]) {
    for _ in 0..10 {
        server.process_packets();
        for client in clients.iter_mut() {
            client.process_packets();
        }
    }
}

fn wait_for_event<F>(
    transport: &mut MemoryTransport,
    server: &mut Manager,
    mut predicate: F,
) -> Option<TransportEvent>
where
    F: FnMut(&TransportEvent) -> bool,
{
    for _ in 0..50 {
        server.process_packets();
        while let Some(event) = transport.poll() {
            if predicate(&event) {
                return Some(event);
            }
        }
    }
    None
}

fn wait_for_data(transport: &mut MemoryTransport, server: &mut Manager) -> Vec<u8> {
    match wait_for_event(transport, server, |e| matches!(e, TransportEvent::Data { .. })) {
        Some(TransportEvent::Data { data, .. }) => data,
        other => panic!("expected data, got {other:?}"),
    }
}

/// Runs the client half of the handshake by hand and returns the peer and
/// the assigned session name.
fn raw_handshake(
    network: &MemoryNetwork,
    server: &mut Manager,
    server_addr: SocketAddr,
    username: &str,
) -> (MemoryTransport, netsync::net::PeerId, String) {
    let mut raw = network.bind_ephemeral().unwrap();
    let peer = raw.connect(server_addr).unwrap();

    wait_for_event(&mut raw, server, |e| {
        matches!(
            e,
            TransportEvent::StatusChanged {
                status: PeerStatus::Connected,
                ..
            }
        )
    })
    .expect("link never came up");

    raw.send(peer, username.as_bytes(), DeliveryMethod::ReliableOrdered)
        .unwrap();
    let assigned = String::from_utf8(wait_for_data(&mut raw, server)).unwrap();
    (raw, peer, assigned)
}

fn connected_name(events: &[NetEvent]) -> Option<&str> {
    events.iter().find_map(|event| match event {
        NetEvent::Connected { session_name, .. } => Some(session_name.as_str()),
        _ => None,
    })
}

#[test]
fn test_handshake_full_flow() {
    let network = MemoryNetwork::new();
    let mut server = NetManager::server(server_config());
    server.register_message::<MsgState>().unwrap();
    let server_addr = listen(&mut server, &network);

    let (tx, rx) = mpsc::channel();
    let (mut client, id) = connect(&network, server_addr, "alice");
    client
        .register_message_with(move |channel: &NetChannel, msg: MsgState| {
            let _ = tx.send((channel.session_name().to_string(), msg.state.to_tick));
        })
        .unwrap();

    pump(&mut server, &mut [&mut client]);

    let server_events: Vec<_> = server.drain_events().collect();
    let client_events: Vec<_> = client.drain_events().collect();
    assert_eq!(connected_name(&server_events), Some("alice"));
    assert_eq!(connected_name(&client_events), Some("alice"));
    assert_eq!(client.channel(id).unwrap().session_name(), "alice");

    assert_eq!(
        client.string_table().try_find_string_id(MsgState::NAME),
        server.string_table().try_find_string_id(MsgState::NAME)
    );

    let server_side = server.channel_by_name("alice").unwrap().connection();
    server
        .send_message(server_side, &MsgState { state: GameState::full(9) })
        .unwrap();
    pump(&mut server, &mut [&mut client]);

    assert_eq!(rx.try_recv().unwrap(), ("alice".to_string(), 9));
}

#[test]
fn test_duplicate_usernames_get_suffixed() {
    let network = MemoryNetwork::new();
    let mut server = NetManager::server(server_config());
    let server_addr = listen(&mut server, &network);

    let (mut a, _) = connect(&network, server_addr, "bob");
    let (mut b, _) = connect(&network, server_addr, "bob");
    let (mut c, _) = connect(&network, server_addr, "bob");
    pump(&mut server, &mut [&mut a, &mut b, &mut c]);

    let names: HashSet<String> = server
        .channels()
        .map(|channel| channel.session_name().to_string())
        .collect();
    let expected: HashSet<String> = ["bob", "bob_2", "bob_3"]
        .into_iter()
        .map(String::from)
        .collect();
    assert_eq!(names, expected);

    let client_names: HashSet<String> = [&a, &b, &c]
        .iter()
        .flat_map(|client| client.channels().map(|ch| ch.session_name().to_string()))
        .collect();
    assert_eq!(client_names, expected);
}

#[test]
fn test_connecting_hook_veto_consumes_no_name() {
    let network = MemoryNetwork::new();
    let mut server = NetManager::server(server_config());
    let mut denied_once = false;
    server.set_connecting_hook(move |info: &ConnectingInfo| {
        if info.requested_name == "carol" && !denied_once {
            denied_once = true;
            ConnectDecision::Deny
        } else {
            ConnectDecision::Allow
        }
    });
    let server_addr = listen(&mut server, &network);

    let (mut first, _) = connect(&network, server_addr, "carol");
    pump(&mut server, &mut [&mut first]);

    let events: Vec<_> = first.drain_events().collect();
    assert!(matches!(
        events.as_slice(),
        [NetEvent::ConnectFailed { reason, .. }] if reason == "Connection denied"
    ));
    assert_eq!(server.channels().count(), 0);
    assert_eq!(server.drain_events().count(), 0);

    let (mut second, _) = connect(&network, server_addr, "carol");
    pump(&mut server, &mut [&mut second]);
    let events: Vec<_> = second.drain_events().collect();
    assert_eq!(connected_name(&events), Some("carol"));
}

#[test]
fn test_invalid_username_is_rejected() {
    let network = MemoryNetwork::new();
    let mut server = NetManager::server(server_config());
    let server_addr = listen(&mut server, &network);

    let (mut client, id) = connect(&network, server_addr, "bad name!");
    pump(&mut server, &mut [&mut client]);

    let events: Vec<_> = client.drain_events().collect();
    match events.as_slice() {
        [NetEvent::ConnectFailed { reason, .. }] => {
            assert!(reason.starts_with("Username is invalid"), "{reason}")
        }
        other => panic!("unexpected events {other:?}"),
    }
    assert!(client.channel(id).is_err());
    assert_eq!(server.channels().count(), 0);
}

#[test]
fn test_wrong_acknowledgement_disconnects() {
    let network = MemoryNetwork::new();
    let mut server = NetManager::server(server_config());
    let server_addr = listen(&mut server, &network);

    let (mut raw, peer, assigned) = raw_handshake(&network, &mut server, server_addr, "dave");
    assert_eq!(assigned, "dave");

    raw.send(peer, b"nope", DeliveryMethod::ReliableOrdered)
        .unwrap();
    let event = wait_for_event(&mut raw, &mut server, |e| {
        matches!(
            e,
            TransportEvent::StatusChanged {
                status: PeerStatus::Disconnected,
                ..
            }
        )
    });

    assert!(matches!(
        event,
        Some(TransportEvent::StatusChanged { reason, .. })
            if reason == "Invalid handshake acknowledgement"
    ));
    assert_eq!(server.channels().count(), 0);
    assert_eq!(server.pending_handshakes(), 0);
}

#[test]
fn test_string_table_arrives_after_handshake() {
    let network = MemoryNetwork::new();
    let mut server = NetManager::server(server_config());
    server.register_message::<MsgState>().unwrap();
    server.register_message::<MsgStateAck>().unwrap();
    let server_addr = listen(&mut server, &network);

    let (mut raw, peer, _) = raw_handshake(&network, &mut server, server_addr, "erin");
    assert!(server.channels().next().is_none());

    raw.send(peer, b"ok", DeliveryMethod::ReliableOrdered).unwrap();
    let table = wait_for_data(&mut raw, &mut server);

    assert_eq!(table[0], netsync::net::BOOTSTRAP_STRING_ID);
    let entries = netsync::net::MsgStringTableEntries::decode(&table[1..])
        .unwrap()
        .entries;
    assert_eq!(entries.len(), 3);
    assert!(entries.iter().any(|entry| entry.name == MsgStateAck::NAME));
    assert_eq!(server.channels().count(), 1);
}

#[test]
fn test_malformed_frames_keep_connection_open() {
    let network = MemoryNetwork::new();
    let mut server = NetManager::server(server_config());
    let received = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&received);
    server
        .register_message_with(move |_: &NetChannel, msg: MsgStateAck| {
            sink.borrow_mut().push(msg.tick);
        })
        .unwrap();
    let server_addr = listen(&mut server, &network);

    let (mut raw, peer, _) = raw_handshake(&network, &mut server, server_addr, "frank");
    raw.send(peer, b"ok", DeliveryMethod::ReliableOrdered).unwrap();
    wait_for_data(&mut raw, &mut server);

    let ack_id = server
        .string_table()
        .try_find_string_id(MsgStateAck::NAME)
        .unwrap();
    for garbage in [vec![], vec![200], vec![ack_id, 0xff]] {
        raw.send(peer, &garbage, DeliveryMethod::ReliableUnordered)
            .unwrap();
    }
    let valid = server.build_message(&MsgStateAck { tick: 7 }).unwrap();
    raw.send(peer, &valid, DeliveryMethod::ReliableUnordered)
        .unwrap();

    for _ in 0..5 {
        server.process_packets();
    }

    assert_eq!(*received.borrow(), vec![7]);
    assert_eq!(server.channels().count(), 1);
    assert!(raw.connections().contains(&peer));
}

#[test]
fn test_disconnect_mid_handshake_is_silent() {
    let network = MemoryNetwork::new();
    let mut server = NetManager::server(server_config());
    let server_addr = listen(&mut server, &network);

    let mut raw = network.bind_ephemeral().unwrap();
    let peer = raw.connect(server_addr).unwrap();
    wait_for_event(&mut raw, &mut server, |e| {
        matches!(
            e,
            TransportEvent::StatusChanged {
                status: PeerStatus::Connected,
                ..
            }
        )
    })
    .unwrap();
    assert_eq!(server.pending_handshakes(), 1);

    raw.disconnect(peer, "gone");
    server.process_packets();

    assert_eq!(server.pending_handshakes(), 0);
    assert_eq!(server.drain_events().count(), 0);
}

#[test]
fn test_disconnect_fires_events_on_both_sides() {
    let network = MemoryNetwork::new();
    let mut server = NetManager::server(server_config());
    let server_addr = listen(&mut server, &network);

    let (mut client, id) = connect(&network, server_addr, "grace");
    pump(&mut server, &mut [&mut client]);
    let _ = server.drain_events().count();
    let _ = client.drain_events().count();

    client.disconnect_channel(id, "Leaving").unwrap();
    pump(&mut server, &mut [&mut client]);

    let client_events: Vec<_> = client.drain_events().collect();
    assert_eq!(
        client_events,
        vec![NetEvent::Disconnected {
            connection: id,
            session_name: "grace".to_string(),
            reason: "Leaving".to_string(),
        }]
    );

    let server_events: Vec<_> = server.drain_events().collect();
    assert!(matches!(
        server_events.as_slice(),
        [NetEvent::Disconnected { session_name, reason, .. }]
            if session_name == "grace" && reason == "Leaving"
    ));
    assert_eq!(server.channels().count(), 0);
}

#[test]
fn test_state_stream_feeds_processor() {
    let network = MemoryNetwork::new();
    let mut server = NetManager::server(server_config());
    let acked = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&acked);
    server.register_message::<MsgState>().unwrap();
    server
        .register_message_with(move |_: &NetChannel, msg: MsgStateAck| {
            sink.borrow_mut().push(msg.tick);
        })
        .unwrap();
    let server_addr = listen(&mut server, &network);

    let (tx, rx) = mpsc::channel();
    let (mut client, id) = connect(&network, server_addr, "heidi");
    client
        .register_message_with(move |_: &NetChannel, msg: MsgState| {
            let _ = tx.send(msg.state);
        })
        .unwrap();
    client.register_message::<MsgStateAck>().unwrap();
    pump(&mut server, &mut [&mut client]);

    let mut baseline: Option<GameState> = None;
    for tick in 1..=10u32 {
        let mut full = GameState::full(tick);
        full.entity_states
            .push(EntityState::new(1).with_component(0, tick.to_le_bytes().to_vec()));
        let state = match &baseline {
            Some(base) => GameState::delta_from_baseline(base, &full),
            None => full.clone(),
        };
        assert_eq!(server.broadcast(&MsgState { state }).unwrap(), 1);
        baseline = Some(full);
    }
    pump(&mut server, &mut [&mut client]);

    let mut processor = GameStateProcessor::default();
    for state in rx.try_iter() {
        assert!(processor.add_state(state, 0));
    }

    let mut tick = 0;
    let mut view = HashMap::new();
    let mut applied = Vec::new();
    for _ in 0..10 {
        let result = processor.process_tick_states(&mut tick);
        if let Some(current) = result.current {
            for state in &result.catch_up {
                state.apply_to(&mut view);
            }
            current.apply_to(&mut view);
            applied.push(current.to_tick);
        }
        tick += 1;
    }

    assert_eq!(applied, (1..=10).collect::<Vec<_>>());
    assert_eq!(view[&1].components[0].data, 10u32.to_le_bytes().to_vec());

    client
        .send_message(id, &MsgStateAck { tick: 10 })
        .unwrap();
    pump(&mut server, &mut [&mut client]);
    assert_eq!(*acked.borrow(), vec![10]);
}
