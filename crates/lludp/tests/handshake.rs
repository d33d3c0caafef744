use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use glam::Vec3;
use uuid::Uuid;

use lludp::net::{
    AgentMovementComplete, ChatFromSimulator, ChatFromViewer, CompleteAgentMovement, PacketAck,
    PacketFlags, RegionHandshake, StartPingCheck, TeleportLocal, TeleportLocationRequest,
    UseCircuitCode, event_channel,
};
use lludp::{
    CircuitInfo, ClientConfig, ClientError, ClientEvent, ConnectionManager, ConnectionState,
    Message, NetworkClient, Packet, register_default_handlers,
};

static PORT_COUNTER: AtomicU16 = AtomicU16::new(41000);

const CIRCUIT_CODE: u32 = 12345;

fn next_port() -> u16 {
    PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
}

fn agent_id() -> Uuid {
    Uuid::from_u128(0xa9e3_0000_0000_0000_0000_0000_0000_0001)
}

fn session_id() -> Uuid {
    Uuid::from_u128(0x5e55_0000_0000_0000_0000_0000_0000_0002)
}

fn circuit() -> CircuitInfo {
    CircuitInfo {
        circuit_code: CIRCUIT_CODE,
        agent_id: agent_id(),
        session_id: session_id(),
    }
}

fn config() -> ClientConfig {
    ClientConfig {
        bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        ..Default::default()
    }
}

/// Plays the region simulator's side of a circuit.
struct FakeSimulator {
    socket: UdpSocket,
    client: Option<SocketAddr>,
    next_sequence: u32,
}

impl FakeSimulator {
    fn bind() -> Self {
        let socket = loop {
            if let Ok(socket) = UdpSocket::bind(("127.0.0.1", next_port())) {
                break socket;
            }
        };
        socket
            .set_read_timeout(Some(Duration::from_millis(20)))
            .unwrap();
        Self {
            socket,
            client: None,
            next_sequence: 1,
        }
    }

    fn port(&self) -> u16 {
        self.socket.local_addr().unwrap().port()
    }

    fn recv(&mut self, timeout_ms: u64) -> Option<Packet> {
        let start = Instant::now();
        let mut buf = [0u8; 8192];
        while start.elapsed() < Duration::from_millis(timeout_ms) {
            if let Ok((len, addr)) = self.socket.recv_from(&mut buf) {
                self.client = Some(addr);
                return Some(Packet::parse(&buf[..len]).unwrap());
            }
        }
        None
    }

    /// Skips packets until one satisfies `pred`.
    fn recv_matching(
        &mut self,
        timeout_ms: u64,
        mut pred: impl FnMut(&Packet) -> bool,
    ) -> Option<Packet> {
        let start = Instant::now();
        while start.elapsed() < Duration::from_millis(timeout_ms) {
            if let Some(packet) = self.recv(timeout_ms) {
                if pred(&packet) {
                    return Some(packet);
                }
            }
        }
        None
    }

    fn send_packet(&mut self, packet: Packet) {
        let bytes = packet.serialize().unwrap();
        self.socket.send_to(&bytes, self.client.unwrap()).unwrap();
    }

    fn send(&mut self, message: Message) -> u32 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.send_packet(Packet::from_message(sequence, message));
        sequence
    }

    fn ack(&mut self, sequence: u32) {
        self.send(PacketAck {
            packets: vec![sequence],
        }
        .into());
    }
}

fn wait_for(
    manager: &mut ConnectionManager,
    timeout_ms: u64,
    mut done: impl FnMut(&ConnectionManager) -> bool,
) -> bool {
    let start = Instant::now();
    while start.elapsed() < Duration::from_millis(timeout_ms) {
        manager.poll_inbound(Instant::now());
        if done(manager) {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    false
}

fn acks_in(packet: &Packet) -> Vec<u32> {
    let mut acks = packet.acks.clone();
    if let Message::PacketAck(ack) = &packet.payload {
        acks.extend(&ack.packets);
    }
    acks
}

fn logged_in_manager(sim: &mut FakeSimulator) -> (ConnectionManager, Receiver<ClientEvent>) {
    let (tx, rx) = event_channel(256);
    let mut manager = ConnectionManager::new(config(), circuit(), Arc::new(tx));

    manager.connect("127.0.0.1", sim.port()).unwrap();
    let use_circuit = sim.recv(500).expect("UseCircuitCode not received");
    sim.ack(use_circuit.sequence());
    assert!(wait_for(&mut manager, 500, |m| m.state() == ConnectionState::Connected));

    manager.login("Jane", "Doe", "").unwrap();
    sim.recv_matching(500, |p| p.message_type() == lludp::MessageType::CompleteAgentMovement)
        .expect("CompleteAgentMovement not received");
    sim.send(
        AgentMovementComplete {
            agent_id: agent_id(),
            session_id: session_id(),
            position: Vec3::new(128.0, 128.0, 25.0),
            look_at: Vec3::X,
            region_handle: 0x0003_e800_0003_e800,
            timestamp: 1,
        }
        .into(),
    );
    assert!(wait_for(&mut manager, 500, |m| m.state() == ConnectionState::LoggedIn));
    (manager, rx)
}

#[test]
fn test_connect_and_login_full_flow() {
    let mut sim = FakeSimulator::bind();
    let (tx, rx) = event_channel(64);
    let mut manager = ConnectionManager::new(config(), circuit(), Arc::new(tx));

    manager.connect("127.0.0.1", sim.port()).unwrap();
    assert_eq!(manager.state(), ConnectionState::Connecting);

    let packet = sim.recv(500).expect("No packet received");
    assert!(packet.header.is_reliable());
    assert_eq!(
        packet.payload,
        Message::UseCircuitCode(UseCircuitCode {
            circuit_code: CIRCUIT_CODE,
            session_id: session_id(),
            agent_id: agent_id(),
        })
    );

    sim.ack(packet.sequence());
    assert!(wait_for(&mut manager, 500, |m| m.state() == ConnectionState::Connected));
    assert_eq!(manager.pending_acks(), 0);

    manager.login("Jane", "Doe", "").unwrap();
    assert_eq!(manager.state(), ConnectionState::Authenticating);

    let packet = sim.recv(500).expect("CompleteAgentMovement not received");
    assert_eq!(
        packet.payload,
        Message::CompleteAgentMovement(CompleteAgentMovement {
            agent_id: agent_id(),
            session_id: session_id(),
            circuit_code: CIRCUIT_CODE,
        })
    );
    // Not logged in until the simulator confirms.
    assert_eq!(manager.session_info(), Default::default());

    let movement_seq = sim.send(
        AgentMovementComplete {
            agent_id: agent_id(),
            session_id: session_id(),
            position: Vec3::new(128.0, 128.0, 25.0),
            ..Default::default()
        }
        .into(),
    );
    assert!(wait_for(&mut manager, 500, |m| m.state() == ConnectionState::LoggedIn));

    let info = manager.session_info();
    assert_eq!(info.agent_id, agent_id());
    assert_eq!(info.session_id, session_id());
    assert_eq!(info.circuit_code, CIRCUIT_CODE);
    assert!(info.is_valid());

    // The simulator's reliable packet gets acknowledged, appended or standalone.
    manager.tick(Instant::now()).unwrap();
    let acked = sim.recv_matching(500, |p| acks_in(p).contains(&movement_seq));
    assert!(acked.is_some(), "AgentMovementComplete was never acknowledged");

    let states: Vec<_> = rx
        .try_iter()
        .filter_map(|event| match event {
            ClientEvent::StateChanged { to, .. } => Some(to),
            _ => None,
        })
        .collect();
    assert_eq!(
        states,
        vec![
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Authenticating,
            ConnectionState::LoggedIn,
        ]
    );
}

#[test]
fn test_teleport_and_chat_after_login() {
    let mut sim = FakeSimulator::bind();
    let (mut manager, rx) = logged_in_manager(&mut sim);
    rx.try_iter().count();

    let target = Vec3::new(64.0, 32.0, 40.0);
    manager.teleport_avatar(target).unwrap();
    let request = sim
        .recv_matching(500, |p| {
            p.message_type() == lludp::MessageType::TeleportLocationRequest
        })
        .expect("TeleportLocationRequest not received");
    let Message::TeleportLocationRequest(TeleportLocationRequest {
        position,
        region_handle,
        ..
    }) = request.payload
    else {
        panic!("unexpected payload");
    };
    assert_eq!(position, target);
    assert_eq!(region_handle, 0x0003_e800_0003_e800);

    sim.send(
        TeleportLocal {
            agent_id: agent_id(),
            position: target,
            ..Default::default()
        }
        .into(),
    );
    assert!(wait_for(&mut manager, 500, |m| {
        m.session().is_some_and(|s| s.position == target)
    }));
    assert!(
        rx.try_iter()
            .any(|event| event == ClientEvent::TeleportFinished { position: target })
    );

    manager.send_chat("hello region").unwrap();
    let chat = sim
        .recv_matching(500, |p| p.message_type() == lludp::MessageType::ChatFromViewer)
        .expect("ChatFromViewer not received");
    assert!(matches!(
        chat.payload,
        Message::ChatFromViewer(ChatFromViewer { ref message, channel: 0, .. }) if message == "hello region"
    ));
}

#[test]
fn test_region_handshake_gets_reply() {
    let mut sim = FakeSimulator::bind();
    let (mut manager, _rx) = logged_in_manager(&mut sim);

    sim.send(
        RegionHandshake {
            sim_name: "Sandbox Island".to_string(),
            region_id: Uuid::from_u128(77),
            ..Default::default()
        }
        .into(),
    );
    assert!(wait_for(&mut manager, 500, |m| {
        m.session().is_some_and(|s| s.region.is_some())
    }));

    let reply = sim
        .recv_matching(500, |p| {
            p.message_type() == lludp::MessageType::RegionHandshakeReply
        })
        .expect("RegionHandshakeReply not received");
    assert!(reply.header.is_reliable());
    assert_eq!(
        manager.session().unwrap().region.as_ref().unwrap().name,
        "Sandbox Island"
    );
}

#[test]
fn test_simulator_ping_is_answered() {
    let mut sim = FakeSimulator::bind();
    let (mut manager, _rx) = logged_in_manager(&mut sim);

    sim.send(
        StartPingCheck {
            ping_id: 9,
            oldest_unacked: 0,
        }
        .into(),
    );
    manager.poll_inbound(Instant::now());
    let mut pong = None;
    for _ in 0..50 {
        manager.poll_inbound(Instant::now());
        pong = sim.recv_matching(20, |p| {
            p.message_type() == lludp::MessageType::CompletePingCheck
        });
        if pong.is_some() {
            break;
        }
    }
    let pong = pong.expect("CompletePingCheck not received");
    assert_eq!(
        pong.payload,
        Message::CompletePingCheck(lludp::net::CompletePingCheck { ping_id: 9 })
    );
}

#[test]
fn test_unacked_circuit_times_out_after_five_resends() {
    let mut sim = FakeSimulator::bind();
    let (tx, rx) = event_channel(64);
    let mut manager = ConnectionManager::new(config(), circuit(), Arc::new(tx));

    let start = Instant::now();
    manager.connect_at("127.0.0.1", sim.port(), start).unwrap();

    // Simulated time so the full backoff schedule runs instantly.
    let mut now = start;
    let mut result = Ok(());
    for _ in 0..600 {
        now += Duration::from_millis(100);
        result = manager.tick(now);
        if result.is_err() {
            break;
        }
    }
    assert!(matches!(
        result,
        Err(ClientError::LinkTimeout {
            sequence: 1,
            retries: 5
        })
    ));
    assert_eq!(manager.state(), ConnectionState::Disconnected);

    let mut first_sends = 0;
    let mut resends = 0;
    while let Some(packet) = sim.recv(100) {
        assert_eq!(packet.message_type(), lludp::MessageType::UseCircuitCode);
        assert_eq!(packet.sequence(), 1);
        if packet.header.flags.contains(PacketFlags::RESEND) {
            resends += 1;
        } else {
            first_sends += 1;
        }
    }
    assert_eq!(first_sends, 1);
    assert_eq!(resends, 5);
    assert!(
        rx.try_iter()
            .any(|event| event == ClientEvent::LinkTimeout { sequence: 1 })
    );
}

#[test]
fn test_rejected_operations_before_login() {
    let mut sim = FakeSimulator::bind();
    let (tx, rx) = event_channel(64);
    let mut manager = ConnectionManager::new(config(), circuit(), Arc::new(tx));

    assert!(matches!(
        manager.login("Jane", "Doe", ""),
        Err(ClientError::InvalidState { .. })
    ));

    manager.connect("127.0.0.1", sim.port()).unwrap();
    let use_circuit = sim.recv(500).unwrap();
    sim.ack(use_circuit.sequence());
    assert!(wait_for(&mut manager, 500, |m| m.state() == ConnectionState::Connected));

    assert!(matches!(
        manager.teleport_avatar(Vec3::ONE),
        Err(ClientError::InvalidState { .. })
    ));
    assert_eq!(manager.state(), ConnectionState::Connected);
    assert!(
        rx.try_iter()
            .any(|event| matches!(event, ClientEvent::Error { .. }))
    );
}

#[test]
fn test_network_client_end_to_end() {
    let mut sim = FakeSimulator::bind();
    let (tx, rx) = event_channel(256);
    let events: Arc<dyn lludp::EventSink> = Arc::new(tx);

    let mut client = NetworkClient::new(config(), circuit(), Arc::clone(&events)).unwrap();
    register_default_handlers(client.router_mut(), Arc::clone(&events), events);
    let handle = client.handle();
    let join = client.spawn().unwrap();

    let wait_state = |state: ConnectionState| {
        let start = Instant::now();
        while start.elapsed() < Duration::from_millis(1000) {
            if handle.health().state == state {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        false
    };

    handle.connect("127.0.0.1", sim.port()).unwrap();
    let use_circuit = sim
        .recv_matching(1000, |p| p.message_type() == lludp::MessageType::UseCircuitCode)
        .expect("UseCircuitCode not received");
    sim.ack(use_circuit.sequence());
    assert!(wait_state(ConnectionState::Connected));

    handle.login("Jane", "Doe", "").unwrap();
    sim.recv_matching(1000, |p| {
        p.message_type() == lludp::MessageType::CompleteAgentMovement
    })
    .expect("CompleteAgentMovement not received");
    sim.send(
        AgentMovementComplete {
            agent_id: agent_id(),
            session_id: session_id(),
            position: Vec3::new(10.0, 20.0, 30.0),
            ..Default::default()
        }
        .into(),
    );
    assert!(wait_state(ConnectionState::LoggedIn));

    sim.send(
        ChatFromSimulator {
            from_name: "Region Greeter".to_string(),
            message: "welcome".to_string(),
            ..Default::default()
        }
        .into(),
    );

    let start = Instant::now();
    let mut chat = None;
    let mut moved = false;
    while chat.is_none() && start.elapsed() < Duration::from_millis(1000) {
        match rx.recv_timeout(Duration::from_millis(20)) {
            Ok(ClientEvent::Chat(record)) => chat = Some(record),
            Ok(ClientEvent::AgentMoved(record)) => {
                moved = record.position == Vec3::new(10.0, 20.0, 30.0);
            }
            _ => {}
        }
    }
    assert!(moved);
    let chat = chat.expect("chat event not delivered");
    assert_eq!(chat.from_name, "Region Greeter");
    assert_eq!(chat.message, "welcome");

    handle.logout().unwrap();
    sim.recv_matching(1000, |p| p.message_type() == lludp::MessageType::LogoutRequest)
        .expect("LogoutRequest not received");
    sim.send(
        lludp::net::LogoutReply {
            agent_id: agent_id(),
            session_id: session_id(),
        }
        .into(),
    );
    assert!(wait_state(ConnectionState::Disconnected));
    assert!(handle.health().messages_routed >= 2);

    handle.shutdown();
    join.join().unwrap();
}
