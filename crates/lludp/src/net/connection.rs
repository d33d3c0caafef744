//! Circuit lifecycle: handshake state machine, session ownership, ack and
//! ping duty.
//!
//! [`ConnectionManager`] is driven from a single thread. Every outbound
//! packet goes through [`ConnectionManager::send_message`], every inbound
//! datagram through [`ConnectionManager::handle_datagram`], and the periodic
//! [`ConnectionManager::tick`] performs retransmission, ack flushing and
//! ping emission. Time is passed in explicitly so the whole machine can be
//! stepped deterministically.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use glam::Vec3;
use serde::Serialize;
use uuid::Uuid;

use super::config::{CircuitInfo, ClientConfig};
use super::endpoint::{NetworkEndpoint, resolve};
use super::error::{ClientError, ClientResult};
use super::events::{ClientEvent, EventSink, RegionRecord};
use super::message::*;
use super::protocol::Packet;
use super::reliability::{ReceiveTracker, ReliabilityLayer};
use super::stats::{NetworkStats, PingTracker};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Authenticating,
    LoggedIn,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Authenticating => "authenticating",
            ConnectionState::LoggedIn => "logged in",
        }
    }

    /// The circuit has been acknowledged by the simulator.
    pub fn has_circuit(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connected | ConnectionState::Authenticating | ConnectionState::LoggedIn
        )
    }
}

/// Established once the simulator confirms agent movement; dropped on
/// disconnect.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub agent_id: Uuid,
    pub session_id: Uuid,
    pub circuit_code: u32,
    pub region_handle: u64,
    pub created_at: SystemTime,
    pub position: Vec3,
    pub look_at: Vec3,
    pub region: Option<RegionRecord>,
}

/// Identifiers of the current session. All zero until logged in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct SessionInfo {
    pub agent_id: Uuid,
    pub session_id: Uuid,
    pub circuit_code: u32,
}

impl SessionInfo {
    pub fn is_valid(&self) -> bool {
        self.circuit_code != 0 && !self.agent_id.is_nil() && !self.session_id.is_nil()
    }
}

pub struct ConnectionManager {
    config: ClientConfig,
    circuit: CircuitInfo,
    events: Arc<dyn EventSink>,
    state: ConnectionState,
    endpoint: Option<NetworkEndpoint>,
    reliability: ReliabilityLayer,
    receive_tracker: ReceiveTracker,
    pings: PingTracker,
    session: Option<Session>,
    /// Last region handshake on this circuit. Simulators usually send it
    /// before the agent movement that opens the session.
    region: Option<RegionRecord>,
    stats: NetworkStats,
    circuit_sequence: Option<u32>,
    teleport_in_progress: bool,
}

impl ConnectionManager {
    pub fn new(config: ClientConfig, circuit: CircuitInfo, events: Arc<dyn EventSink>) -> Self {
        Self {
            reliability: ReliabilityLayer::new(config.reliability.clone()),
            config,
            circuit,
            events,
            state: ConnectionState::Disconnected,
            endpoint: None,
            receive_tracker: ReceiveTracker::new(),
            pings: PingTracker::new(),
            session: None,
            region: None,
            stats: NetworkStats::default(),
            circuit_sequence: None,
            teleport_in_progress: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state.has_circuit()
    }

    pub fn circuit(&self) -> &CircuitInfo {
        &self.circuit
    }

    /// New credentials apply from the next `connect`.
    pub fn set_circuit(&mut self, circuit: CircuitInfo) {
        self.circuit = circuit;
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn region(&self) -> Option<&RegionRecord> {
        self.region.as_ref()
    }

    pub fn session_info(&self) -> SessionInfo {
        match (&self.session, self.state) {
            (Some(session), ConnectionState::LoggedIn) => SessionInfo {
                agent_id: session.agent_id,
                session_id: session.session_id,
                circuit_code: session.circuit_code,
            },
            _ => SessionInfo::default(),
        }
    }

    pub fn stats(&self) -> &NetworkStats {
        &self.stats
    }

    pub fn pending_acks(&self) -> usize {
        self.reliability.pending_count()
    }

    pub fn latency_ms(&self) -> Option<f32> {
        self.pings.latency_ms()
    }

    pub fn is_high_latency(&self) -> bool {
        let threshold = self.config.latency_threshold.as_secs_f32() * 1000.0;
        self.latency_ms().is_some_and(|latency| latency > threshold)
    }

    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.endpoint.as_ref().map(NetworkEndpoint::local_addr)
    }

    pub fn connect(&mut self, host: &str, port: u16) -> ClientResult<()> {
        self.connect_at(host, port, Instant::now())
    }

    /// Opens the socket and sends `UseCircuitCode`. The circuit counts as
    /// established once the simulator acknowledges that packet.
    pub fn connect_at(&mut self, host: &str, port: u16, now: Instant) -> ClientResult<()> {
        self.require(&[ConnectionState::Disconnected], "connect")?;

        let opened = resolve(host, port).and_then(|remote| {
            let mut endpoint =
                NetworkEndpoint::bind(self.config.bind_addr, self.config.receive_buffer)?;
            endpoint.set_remote(remote);
            Ok((remote, endpoint))
        });
        let (remote, endpoint) = match opened {
            Ok(opened) => opened,
            Err(e) => {
                log::error!("Could not open circuit to {}:{}: {}", host, port, e);
                self.emit_error(format!("transport failure: {e}"));
                return Err(e.into());
            }
        };
        log::info!(
            "Opening circuit {} to {} from {}",
            self.circuit.circuit_code,
            remote,
            endpoint.local_addr()
        );

        self.endpoint = Some(endpoint);
        self.stats = NetworkStats::default();
        self.transition(ConnectionState::Connecting);

        let sequence = self.send_message(
            UseCircuitCode {
                circuit_code: self.circuit.circuit_code,
                session_id: self.circuit.session_id,
                agent_id: self.circuit.agent_id,
            }
            .into(),
            now,
        )?;
        self.circuit_sequence = Some(sequence);
        Ok(())
    }

    pub fn login(&mut self, first: &str, last: &str, password: &str) -> ClientResult<()> {
        self.login_at(first, last, password, Instant::now())
    }

    /// Moves the agent into the region. Credentials were already checked by
    /// the login service that issued the circuit, so the password never
    /// travels over the circuit.
    pub fn login_at(
        &mut self,
        first: &str,
        last: &str,
        _password: &str,
        now: Instant,
    ) -> ClientResult<()> {
        self.require(&[ConnectionState::Connected], "login")?;

        if first.trim().is_empty() || last.trim().is_empty() {
            return Err(self.fail_handshake("first and last name are required".to_string()));
        }

        log::info!("Logging in as {} {}", first, last);
        self.transition(ConnectionState::Authenticating);
        self.send_message(
            CompleteAgentMovement {
                agent_id: self.circuit.agent_id,
                session_id: self.circuit.session_id,
                circuit_code: self.circuit.circuit_code,
            }
            .into(),
            now,
        )?;
        Ok(())
    }

    pub fn teleport_avatar(&mut self, position: Vec3) -> ClientResult<()> {
        self.teleport_avatar_at(position, Instant::now())
    }

    /// Requests a teleport within the current region. The session position
    /// only changes once the simulator reports the arrival.
    pub fn teleport_avatar_at(&mut self, position: Vec3, now: Instant) -> ClientResult<()> {
        let region_handle = self.logged_in_session("teleport")?.region_handle;

        self.teleport_in_progress = true;
        self.send_message(
            TeleportLocationRequest {
                agent_id: self.circuit.agent_id,
                session_id: self.circuit.session_id,
                region_handle,
                position,
                look_at: Vec3::X,
            }
            .into(),
            now,
        )?;
        Ok(())
    }

    pub fn send_chat(&mut self, text: &str) -> ClientResult<()> {
        self.send_chat_at(text, 0, Instant::now())
    }

    pub fn send_chat_at(&mut self, text: &str, channel: i32, now: Instant) -> ClientResult<()> {
        self.logged_in_session("send_chat")?;
        self.send_message(
            ChatFromViewer {
                agent_id: self.circuit.agent_id,
                session_id: self.circuit.session_id,
                message: text.to_string(),
                chat_type: ChatFromViewer::CHAT_NORMAL,
                channel,
            }
            .into(),
            now,
        )?;
        Ok(())
    }

    /// Asks the simulator to end the session; the circuit closes when the
    /// reply arrives.
    pub fn logout(&mut self) -> ClientResult<()> {
        self.logged_in_session("logout")?;
        self.send_message(
            LogoutRequest {
                agent_id: self.circuit.agent_id,
                session_id: self.circuit.session_id,
            }
            .into(),
            Instant::now(),
        )?;
        Ok(())
    }

    /// Tears down the circuit from any state. Repeated calls are no-ops.
    pub fn disconnect(&mut self) {
        if self.state == ConnectionState::Disconnected && self.endpoint.is_none() {
            return;
        }

        if let Some(endpoint) = self.endpoint.take() {
            if self.state.has_circuit() {
                let sequence = self.reliability.next_sequence();
                let close = Packet::from_message(sequence, CloseCircuit.into()).serialize();
                if let Ok(bytes) = close {
                    if let Err(e) = endpoint.send(&bytes) {
                        log::debug!("CloseCircuit not sent: {}", e);
                    }
                }
            }
        }

        let dropped = self.reliability.pending_count();
        if dropped > 0 {
            log::debug!("Discarding {} unacknowledged packets", dropped);
        }
        self.reliability.clear();
        self.receive_tracker.clear();
        self.pings.reset();
        self.session = None;
        self.region = None;
        self.circuit_sequence = None;
        self.teleport_in_progress = false;
        self.transition(ConnectionState::Disconnected);
    }

    /// Encodes and sends one message, registering it for retransmission
    /// when its type is reliable. Owed acks ride along.
    pub fn send_message(&mut self, message: Message, now: Instant) -> ClientResult<u32> {
        if self.endpoint.is_none() {
            return Err(ClientError::NotConnected);
        }

        let sequence = self.reliability.next_sequence();
        let reliable = message.needs_ack();
        let message_type = message.message_type();
        let acks = if matches!(message, Message::PacketAck(_)) {
            Vec::new()
        } else {
            self.receive_tracker.take_acks()
        };
        let ack_count = acks.len() as u64;

        let bytes = match Packet::from_message(sequence, message).with_acks(acks.clone()).serialize() {
            Ok(bytes) => bytes,
            Err(e) => {
                log::warn!("Not sending {}: {}", message_type, e);
                self.receive_tracker.requeue_acks(acks);
                return Err(e.into());
            }
        };

        self.send_bytes(&bytes)?;
        self.stats.acks_sent += ack_count;
        log::debug!(
            "Sent {} seq={} ({} bytes, reliable={})",
            message_type,
            sequence,
            bytes.len(),
            reliable
        );
        self.reliability.on_send(sequence, bytes, reliable, now);
        Ok(sequence)
    }

    fn send_bytes(&mut self, bytes: &[u8]) -> ClientResult<()> {
        let Some(endpoint) = self.endpoint.as_ref() else {
            return Err(ClientError::NotConnected);
        };

        match endpoint.send(bytes) {
            Ok(sent) => {
                self.stats.packets_sent += 1;
                self.stats.bytes_sent += sent as u64;
                Ok(())
            }
            Err(e) => {
                log::error!("Send failed: {}", e);
                self.emit_error(format!("transport failure: {e}"));
                self.disconnect();
                Err(e.into())
            }
        }
    }

    /// Drains the socket and returns the packets that should be dispatched.
    pub fn poll_inbound(&mut self, now: Instant) -> Vec<Packet> {
        let Some(endpoint) = self.endpoint.as_mut() else {
            return Vec::new();
        };

        let datagrams = match endpoint.receive() {
            Ok(datagrams) => datagrams,
            Err(e) => {
                log::error!("Receive failed: {}", e);
                self.emit_error(format!("transport failure: {e}"));
                self.disconnect();
                return Vec::new();
            }
        };

        datagrams
            .iter()
            .filter_map(|datagram| self.handle_datagram(datagram, now))
            .collect()
    }

    /// Decodes one datagram and performs the circuit-level duties for it.
    /// Returns the packet when it is new and should reach the router;
    /// malformed and duplicate datagrams return `None`.
    pub fn handle_datagram(&mut self, data: &[u8], now: Instant) -> Option<Packet> {
        if self.state == ConnectionState::Disconnected {
            log::debug!("Ignoring datagram while disconnected");
            return None;
        }

        self.stats.packets_received += 1;
        self.stats.bytes_received += data.len() as u64;

        let packet = match Packet::parse(data) {
            Ok(packet) => packet,
            Err(e) => {
                self.stats.malformed_packets += 1;
                log::warn!("Dropping malformed packet ({} bytes): {}", data.len(), e);
                return None;
            }
        };

        for &ack in &packet.acks {
            self.ack_received(ack, now);
        }

        if !self
            .receive_tracker
            .record_received(packet.sequence(), packet.header.is_reliable())
        {
            self.stats.duplicate_packets += 1;
            log::debug!(
                "Duplicate {} seq={}, re-acknowledging",
                packet.message_type(),
                packet.sequence()
            );
            return None;
        }

        log::debug!("Received {} seq={}", packet.message_type(), packet.sequence());
        self.process_circuit_message(&packet, now);
        Some(packet)
    }

    fn process_circuit_message(&mut self, packet: &Packet, now: Instant) {
        match &packet.payload {
            Message::PacketAck(ack) => {
                for &sequence in &ack.packets {
                    self.ack_received(sequence, now);
                }
            }
            Message::StartPingCheck(ping) => {
                let reply = CompletePingCheck {
                    ping_id: ping.ping_id,
                };
                if let Err(e) = self.send_message(reply.into(), now) {
                    log::warn!("Could not answer ping {}: {}", ping.ping_id, e);
                }
            }
            Message::CompletePingCheck(pong) => {
                self.complete_ping_check(pong.ping_id, now);
            }
            Message::AgentMovementComplete(movement) => {
                self.on_movement_complete(movement, now);
            }
            Message::RegionHandshake(handshake) => {
                self.on_region_handshake(handshake, now);
            }
            Message::TeleportStart(_) => {
                self.teleport_in_progress = true;
                self.events.emit(ClientEvent::TeleportStarted);
            }
            Message::TeleportLocal(teleport) => {
                if let Some(session) = self.session.as_mut() {
                    session.position = teleport.position;
                    session.look_at = teleport.look_at;
                }
                self.teleport_in_progress = false;
                self.events.emit(ClientEvent::TeleportFinished {
                    position: teleport.position,
                });
            }
            Message::TeleportFailed(failed) => {
                log::warn!("Teleport failed: {}", failed.reason);
                self.teleport_in_progress = false;
                self.events.emit(ClientEvent::TeleportFailed {
                    reason: failed.reason.clone(),
                });
            }
            Message::LogoutReply(_) => {
                log::info!("Logout confirmed by simulator");
                self.disconnect();
            }
            Message::CloseCircuit(_) => {
                log::info!("Simulator closed the circuit");
                self.disconnect();
            }
            _ => {}
        }
    }

    fn ack_received(&mut self, sequence: u32, now: Instant) {
        self.stats.acks_received += 1;
        self.reliability.on_ack_received_at(sequence, now);

        if self.state == ConnectionState::Connecting && self.circuit_sequence == Some(sequence) {
            self.circuit_sequence = None;
            self.transition(ConnectionState::Connected);
        }
    }

    fn on_movement_complete(&mut self, movement: &AgentMovementComplete, now: Instant) {
        match self.state {
            ConnectionState::Authenticating => {
                if let Err(reason) = self.validate_movement(movement) {
                    self.fail_handshake(reason);
                    return;
                }

                self.session = Some(Session {
                    agent_id: movement.agent_id,
                    session_id: movement.session_id,
                    circuit_code: self.circuit.circuit_code,
                    region_handle: movement.region_handle,
                    created_at: SystemTime::now(),
                    position: movement.position,
                    look_at: movement.look_at,
                    region: self.region.clone(),
                });
                self.transition(ConnectionState::LoggedIn);
                if let Err(e) = self.ping_check(now) {
                    log::debug!("Initial ping not sent: {}", e);
                }
            }
            ConnectionState::LoggedIn => {
                // Arrival after a teleport into another region.
                if let Some(session) = self.session.as_mut() {
                    session.position = movement.position;
                    session.look_at = movement.look_at;
                    session.region_handle = movement.region_handle;
                }
                if self.teleport_in_progress {
                    self.teleport_in_progress = false;
                    self.events.emit(ClientEvent::TeleportFinished {
                        position: movement.position,
                    });
                }
            }
            state => log::debug!("Ignoring AgentMovementComplete while {}", state.as_str()),
        }
    }

    fn validate_movement(&self, movement: &AgentMovementComplete) -> Result<(), String> {
        if !self.circuit.is_complete() {
            return Err("circuit code, agent id and session id must all be set".to_string());
        }
        if movement.agent_id != self.circuit.agent_id {
            return Err(format!("simulator confirmed agent {}", movement.agent_id));
        }
        if movement.session_id != self.circuit.session_id {
            return Err(format!("simulator confirmed session {}", movement.session_id));
        }
        Ok(())
    }

    fn on_region_handshake(&mut self, handshake: &RegionHandshake, now: Instant) {
        let region = RegionRecord::from(handshake);
        if let Some(session) = self.session.as_mut() {
            session.region = Some(region.clone());
        }
        self.region = Some(region);

        log::info!("Region handshake from {}", handshake.sim_name);
        let reply = RegionHandshakeReply {
            agent_id: self.circuit.agent_id,
            session_id: self.circuit.session_id,
            flags: 0,
        };
        if let Err(e) = self.send_message(reply.into(), now) {
            log::warn!("Could not reply to region handshake: {}", e);
        }
    }

    /// Retransmits overdue reliable packets, flushes owed acks and keeps the
    /// latency estimate fresh. A reliable packet that exhausts its retry
    /// budget closes the circuit.
    pub fn tick(&mut self, now: Instant) -> ClientResult<()> {
        if self.state == ConnectionState::Disconnected {
            return Ok(());
        }

        let batch = self.reliability.tick(now);
        for bytes in &batch.resend {
            self.send_bytes(bytes)?;
            self.stats.packets_resent += 1;
        }

        if let Some(&sequence) = batch.expired.first() {
            self.stats.reliable_timeouts += batch.expired.len() as u64;
            let retries = self.config.reliability.max_retries;
            log::warn!(
                "Reliable packet {} unacknowledged after {} retries, closing circuit",
                sequence,
                retries
            );
            self.events.emit(ClientEvent::LinkTimeout { sequence });
            self.disconnect();
            return Err(ClientError::LinkTimeout { sequence, retries });
        }

        self.flush_acks(now)?;

        if self.state.has_circuit() {
            self.ping_check(now)?;
        }

        self.stats.rtt_ms = self.reliability.srtt().unwrap_or(0.0);
        self.stats.rtt_variance = self.reliability.rtt_var();
        Ok(())
    }

    fn flush_acks(&mut self, now: Instant) -> ClientResult<()> {
        while self.receive_tracker.owed_count() > 0 {
            let packets = self.receive_tracker.take_acks();
            let count = packets.len();
            self.send_message(PacketAck { packets }.into(), now)?;
            self.stats.acks_sent += count as u64;
        }
        Ok(())
    }

    /// Sends a `StartPingCheck` and returns its id.
    pub fn start_ping_check(&mut self, now: Instant) -> ClientResult<u8> {
        let ping_id = self.pings.on_ping_sent(now);
        let oldest_unacked = self.reliability.oldest_unacked().unwrap_or(0);
        self.send_message(
            StartPingCheck {
                ping_id,
                oldest_unacked,
            }
            .into(),
            now,
        )?;
        Ok(ping_id)
    }

    /// Records the reply to one of our pings. Unknown ids are ignored.
    pub fn complete_ping_check(&mut self, ping_id: u8, now: Instant) -> Option<Duration> {
        let rtt = self.pings.on_pong_received(ping_id, now)?;
        log::debug!("Ping {} answered in {:?}", ping_id, rtt);
        if rtt > self.config.latency_threshold {
            log::warn!(
                "High latency: {} ms (threshold {} ms)",
                rtt.as_millis(),
                self.config.latency_threshold.as_millis()
            );
        }
        Some(rtt)
    }

    /// Expires lost pings, starts a new one when the interval has elapsed
    /// and returns the current latency estimate.
    pub fn ping_check(&mut self, now: Instant) -> ClientResult<Option<f32>> {
        self.pings.expire_pending(now);
        if self.pings.due(now, self.config.ping_interval) {
            self.start_ping_check(now)?;
        }
        Ok(self.latency_ms())
    }

    fn require(&self, allowed: &[ConnectionState], operation: &'static str) -> ClientResult<()> {
        if allowed.contains(&self.state) {
            return Ok(());
        }
        let err = ClientError::InvalidState {
            operation,
            state: self.state,
        };
        log::warn!("Rejected: {}", err);
        self.emit_error(err.to_string());
        Err(err)
    }

    fn logged_in_session(&self, operation: &'static str) -> ClientResult<&Session> {
        self.require(&[ConnectionState::LoggedIn], operation)?;
        self.session.as_ref().ok_or(ClientError::NotConnected)
    }

    fn fail_handshake(&mut self, reason: String) -> ClientError {
        log::warn!("Handshake failed: {}", reason);
        self.emit_error(format!("handshake failed: {reason}"));
        self.disconnect();
        ClientError::HandshakeFailure(reason)
    }

    fn emit_error(&self, message: String) {
        self.events.emit(ClientEvent::Error { message });
    }

    fn transition(&mut self, to: ConnectionState) {
        let from = self.state;
        if from == to {
            return;
        }
        log::info!("Connection state: {} -> {}", from.as_str(), to.as_str());
        self.state = to;
        self.events.emit(ClientEvent::StateChanged { from, to });
    }
}
