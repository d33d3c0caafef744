//! The network I/O loop and the thread-safe handle used to drive it.
//!
//! [`NetworkClient`] owns the [`ConnectionManager`] and [`MessageRouter`]
//! and runs on a single thread, so circuit state is never shared. Other
//! threads talk to it through a cloneable [`ClientHandle`], which queues
//! [`ClientCommand`]s over a bounded channel and reads the latest published
//! [`HealthSnapshot`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, bounded};
use glam::Vec3;

use super::config::{CircuitInfo, ClientConfig};
use super::connection::{ConnectionManager, ConnectionState};
use super::error::{ClientError, ClientResult, ConfigError};
use super::events::EventSink;
use super::router::{MessageRouter, RouteOutcome};
use super::stats::{HealthSnapshot, health_snapshot};

const LOOP_SLEEP: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, PartialEq)]
pub enum ClientCommand {
    Connect {
        host: String,
        port: u16,
    },
    Login {
        first: String,
        last: String,
        password: String,
    },
    Teleport {
        position: Vec3,
    },
    SendChat {
        text: String,
    },
    Logout,
    Disconnect,
    /// Hold inbound packets in the router queue.
    Pause,
    /// Dispatch everything held since `Pause`.
    Resume,
}

#[derive(Clone)]
pub struct ClientHandle {
    commands: Sender<ClientCommand>,
    health: Arc<Mutex<HealthSnapshot>>,
    running: Arc<AtomicBool>,
}

impl ClientHandle {
    pub fn send(&self, command: ClientCommand) -> ClientResult<()> {
        self.commands
            .send(command)
            .map_err(|_| ClientError::ChannelClosed)
    }

    pub fn connect(&self, host: impl Into<String>, port: u16) -> ClientResult<()> {
        self.send(ClientCommand::Connect {
            host: host.into(),
            port,
        })
    }

    pub fn login(
        &self,
        first: impl Into<String>,
        last: impl Into<String>,
        password: impl Into<String>,
    ) -> ClientResult<()> {
        self.send(ClientCommand::Login {
            first: first.into(),
            last: last.into(),
            password: password.into(),
        })
    }

    pub fn teleport(&self, position: Vec3) -> ClientResult<()> {
        self.send(ClientCommand::Teleport { position })
    }

    pub fn send_chat(&self, text: impl Into<String>) -> ClientResult<()> {
        self.send(ClientCommand::SendChat { text: text.into() })
    }

    pub fn logout(&self) -> ClientResult<()> {
        self.send(ClientCommand::Logout)
    }

    pub fn pause_processing(&self) -> ClientResult<()> {
        self.send(ClientCommand::Pause)
    }

    pub fn resume_processing(&self) -> ClientResult<()> {
        self.send(ClientCommand::Resume)
    }

    /// Closes the circuit. Safe from any thread and any number of times.
    /// The loop stays alive, idle on the command queue, so a later
    /// `connect` can reuse it; [`shutdown`](Self::shutdown) ends it.
    pub fn disconnect(&self) {
        if self.send(ClientCommand::Disconnect).is_err() {
            log::debug!("Disconnect requested after the I/O loop stopped");
        }
    }

    /// Stops the I/O loop after it closes the circuit.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn health(&self) -> HealthSnapshot {
        match self.health.lock() {
            Ok(health) => health.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

pub struct NetworkClient {
    connection: ConnectionManager,
    router: MessageRouter,
    config: ClientConfig,
    commands: Receiver<ClientCommand>,
    handle: ClientHandle,
    last_tick: Option<Instant>,
}

impl NetworkClient {
    pub fn new(
        config: ClientConfig,
        circuit: CircuitInfo,
        events: Arc<dyn EventSink>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let (tx, rx) = bounded(config.command_capacity);
        let handle = ClientHandle {
            commands: tx,
            health: Arc::new(Mutex::new(HealthSnapshot::default())),
            running: Arc::new(AtomicBool::new(true)),
        };

        Ok(Self {
            connection: ConnectionManager::new(config.clone(), circuit, events),
            router: MessageRouter::new(config.router.clone()),
            config,
            commands: rx,
            handle,
            last_tick: None,
        })
    }

    pub fn handle(&self) -> ClientHandle {
        self.handle.clone()
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn router(&self) -> &MessageRouter {
        &self.router
    }

    /// Handlers must be registered here before the loop is spawned.
    pub fn router_mut(&mut self) -> &mut MessageRouter {
        &mut self.router
    }

    pub fn health(&self) -> HealthSnapshot {
        health_snapshot(&self.connection, &self.router)
    }

    pub fn spawn(mut self) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("lludp-io".to_string())
            .spawn(move || self.run())
    }

    pub fn run(&mut self) {
        log::info!("Network loop started");
        while self.handle.is_running() {
            if self.connection.state() == ConnectionState::Disconnected {
                self.wait_for_command();
                continue;
            }
            self.tick_once(Instant::now());
            thread::sleep(LOOP_SLEEP);
        }

        self.connection.disconnect();
        self.publish_health();
        log::info!("Network loop stopped");
    }

    /// One pass of the loop: queued commands, inbound packets, then the
    /// periodic reliability and ping work when its interval has elapsed.
    pub fn tick_once(&mut self, now: Instant) {
        self.drain_commands(now);

        for packet in self.connection.poll_inbound(now) {
            if let RouteOutcome::Failed(e) = self.router.route_message(packet) {
                log::debug!("Dispatch failed: {}", e);
            }
        }

        let due = self
            .last_tick
            .is_none_or(|last| now.saturating_duration_since(last) >= self.config.tick_interval);
        if due {
            self.last_tick = Some(now);
            if let Err(e) = self.connection.tick(now) {
                log::warn!("Circuit tick: {}", e);
            }
        }

        self.publish_health();
    }

    /// Without a circuit there is no socket to poll, so block until a
    /// command arrives or a tick interval passes.
    fn wait_for_command(&mut self) {
        if let Ok(command) = self.commands.recv_timeout(self.config.tick_interval) {
            let now = Instant::now();
            self.run_command(command, now);
            self.drain_commands(now);
            self.publish_health();
        }
    }

    fn drain_commands(&mut self, now: Instant) {
        while let Ok(command) = self.commands.try_recv() {
            self.run_command(command, now);
        }
    }

    fn run_command(&mut self, command: ClientCommand, now: Instant) {
        if let Err(e) = self.execute(command, now) {
            log::debug!("Command failed: {}", e);
        }
    }

    fn execute(&mut self, command: ClientCommand, now: Instant) -> ClientResult<()> {
        log::debug!("Executing {:?}", command);
        match command {
            ClientCommand::Connect { host, port } => self.connection.connect_at(&host, port, now),
            ClientCommand::Login {
                first,
                last,
                password,
            } => self.connection.login_at(&first, &last, &password, now),
            ClientCommand::Teleport { position } => {
                self.connection.teleport_avatar_at(position, now)
            }
            ClientCommand::SendChat { text } => self.connection.send_chat_at(&text, 0, now),
            ClientCommand::Logout => self.connection.logout(),
            ClientCommand::Disconnect => {
                self.connection.disconnect();
                Ok(())
            }
            ClientCommand::Pause => {
                self.router.pause_processing();
                Ok(())
            }
            ClientCommand::Resume => {
                for outcome in self.router.resume_processing() {
                    if let RouteOutcome::Failed(e) = outcome {
                        log::debug!("Dispatch failed: {}", e);
                    }
                }
                Ok(())
            }
        }
    }

    fn publish_health(&self) {
        let snapshot = self.health();
        match self.handle.health.lock() {
            Ok(mut health) => *health = snapshot,
            Err(poisoned) => *poisoned.into_inner() = snapshot,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::events::{ClientEvent, event_channel};
    use std::net::SocketAddr;

    fn client() -> (NetworkClient, Receiver<ClientEvent>) {
        let (tx, rx) = event_channel(64);
        let config = ClientConfig {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            ..Default::default()
        };
        let circuit = CircuitInfo {
            circuit_code: 1,
            agent_id: uuid::Uuid::from_u128(1),
            session_id: uuid::Uuid::from_u128(2),
        };
        (NetworkClient::new(config, circuit, Arc::new(tx)).unwrap(), rx)
    }

    #[test]
    fn test_invalid_config_rejected() {
        let (tx, _rx) = event_channel(1);
        let config = ClientConfig {
            command_capacity: 0,
            ..Default::default()
        };
        assert!(matches!(
            NetworkClient::new(config, CircuitInfo::default(), Arc::new(tx)),
            Err(ConfigError::Zero("command_capacity"))
        ));
    }

    #[test]
    fn test_commands_run_on_tick() {
        let (mut client, rx) = client();
        let sim = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let handle = client.handle();

        handle
            .connect("127.0.0.1", sim.local_addr().unwrap().port())
            .unwrap();
        assert_eq!(client.connection().state(), ConnectionState::Disconnected);

        client.tick_once(Instant::now());
        assert_eq!(client.connection().state(), ConnectionState::Connecting);
        assert_eq!(handle.health().state, ConnectionState::Connecting);
        assert_eq!(handle.health().pending_acks, 1);
        assert!(matches!(
            rx.try_recv(),
            Ok(ClientEvent::StateChanged {
                to: ConnectionState::Connecting,
                ..
            })
        ));
    }

    #[test]
    fn test_rejected_command_does_not_stop_loop() {
        let (mut client, rx) = client();
        let handle = client.handle();

        handle.teleport(Vec3::ONE).unwrap();
        client.tick_once(Instant::now());

        assert_eq!(client.connection().state(), ConnectionState::Disconnected);
        assert!(matches!(rx.try_recv(), Ok(ClientEvent::Error { .. })));
    }

    #[test]
    fn test_pause_and_resume_commands_reach_router() {
        use crate::net::message::ChatFromSimulator;
        use crate::net::protocol::{MessageType, Packet};
        use crate::net::router::FnHandler;

        let (mut client, _rx) = client();
        client.router_mut().register_handler(FnHandler::new(
            "chat",
            0,
            &[MessageType::ChatFromSimulator],
            |_packet: &Packet| Ok(()),
        ));
        let handle = client.handle();

        handle.pause_processing().unwrap();
        client.tick_once(Instant::now());
        assert!(client.router().is_paused());
        assert!(handle.health().router_paused);

        let packet = Packet::from_message(1, ChatFromSimulator::default().into());
        assert!(matches!(
            client.router_mut().route_message(packet),
            RouteOutcome::Queued
        ));
        assert_eq!(client.router().messages_routed(), 0);

        handle.resume_processing().unwrap();
        client.tick_once(Instant::now());
        assert!(!client.router().is_paused());
        assert_eq!(client.router().queue_depth(), 0);
        assert_eq!(client.router().messages_routed(), 1);
        assert!(!handle.health().router_paused);
    }

    #[test]
    fn test_idle_loop_wakes_for_commands() {
        let (client, _rx) = client();
        let sim = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let handle = client.handle();
        let join = client.spawn().unwrap();

        handle
            .connect("127.0.0.1", sim.local_addr().unwrap().port())
            .unwrap();
        let start = Instant::now();
        while handle.health().state != ConnectionState::Connecting
            && start.elapsed() < Duration::from_millis(1000)
        {
            thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(handle.health().state, ConnectionState::Connecting);

        handle.disconnect();
        let start = Instant::now();
        while handle.health().state != ConnectionState::Disconnected
            && start.elapsed() < Duration::from_millis(1000)
        {
            thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(handle.health().state, ConnectionState::Disconnected);
        assert!(handle.is_running());

        handle.shutdown();
        join.join().unwrap();
    }

    #[test]
    fn test_shutdown_stops_spawned_loop() {
        let (client, _rx) = client();
        let handle = client.handle();
        let join = client.spawn().unwrap();

        handle.disconnect();
        handle.disconnect();
        handle.shutdown();
        join.join().unwrap();

        assert!(!handle.is_running());
        assert_eq!(handle.health().state, ConnectionState::Disconnected);
    }
}
