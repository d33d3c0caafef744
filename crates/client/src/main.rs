use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use clap::Parser;
use crossbeam_channel::Receiver;
use env_logger::Env;
use glam::Vec3;
use serde::Serialize;
use uuid::Uuid;

use lludp::net::{DEFAULT_PORT, event_channel};
use lludp::{
    CircuitInfo, ClientConfig, ClientEvent, ClientHandle, ConnectionState, EventSink,
    HealthSnapshot, NetworkClient, register_default_handlers,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const LOGOUT_TIMEOUT: Duration = Duration::from_secs(3);
const EVENT_POLL: Duration = Duration::from_millis(50);

#[derive(Parser)]
#[command(name = "lludp-client")]
#[command(about = "Headless LLUDP viewer: joins a region circuit and reports what it sees")]
struct Args {
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    #[arg(long, help = "Circuit code issued by the login service")]
    circuit_code: u32,

    #[arg(long)]
    agent_id: Uuid,

    #[arg(long)]
    session_id: Uuid,

    #[arg(long)]
    first: String,

    #[arg(long)]
    last: String,

    #[arg(long, default_value = "")]
    password: String,

    #[arg(long, help = "Say this on the local chat channel after login")]
    chat: Option<String>,

    #[arg(long, value_parser = parse_position, help = "Teleport within the region (e.g., 128,128,25)")]
    teleport: Option<Vec3>,

    #[arg(short, long, default_value_t = 10, help = "Seconds to stay in the region")]
    duration: u64,

    #[arg(long, help = "Print events and the final report as JSON")]
    json: bool,
}

#[derive(Serialize)]
struct Report {
    circuit_code: u32,
    agent_id: Uuid,
    health: HealthSnapshot,
}

fn parse_position(s: &str) -> Result<Vec3, String> {
    let parts: Vec<f32> = s
        .split(',')
        .map(|part| part.trim().parse::<f32>())
        .collect::<Result<_, _>>()
        .map_err(|e| format!("invalid coordinate: {e}"))?;
    match parts.as_slice() {
        [x, y, z] => Ok(Vec3::new(*x, *y, *z)),
        _ => Err(format!("expected X,Y,Z but got {} values", parts.len())),
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = ClientConfig::default();
    let circuit = CircuitInfo {
        circuit_code: args.circuit_code,
        agent_id: args.agent_id,
        session_id: args.session_id,
    };

    let (tx, rx) = event_channel(config.event_capacity);
    let events: Arc<dyn EventSink> = Arc::new(tx);
    let mut client = NetworkClient::new(config, circuit, Arc::clone(&events))
        .context("invalid client configuration")?;
    register_default_handlers(client.router_mut(), Arc::clone(&events), events);

    let handle = client.handle();
    let io_thread = client.spawn().context("failed to start network thread")?;

    let outcome = run_session(&args, &handle, &rx);

    handle.shutdown();
    io_thread
        .join()
        .map_err(|_| anyhow!("network thread panicked"))?;
    for event in rx.try_iter() {
        print_event(&event, args.json)?;
    }

    let report = Report {
        circuit_code: args.circuit_code,
        agent_id: args.agent_id,
        health: handle.health(),
    };
    print_report(&report, args.json)?;

    outcome
}

fn run_session(args: &Args, handle: &ClientHandle, rx: &Receiver<ClientEvent>) -> Result<()> {
    log::info!("Connecting to {}:{}", args.host, args.port);
    handle.connect(args.host.as_str(), args.port)?;
    wait_for_state(handle, rx, ConnectionState::Connected, CONNECT_TIMEOUT, args.json)
        .context("circuit was not established")?;

    handle.login(args.first.as_str(), args.last.as_str(), args.password.as_str())?;
    wait_for_state(handle, rx, ConnectionState::LoggedIn, CONNECT_TIMEOUT, args.json)
        .context("login did not complete")?;

    if let Some(text) = &args.chat {
        handle.send_chat(text.as_str())?;
    }
    if let Some(position) = args.teleport {
        handle.teleport(position)?;
    }

    let deadline = Instant::now() + Duration::from_secs(args.duration);
    while Instant::now() < deadline {
        pump_events(rx, args.json)?;
        if handle.health().state == ConnectionState::Disconnected {
            bail!("simulator closed the circuit");
        }
    }

    handle.logout()?;
    if wait_for_state(handle, rx, ConnectionState::Disconnected, LOGOUT_TIMEOUT, args.json).is_err() {
        log::warn!("No logout reply, closing the circuit");
        handle.disconnect();
    }
    Ok(())
}

fn wait_for_state(
    handle: &ClientHandle,
    rx: &Receiver<ClientEvent>,
    target: ConnectionState,
    timeout: Duration,
    json: bool,
) -> Result<()> {
    let start = Instant::now();
    // The loop publishes Disconnected until it picks up the connect command.
    let mut seen_circuit = false;
    while start.elapsed() < timeout {
        pump_events(rx, json)?;
        let state = handle.health().state;
        if state == target {
            return Ok(());
        }
        if state != ConnectionState::Disconnected {
            seen_circuit = true;
        } else if seen_circuit {
            bail!("circuit closed while waiting for {}", target.as_str());
        }
    }
    bail!("timed out waiting for {}", target.as_str())
}

fn pump_events(rx: &Receiver<ClientEvent>, json: bool) -> Result<()> {
    if let Ok(event) = rx.recv_timeout(EVENT_POLL) {
        print_event(&event, json)?;
        for event in rx.try_iter() {
            print_event(&event, json)?;
        }
    }
    Ok(())
}

fn print_event(event: &ClientEvent, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(event)?);
        return Ok(());
    }

    match event {
        ClientEvent::StateChanged { from, to } => {
            println!("state: {} -> {}", from.as_str(), to.as_str())
        }
        ClientEvent::Chat(chat) => println!("[chat] {}: {}", chat.from_name, chat.message),
        ClientEvent::ObjectUpdated(object) => println!(
            "object {} at ({:.1}, {:.1}, {:.1})",
            object.local_id, object.position.x, object.position.y, object.position.z
        ),
        ClientEvent::ObjectRemoved { local_id } => println!("object {} removed", local_id),
        ClientEvent::AgentMoved(agent) => println!(
            "agent at ({:.1}, {:.1}, {:.1})",
            agent.position.x, agent.position.y, agent.position.z
        ),
        ClientEvent::RegionChanged(region) => {
            println!("region: {} ({})", region.name, region.region_id)
        }
        ClientEvent::TeleportStarted => println!("teleport started"),
        ClientEvent::TeleportFinished { position } => println!(
            "teleported to ({:.1}, {:.1}, {:.1})",
            position.x, position.y, position.z
        ),
        ClientEvent::TeleportFailed { reason } => println!("teleport failed: {}", reason),
        ClientEvent::LinkTimeout { sequence } => {
            println!("link timeout: packet {} never acknowledged", sequence)
        }
        ClientEvent::Error { message } => println!("error: {}", message),
    }
    Ok(())
}

fn print_report(report: &Report, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    let health = &report.health;
    println!();
    println!("=== Circuit {} ===", report.circuit_code);
    println!("agent:            {}", report.agent_id);
    println!("state:            {}", health.state.as_str());
    match health.latency_ms {
        Some(ms) => println!(
            "latency:          {:.1} ms{}",
            ms,
            if health.high_latency { " (high)" } else { "" }
        ),
        None => println!("latency:          n/a"),
    }
    println!("pending acks:     {}", health.pending_acks);
    println!(
        "packets:          {} sent / {} received / {} resent",
        health.stats.packets_sent, health.stats.packets_received, health.stats.packets_resent
    );
    println!(
        "dropped:          {} malformed / {} duplicate",
        health.stats.malformed_packets, health.stats.duplicate_packets
    );
    println!(
        "router:           {} routed, {} failed, {:.3} ms avg",
        health.messages_routed, health.handler_failures, health.router_avg_processing_ms
    );
    Ok(())
}
