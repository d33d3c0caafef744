use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::Serialize;

use super::connection::{ConnectionManager, ConnectionState};
use super::router::MessageRouter;

const PING_WINDOW: usize = 32;
const PING_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NetworkStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_resent: u64,
    pub acks_sent: u64,
    pub acks_received: u64,
    pub malformed_packets: u64,
    pub duplicate_packets: u64,
    pub reliable_timeouts: u64,
    /// Smoothed round trip of acknowledged reliable packets.
    pub rtt_ms: f32,
    pub rtt_variance: f32,
}

#[derive(Debug, Clone, Copy)]
struct PendingPing {
    ping_id: u8,
    sent_at: Instant,
}

/// Rolling latency from StartPingCheck/CompletePingCheck exchanges.
#[derive(Debug)]
pub struct PingTracker {
    next_id: u8,
    pending: VecDeque<PendingPing>,
    samples: VecDeque<Duration>,
    last_sent: Option<Instant>,
}

impl Default for PingTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl PingTracker {
    pub fn new() -> Self {
        Self {
            next_id: 0,
            pending: VecDeque::new(),
            samples: VecDeque::with_capacity(PING_WINDOW),
            last_sent: None,
        }
    }

    /// Returns the id to carry in the outgoing StartPingCheck.
    pub fn on_ping_sent(&mut self, now: Instant) -> u8 {
        let ping_id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        self.pending.retain(|p| p.ping_id != ping_id);
        self.pending.push_back(PendingPing {
            ping_id,
            sent_at: now,
        });
        self.last_sent = Some(now);
        ping_id
    }

    /// Unknown ids are ignored. Returns the measured round trip.
    pub fn on_pong_received(&mut self, ping_id: u8, now: Instant) -> Option<Duration> {
        let index = self.pending.iter().position(|p| p.ping_id == ping_id)?;
        let ping = self.pending.remove(index)?;
        let rtt = now.saturating_duration_since(ping.sent_at);

        if self.samples.len() >= PING_WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back(rtt);
        Some(rtt)
    }

    pub fn expire_pending(&mut self, now: Instant) {
        while let Some(front) = self.pending.front() {
            if now.saturating_duration_since(front.sent_at) > PING_TIMEOUT {
                self.pending.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn due(&self, now: Instant, interval: Duration) -> bool {
        self.last_sent
            .is_none_or(|last| now.saturating_duration_since(last) >= interval)
    }

    pub fn average(&self) -> Option<Duration> {
        if self.samples.is_empty() {
            return None;
        }
        let sum: Duration = self.samples.iter().sum();
        Some(sum / self.samples.len() as u32)
    }

    pub fn latency_ms(&self) -> Option<f32> {
        self.average().map(|rtt| rtt.as_secs_f32() * 1000.0)
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

/// Point-in-time view of link and dispatch health.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSnapshot {
    pub state: ConnectionState,
    pub is_connected: bool,
    pub latency_ms: Option<f32>,
    pub high_latency: bool,
    pub pending_acks: usize,
    pub router_avg_processing_ms: f32,
    pub router_queue_depth: usize,
    pub router_paused: bool,
    pub handler_failures: u64,
    pub messages_routed: u64,
    pub stats: NetworkStats,
}

impl Default for HealthSnapshot {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            is_connected: false,
            latency_ms: None,
            high_latency: false,
            pending_acks: 0,
            router_avg_processing_ms: 0.0,
            router_queue_depth: 0,
            router_paused: false,
            handler_failures: 0,
            messages_routed: 0,
            stats: NetworkStats::default(),
        }
    }
}

pub fn health_snapshot(connection: &ConnectionManager, router: &MessageRouter) -> HealthSnapshot {
    HealthSnapshot {
        state: connection.state(),
        is_connected: connection.is_connected(),
        latency_ms: connection.latency_ms(),
        high_latency: connection.is_high_latency(),
        pending_acks: connection.pending_acks(),
        router_avg_processing_ms: router.avg_processing_ms(),
        router_queue_depth: router.queue_depth(),
        router_paused: router.is_paused(),
        handler_failures: router.handler_failures(),
        messages_routed: router.messages_routed(),
        stats: connection.stats().clone(),
    }
}
