use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::ConfigError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReliabilityConfig {
    pub initial_timeout: Duration,
    pub max_timeout: Duration,
    pub max_retries: u32,
    pub max_pending: usize,
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            initial_timeout: Duration::from_millis(500),
            max_timeout: Duration::from_secs(8),
            max_retries: 5,
            max_pending: 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Packets held while paused before the oldest is dropped.
    pub queue_capacity: usize,
    pub handler_budget: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            handler_budget: Duration::from_millis(50),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    pub bind_addr: SocketAddr,
    pub reliability: ReliabilityConfig,
    pub router: RouterConfig,
    pub ping_interval: Duration,
    pub latency_threshold: Duration,
    pub tick_interval: Duration,
    pub receive_buffer: usize,
    pub event_capacity: usize,
    pub command_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            reliability: ReliabilityConfig::default(),
            router: RouterConfig::default(),
            ping_interval: Duration::from_secs(5),
            latency_threshold: Duration::from_millis(200),
            tick_interval: Duration::from_millis(100),
            receive_buffer: 8192,
            event_capacity: 1024,
            command_capacity: 256,
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let durations = [
            ("reliability.initial_timeout", self.reliability.initial_timeout),
            ("reliability.max_timeout", self.reliability.max_timeout),
            ("router.handler_budget", self.router.handler_budget),
            ("ping_interval", self.ping_interval),
            ("latency_threshold", self.latency_threshold),
            ("tick_interval", self.tick_interval),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return Err(ConfigError::Zero(name));
            }
        }

        let counts = [
            ("reliability.max_retries", self.reliability.max_retries as usize),
            ("reliability.max_pending", self.reliability.max_pending),
            ("router.queue_capacity", self.router.queue_capacity),
            ("receive_buffer", self.receive_buffer),
            ("event_capacity", self.event_capacity),
            ("command_capacity", self.command_capacity),
        ];
        for (name, value) in counts {
            if value == 0 {
                return Err(ConfigError::Zero(name));
            }
        }

        if self.reliability.initial_timeout > self.reliability.max_timeout {
            return Err(ConfigError::TimeoutOrder);
        }
        Ok(())
    }
}

/// Credentials for one circuit, issued by the login service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CircuitInfo {
    pub circuit_code: u32,
    pub agent_id: Uuid,
    pub session_id: Uuid,
}

impl CircuitInfo {
    pub fn is_complete(&self) -> bool {
        self.circuit_code != 0 && !self.agent_id.is_nil() && !self.session_id.is_nil()
    }
}
