//! Message routing: dispatch decoded packets to priority-ordered handlers.
//!
//! Each packet goes to exactly one handler, the first in descending
//! priority order whose [`MessageHandler::can_handle`] accepts its type.
//! Handlers of equal priority keep their registration order.

use std::collections::VecDeque;
use std::time::Instant;

use super::config::RouterConfig;
use super::error::{ClientError, HandlerError};
use super::protocol::{MessageType, Packet};

const EMA_ALPHA: f32 = 0.1;

pub trait MessageHandler: Send {
    fn name(&self) -> &str;

    fn priority(&self) -> i32;

    fn can_handle(&self, message_type: MessageType) -> bool;

    fn handle(&self, packet: &Packet) -> Result<(), HandlerError>;
}

/// Handler built from a closure and a fixed set of message types.
pub struct FnHandler<F> {
    name: String,
    priority: i32,
    types: Vec<MessageType>,
    f: F,
}

impl<F> FnHandler<F>
where
    F: Fn(&Packet) -> Result<(), HandlerError> + Send,
{
    pub fn new(name: impl Into<String>, priority: i32, types: &[MessageType], f: F) -> Self {
        Self {
            name: name.into(),
            priority,
            types: types.to_vec(),
            f,
        }
    }
}

impl<F> MessageHandler for FnHandler<F>
where
    F: Fn(&Packet) -> Result<(), HandlerError> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn can_handle(&self, message_type: MessageType) -> bool {
        self.types.contains(&message_type)
    }

    fn handle(&self, packet: &Packet) -> Result<(), HandlerError> {
        (self.f)(packet)
    }
}

#[derive(Debug)]
pub enum RouteOutcome {
    Handled { handler: String },
    Failed(ClientError),
    Unhandled,
    /// Held until processing resumes.
    Queued,
}

struct Registration {
    handler: Box<dyn MessageHandler>,
    priority: i32,
    order: u64,
}

pub struct MessageRouter {
    config: RouterConfig,
    handlers: Vec<Registration>,
    next_order: u64,
    paused: bool,
    queue: VecDeque<Packet>,
    avg_processing_ms: f32,
    messages_routed: u64,
    handler_failures: u64,
    unhandled: u64,
    dropped: u64,
}

impl Default for MessageRouter {
    fn default() -> Self {
        Self::new(RouterConfig::default())
    }
}

impl MessageRouter {
    pub fn new(config: RouterConfig) -> Self {
        Self {
            queue: VecDeque::with_capacity(config.queue_capacity),
            config,
            handlers: Vec::new(),
            next_order: 0,
            paused: false,
            avg_processing_ms: 0.0,
            messages_routed: 0,
            handler_failures: 0,
            unhandled: 0,
            dropped: 0,
        }
    }

    /// A handler registered under an existing name replaces it.
    pub fn register_handler<H: MessageHandler + 'static>(&mut self, handler: H) {
        self.register_boxed(Box::new(handler));
    }

    pub fn register_boxed(&mut self, handler: Box<dyn MessageHandler>) {
        if self.unregister_handler(handler.name()) {
            log::warn!("Replacing handler {}", handler.name());
        }

        log::debug!(
            "Registered handler {} (priority {})",
            handler.name(),
            handler.priority()
        );
        let registration = Registration {
            priority: handler.priority(),
            order: self.next_order,
            handler,
        };
        self.next_order += 1;
        self.handlers.push(registration);
        self.handlers
            .sort_by(|a, b| b.priority.cmp(&a.priority).then(a.order.cmp(&b.order)));
    }

    pub fn unregister_handler(&mut self, name: &str) -> bool {
        let before = self.handlers.len();
        self.handlers.retain(|r| r.handler.name() != name);
        self.handlers.len() != before
    }

    /// Names in dispatch order.
    pub fn handler_names(&self) -> Vec<&str> {
        self.handlers.iter().map(|r| r.handler.name()).collect()
    }

    pub fn route_message(&mut self, packet: Packet) -> RouteOutcome {
        if !self.paused {
            return self.dispatch(packet);
        }

        if self.queue.len() >= self.config.queue_capacity {
            if let Some(oldest) = self.queue.pop_front() {
                self.dropped += 1;
                log::warn!(
                    "Router queue full, dropping {} seq={}",
                    oldest.message_type(),
                    oldest.sequence()
                );
            }
        }
        self.queue.push_back(packet);
        RouteOutcome::Queued
    }

    pub fn pause_processing(&mut self) {
        if !self.paused {
            log::info!("Message processing paused");
            self.paused = true;
        }
    }

    /// Dispatches everything queued while paused, in arrival order.
    pub fn resume_processing(&mut self) -> Vec<RouteOutcome> {
        if self.paused {
            log::info!(
                "Message processing resumed, {} queued packets",
                self.queue.len()
            );
            self.paused = false;
        }

        let mut outcomes = Vec::with_capacity(self.queue.len());
        while let Some(packet) = self.queue.pop_front() {
            outcomes.push(self.dispatch(packet));
        }
        outcomes
    }

    fn dispatch(&mut self, packet: Packet) -> RouteOutcome {
        let message_type = packet.message_type();
        let Some(registration) = self
            .handlers
            .iter()
            .find(|r| r.handler.can_handle(message_type))
        else {
            self.unhandled += 1;
            log::debug!("No handler for {}", message_type);
            return RouteOutcome::Unhandled;
        };

        let start = Instant::now();
        let result = registration.handler.handle(&packet);
        let elapsed = start.elapsed();
        let name = registration.handler.name().to_string();

        let elapsed_ms = elapsed.as_secs_f32() * 1000.0;
        self.record_processing_time(elapsed_ms);

        let result = result.and_then(|()| {
            if elapsed > self.config.handler_budget {
                let budget_ms = self.config.handler_budget.as_secs_f32() * 1000.0;
                Err(HandlerError::budget_exceeded(elapsed_ms, budget_ms))
            } else {
                Ok(())
            }
        });

        match result {
            Ok(()) => RouteOutcome::Handled { handler: name },
            Err(source) => {
                self.handler_failures += 1;
                log::warn!(
                    "Handler {} failed on {} seq={}: {}",
                    name,
                    message_type,
                    packet.sequence(),
                    source
                );
                RouteOutcome::Failed(ClientError::Handler { name, source })
            }
        }
    }

    fn record_processing_time(&mut self, elapsed_ms: f32) {
        self.avg_processing_ms = if self.messages_routed == 0 {
            elapsed_ms
        } else {
            (1.0 - EMA_ALPHA) * self.avg_processing_ms + EMA_ALPHA * elapsed_ms
        };
        self.messages_routed += 1;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.len()
    }

    pub fn avg_processing_ms(&self) -> f32 {
        self.avg_processing_ms
    }

    pub fn messages_routed(&self) -> u64 {
        self.messages_routed
    }

    pub fn handler_failures(&self) -> u64 {
        self.handler_failures
    }

    pub fn unhandled_count(&self) -> u64 {
        self.unhandled
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped
    }
}
