use std::sync::Arc;

use super::error::HandlerError;
use super::events::{AgentRecord, ChatRecord, ClientEvent, EventSink, ObjectRecord, RegionRecord};
use super::message::Message;
use super::protocol::{MessageType, Packet};
use super::router::{MessageHandler, MessageRouter};

fn unexpected(handler: &str, packet: &Packet) -> HandlerError {
    HandlerError::new(format!(
        "{handler} cannot handle {}",
        packet.message_type()
    ))
}

/// Forwards the agent's own position changes to the entity store.
pub struct AgentMovementHandler {
    ecs: Arc<dyn EventSink>,
}

impl AgentMovementHandler {
    pub const NAME: &'static str = "agent-movement";

    pub fn new(ecs: Arc<dyn EventSink>) -> Self {
        Self { ecs }
    }
}

impl MessageHandler for AgentMovementHandler {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn priority(&self) -> i32 {
        MessageType::AgentMovementComplete.priority() as i32
    }

    fn can_handle(&self, message_type: MessageType) -> bool {
        matches!(
            message_type,
            MessageType::AgentMovementComplete | MessageType::TeleportLocal
        )
    }

    fn handle(&self, packet: &Packet) -> Result<(), HandlerError> {
        let record = match &packet.payload {
            Message::AgentMovementComplete(movement) => AgentRecord::from(movement),
            Message::TeleportLocal(teleport) => AgentRecord::from(teleport),
            _ => return Err(unexpected(Self::NAME, packet)),
        };
        self.ecs.emit(ClientEvent::AgentMoved(record));
        Ok(())
    }
}

pub struct ObjectUpdateHandler {
    ecs: Arc<dyn EventSink>,
}

impl ObjectUpdateHandler {
    pub const NAME: &'static str = "object-update";

    pub fn new(ecs: Arc<dyn EventSink>) -> Self {
        Self { ecs }
    }
}

impl MessageHandler for ObjectUpdateHandler {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn priority(&self) -> i32 {
        MessageType::ObjectUpdate.priority() as i32
    }

    fn can_handle(&self, message_type: MessageType) -> bool {
        matches!(
            message_type,
            MessageType::ObjectUpdate | MessageType::KillObject
        )
    }

    fn handle(&self, packet: &Packet) -> Result<(), HandlerError> {
        match &packet.payload {
            Message::ObjectUpdate(update) => {
                self.ecs
                    .emit(ClientEvent::ObjectUpdated(ObjectRecord::from(update)));
            }
            Message::KillObject(kill) => {
                for &local_id in &kill.local_ids {
                    self.ecs.emit(ClientEvent::ObjectRemoved { local_id });
                }
            }
            _ => return Err(unexpected(Self::NAME, packet)),
        }
        Ok(())
    }
}

pub struct ChatHandler {
    ui: Arc<dyn EventSink>,
}

impl ChatHandler {
    pub const NAME: &'static str = "chat";

    pub fn new(ui: Arc<dyn EventSink>) -> Self {
        Self { ui }
    }
}

impl MessageHandler for ChatHandler {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn priority(&self) -> i32 {
        MessageType::ChatFromSimulator.priority() as i32
    }

    fn can_handle(&self, message_type: MessageType) -> bool {
        message_type == MessageType::ChatFromSimulator
    }

    fn handle(&self, packet: &Packet) -> Result<(), HandlerError> {
        let Message::ChatFromSimulator(chat) = &packet.payload else {
            return Err(unexpected(Self::NAME, packet));
        };
        log::info!("[chat] {}: {}", chat.from_name, chat.message);
        self.ui.emit(ClientEvent::Chat(ChatRecord::from(chat)));
        Ok(())
    }
}

pub struct RegionHandshakeHandler {
    ui: Arc<dyn EventSink>,
}

impl RegionHandshakeHandler {
    pub const NAME: &'static str = "region-handshake";

    pub fn new(ui: Arc<dyn EventSink>) -> Self {
        Self { ui }
    }
}

impl MessageHandler for RegionHandshakeHandler {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn priority(&self) -> i32 {
        MessageType::RegionHandshake.priority() as i32
    }

    fn can_handle(&self, message_type: MessageType) -> bool {
        message_type == MessageType::RegionHandshake
    }

    fn handle(&self, packet: &Packet) -> Result<(), HandlerError> {
        let Message::RegionHandshake(handshake) = &packet.payload else {
            return Err(unexpected(Self::NAME, packet));
        };
        self.ui
            .emit(ClientEvent::RegionChanged(RegionRecord::from(handshake)));
        Ok(())
    }
}

/// Installs the stock handlers: world state goes to `ecs`, chat and region
/// notices go to `ui`.
pub fn register_default_handlers(
    router: &mut MessageRouter,
    ecs: Arc<dyn EventSink>,
    ui: Arc<dyn EventSink>,
) {
    router.register_handler(AgentMovementHandler::new(Arc::clone(&ecs)));
    router.register_handler(ObjectUpdateHandler::new(ecs));
    router.register_handler(ChatHandler::new(Arc::clone(&ui)));
    router.register_handler(RegionHandshakeHandler::new(ui));
}
