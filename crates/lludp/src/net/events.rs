//! Notifications flowing out of the client core.
//!
//! The entity store and the UI never get references into the core. They
//! receive plain value records through an [`EventSink`] handed to the
//! constructors that need one.

use std::time::Duration;

use crossbeam_channel::{Receiver, SendTimeoutError, Sender, bounded};
use glam::{Quat, Vec3};
use serde::Serialize;
use uuid::Uuid;

use super::connection::ConnectionState;
use super::message::{AgentMovementComplete, ChatFromSimulator, ObjectUpdate, RegionHandshake, TeleportLocal};

const SEND_TIMEOUT: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatRecord {
    pub from_name: String,
    pub source_id: Uuid,
    pub owner_id: Uuid,
    pub chat_type: u8,
    pub position: Vec3,
    pub message: String,
}

impl From<&ChatFromSimulator> for ChatRecord {
    fn from(chat: &ChatFromSimulator) -> Self {
        Self {
            from_name: chat.from_name.clone(),
            source_id: chat.source_id,
            owner_id: chat.owner_id,
            chat_type: chat.chat_type,
            position: chat.position,
            message: chat.message.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObjectRecord {
    pub local_id: u32,
    pub full_id: Uuid,
    pub region_handle: u64,
    pub pcode: u8,
    pub position: Vec3,
    pub velocity: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
}

impl From<&ObjectUpdate> for ObjectRecord {
    fn from(update: &ObjectUpdate) -> Self {
        Self {
            local_id: update.local_id,
            full_id: update.full_id,
            region_handle: update.region_handle,
            pcode: update.pcode,
            position: update.position,
            velocity: update.velocity,
            rotation: update.rotation,
            scale: update.scale,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentRecord {
    pub agent_id: Uuid,
    pub position: Vec3,
    pub look_at: Vec3,
    /// Zero for local teleports, which stay in the current region.
    pub region_handle: u64,
}

impl From<&AgentMovementComplete> for AgentRecord {
    fn from(movement: &AgentMovementComplete) -> Self {
        Self {
            agent_id: movement.agent_id,
            position: movement.position,
            look_at: movement.look_at,
            region_handle: movement.region_handle,
        }
    }
}

impl From<&TeleportLocal> for AgentRecord {
    fn from(teleport: &TeleportLocal) -> Self {
        Self {
            agent_id: teleport.agent_id,
            position: teleport.position,
            look_at: teleport.look_at,
            region_handle: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegionRecord {
    pub name: String,
    pub region_id: Uuid,
    pub owner_id: Uuid,
    pub flags: u32,
    pub sim_access: u8,
    pub water_height: f32,
}

impl From<&RegionHandshake> for RegionRecord {
    fn from(handshake: &RegionHandshake) -> Self {
        Self {
            name: handshake.sim_name.clone(),
            region_id: handshake.region_id,
            owner_id: handshake.sim_owner,
            flags: handshake.region_flags,
            sim_access: handshake.sim_access,
            water_height: handshake.water_height,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ClientEvent {
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
    Chat(ChatRecord),
    ObjectUpdated(ObjectRecord),
    ObjectRemoved {
        local_id: u32,
    },
    AgentMoved(AgentRecord),
    RegionChanged(RegionRecord),
    TeleportStarted,
    TeleportFinished {
        position: Vec3,
    },
    TeleportFailed {
        reason: String,
    },
    LinkTimeout {
        sequence: u32,
    },
    Error {
        message: String,
    },
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: ClientEvent);
}

impl<F> EventSink for F
where
    F: Fn(ClientEvent) + Send + Sync,
{
    fn emit(&self, event: ClientEvent) {
        self(event);
    }
}

/// A full or abandoned channel never stalls the I/O loop; the event is
/// dropped instead.
impl EventSink for Sender<ClientEvent> {
    fn emit(&self, event: ClientEvent) {
        match self.send_timeout(event, SEND_TIMEOUT) {
            Ok(()) => {}
            Err(SendTimeoutError::Timeout(event)) => {
                log::warn!("Event channel full, dropping {:?}", event);
            }
            Err(SendTimeoutError::Disconnected(_)) => {
                log::debug!("Event receiver gone, dropping event");
            }
        }
    }
}

pub fn event_channel(capacity: usize) -> (Sender<ClientEvent>, Receiver<ClientEvent>) {
    bounded(capacity)
}
