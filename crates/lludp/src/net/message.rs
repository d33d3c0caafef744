use glam::{Quat, Vec3};
use uuid::Uuid;

use super::codec::{WireReader, WireWriter};
use super::error::ProtocolError;
use super::protocol::MessageType;

/// Field layout of a single catalog entry.
pub trait WireMessage: Sized {
    const TYPE: MessageType;

    fn encode(&self, w: &mut WireWriter) -> Result<(), ProtocolError>;

    fn decode(r: &mut WireReader<'_>) -> Result<Self, ProtocolError>;
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct UseCircuitCode {
    pub circuit_code: u32,
    pub session_id: Uuid,
    pub agent_id: Uuid,
}

impl WireMessage for UseCircuitCode {
    const TYPE: MessageType = MessageType::UseCircuitCode;

    fn encode(&self, w: &mut WireWriter) -> Result<(), ProtocolError> {
        w.write_u32(self.circuit_code);
        w.write_uuid(&self.session_id);
        w.write_uuid(&self.agent_id);
        Ok(())
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            circuit_code: r.read_u32()?,
            session_id: r.read_uuid()?,
            agent_id: r.read_uuid()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct CompleteAgentMovement {
    pub agent_id: Uuid,
    pub session_id: Uuid,
    pub circuit_code: u32,
}

impl WireMessage for CompleteAgentMovement {
    const TYPE: MessageType = MessageType::CompleteAgentMovement;

    fn encode(&self, w: &mut WireWriter) -> Result<(), ProtocolError> {
        w.write_uuid(&self.agent_id);
        w.write_uuid(&self.session_id);
        w.write_u32(self.circuit_code);
        Ok(())
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            agent_id: r.read_uuid()?,
            session_id: r.read_uuid()?,
            circuit_code: r.read_u32()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct AgentMovementComplete {
    pub agent_id: Uuid,
    pub session_id: Uuid,
    pub position: Vec3,
    pub look_at: Vec3,
    pub region_handle: u64,
    pub timestamp: u32,
}

impl WireMessage for AgentMovementComplete {
    const TYPE: MessageType = MessageType::AgentMovementComplete;

    fn encode(&self, w: &mut WireWriter) -> Result<(), ProtocolError> {
        w.write_uuid(&self.agent_id);
        w.write_uuid(&self.session_id);
        w.write_vec3(self.position);
        w.write_vec3(self.look_at);
        w.write_u64(self.region_handle);
        w.write_u32(self.timestamp);
        Ok(())
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            agent_id: r.read_uuid()?,
            session_id: r.read_uuid()?,
            position: r.read_vec3()?,
            look_at: r.read_vec3()?,
            region_handle: r.read_u64()?,
            timestamp: r.read_u32()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct RegionHandshake {
    pub region_flags: u32,
    pub sim_access: u8,
    pub sim_name: String,
    pub sim_owner: Uuid,
    pub region_id: Uuid,
    pub water_height: f32,
}

impl WireMessage for RegionHandshake {
    const TYPE: MessageType = MessageType::RegionHandshake;

    fn encode(&self, w: &mut WireWriter) -> Result<(), ProtocolError> {
        w.write_u32(self.region_flags);
        w.write_u8(self.sim_access);
        w.write_short_string(&self.sim_name)?;
        w.write_uuid(&self.sim_owner);
        w.write_uuid(&self.region_id);
        w.write_f32(self.water_height);
        Ok(())
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            region_flags: r.read_u32()?,
            sim_access: r.read_u8()?,
            sim_name: r.read_short_string()?,
            sim_owner: r.read_uuid()?,
            region_id: r.read_uuid()?,
            water_height: r.read_f32()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct RegionHandshakeReply {
    pub agent_id: Uuid,
    pub session_id: Uuid,
    pub flags: u32,
}

impl WireMessage for RegionHandshakeReply {
    const TYPE: MessageType = MessageType::RegionHandshakeReply;

    fn encode(&self, w: &mut WireWriter) -> Result<(), ProtocolError> {
        w.write_uuid(&self.agent_id);
        w.write_uuid(&self.session_id);
        w.write_u32(self.flags);
        Ok(())
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            agent_id: r.read_uuid()?,
            session_id: r.read_uuid()?,
            flags: r.read_u32()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct AgentUpdate {
    pub agent_id: Uuid,
    pub session_id: Uuid,
    pub body_rotation: Quat,
    pub head_rotation: Quat,
    pub state: u8,
    pub camera_center: Vec3,
    pub camera_at_axis: Vec3,
    pub far: f32,
    pub control_flags: u32,
    pub flags: u8,
}

impl WireMessage for AgentUpdate {
    const TYPE: MessageType = MessageType::AgentUpdate;

    fn encode(&self, w: &mut WireWriter) -> Result<(), ProtocolError> {
        w.write_uuid(&self.agent_id);
        w.write_uuid(&self.session_id);
        w.write_quat(self.body_rotation);
        w.write_quat(self.head_rotation);
        w.write_u8(self.state);
        w.write_vec3(self.camera_center);
        w.write_vec3(self.camera_at_axis);
        w.write_f32(self.far);
        w.write_u32(self.control_flags);
        w.write_u8(self.flags);
        Ok(())
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            agent_id: r.read_uuid()?,
            session_id: r.read_uuid()?,
            body_rotation: r.read_quat()?,
            head_rotation: r.read_quat()?,
            state: r.read_u8()?,
            camera_center: r.read_vec3()?,
            camera_at_axis: r.read_vec3()?,
            far: r.read_f32()?,
            control_flags: r.read_u32()?,
            flags: r.read_u8()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ObjectUpdate {
    pub region_handle: u64,
    pub local_id: u32,
    pub full_id: Uuid,
    pub pcode: u8,
    pub position: Vec3,
    pub velocity: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
}

impl WireMessage for ObjectUpdate {
    const TYPE: MessageType = MessageType::ObjectUpdate;

    fn encode(&self, w: &mut WireWriter) -> Result<(), ProtocolError> {
        w.write_u64(self.region_handle);
        w.write_u32(self.local_id);
        w.write_uuid(&self.full_id);
        w.write_u8(self.pcode);
        w.write_vec3(self.position);
        w.write_vec3(self.velocity);
        w.write_quat(self.rotation);
        w.write_vec3(self.scale);
        Ok(())
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            region_handle: r.read_u64()?,
            local_id: r.read_u32()?,
            full_id: r.read_uuid()?,
            pcode: r.read_u8()?,
            position: r.read_vec3()?,
            velocity: r.read_vec3()?,
            rotation: r.read_quat()?,
            scale: r.read_vec3()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct KillObject {
    pub local_ids: Vec<u32>,
}

impl WireMessage for KillObject {
    const TYPE: MessageType = MessageType::KillObject;

    fn encode(&self, w: &mut WireWriter) -> Result<(), ProtocolError> {
        w.write_u32_list(&self.local_ids)
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            local_ids: r.read_u32_list()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ChatFromViewer {
    pub agent_id: Uuid,
    pub session_id: Uuid,
    pub message: String,
    pub chat_type: u8,
    pub channel: i32,
}

impl ChatFromViewer {
    pub const CHAT_NORMAL: u8 = 1;
}

impl WireMessage for ChatFromViewer {
    const TYPE: MessageType = MessageType::ChatFromViewer;

    fn encode(&self, w: &mut WireWriter) -> Result<(), ProtocolError> {
        w.write_uuid(&self.agent_id);
        w.write_uuid(&self.session_id);
        w.write_long_string(&self.message)?;
        w.write_u8(self.chat_type);
        w.write_i32(self.channel);
        Ok(())
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            agent_id: r.read_uuid()?,
            session_id: r.read_uuid()?,
            message: r.read_long_string()?,
            chat_type: r.read_u8()?,
            channel: r.read_i32()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ChatFromSimulator {
    pub from_name: String,
    pub source_id: Uuid,
    pub owner_id: Uuid,
    pub source_type: u8,
    pub chat_type: u8,
    pub audible: u8,
    pub position: Vec3,
    pub message: String,
}

impl WireMessage for ChatFromSimulator {
    const TYPE: MessageType = MessageType::ChatFromSimulator;

    fn encode(&self, w: &mut WireWriter) -> Result<(), ProtocolError> {
        w.write_short_string(&self.from_name)?;
        w.write_uuid(&self.source_id);
        w.write_uuid(&self.owner_id);
        w.write_u8(self.source_type);
        w.write_u8(self.chat_type);
        w.write_u8(self.audible);
        w.write_vec3(self.position);
        w.write_long_string(&self.message)?;
        Ok(())
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            from_name: r.read_short_string()?,
            source_id: r.read_uuid()?,
            owner_id: r.read_uuid()?,
            source_type: r.read_u8()?,
            chat_type: r.read_u8()?,
            audible: r.read_u8()?,
            position: r.read_vec3()?,
            message: r.read_long_string()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct TeleportLocationRequest {
    pub agent_id: Uuid,
    pub session_id: Uuid,
    pub region_handle: u64,
    pub position: Vec3,
    pub look_at: Vec3,
}

impl WireMessage for TeleportLocationRequest {
    const TYPE: MessageType = MessageType::TeleportLocationRequest;

    fn encode(&self, w: &mut WireWriter) -> Result<(), ProtocolError> {
        w.write_uuid(&self.agent_id);
        w.write_uuid(&self.session_id);
        w.write_u64(self.region_handle);
        w.write_vec3(self.position);
        w.write_vec3(self.look_at);
        Ok(())
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            agent_id: r.read_uuid()?,
            session_id: r.read_uuid()?,
            region_handle: r.read_u64()?,
            position: r.read_vec3()?,
            look_at: r.read_vec3()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct TeleportStart {
    pub teleport_flags: u32,
}

impl WireMessage for TeleportStart {
    const TYPE: MessageType = MessageType::TeleportStart;

    fn encode(&self, w: &mut WireWriter) -> Result<(), ProtocolError> {
        w.write_u32(self.teleport_flags);
        Ok(())
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            teleport_flags: r.read_u32()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct TeleportLocal {
    pub agent_id: Uuid,
    pub location_id: u32,
    pub position: Vec3,
    pub look_at: Vec3,
    pub teleport_flags: u32,
}

impl WireMessage for TeleportLocal {
    const TYPE: MessageType = MessageType::TeleportLocal;

    fn encode(&self, w: &mut WireWriter) -> Result<(), ProtocolError> {
        w.write_uuid(&self.agent_id);
        w.write_u32(self.location_id);
        w.write_vec3(self.position);
        w.write_vec3(self.look_at);
        w.write_u32(self.teleport_flags);
        Ok(())
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            agent_id: r.read_uuid()?,
            location_id: r.read_u32()?,
            position: r.read_vec3()?,
            look_at: r.read_vec3()?,
            teleport_flags: r.read_u32()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct TeleportFailed {
    pub agent_id: Uuid,
    pub reason: String,
}

impl WireMessage for TeleportFailed {
    const TYPE: MessageType = MessageType::TeleportFailed;

    fn encode(&self, w: &mut WireWriter) -> Result<(), ProtocolError> {
        w.write_uuid(&self.agent_id);
        w.write_short_string(&self.reason)
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            agent_id: r.read_uuid()?,
            reason: r.read_short_string()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct StartPingCheck {
    pub ping_id: u8,
    pub oldest_unacked: u32,
}

impl WireMessage for StartPingCheck {
    const TYPE: MessageType = MessageType::StartPingCheck;

    fn encode(&self, w: &mut WireWriter) -> Result<(), ProtocolError> {
        w.write_u8(self.ping_id);
        w.write_u32(self.oldest_unacked);
        Ok(())
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            ping_id: r.read_u8()?,
            oldest_unacked: r.read_u32()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct CompletePingCheck {
    pub ping_id: u8,
}

impl WireMessage for CompletePingCheck {
    const TYPE: MessageType = MessageType::CompletePingCheck;

    fn encode(&self, w: &mut WireWriter) -> Result<(), ProtocolError> {
        w.write_u8(self.ping_id);
        Ok(())
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            ping_id: r.read_u8()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct PacketAck {
    pub packets: Vec<u32>,
}

impl WireMessage for PacketAck {
    const TYPE: MessageType = MessageType::PacketAck;

    fn encode(&self, w: &mut WireWriter) -> Result<(), ProtocolError> {
        w.write_u32_list(&self.packets)
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            packets: r.read_u32_list()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct LogoutRequest {
    pub agent_id: Uuid,
    pub session_id: Uuid,
}

impl WireMessage for LogoutRequest {
    const TYPE: MessageType = MessageType::LogoutRequest;

    fn encode(&self, w: &mut WireWriter) -> Result<(), ProtocolError> {
        w.write_uuid(&self.agent_id);
        w.write_uuid(&self.session_id);
        Ok(())
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            agent_id: r.read_uuid()?,
            session_id: r.read_uuid()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct LogoutReply {
    pub agent_id: Uuid,
    pub session_id: Uuid,
}

impl WireMessage for LogoutReply {
    const TYPE: MessageType = MessageType::LogoutReply;

    fn encode(&self, w: &mut WireWriter) -> Result<(), ProtocolError> {
        w.write_uuid(&self.agent_id);
        w.write_uuid(&self.session_id);
        Ok(())
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            agent_id: r.read_uuid()?,
            session_id: r.read_uuid()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct CloseCircuit;

impl WireMessage for CloseCircuit {
    const TYPE: MessageType = MessageType::CloseCircuit;

    fn encode(&self, _w: &mut WireWriter) -> Result<(), ProtocolError> {
        Ok(())
    }

    fn decode(_r: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self)
    }
}

macro_rules! message_catalog {
    ($($name:ident),* $(,)?) => {
        /// One variant per catalog entry. Built once by the caller and
        /// immutable after encoding.
        #[derive(Debug, Clone, PartialEq)]
        pub enum Message {
            $($name($name),)*
        }

        impl Message {
            pub fn message_type(&self) -> MessageType {
                match self {
                    $(Self::$name(_) => MessageType::$name,)*
                }
            }

            pub fn encode(&self, w: &mut WireWriter) -> Result<(), ProtocolError> {
                match self {
                    $(Self::$name(m) => m.encode(w),)*
                }
            }

            pub fn decode(
                message_type: MessageType,
                r: &mut WireReader<'_>,
            ) -> Result<Self, ProtocolError> {
                match message_type {
                    $(MessageType::$name => $name::decode(r).map(Self::$name),)*
                }
            }

            /// All fixed fields zeroed, strings and lists empty.
            pub fn default_for(message_type: MessageType) -> Self {
                match message_type {
                    $(MessageType::$name => Self::$name($name::default()),)*
                }
            }
        }

        $(
            impl From<$name> for Message {
                fn from(message: $name) -> Self {
                    Self::$name(message)
                }
            }
        )*
    };
}

message_catalog! {
    UseCircuitCode,
    CompleteAgentMovement,
    AgentMovementComplete,
    RegionHandshake,
    RegionHandshakeReply,
    AgentUpdate,
    ObjectUpdate,
    KillObject,
    ChatFromViewer,
    ChatFromSimulator,
    TeleportLocationRequest,
    TeleportStart,
    TeleportLocal,
    TeleportFailed,
    StartPingCheck,
    CompletePingCheck,
    PacketAck,
    LogoutRequest,
    LogoutReply,
    CloseCircuit,
}

impl Message {
    pub fn needs_ack(&self) -> bool {
        self.message_type().needs_ack()
    }
}
