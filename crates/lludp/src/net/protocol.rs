use bitflags::bitflags;

use super::codec::{WireReader, WireWriter, zero_decode, zero_encode};
use super::error::ProtocolError;
use super::message::Message;

/// flags (1) + sequence (4) + message type (4).
pub const HEADER_SIZE: usize = 9;
pub const MAX_PACKET_SIZE: usize = 8192;
pub const MAX_APPENDED_ACKS: usize = u8::MAX as usize;
pub const DEFAULT_PORT: u16 = 9000;

const SEQUENCE_WRAP_THRESHOLD: u32 = u32::MAX / 2;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PacketFlags: u8 {
        const ZEROCODED = 0x80;
        const RELIABLE = 0x40;
        const RESEND = 0x20;
        const ACK = 0x10;
    }
}

#[inline]
pub fn sequence_greater_than(s1: u32, s2: u32) -> bool {
    ((s1 > s2) && (s1 - s2 <= SEQUENCE_WRAP_THRESHOLD))
        || ((s1 < s2) && (s2 - s1 > SEQUENCE_WRAP_THRESHOLD))
}

/// Dispatch urgency of a message type, highest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MessagePriority {
    Low = 0,
    Normal = 1,
    High = 2,
    Critical = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u32)]
pub enum MessageType {
    UseCircuitCode = 1,
    CompleteAgentMovement = 2,
    AgentMovementComplete = 3,
    RegionHandshake = 4,
    RegionHandshakeReply = 5,
    AgentUpdate = 6,
    ObjectUpdate = 7,
    KillObject = 8,
    ChatFromViewer = 9,
    ChatFromSimulator = 10,
    TeleportLocationRequest = 11,
    TeleportStart = 12,
    TeleportLocal = 13,
    TeleportFailed = 14,
    StartPingCheck = 15,
    CompletePingCheck = 16,
    PacketAck = 17,
    LogoutRequest = 18,
    LogoutReply = 19,
    CloseCircuit = 20,
}

impl MessageType {
    pub const ALL: [MessageType; 20] = [
        Self::UseCircuitCode,
        Self::CompleteAgentMovement,
        Self::AgentMovementComplete,
        Self::RegionHandshake,
        Self::RegionHandshakeReply,
        Self::AgentUpdate,
        Self::ObjectUpdate,
        Self::KillObject,
        Self::ChatFromViewer,
        Self::ChatFromSimulator,
        Self::TeleportLocationRequest,
        Self::TeleportStart,
        Self::TeleportLocal,
        Self::TeleportFailed,
        Self::StartPingCheck,
        Self::CompletePingCheck,
        Self::PacketAck,
        Self::LogoutRequest,
        Self::LogoutReply,
        Self::CloseCircuit,
    ];

    #[inline]
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Result<Self, ProtocolError> {
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.code() == code)
            .ok_or(ProtocolError::UnknownMessageType(code))
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::UseCircuitCode => "UseCircuitCode",
            Self::CompleteAgentMovement => "CompleteAgentMovement",
            Self::AgentMovementComplete => "AgentMovementComplete",
            Self::RegionHandshake => "RegionHandshake",
            Self::RegionHandshakeReply => "RegionHandshakeReply",
            Self::AgentUpdate => "AgentUpdate",
            Self::ObjectUpdate => "ObjectUpdate",
            Self::KillObject => "KillObject",
            Self::ChatFromViewer => "ChatFromViewer",
            Self::ChatFromSimulator => "ChatFromSimulator",
            Self::TeleportLocationRequest => "TeleportLocationRequest",
            Self::TeleportStart => "TeleportStart",
            Self::TeleportLocal => "TeleportLocal",
            Self::TeleportFailed => "TeleportFailed",
            Self::StartPingCheck => "StartPingCheck",
            Self::CompletePingCheck => "CompletePingCheck",
            Self::PacketAck => "PacketAck",
            Self::LogoutRequest => "LogoutRequest",
            Self::LogoutReply => "LogoutReply",
            Self::CloseCircuit => "CloseCircuit",
        }
    }

    /// Whether packets of this type are sent with the reliable flag.
    /// Realtime updates, pings and acknowledgements never are.
    pub fn needs_ack(self) -> bool {
        !matches!(
            self,
            Self::AgentUpdate
                | Self::StartPingCheck
                | Self::CompletePingCheck
                | Self::PacketAck
                | Self::CloseCircuit
        )
    }

    /// Smallest valid payload: every fixed field present, strings and lists empty.
    pub fn min_payload_len(self) -> usize {
        const ID: usize = 16;
        const VEC3: usize = 12;
        const QUAT: usize = 16;
        match self {
            Self::UseCircuitCode | Self::CompleteAgentMovement => 4 + 2 * ID,
            Self::AgentMovementComplete => 2 * ID + 2 * VEC3 + 8 + 4,
            Self::RegionHandshake => 4 + 1 + 1 + 2 * ID + 4,
            Self::RegionHandshakeReply => 2 * ID + 4,
            Self::AgentUpdate => 2 * ID + 2 * QUAT + 1 + 2 * VEC3 + 4 + 4 + 1,
            Self::ObjectUpdate => 8 + 4 + ID + 1 + 2 * VEC3 + QUAT + VEC3,
            Self::KillObject | Self::PacketAck => 1,
            Self::ChatFromViewer => 2 * ID + 2 + 1 + 4,
            Self::ChatFromSimulator => 1 + 2 * ID + 3 + VEC3 + 2,
            Self::TeleportLocationRequest => 2 * ID + 8 + 2 * VEC3,
            Self::TeleportStart => 4,
            Self::TeleportLocal => ID + 4 + 2 * VEC3 + 4,
            Self::TeleportFailed => ID + 1,
            Self::StartPingCheck => 1 + 4,
            Self::CompletePingCheck => 1,
            Self::LogoutRequest | Self::LogoutReply => 2 * ID,
            Self::CloseCircuit => 0,
        }
    }

    /// Types whose payloads carry enough zero padding to be worth zero-coding.
    pub fn zerocode_allowed(self) -> bool {
        matches!(
            self,
            Self::ObjectUpdate | Self::AgentUpdate | Self::ChatFromSimulator | Self::RegionHandshake
        )
    }

    pub fn priority(self) -> MessagePriority {
        match self {
            Self::UseCircuitCode
            | Self::CompleteAgentMovement
            | Self::AgentMovementComplete
            | Self::RegionHandshake
            | Self::RegionHandshakeReply
            | Self::LogoutRequest
            | Self::LogoutReply
            | Self::CloseCircuit => MessagePriority::Critical,
            Self::AgentUpdate | Self::ObjectUpdate | Self::KillObject => MessagePriority::High,
            Self::ChatFromViewer
            | Self::ChatFromSimulator
            | Self::TeleportLocationRequest
            | Self::TeleportStart
            | Self::TeleportLocal
            | Self::TeleportFailed => MessagePriority::Normal,
            Self::StartPingCheck | Self::CompletePingCheck | Self::PacketAck => {
                MessagePriority::Low
            }
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub flags: PacketFlags,
    pub sequence: u32,
    pub message_type: MessageType,
}

impl PacketHeader {
    pub fn new(flags: PacketFlags, sequence: u32, message_type: MessageType) -> Self {
        Self {
            flags,
            sequence,
            message_type,
        }
    }

    /// Header for an outbound message; the reliable flag follows the type.
    pub fn for_message(sequence: u32, message_type: MessageType) -> Self {
        let flags = if message_type.needs_ack() {
            PacketFlags::RELIABLE
        } else {
            PacketFlags::empty()
        };
        Self::new(flags, sequence, message_type)
    }

    pub fn is_reliable(&self) -> bool {
        self.flags.contains(PacketFlags::RELIABLE)
    }

    pub fn is_resend(&self) -> bool {
        self.flags.contains(PacketFlags::RESEND)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub header: PacketHeader,
    pub payload: Message,
    /// Acknowledgements piggy-backed after the payload.
    pub acks: Vec<u32>,
}

impl Packet {
    pub fn new(header: PacketHeader, payload: Message) -> Self {
        Self {
            header,
            payload,
            acks: Vec::new(),
        }
    }

    pub fn from_message(sequence: u32, payload: Message) -> Self {
        Self::new(PacketHeader::for_message(sequence, payload.message_type()), payload)
    }

    pub fn with_acks(mut self, acks: Vec<u32>) -> Self {
        self.acks = acks;
        self
    }

    pub fn message_type(&self) -> MessageType {
        self.header.message_type
    }

    pub fn sequence(&self) -> u32 {
        self.header.sequence
    }

    pub fn ack_number(&self) -> Option<u32> {
        self.acks.first().copied()
    }

    /// Encodes header, payload (zero-coded when that shrinks it and the type
    /// allows it) and any appended acks. The header's zerocoded and ack flags
    /// are derived here; the caller controls reliable and resend.
    pub fn serialize(&self) -> Result<Vec<u8>, ProtocolError> {
        if self.acks.len() > MAX_APPENDED_ACKS {
            return Err(ProtocolError::TooManyAcks(self.acks.len()));
        }

        let mut payload = WireWriter::with_capacity(self.header.message_type.min_payload_len());
        self.payload.encode(&mut payload)?;
        let mut payload = payload.into_inner();

        let mut flags = self.header.flags - (PacketFlags::ZEROCODED | PacketFlags::ACK);
        if self.header.message_type.zerocode_allowed() {
            let coded = zero_encode(&payload);
            if coded.len() < payload.len() {
                payload = coded;
                flags |= PacketFlags::ZEROCODED;
            }
        }
        if !self.acks.is_empty() {
            flags |= PacketFlags::ACK;
        }

        let mut out = WireWriter::with_capacity(HEADER_SIZE + payload.len() + self.acks.len() * 4 + 1);
        out.write_u8(flags.bits());
        out.write_u32(self.header.sequence);
        out.write_u32(self.header.message_type.code());
        let mut out = out.into_inner();
        out.extend_from_slice(&payload);

        if !self.acks.is_empty() {
            for ack in &self.acks {
                out.extend_from_slice(&ack.to_be_bytes());
            }
            out.push(self.acks.len() as u8);
        }

        if out.len() > MAX_PACKET_SIZE {
            return Err(ProtocolError::PacketTooLarge {
                len: out.len(),
                max: MAX_PACKET_SIZE,
            });
        }

        Ok(out)
    }

    pub fn parse(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < HEADER_SIZE {
            return Err(ProtocolError::InvalidPacketSize {
                len: data.len(),
                min: HEADER_SIZE,
            });
        }

        let mut header = WireReader::new(&data[..HEADER_SIZE]);
        let flags = PacketFlags::from_bits_truncate(header.read_u8()?);
        let sequence = header.read_u32()?;
        let message_type = MessageType::from_code(header.read_u32()?)?;

        let mut body = &data[HEADER_SIZE..];
        let mut acks = Vec::new();
        if flags.contains(PacketFlags::ACK) {
            let (&count, rest) = body.split_last().ok_or(ProtocolError::InsufficientData {
                needed: 1,
                available: 0,
            })?;
            let ack_bytes = count as usize * 4;
            if rest.len() < ack_bytes {
                return Err(ProtocolError::InsufficientData {
                    needed: ack_bytes,
                    available: rest.len(),
                });
            }
            let (payload, trailer) = rest.split_at(rest.len() - ack_bytes);
            let mut reader = WireReader::new(trailer);
            for _ in 0..count {
                acks.push(reader.read_u32()?);
            }
            body = payload;
        }

        let decoded;
        if flags.contains(PacketFlags::ZEROCODED) {
            decoded = zero_decode(body)?;
            body = &decoded;
        }

        let min = message_type.min_payload_len();
        if body.len() < min {
            return Err(ProtocolError::InsufficientData {
                needed: min,
                available: body.len(),
            });
        }

        let mut reader = WireReader::new(body);
        let payload = Message::decode(message_type, &mut reader)?;

        Ok(Self {
            header: PacketHeader::new(flags, sequence, message_type),
            payload,
            acks,
        })
    }
}

/// Encodes `message` as a fresh packet with no appended acks.
pub fn serialize(sequence: u32, message: &Message) -> Result<Vec<u8>, ProtocolError> {
    Packet::from_message(sequence, message.clone()).serialize()
}

pub fn parse(data: &[u8]) -> Result<Packet, ProtocolError> {
    Packet::parse(data)
}

/// Marks an already serialized packet as a retransmission.
pub fn set_resend_flag(data: &mut [u8]) {
    if let Some(flags) = data.first_mut() {
        *flags |= PacketFlags::RESEND.bits();
    }
}
