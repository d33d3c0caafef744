mod client;
mod codec;
mod config;
mod connection;
mod endpoint;
mod error;
mod events;
mod handlers;
mod message;
mod protocol;
mod reliability;
mod router;
mod stats;

pub use client::{ClientCommand, ClientHandle, NetworkClient};
pub use codec::{MAX_LONG_STRING, MAX_SHORT_STRING, WireReader, WireWriter, zero_decode, zero_encode};
pub use config::{CircuitInfo, ClientConfig, ReliabilityConfig, RouterConfig};
pub use connection::{ConnectionManager, ConnectionState, Session, SessionInfo};
pub use endpoint::{NetworkEndpoint, resolve};
pub use error::{ClientError, ClientResult, ConfigError, HandlerError, ProtocolError};
pub use events::{
    AgentRecord, ChatRecord, ClientEvent, EventSink, ObjectRecord, RegionRecord, event_channel,
};
pub use handlers::{
    AgentMovementHandler, ChatHandler, ObjectUpdateHandler, RegionHandshakeHandler,
    register_default_handlers,
};
pub use message::*;
pub use protocol::{
    DEFAULT_PORT, HEADER_SIZE, MAX_APPENDED_ACKS, MAX_PACKET_SIZE, MessagePriority, MessageType,
    Packet, PacketFlags, PacketHeader, parse, sequence_greater_than, serialize, set_resend_flag,
};
pub use reliability::{PendingAck, ReceiveTracker, ReliabilityLayer, RetransmitBatch};
pub use router::{FnHandler, MessageHandler, MessageRouter, RouteOutcome};
pub use stats::{HealthSnapshot, NetworkStats, PingTracker, health_snapshot};
