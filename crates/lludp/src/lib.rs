//! Client side of the LLUDP virtual-world protocol: wire codec, reliable
//! delivery, the circuit handshake and priority-ordered message dispatch.

pub mod net;

pub use net::{
    CircuitInfo, ClientCommand, ClientConfig, ClientError, ClientEvent, ClientHandle,
    ClientResult, ConnectionManager, ConnectionState, EventSink, HandlerError, HealthSnapshot,
    Message, MessageHandler, MessageRouter, MessageType, NetworkClient, NetworkStats, Packet,
    ProtocolError, SessionInfo, health_snapshot, parse, register_default_handlers, serialize,
};
