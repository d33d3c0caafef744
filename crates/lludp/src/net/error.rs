use std::io;

use super::connection::ConnectionState;

/// A malformed datagram. Always recoverable: the packet is dropped and the
/// circuit stays open.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("packet of {len} bytes is shorter than the {min}-byte header")]
    InvalidPacketSize { len: usize, min: usize },
    #[error("unknown message type {0:#x}")]
    UnknownMessageType(u32),
    #[error("field needs {needed} bytes but only {available} remain")]
    InsufficientData { needed: usize, available: usize },
    #[error("string of {len} bytes exceeds the {max}-byte limit")]
    StringTooLong { len: usize, max: usize },
    #[error("string field is not valid UTF-8")]
    InvalidString,
    #[error("zero-coded payload ends inside a zero run")]
    InvalidZerocode,
    #[error("{0} acknowledgements do not fit in one packet")]
    TooManyAcks(usize),
    #[error("packet of {len} bytes exceeds the {max}-byte limit")]
    PacketTooLarge { len: usize, max: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn budget_exceeded(elapsed_ms: f32, budget_ms: f32) -> Self {
        Self::new(format!(
            "handler took {elapsed_ms:.1} ms, budget is {budget_ms:.1} ms"
        ))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("reliable packet {sequence} unacknowledged after {retries} retransmissions")]
    LinkTimeout { sequence: u32, retries: u32 },
    #[error("handshake failed: {0}")]
    HandshakeFailure(String),
    #[error("handler {name} failed: {source}")]
    Handler {
        name: String,
        #[source]
        source: HandlerError,
    },
    #[error("{operation} is not valid while {state:?}")]
    InvalidState {
        operation: &'static str,
        state: ConnectionState,
    },
    #[error("no circuit is open")]
    NotConnected,
    #[error("transport error: {0}")]
    Io(#[from] io::Error),
    #[error("client command channel closed")]
    ChannelClosed,
}

pub type ClientResult<T> = Result<T, ClientError>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("initial retransmit timeout exceeds the maximum timeout")]
    TimeoutOrder,
}
