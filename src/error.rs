use thiserror::Error;

use crate::protocol::MessageKind;

/// Fatal session errors. Every variant ends the current connection; the
/// session supervisor decides between exiting and reconnecting.
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("send to coordinator failed {attempts} times: {source}")]
    SendFailed {
        attempts: u32,
        source: std::io::Error,
    },

    #[error("receive from coordinator failed {attempts} times: {source}")]
    ReceiveFailed {
        attempts: u32,
        source: std::io::Error,
    },

    #[error("corrupt message from coordinator: {0}")]
    CorruptMessage(String),

    #[error("lost connection to coordinator")]
    PeerClosed,

    #[error("no message received from coordinator in the last {silence_secs} seconds")]
    PeerSilent { silence_secs: u64 },

    #[error("unexpected {0} message during an active run")]
    ProtocolViolation(MessageKind),

    #[error("not connected to coordinator")]
    NotConnected,

    #[error("stream to coordinator is out of step after a partial write")]
    Desynchronized,

    #[error("failed to encode message: {0}")]
    Encode(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AgentError {
    /// Whether the coordinator should be told about a corrupt message before
    /// the connection is torn down.
    pub fn is_corrupt(&self) -> bool {
        matches!(self, AgentError::CorruptMessage(_))
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;
