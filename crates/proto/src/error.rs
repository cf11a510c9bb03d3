use crate::packet::MalformedPacket;

pub type Result<T> = std::result::Result<T, ProtoError>;

/// Failure taxonomy for the protocol layer.
///
/// `Malformed` is recoverable (the packet is dropped locally and the
/// retransmission machinery takes over). Everything else is fatal to the
/// connection it occurred on and never disturbs other sessions.
#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    #[error("malformed packet: {0}")]
    Malformed(#[from] MalformedPacket),

    #[error("connection error: {0}")]
    Connection(#[from] std::io::Error),

    #[error("peer closed the connection")]
    PeerClosed,

    #[error("timed out waiting for a packet")]
    TimedOut,

    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("payload encoding failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("retry ceiling exceeded after {attempts} failed attempts")]
    RetryCeiling { attempts: u32 },
}

impl ProtoError {
    /// `true` for errors that end the connection rather than a single packet.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ProtoError::Malformed(_))
    }
}
