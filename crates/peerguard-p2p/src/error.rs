//! Peer agent error types

use thiserror::Error;

/// Peer agent errors
#[derive(Debug, Error)]
pub enum P2pError {
    /// Startup-time configuration rejection
    #[error("invalid config: {0}")]
    ConfigInvalid(String),

    /// No peermap endpoint accepted the session
    #[error("peermap dial failed: {0}")]
    Dial(String),

    /// The peermap session or a UDP socket is gone
    #[error("transport closed")]
    TransportClosed,

    /// A configured read deadline elapsed
    #[error("read deadline exceeded")]
    DeadlineExceeded,

    /// STUN response rejected
    #[error("stun: {0}")]
    Stun(String),

    #[error(transparent)]
    Proto(#[from] peerguard_proto::ProtoError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type for peer agent operations
pub type P2pResult<T> = Result<T, P2pError>;
