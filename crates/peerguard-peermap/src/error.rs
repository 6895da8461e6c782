//! Peermap error types

use peerguard_proto::PeerId;
use thiserror::Error;

/// Rendezvous server errors
#[derive(Debug, Error)]
pub enum PeermapError {
    /// Token MAC mismatch, expired, or malformed upgrade credentials
    #[error("authentication failed: {0}")]
    AuthInvalid(#[from] peerguard_auth::AuthError),

    /// Peer id already registered in the network
    #[error("peer {0} is already connected")]
    PeerDuplicate(PeerId),

    /// Session closed while an operation was in flight
    #[error("session closed")]
    SessionClosed,

    /// Startup-time configuration rejection
    #[error("invalid config: {0}")]
    ConfigInvalid(String),

    /// Frame codec failure
    #[error(transparent)]
    Proto(#[from] peerguard_proto::ProtoError),

    /// WebSocket transport failure
    #[error("transport: {0}")]
    Transport(String),

    /// State file load/save failure
    #[error("state file: {0}")]
    State(String),

    /// Internal serialisation failure
    #[error("encoding: {0}")]
    Encoding(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type for peermap operations
pub type PeermapResult<T> = Result<T, PeermapError>;
