//! Wire primitive error types

use thiserror::Error;

/// Errors raised while assembling or parsing wire artifacts
#[derive(Debug, Error)]
pub enum ProtoError {
    /// Peer identifier outside the 1..=255 byte bound
    #[error("invalid peer id length: {0}")]
    InvalidPeerId(usize),

    /// Frame shorter than its advertised address length
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// Control code byte outside the closed code set
    #[error("unknown control code: {0}")]
    UnknownControlCode(u8),

    /// Metadata multimap could not be parsed
    #[error("invalid metadata: {0}")]
    InvalidMetadata(String),

    /// Datagram encryption hook failure
    #[error("crypto hook error: {0}")]
    Crypto(String),
}

/// Result type for wire primitive operations
pub type ProtoResult<T> = Result<T, ProtoError>;
