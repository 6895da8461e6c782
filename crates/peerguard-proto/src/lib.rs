//! PeerGuard wire primitives
//!
//! Shared between the peermap server and the peer agent:
//! - Opaque peer identifiers
//! - Control codes and length-prefixed frame codec
//! - Single-byte nonce obfuscation
//! - Discovery ping datagrams and the NAT-type lattice
//! - Optional datagram encryption hook

pub mod codec;
pub mod disco;
pub mod error;
pub mod metadata;
pub mod secure;

pub use codec::{xor_nonce, ControlCode, Frame};
pub use disco::{Datagram, Disco, NatType, PeerUdpAddr};
pub use error::{ProtoError, ProtoResult};
pub use metadata::Metadata;
pub use secure::SymmAlgo;

/// Opaque peer identifier: 1..=255 bytes, compared byte-wise.
///
/// Callers may choose IP strings or arbitrary names; the core attaches no
/// structure to the content beyond the length bound imposed by the frame
/// address field.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(Vec<u8>);

impl PeerId {
    /// Maximum identifier length, bounded by the one-byte address-length
    /// field of the frame codec.
    pub const MAX_LEN: usize = 255;

    pub fn new(bytes: impl Into<Vec<u8>>) -> ProtoResult<Self> {
        let bytes = bytes.into();
        if bytes.is_empty() || bytes.len() > Self::MAX_LEN {
            return Err(ProtoError::InvalidPeerId(bytes.len()));
        }
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len_byte(&self) -> u8 {
        self.0.len() as u8
    }
}

impl std::str::FromStr for PeerId {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.as_bytes().to_vec())
    }
}

impl TryFrom<&[u8]> for PeerId {
    type Error = ProtoError;

    fn try_from(b: &[u8]) -> Result<Self, Self::Error> {
        Self::new(b.to_vec())
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PeerId({})", self)
    }
}
