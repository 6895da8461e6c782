//! Datagram encryption hook
//!
//! Payload confidentiality is optional: callers may install a symmetric
//! algorithm keyed by the destination peer id string. The core never
//! mandates it; the nonce obfuscation on the peermap wire is not a
//! substitute.

use crate::error::ProtoResult;

/// Symmetric encryption applied to datagram bodies.
///
/// `key_id` is the peer id string of the remote end, letting
/// implementations derive or look up a per-peer key.
pub trait SymmAlgo: Send + Sync {
    fn encrypt(&self, data: &[u8], key_id: &str) -> ProtoResult<Vec<u8>>;
    fn decrypt(&self, data: &[u8], key_id: &str) -> ProtoResult<Vec<u8>>;
}
