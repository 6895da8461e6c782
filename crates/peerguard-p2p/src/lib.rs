//! PeerGuard peer agent
//!
//! Speaks the peermap control protocol, performs NAT traversal (STUN
//! binding plus punch-through pings), keeps direct UDP paths alive, and
//! exposes a packet-oriented connection addressed by peer identifiers.

pub mod config;
mod conn;
mod control;
pub mod error;
mod nat;
pub mod stun;

pub use config::Config;
pub use conn::PacketConn;
pub use error::{P2pError, P2pResult};
pub use peerguard_proto::{Datagram, Disco, Metadata, NatType, PeerId, SymmAlgo};
