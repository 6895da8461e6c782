//! PeerGuard rendezvous server
//!
//! Hosts per-network peer directories, brokers discovery introductions,
//! rotates network secrets, rate-limits traffic, and relays frames between
//! peers that cannot connect directly. Peers attach over a WebSocket
//! upgrade authenticated by a network-membership secret; a read-only
//! exporter API and the OIDC callback flow share the HTTP surface.

pub mod config;
pub mod directory;
pub mod error;
pub mod exporter;
pub mod oidc;
pub mod ratelimit;
mod server;
pub mod session;
pub mod state;

pub use config::{Config, RateLimiterConfig};
pub use error::{PeermapError, PeermapResult};
pub use oidc::{OidcRegistry, UserInfoResolver};
pub use server::PeerMap;
pub use session::PeerSession;
