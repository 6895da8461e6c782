//! Peer agent configuration

use std::sync::Arc;
use std::time::Duration;

use peerguard_proto::{PeerId, SymmAlgo};

use crate::error::{P2pError, P2pResult};

/// Configuration of one peer agent.
#[derive(Clone)]
pub struct Config {
    /// Peermap endpoints tried in order (ws:// or wss:// URLs)
    pub peermap: Vec<String>,
    /// Network membership token, or the public network name
    pub network: String,
    /// This agent's identity
    pub peer_id: String,
    /// Metadata advertised to other peers on introduction
    pub metadata: Vec<(String, String)>,
    /// Direct-path ping cadence; a path is live within twice this
    pub keepalive_interval: Duration,
    /// Payload size hint published to upstream consumers
    pub mtu: usize,
    /// Ping discriminator override; must agree across the deployment
    pub ping_magic: Option<Vec<u8>>,
    /// Optional datagram encryption hook
    pub symm_algo: Option<Arc<dyn SymmAlgo>>,
    /// Redial the peermap after the session drops
    pub reconnect: bool,
}

impl Config {
    pub fn new(
        peermap: Vec<String>,
        network: impl Into<String>,
        peer_id: impl Into<String>,
    ) -> Self {
        Self {
            peermap,
            network: network.into(),
            peer_id: peer_id.into(),
            metadata: Vec::new(),
            keepalive_interval: Duration::from_secs(10),
            mtu: 1428,
            ping_magic: None,
            symm_algo: None,
            reconnect: true,
        }
    }

    pub fn validate(&self) -> P2pResult<PeerId> {
        if self.peermap.is_empty() {
            return Err(P2pError::ConfigInvalid("no peermap endpoint".into()));
        }
        if self.keepalive_interval.is_zero() {
            return Err(P2pError::ConfigInvalid(
                "keepalive interval must be positive".into(),
            ));
        }
        self.peer_id
            .parse::<PeerId>()
            .map_err(|err| P2pError::ConfigInvalid(err.to_string()))
    }
}
