//! Peermap configuration
//!
//! Configuration enters through this struct; file formats and flag parsing
//! belong to the hosting binary.

use std::path::PathBuf;
use std::time::Duration;

use rand::RngCore;
use tracing::{info, warn};

use crate::error::{PeermapError, PeermapResult};

/// Aggregate per-network rate limit, bytes per second.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimiterConfig {
    pub limit: usize,
    pub burst: usize,
}

/// Peermap server configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// host:port to listen on
    pub listen: String,
    /// Deployment-wide symmetric key; auto-generated when empty
    pub secret_key: String,
    /// STUN servers advertised to peers on upgrade
    pub stuns: Vec<String>,
    /// Network name exempt from authentication (testing namespace)
    pub public_network: Option<String>,
    /// Network metadata persistence path
    pub state_file: PathBuf,
    /// Per-network data-plane limiter; discovery traffic has its own
    pub rate_limiter: Option<RateLimiterConfig>,
    /// Lifetime of an issued network secret
    pub secret_validity: Duration,
    /// How often active sessions receive a fresh secret
    pub secret_rotation: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: String::new(),
            secret_key: String::new(),
            stuns: Vec::new(),
            public_network: None,
            state_file: PathBuf::from("peermap_state.json"),
            rate_limiter: None,
            secret_validity: Duration::from_secs(4 * 3600),
            secret_rotation: Duration::from_secs(3600),
        }
    }
}

impl Config {
    /// Fill in defaults and validate. A missing secret key is generated
    /// from 16 random bytes and logged once so operators can pin it.
    pub fn apply_defaults(&mut self) -> PeermapResult<()> {
        if self.listen.is_empty() {
            self.listen = "127.0.0.1:9987".to_string();
        }
        if self.secret_key.is_empty() {
            let mut key = [0u8; 16];
            rand::rngs::OsRng.fill_bytes(&mut key);
            self.secret_key = hex::encode(key);
            info!("SecretKey {}", self.secret_key);
        }
        if self.stuns.is_empty() {
            warn!("no STUN servers configured, NAT traversal is disabled");
        }
        if let Some(rl) = &self.rate_limiter {
            if rl.burst < rl.limit {
                return Err(PeermapError::ConfigInvalid(
                    "burst must be greater than or equal to limit".into(),
                ));
            }
        }
        if self.secret_rotation.is_zero() || self.secret_rotation >= self.secret_validity {
            return Err(PeermapError::ConfigInvalid(
                "secret rotation period must be positive and shorter than the validity period"
                    .into(),
            ));
        }
        Ok(())
    }
}
