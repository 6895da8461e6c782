//! Network-membership secrets
//!
//! A secret is a compact signed token binding (network id, optional alias,
//! neighbour list, absolute deadline). Integrity comes from HMAC-SHA256
//! under a deployment-wide symmetric key; there is no asymmetric material.
//!
//! Token layout: `base64url(claims-json) "." base64url(mac)` where the MAC
//! covers an audience tag plus the claims bytes. The exporter authenticator
//! shares the key but signs a disjoint audience, so the two token spaces
//! cannot be exchanged.

pub mod exporter;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

const AUDIENCE_NETWORK: &[u8] = b"peerguard.network";

/// Authentication failures
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    /// MAC mismatch or undecodable token
    #[error("invalid secret")]
    Invalid,

    /// Well-formed token whose deadline has passed
    #[error("secret expired")]
    Expired,

    /// Validity/rotation configuration rejected at startup
    #[error("invalid validity period: {0}")]
    InvalidValidity(String),
}

pub type AuthResult<T> = Result<T, AuthError>;

/// The network attributes a secret binds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Net {
    pub id: String,
    pub alias: Option<String>,
    pub neighbors: Vec<String>,
}

/// Signed claims carried inside a token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretClaims {
    #[serde(rename = "n")]
    pub network: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub neighbors: Vec<String>,
    /// Unix seconds
    pub deadline: i64,
}

impl SecretClaims {
    pub fn deadline_time(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.deadline, 0).unwrap_or_else(Utc::now)
    }

    pub fn net(&self) -> Net {
        Net {
            id: self.network.clone(),
            alias: self.alias.clone(),
            neighbors: self.neighbors.clone(),
        }
    }
}

/// The secret blob handed to peers over `UPDATE_NETWORK_SECRET`, and
/// returned by the OIDC token channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkSecret {
    pub network: String,
    pub secret: String,
    pub expire: DateTime<Utc>,
}

/// Issues and validates network-membership tokens.
#[derive(Clone)]
pub struct Authenticator {
    key: Vec<u8>,
    audience: &'static [u8],
}

impl Authenticator {
    pub fn new(secret_key: &str) -> Self {
        Self {
            key: secret_key.as_bytes().to_vec(),
            audience: AUDIENCE_NETWORK,
        }
    }

    pub(crate) fn with_audience(secret_key: &str, audience: &'static [u8]) -> Self {
        Self {
            key: secret_key.as_bytes().to_vec(),
            audience,
        }
    }

    /// Produce a token binding `net` with an absolute deadline of
    /// `now + validity`.
    pub fn generate_secret(&self, net: &Net, validity: Duration) -> AuthResult<(String, DateTime<Utc>)> {
        let deadline = Utc::now() + validity;
        let claims = SecretClaims {
            network: net.id.clone(),
            alias: net.alias.clone(),
            neighbors: net.neighbors.clone(),
            deadline: deadline.timestamp(),
        };
        let body = serde_json::to_vec(&claims).map_err(|_| AuthError::Invalid)?;
        let token = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(&body),
            URL_SAFE_NO_PAD.encode(self.mac(&body))
        );
        Ok((token, deadline))
    }

    /// Validate the MAC and the deadline, returning the bound claims.
    pub fn parse_secret(&self, token: &str) -> AuthResult<SecretClaims> {
        let (body_b64, mac_b64) = token.split_once('.').ok_or(AuthError::Invalid)?;
        let body = URL_SAFE_NO_PAD
            .decode(body_b64)
            .map_err(|_| AuthError::Invalid)?;
        let mac = URL_SAFE_NO_PAD
            .decode(mac_b64)
            .map_err(|_| AuthError::Invalid)?;

        let mut verifier = HmacSha256::new_from_slice(&self.key).map_err(|_| AuthError::Invalid)?;
        verifier.update(self.audience);
        verifier.update(&body);
        verifier.verify_slice(&mac).map_err(|_| AuthError::Invalid)?;

        let claims: SecretClaims = serde_json::from_slice(&body).map_err(|_| AuthError::Invalid)?;
        if claims.deadline <= Utc::now().timestamp() {
            return Err(AuthError::Expired);
        }
        Ok(claims)
    }

    fn mac(&self, body: &[u8]) -> Vec<u8> {
        let mut mac = HmacSha256::new_from_slice(&self.key).expect("hmac accepts any key length");
        mac.update(self.audience);
        mac.update(body);
        mac.finalize().into_bytes().to_vec()
    }
}
