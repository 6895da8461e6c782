//! Exporter tokens
//!
//! The read-only monitoring API authenticates with tokens signed under the
//! same deployment key as network secrets but a disjoint audience, so a
//! network secret can never pass as an exporter credential or vice versa.

use chrono::Duration;

use crate::{AuthResult, Authenticator as SecretAuthenticator, Net, SecretClaims};

const AUDIENCE_EXPORTER: &[u8] = b"peerguard.exporter";

/// Issues and validates exporter tokens.
#[derive(Clone)]
pub struct Authenticator {
    inner: SecretAuthenticator,
}

impl Authenticator {
    pub fn new(secret_key: &str) -> Self {
        Self {
            inner: SecretAuthenticator::with_audience(secret_key, AUDIENCE_EXPORTER),
        }
    }

    pub fn generate_token(&self, validity: Duration) -> AuthResult<String> {
        let net = Net {
            id: "exporter".into(),
            ..Default::default()
        };
        let (token, _) = self.inner.generate_secret(&net, validity)?;
        Ok(token)
    }

    pub fn check_token(&self, token: &str) -> AuthResult<SecretClaims> {
        self.inner.parse_secret(token)
    }
}
