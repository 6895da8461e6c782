//! OIDC provider registry and pending-secret channel
//!
//! Provider HTTP flows live outside the core; only the callback contract is
//! implemented here. The registry and the state channel correlating OIDC
//! `state` values to pending secret issuance are explicit, lifecycled state
//! owned by the peermap rather than process-wide globals.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use peerguard_auth::NetworkSecret;
use tokio::sync::oneshot;
use tokio::time::timeout;

/// How long `/network/token` parks before giving up on the callback.
const TOKEN_WAIT: Duration = Duration::from_secs(120);

/// Resolves an authorization code to the authenticated user's email. The
/// email becomes the network id.
#[async_trait]
pub trait UserInfoResolver: Send + Sync {
    async fn user_info(&self, code: &str) -> Result<String, String>;
}

/// Named providers plus the pending state channel.
#[derive(Default)]
pub struct OidcRegistry {
    providers: RwLock<HashMap<String, Arc<dyn UserInfoResolver>>>,
    pending: Mutex<HashMap<String, oneshot::Sender<NetworkSecret>>>,
}

impl OidcRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_provider(&self, name: impl Into<String>, resolver: Arc<dyn UserInfoResolver>) {
        self.providers.write().unwrap().insert(name.into(), resolver);
    }

    pub fn provider(&self, name: &str) -> Option<Arc<dyn UserInfoResolver>> {
        self.providers.read().unwrap().get(name).cloned()
    }

    /// Park until the OIDC callback notifies a secret for `state`, or the
    /// wait times out.
    pub async fn await_token(&self, state: &str) -> Option<NetworkSecret> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(state.to_string(), tx);
        let result = timeout(TOKEN_WAIT, rx).await;
        self.pending.lock().unwrap().remove(state);
        match result {
            Ok(Ok(secret)) => Some(secret),
            _ => None,
        }
    }

    /// Hand the issued secret to whoever is parked on `state`. Fails when
    /// nobody is waiting.
    pub fn notify_token(&self, state: &str, secret: NetworkSecret) -> Result<(), String> {
        let tx = self
            .pending
            .lock()
            .unwrap()
            .remove(state)
            .ok_or_else(|| format!("no pending request for state {}", state))?;
        tx.send(secret).map_err(|_| "requester went away".into())
    }
}
