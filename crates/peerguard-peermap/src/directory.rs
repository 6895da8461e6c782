//! Per-network peer directory
//!
//! Two indices are held together: network id to network context, and a
//! global peer id to network context index. A session is in its network's
//! peer map iff the global index points at that network (insertion and
//! removal take both locks, in the same order).

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, RwLock};

use chrono::{DateTime, Utc};
use peerguard_auth::Net;
use peerguard_proto::PeerId;
use tracing::debug;

use crate::config::RateLimiterConfig;
use crate::error::{PeermapError, PeermapResult};
use crate::ratelimit::RateLimiter;
use crate::session::PeerSession;
use crate::state::NetState;

/// Discovery-class traffic budget, independent of the data limiter so the
/// control plane makes progress under data backpressure.
const DISCO_LIMIT: usize = 10 * 1024;
const DISCO_BURST: usize = 128 * 1024;

/// Mutable network metadata.
#[derive(Debug, Clone)]
pub struct NetworkMeta {
    pub alias: Option<String>,
    pub neighbors: Vec<String>,
    pub update_time: DateTime<Utc>,
}

/// Per-network state: the peer map, limiters, and metadata.
pub struct NetworkContext {
    pub id: String,
    pub create_time: DateTime<Utc>,
    pub ratelimiter: Option<Arc<RateLimiter>>,
    pub disco_limiter: Arc<RateLimiter>,
    peers: RwLock<HashMap<PeerId, Arc<PeerSession>>>,
    meta: StdMutex<NetworkMeta>,
}

impl NetworkContext {
    fn new(state: NetState, limiter: Option<RateLimiterConfig>) -> Self {
        let ratelimiter = limiter
            .filter(|rl| rl.limit > 0)
            .map(|rl| Arc::new(RateLimiter::new(rl.limit, rl.burst)));
        Self {
            id: state.id,
            create_time: state.create_time,
            ratelimiter,
            disco_limiter: Arc::new(RateLimiter::new(DISCO_LIMIT, DISCO_BURST)),
            peers: RwLock::new(HashMap::new()),
            meta: StdMutex::new(NetworkMeta {
                alias: state.alias,
                neighbors: state.neighbors,
                update_time: state.update_time,
            }),
        }
    }

    pub fn get_peer(&self, id: &PeerId) -> Option<Arc<PeerSession>> {
        self.peers.read().unwrap().get(id).cloned()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().unwrap().len()
    }

    pub fn peers(&self) -> Vec<Arc<PeerSession>> {
        self.peers.read().unwrap().values().cloned().collect()
    }

    pub fn meta(&self) -> NetworkMeta {
        self.meta.lock().unwrap().clone()
    }

    pub fn net(&self) -> Net {
        let meta = self.meta.lock().unwrap();
        Net {
            id: self.id.clone(),
            alias: meta.alias.clone(),
            neighbors: meta.neighbors.clone(),
        }
    }

    /// Adopt metadata carried by a presented secret, unless the stored
    /// metadata is newer than the secret's issue time.
    pub fn init_meta(&self, net: &Net, issue_time: DateTime<Utc>) {
        let mut meta = self.meta.lock().unwrap();
        if meta.update_time > issue_time {
            return;
        }
        meta.update_time = issue_time;
        meta.alias = net.alias.clone();
        meta.neighbors = net.neighbors.clone();
    }

    /// Overwrite metadata from the exporter API. Returns false when nothing
    /// changed (callers then skip the secret fan-out).
    pub fn update_meta(&self, alias: Option<String>, neighbors: Vec<String>) -> bool {
        let mut meta = self.meta.lock().unwrap();
        if meta.alias == alias && meta.neighbors == neighbors {
            return false;
        }
        meta.update_time = Utc::now();
        meta.alias = alias;
        meta.neighbors = neighbors;
        true
    }

    pub fn to_state(&self) -> NetState {
        let meta = self.meta.lock().unwrap();
        NetState {
            id: self.id.clone(),
            alias: meta.alias.clone(),
            neighbors: meta.neighbors.clone(),
            create_time: self.create_time,
            update_time: meta.update_time,
        }
    }
}

/// The two-index directory.
#[derive(Default)]
pub struct Directory {
    networks: RwLock<HashMap<String, Arc<NetworkContext>>>,
    peer_index: RwLock<HashMap<PeerId, Arc<NetworkContext>>>,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_network(&self, network: &str) -> Option<Arc<NetworkContext>> {
        self.networks.read().unwrap().get(network).cloned()
    }

    /// Create the network context on first join, double-checked under the
    /// write lock.
    pub fn get_or_create_network(
        &self,
        network: &str,
        limiter: Option<RateLimiterConfig>,
    ) -> Arc<NetworkContext> {
        if let Some(ctx) = self.get_network(network) {
            return ctx;
        }
        let mut networks = self.networks.write().unwrap();
        networks
            .entry(network.to_string())
            .or_insert_with(|| {
                let now = Utc::now();
                Arc::new(NetworkContext::new(
                    NetState {
                        id: network.to_string(),
                        alias: None,
                        neighbors: Vec::new(),
                        create_time: now,
                        update_time: now,
                    },
                    limiter,
                ))
            })
            .clone()
    }

    /// Check-and-set insertion into both indices. A colliding peer id
    /// rejects the new session so the upgrade handler can answer 400.
    pub fn insert_session(
        &self,
        ctx: &Arc<NetworkContext>,
        session: &Arc<PeerSession>,
    ) -> PeermapResult<()> {
        let mut peers = ctx.peers.write().unwrap();
        let mut index = self.peer_index.write().unwrap();
        if peers.contains_key(session.id()) {
            return Err(PeermapError::PeerDuplicate(session.id().clone()));
        }
        peers.insert(session.id().clone(), session.clone());
        index.insert(session.id().clone(), ctx.clone());
        Ok(())
    }

    /// Remove the session from both indices atomically. A stale removal
    /// (a newer session reused the id) is a no-op.
    pub fn remove_session(&self, network: &str, session: &Arc<PeerSession>) {
        let Some(ctx) = self.get_network(network) else {
            return;
        };
        let mut peers = ctx.peers.write().unwrap();
        let mut index = self.peer_index.write().unwrap();
        if let Some(current) = peers.get(session.id()) {
            if !Arc::ptr_eq(current, session) {
                return;
            }
        } else {
            return;
        }
        peers.remove(session.id());
        index.remove(session.id());
        debug!(network, peer = %session.id(), "peer removed");
    }

    /// Resolve a target: the caller's network first, then the global index,
    /// accepting the match only when the target's network is one of the
    /// caller's declared neighbours.
    pub fn find_peer(&self, from: &NetworkContext, id: &PeerId) -> Option<Arc<PeerSession>> {
        if let Some(peer) = from.get_peer(id) {
            return Some(peer);
        }
        let neighbor_ctx = self.peer_index.read().unwrap().get(id).cloned()?;
        if !from
            .meta
            .lock()
            .unwrap()
            .neighbors
            .contains(&neighbor_ctx.id)
        {
            return None;
        }
        neighbor_ctx.get_peer(id)
    }

    /// Sessions of a network whose metadata passes `filter`.
    pub fn find_peers(
        &self,
        network: &str,
        filter: impl Fn(&peerguard_proto::Metadata) -> bool,
    ) -> Vec<Arc<PeerSession>> {
        match self.get_network(network) {
            Some(ctx) => ctx
                .peers()
                .into_iter()
                .filter(|p| filter(p.metadata()))
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn networks(&self) -> Vec<Arc<NetworkContext>> {
        self.networks.read().unwrap().values().cloned().collect()
    }

    /// Rebuild network contexts from persisted state; peers are never
    /// persisted.
    pub fn load_states(&self, states: Vec<NetState>, limiter: Option<RateLimiterConfig>) {
        let mut networks = self.networks.write().unwrap();
        for state in states {
            let id = state.id.clone();
            networks.insert(id, Arc::new(NetworkContext::new(state, limiter)));
        }
    }

    pub fn export_states(&self) -> Vec<NetState> {
        self.networks
            .read()
            .unwrap()
            .values()
            .map(|ctx| ctx.to_state())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::PeerSession;
    use peerguard_auth::SecretClaims;
    use peerguard_proto::Metadata;

    fn claims(network: &str) -> SecretClaims {
        SecretClaims {
            network: network.into(),
            alias: None,
            neighbors: Vec::new(),
            deadline: i64::MAX,
        }
    }

    fn session(id: &str, network: &str) -> Arc<PeerSession> {
        PeerSession::new(
            id.parse().unwrap(),
            network.to_string(),
            7,
            Metadata::new(),
            claims(network),
            None,
        )
    }

    #[test]
    fn test_insert_and_duplicate() {
        let dir = Directory::new();
        let ctx = dir.get_or_create_network("net1", None);
        let alice = session("alice", "net1");
        dir.insert_session(&ctx, &alice).unwrap();
        assert!(matches!(
            dir.insert_session(&ctx, &session("alice", "net1")),
            Err(PeermapError::PeerDuplicate(_))
        ));
        assert_eq!(ctx.peer_count(), 1);
    }

    #[test]
    fn test_remove_is_atomic_across_indices() {
        let dir = Directory::new();
        let ctx = dir.get_or_create_network("net1", None);
        let alice = session("alice", "net1");
        dir.insert_session(&ctx, &alice).unwrap();
        dir.remove_session("net1", &alice);
        assert!(ctx.get_peer(alice.id()).is_none());
        assert!(dir.peer_index.read().unwrap().get(alice.id()).is_none());
        // reinsert is now allowed
        dir.insert_session(&ctx, &session("alice", "net1")).unwrap();
    }

    #[test]
    fn test_stale_remove_keeps_new_session() {
        let dir = Directory::new();
        let ctx = dir.get_or_create_network("net1", None);
        let old = session("alice", "net1");
        dir.insert_session(&ctx, &old).unwrap();
        dir.remove_session("net1", &old);
        let new = session("alice", "net1");
        dir.insert_session(&ctx, &new).unwrap();
        // removing the dead session again must not evict the live one
        dir.remove_session("net1", &old);
        assert!(ctx.get_peer(new.id()).is_some());
    }

    #[test]
    fn test_neighbor_resolution() {
        let dir = Directory::new();
        let net1 = dir.get_or_create_network("net1", None);
        let net2 = dir.get_or_create_network("net2", None);
        let bob = session("bob", "net2");
        dir.insert_session(&net2, &bob).unwrap();

        // not a neighbour: invisible
        assert!(dir.find_peer(&net1, bob.id()).is_none());

        net1.update_meta(None, vec!["net2".into()]);
        assert!(dir.find_peer(&net1, bob.id()).is_some());
    }

    #[test]
    fn test_find_peers_filter() {
        let dir = Directory::new();
        let ctx = dir.get_or_create_network("net1", None);
        let mut meta = Metadata::new();
        meta.add("silenceMode", "1");
        let silent = PeerSession::new(
            "quiet".parse().unwrap(),
            "net1".into(),
            1,
            meta,
            claims("net1"),
            None,
        );
        dir.insert_session(&ctx, &silent).unwrap();
        dir.insert_session(&ctx, &session("loud", "net1")).unwrap();

        let silent_peers = dir.find_peers("net1", |m| m.silence_mode());
        assert_eq!(silent_peers.len(), 1);
        assert_eq!(silent_peers[0].id().to_string(), "quiet");
    }

    #[test]
    fn test_init_meta_monotonic() {
        let dir = Directory::new();
        let ctx = dir.get_or_create_network("net1", None);
        ctx.update_meta(Some("fresh".into()), vec![]);
        // a secret issued before the update must not clobber it
        let old_issue = Utc::now() - chrono::Duration::hours(1);
        ctx.init_meta(
            &Net {
                id: "net1".into(),
                alias: Some("stale".into()),
                neighbors: vec![],
            },
            old_issue,
        );
        assert_eq!(ctx.meta().alias.as_deref(), Some("fresh"));
    }
}
