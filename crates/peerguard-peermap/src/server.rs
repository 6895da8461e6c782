//! Peermap HTTP surface
//!
//! Routes:
//! - `GET /` WebSocket upgrade for peer sessions
//! - `GET /networks`, `GET /peers`, `PUT /network/{network}/meta` exporter API
//! - `GET /oidc/authorize/{provider}`, `GET /network/token` OIDC callback flow

use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{Duration as ChronoDuration, Utc};
use peerguard_auth::{exporter as exporter_auth, Authenticator, Net, NetworkSecret, SecretClaims};
use peerguard_proto::{ControlCode, Frame, Metadata, PeerId};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::directory::{Directory, NetworkContext};
use crate::error::{PeermapError, PeermapResult};
use crate::exporter::{Network, NetworkHead, PutNetworkMetaRequest};
use crate::oidc::OidcRegistry;
use crate::session::{run_session, PeerSession};
use crate::state;

/// The multi-network rendezvous server.
pub struct PeerMap {
    cfg: Config,
    directory: Directory,
    authenticator: Authenticator,
    exporter_auth: exporter_auth::Authenticator,
    oidc: OidcRegistry,
    stuns_json: Vec<u8>,
    local_addr: StdMutex<Option<SocketAddr>>,
    shutdown: watch::Sender<bool>,
}

impl PeerMap {
    pub fn new(mut cfg: Config, oidc: OidcRegistry) -> PeermapResult<Arc<Self>> {
        cfg.apply_defaults()?;
        let stuns_json = serde_json::to_vec(&cfg.stuns)
            .map_err(|err| PeermapError::Encoding(err.to_string()))?;
        let (shutdown, _) = watch::channel(false);
        Ok(Arc::new(Self {
            authenticator: Authenticator::new(&cfg.secret_key),
            exporter_auth: exporter_auth::Authenticator::new(&cfg.secret_key),
            directory: Directory::new(),
            oidc,
            stuns_json,
            local_addr: StdMutex::new(None),
            shutdown,
            cfg,
        }))
    }

    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    pub fn authenticator(&self) -> &Authenticator {
        &self.authenticator
    }

    pub fn exporter_authenticator(&self) -> &exporter_auth::Authenticator {
        &self.exporter_auth
    }

    pub fn secret_validity(&self) -> Duration {
        self.cfg.secret_validity
    }

    pub fn secret_rotation(&self) -> Duration {
        self.cfg.secret_rotation
    }

    pub fn is_public_network(&self, network: &str) -> bool {
        self.cfg.public_network.as_deref() == Some(network)
    }

    /// The bound listen address, available once `serve` is running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap()
    }

    /// Trigger graceful shutdown: sessions close, state is saved, the HTTP
    /// server drains.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Serve until shutdown. Reloads persisted network metadata first and
    /// saves it on the way out; a missing or broken state file is logged,
    /// never fatal.
    pub async fn serve(self: Arc<Self>) -> PeermapResult<()> {
        match state::load(&self.cfg.state_file) {
            Ok(states) => self.directory.load_states(states, self.cfg.rate_limiter),
            Err(err) => error!(%err, "load networks"),
        }
        #[cfg(unix)]
        tokio::spawn(watch_save_cycle(self.clone()));

        let listener = TcpListener::bind(&self.cfg.listen).await?;
        let addr = listener.local_addr()?;
        *self.local_addr.lock().unwrap() = Some(addr);
        info!(listen = %addr, "serving http");

        let app = self.router();
        let pm = self.clone();
        let mut shutdown_rx = self.shutdown.subscribe();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.wait_for(|s| *s).await;
                info!("graceful shutdown");
                for ctx in pm.directory.networks() {
                    for session in ctx.peers() {
                        session.close(&pm).await;
                    }
                }
            })
            .await?;

        if let Err(err) = state::save(&self.cfg.state_file, &self.directory.export_states()) {
            error!(%err, "save networks");
        }
        Ok(())
    }

    fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/", get(handle_peer_connect))
            .route("/networks", get(handle_query_networks))
            .route("/peers", get(handle_query_network_peers))
            .route("/network/:network/meta", put(handle_put_network_meta))
            .route("/network/token", get(handle_network_token))
            .route("/oidc/authorize/:provider", get(handle_oidc_authorize))
            .with_state(self.clone())
    }

    /// Issue a fresh network secret with the peer-facing expiry margin.
    pub fn generate_secret(&self, net: &Net) -> PeermapResult<NetworkSecret> {
        let validity = ChronoDuration::from_std(self.cfg.secret_validity)
            .map_err(|err| PeermapError::Encoding(err.to_string()))?;
        let (token, deadline) = self.authenticator.generate_secret(net, validity)?;
        // the peer-facing expiry leads the MAC deadline so agents rotate
        // before the token actually dies
        Ok(NetworkSecret {
            network: net.id.clone(),
            secret: token,
            expire: deadline - ChronoDuration::seconds(10),
        })
    }

    /// Push a rotated secret to one session and adopt the new claims.
    pub(crate) async fn push_new_secret(
        &self,
        ctx: &NetworkContext,
        session: &Arc<PeerSession>,
    ) -> PeermapResult<()> {
        let secret = self.generate_secret(&ctx.net())?;
        let payload =
            serde_json::to_vec(&secret).map_err(|err| PeermapError::Encoding(err.to_string()))?;
        let frame = Frame::new(
            ControlCode::UpdateNetworkSecret,
            session.id().clone(),
            payload,
        );
        session.write_frame(&frame).await?;
        let claims = self.authenticator.parse_secret(&secret.secret)?;
        session.set_claims(claims);
        Ok(())
    }

    /// Introduce a newly-joined session to every non-silent peer already in
    /// the network, in both directions.
    pub(crate) async fn broadcast_introductions(
        &self,
        ctx: &Arc<NetworkContext>,
        session: &Arc<PeerSession>,
    ) {
        for other in ctx.peers() {
            if other.id() == session.id() || other.metadata().silence_mode() {
                continue;
            }
            self.introduce(session, &other).await;
        }
    }

    async fn introduce(&self, a: &Arc<PeerSession>, b: &Arc<PeerSession>) {
        let to_b = Frame::new(
            ControlCode::NewPeer,
            a.id().clone(),
            a.metadata().encode().into_bytes(),
        );
        let _ = b.write_frame(&to_b).await;
        let to_a = Frame::new(
            ControlCode::NewPeer,
            b.id().clone(),
            b.metadata().encode().into_bytes(),
        );
        let _ = a.write_frame(&to_a).await;
    }

    /// Answer LEAD_DISCO: both ends receive the STUN server list, each
    /// addressed with the other's id, triggering their NAT engines.
    pub(crate) async fn broker_traversal(&self, a: &Arc<PeerSession>, b: &Arc<PeerSession>) {
        let to_a = Frame::new(ControlCode::NewPeer, b.id().clone(), self.stuns_json.clone());
        let _ = a.write_frame(&to_a).await;
        let to_b = Frame::new(ControlCode::NewPeer, a.id().clone(), self.stuns_json.clone());
        let _ = b.write_frame(&to_b).await;
    }

    fn check_exporter_token(&self, headers: &HeaderMap) -> bool {
        let Some(token) = header_str(headers, "x-token") else {
            return false;
        };
        match self.exporter_auth.check_token(token) {
            Ok(_) => true,
            Err(err) => {
                debug!(%err, "exporter auth failed");
                false
            }
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Removes a registered session if the upgrade never completes, so an
/// aborted handshake cannot poison its peer id.
struct SessionGuard {
    pm: Arc<PeerMap>,
    session: Arc<PeerSession>,
    armed: bool,
}

impl SessionGuard {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if self.armed {
            self.pm
                .directory
                .remove_session(self.session.network(), &self.session);
        }
    }
}

async fn handle_peer_connect(
    State(pm): State<Arc<PeerMap>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    // authenticate: the public network name passes as-is with a far-future
    // deadline, anything else must be a valid secret token
    let Some(network_header) = header_str(&headers, "x-network") else {
        return StatusCode::FORBIDDEN.into_response();
    };
    let claims = if pm.is_public_network(network_header) {
        SecretClaims {
            network: network_header.to_string(),
            alias: None,
            neighbors: Vec::new(),
            deadline: (Utc::now() + ChronoDuration::days(365 * 100)).timestamp(),
        }
    } else {
        match pm.authenticator.parse_secret(network_header) {
            Ok(claims) => claims,
            Err(err) => {
                debug!(%err, "authenticate failed");
                return StatusCode::FORBIDDEN.into_response();
            }
        }
    };

    let peer_id = match header_str(&headers, "x-peerid").map(str::parse::<PeerId>) {
        Some(Ok(id)) => id,
        _ => return StatusCode::FORBIDDEN.into_response(),
    };
    let nonce = match header_str(&headers, "x-nonce").map(str::parse::<u8>) {
        Some(Ok(nonce)) => nonce,
        _ => return StatusCode::FORBIDDEN.into_response(),
    };

    // metadata must be the plain URL-query form; input that decodes as
    // base64 is rejected to surface mistakenly-encoded headers
    let mut metadata = Metadata::new();
    if let Some(raw) = header_str(&headers, "x-metadata") {
        if !raw.is_empty() {
            if BASE64.decode(raw).is_ok() {
                return StatusCode::FORBIDDEN.into_response();
            }
            metadata = match Metadata::parse(raw) {
                Ok(meta) => meta,
                Err(_) => return StatusCode::FORBIDDEN.into_response(),
            };
        }
    }

    let ctx = pm
        .directory
        .get_or_create_network(&claims.network, pm.cfg.rate_limiter);
    let validity = ChronoDuration::from_std(pm.cfg.secret_validity).unwrap_or_default();
    ctx.init_meta(&claims.net(), claims.deadline_time() - validity);

    let session = PeerSession::new(
        peer_id.clone(),
        claims.network.clone(),
        nonce,
        metadata,
        claims,
        pm.cfg.rate_limiter,
    );
    if let Err(err) = pm.directory.insert_session(&ctx, &session) {
        debug!(%err, "peer id already in use");
        return StatusCode::BAD_REQUEST.into_response();
    }

    let guard = SessionGuard {
        pm: pm.clone(),
        session: session.clone(),
        armed: true,
    };
    let nonce_echo = headers.get("x-nonce").cloned();
    let stuns_b64 = BASE64.encode(&pm.stuns_json);
    let limiter = pm.cfg.rate_limiter;
    let pm_run = pm.clone();
    let mut response = ws.on_upgrade(move |socket| async move {
        let mut guard = guard;
        guard.disarm();
        info!(network = session.network(), peer = %session.id(), "peer connected");
        run_session(pm_run, ctx, session, socket).await;
    });

    let headers_out = response.headers_mut();
    if let Some(nonce) = nonce_echo {
        headers_out.insert("x-nonce", nonce);
    }
    if let Ok(v) = HeaderValue::from_str(&stuns_b64) {
        headers_out.insert("x-stuns", v);
    }
    if let Some(rl) = limiter {
        if let Ok(v) = HeaderValue::from_str(&rl.burst.to_string()) {
            headers_out.insert("x-limiter-burst", v);
        }
        if let Ok(v) = HeaderValue::from_str(&rl.limit.to_string()) {
            headers_out.insert("x-limiter-limit", v);
        }
    }
    response
}

async fn handle_query_networks(State(pm): State<Arc<PeerMap>>, headers: HeaderMap) -> Response {
    if !pm.check_exporter_token(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let networks: Vec<NetworkHead> = pm
        .directory
        .networks()
        .into_iter()
        .map(|ctx| NetworkHead {
            id: ctx.id.clone(),
            peers_count: ctx.peer_count(),
            create_time: ctx
                .create_time
                .timestamp_nanos_opt()
                .unwrap_or_default()
                .to_string(),
        })
        .collect();
    Json(networks).into_response()
}

async fn handle_query_network_peers(
    State(pm): State<Arc<PeerMap>>,
    headers: HeaderMap,
) -> Response {
    if !pm.check_exporter_token(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let networks: Vec<Network> = pm
        .directory
        .networks()
        .into_iter()
        .map(|ctx| Network {
            id: ctx.id.clone(),
            peers: ctx.peers().iter().map(|p| p.display_string()).collect(),
        })
        .collect();
    Json(networks).into_response()
}

async fn handle_put_network_meta(
    State(pm): State<Arc<PeerMap>>,
    Path(network): Path<String>,
    headers: HeaderMap,
    Json(request): Json<PutNetworkMetaRequest>,
) -> Response {
    if !pm.check_exporter_token(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let Some(ctx) = pm.directory.get_network(&network) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    if ctx.update_meta(request.alias, request.neighbors) {
        // every member re-keys so tokens carry the fresh neighbour list
        for session in ctx.peers() {
            if let Err(err) = pm.push_new_secret(&ctx, &session).await {
                error!(peer = %session.id(), %err, "secret fan-out failed");
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            }
        }
    }
    StatusCode::OK.into_response()
}

#[derive(Deserialize)]
struct OidcQuery {
    #[serde(default)]
    code: String,
    #[serde(default)]
    state: String,
}

async fn handle_oidc_authorize(
    State(pm): State<Arc<PeerMap>>,
    Path(provider): Path<String>,
    Query(query): Query<OidcQuery>,
) -> Response {
    let Some(resolver) = pm.oidc.provider(&provider) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    let email = match resolver.user_info(&query.code).await {
        Ok(email) => email,
        Err(err) => {
            error!(%err, "oidc user info");
            return (StatusCode::BAD_GATEWAY, format!("oidc: {}", err)).into_response();
        }
    };
    if email.is_empty() {
        return (StatusCode::BAD_GATEWAY, "oidc: email is required").into_response();
    }
    // the email is the network id; keep existing metadata if the network
    // is already known
    let net = match pm.directory.get_network(&email) {
        Some(ctx) => ctx.net(),
        None => Net {
            id: email,
            ..Default::default()
        },
    };
    let secret = match pm.generate_secret(&net) {
        Ok(secret) => secret,
        Err(_) => return StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    };
    if let Err(err) = pm.oidc.notify_token(&query.state, secret) {
        error!(%err, "oidc token notify");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    "ok".into_response()
}

async fn handle_network_token(
    State(pm): State<Arc<PeerMap>>,
    Query(query): Query<OidcQuery>,
) -> Response {
    if query.state.is_empty() {
        return StatusCode::BAD_REQUEST.into_response();
    }
    match pm.oidc.await_token(&query.state).await {
        Some(secret) => Json(secret).into_response(),
        None => StatusCode::REQUEST_TIMEOUT.into_response(),
    }
}

#[cfg(unix)]
async fn watch_save_cycle(pm: Arc<PeerMap>) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hup = match signal(SignalKind::hangup()) {
        Ok(sig) => sig,
        Err(err) => {
            error!(%err, "install SIGHUP handler");
            return;
        }
    };
    let mut shutdown_rx = pm.shutdown.subscribe();
    loop {
        tokio::select! {
            _ = shutdown_rx.wait_for(|s| *s) => return,
            sig = hup.recv() => {
                if sig.is_none() {
                    return;
                }
                if let Err(err) = state::save(&pm.cfg.state_file, &pm.directory.export_states()) {
                    error!(%err, "save networks");
                }
            }
        }
    }
}
