//! Peermap control path
//!
//! Dials the peermap endpoints in order, demultiplexes control codes to the
//! NAT engine and the packet queues, and redials with backoff when the
//! session drops.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use peerguard_auth::NetworkSecret;
use peerguard_proto::{xor_nonce, ControlCode, Datagram, Frame, Metadata, PeerId};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{P2pError, P2pResult};
use crate::nat::NatEngine;

const CLOSE_DEADLINE: Duration = Duration::from_secs(2);
const REDIAL_BACKOFF_MAX: Duration = Duration::from_secs(30);

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// The agent's half of a peermap session: nonce, current secret, and the
/// write side of the WebSocket behind its mutex.
pub(crate) struct PeermapLink {
    nonce: u8,
    token: StdMutex<String>,
    secret: StdMutex<Option<NetworkSecret>>,
    sink: Mutex<Option<WsSink>>,
}

impl PeermapLink {
    pub(crate) fn new(nonce: u8, token: String) -> Arc<Self> {
        Arc::new(Self {
            nonce,
            token: StdMutex::new(token),
            secret: StdMutex::new(None),
            sink: Mutex::new(None),
        })
    }

    pub(crate) fn nonce(&self) -> u8 {
        self.nonce
    }

    pub(crate) fn current_token(&self) -> String {
        self.token.lock().unwrap().clone()
    }

    pub(crate) fn network_secret(&self) -> Option<NetworkSecret> {
        self.secret.lock().unwrap().clone()
    }

    /// Adopt a pushed secret. Applying the same blob twice is a no-op.
    pub(crate) fn update_secret(&self, secret: NetworkSecret) -> bool {
        let mut current = self.secret.lock().unwrap();
        if current.as_ref() == Some(&secret) {
            return false;
        }
        *self.token.lock().unwrap() = secret.secret.clone();
        *current = Some(secret);
        true
    }

    pub(crate) async fn attach(&self, sink: WsSink) {
        *self.sink.lock().await = Some(sink);
    }

    pub(crate) async fn detach(&self) {
        *self.sink.lock().await = None;
    }

    /// Obfuscate and send one control frame to the peermap.
    pub(crate) async fn write_frame(
        &self,
        code: ControlCode,
        addr: &PeerId,
        payload: &[u8],
    ) -> P2pResult<()> {
        let mut wire = Frame::new(code, addr.clone(), payload.to_vec()).encode();
        xor_nonce(&mut wire, self.nonce);
        self.send_message(Message::Binary(wire)).await
    }

    async fn send_message(&self, msg: Message) -> P2pResult<()> {
        let mut sink = self.sink.lock().await;
        let sink = sink.as_mut().ok_or(P2pError::TransportClosed)?;
        sink.send(msg)
            .await
            .map_err(|_| P2pError::TransportClosed)
    }

    async fn send_pong(&self, payload: Vec<u8>) -> P2pResult<()> {
        self.send_message(Message::Pong(payload)).await
    }

    /// Emit a normal closure with a bounded deadline and drop the sink.
    pub(crate) async fn close(&self) {
        let mut sink = self.sink.lock().await;
        if let Some(mut ws) = sink.take() {
            let close = Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "".into(),
            }));
            let _ = timeout(CLOSE_DEADLINE, ws.send(close)).await;
        }
    }
}

/// Upgrade-time information returned by the peermap.
pub(crate) struct DialInfo {
    pub stream: SplitStream<WsStream>,
    pub stuns: Vec<String>,
}

/// Try each peermap endpoint in order until one accepts the session.
pub(crate) async fn dial(
    cfg: &Config,
    nonce: u8,
    token: &str,
) -> P2pResult<(WsSink, DialInfo)> {
    let mut metadata = Metadata::new();
    for (k, v) in &cfg.metadata {
        metadata.add(k.clone(), v.clone());
    }
    let metadata = metadata.encode();

    let mut last_err = "no peermap endpoint".to_string();
    for url in &cfg.peermap {
        let mut request = match url.as_str().into_client_request() {
            Ok(request) => request,
            Err(err) => {
                last_err = format!("{}: {}", url, err);
                continue;
            }
        };
        let mut pairs = vec![
            ("X-Network", token.to_string()),
            ("X-PeerID", cfg.peer_id.clone()),
            ("X-Nonce", nonce.to_string()),
        ];
        if !metadata.is_empty() {
            pairs.push(("X-Metadata", metadata.clone()));
        }
        let headers = request.headers_mut();
        for (name, value) in pairs.drain(..) {
            let value = HeaderValue::from_str(&value)
                .map_err(|err| P2pError::Dial(format!("invalid {} header: {}", name, err)))?;
            headers.insert(name, value);
        }

        match connect_async(request).await {
            Ok((ws, response)) => {
                let echoed = response
                    .headers()
                    .get("x-nonce")
                    .and_then(|v| v.to_str().ok());
                if echoed != Some(nonce.to_string().as_str()) {
                    warn!(%url, "peermap did not echo the session nonce");
                }
                let stuns = response
                    .headers()
                    .get("x-stuns")
                    .and_then(|v| BASE64.decode(v.as_bytes()).ok())
                    .and_then(|raw| serde_json::from_slice::<Vec<String>>(&raw).ok())
                    .unwrap_or_default();
                info!(%url, "peermap session established");
                let (sink, stream) = ws.split();
                return Ok((sink, DialInfo { stream, stuns }));
            }
            Err(err) => {
                last_err = format!("{}: {}", url, err);
                warn!(%url, %err, "peermap dial failed");
            }
        }
    }
    Err(P2pError::Dial(last_err))
}

/// Consume the session until it drops, then redial if configured. When the
/// link is gone for good the whole connection shuts down.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn run_control_loop(
    cfg: Config,
    link: Arc<PeermapLink>,
    engine: Arc<NatEngine>,
    mut stream: SplitStream<WsStream>,
    inbound_tx: mpsc::Sender<Datagram>,
    control_tx: mpsc::Sender<Vec<u8>>,
    shutdown: Arc<watch::Sender<bool>>,
) {
    let mut shutdown_rx = shutdown.subscribe();
    'session: loop {
        loop {
            let msg = tokio::select! {
                _ = shutdown_rx.wait_for(|s| *s) => return,
                msg = stream.next() => msg,
            };
            match msg {
                Some(Ok(Message::Binary(b))) => {
                    handle_frame(&link, &engine, &inbound_tx, &control_tx, b).await;
                }
                Some(Ok(Message::Ping(payload))) => {
                    let _ = link.send_pong(payload).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {} // keepalive text refreshes nothing here
                Some(Err(err)) => {
                    debug!(%err, "peermap read failed");
                    break;
                }
            }
        }
        link.detach().await;
        if !cfg.reconnect || *shutdown_rx.borrow() {
            break 'session;
        }

        let mut backoff = Duration::from_secs(1);
        loop {
            tokio::select! {
                _ = shutdown_rx.wait_for(|s| *s) => return,
                _ = sleep(backoff) => {}
            }
            match dial(&cfg, link.nonce(), &link.current_token()).await {
                Ok((sink, info)) => {
                    link.attach(sink).await;
                    engine.set_stun_servers(info.stuns);
                    stream = info.stream;
                    continue 'session;
                }
                Err(err) => {
                    warn!(%err, "peermap redial failed");
                    backoff = (backoff * 2).min(REDIAL_BACKOFF_MAX);
                }
            }
        }
    }
    let _ = shutdown.send(true);
}

async fn handle_frame(
    link: &Arc<PeermapLink>,
    engine: &Arc<NatEngine>,
    inbound_tx: &mpsc::Sender<Datagram>,
    control_tx: &mpsc::Sender<Vec<u8>>,
    mut b: Vec<u8>,
) {
    xor_nonce(&mut b, link.nonce());
    let frame = match Frame::decode(&b) {
        Ok(frame) => frame,
        Err(err) => {
            warn!(%err, "dropping malformed frame");
            return;
        }
    };
    match frame.code {
        ControlCode::Relay => {
            let _ = inbound_tx
                .send(Datagram {
                    peer_id: frame.addr,
                    data: frame.payload,
                })
                .await;
        }
        ControlCode::NewPeer => {
            // a JSON server list is a brokered traversal trigger; anything
            // else is an introduction carrying the peer's metadata
            if let Ok(servers) = serde_json::from_slice::<Vec<String>>(&frame.payload) {
                tokio::spawn(engine.clone().request_stun(frame.addr, servers));
            } else if !engine.peer_connected(&frame.addr) {
                debug!(peer = %frame.addr, "introduced, requesting brokered discovery");
                let _ = link
                    .write_frame(ControlCode::LeadDisco, &frame.addr, &[])
                    .await;
            }
        }
        ControlCode::NewPeerUdpAddr => {
            let addr = std::str::from_utf8(&frame.payload)
                .ok()
                .and_then(|s| s.parse::<SocketAddr>().ok());
            match addr {
                Some(addr) => engine.on_peer_udp_addr(frame.addr, addr).await,
                None => warn!(peer = %frame.addr, "undecodable peer udp address"),
            }
        }
        ControlCode::UpdateNetworkSecret => {
            match serde_json::from_slice::<NetworkSecret>(&frame.payload) {
                Ok(secret) => {
                    if link.update_secret(secret) {
                        debug!("network secret rotated");
                    }
                }
                Err(err) => warn!(%err, "undecodable network secret"),
            }
        }
        ControlCode::ControlConn => {
            let _ = control_tx.send(frame.payload).await;
        }
        // server-bound; nothing to do on the agent
        ControlCode::LeadDisco => {}
    }
}
