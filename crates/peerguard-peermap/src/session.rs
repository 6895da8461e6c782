//! Peermap peer session
//!
//! One long-lived WebSocket per peer: a read loop dispatching control
//! frames, a keepalive loop that also drives secret rotation, and an
//! in-band byte stream multiplexed under `CONTROL_CONN`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use peerguard_auth::SecretClaims;
use peerguard_proto::{xor_nonce, ControlCode, Frame, Metadata, PeerId};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::{interval, timeout};
use tracing::{debug, warn};

use crate::config::RateLimiterConfig;
use crate::directory::NetworkContext;
use crate::error::{PeermapError, PeermapResult};
use crate::ratelimit::RateLimiter;
use crate::server::PeerMap;

/// Server keepalive cadence.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(12);
/// A session silent for longer than this is closing.
const INACTIVE_TIMEOUT: Duration = Duration::from_secs(25);
/// Write deadline for the WebSocket close frame.
const CLOSE_DEADLINE: Duration = Duration::from_secs(2);
/// Bound of the in-band CONTROL_CONN queue.
const CONN_QUEUE: usize = 128;

type WsSink = SplitSink<WebSocket, Message>;

struct ConnReader {
    rx: mpsc::Receiver<Vec<u8>>,
    buf: Vec<u8>,
}

/// One authenticated peer session.
pub struct PeerSession {
    id: PeerId,
    network: String,
    nonce: u8,
    metadata: Metadata,
    claims: StdMutex<SecretClaims>,
    active_at: StdMutex<Instant>,
    sink: Mutex<Option<WsSink>>,
    conn_tx: mpsc::Sender<Vec<u8>>,
    conn_rx: Mutex<ConnReader>,
    read_limiter: Option<RateLimiter>,
    write_limiter: Option<RateLimiter>,
    closed: AtomicBool,
    closed_tx: watch::Sender<bool>,
}

impl PeerSession {
    pub fn new(
        id: PeerId,
        network: String,
        nonce: u8,
        metadata: Metadata,
        claims: SecretClaims,
        limiter: Option<RateLimiterConfig>,
    ) -> Arc<Self> {
        let (conn_tx, conn_rx) = mpsc::channel(CONN_QUEUE);
        let (closed_tx, _) = watch::channel(false);
        let mk_limiter = || {
            limiter
                .filter(|rl| rl.limit > 0)
                .map(|rl| RateLimiter::new(rl.limit, rl.burst))
        };
        Arc::new(Self {
            id,
            network,
            nonce,
            metadata,
            claims: StdMutex::new(claims),
            active_at: StdMutex::new(Instant::now()),
            sink: Mutex::new(None),
            conn_tx,
            conn_rx: Mutex::new(ConnReader {
                rx: conn_rx,
                buf: Vec::new(),
            }),
            read_limiter: mk_limiter(),
            write_limiter: mk_limiter(),
            closed: AtomicBool::new(false),
            closed_tx,
        })
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn network(&self) -> &str {
        &self.network
    }

    pub fn nonce(&self) -> u8 {
        self.nonce
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn claims(&self) -> SecretClaims {
        self.claims.lock().unwrap().clone()
    }

    pub fn set_claims(&self, claims: SecretClaims) {
        *self.claims.lock().unwrap() = claims;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Renders as `pg://<id>?<metadata>`, the exporter's peer string form.
    pub fn display_string(&self) -> String {
        let query = self.metadata.encode();
        if query.is_empty() {
            format!("pg://{}", self.id)
        } else {
            format!("pg://{}?{}", self.id, query)
        }
    }

    fn touch(&self) {
        *self.active_at.lock().unwrap() = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.active_at.lock().unwrap().elapsed()
    }

    pub(crate) async fn attach(&self, sink: WsSink) {
        *self.sink.lock().await = Some(sink);
    }

    /// Obfuscate and send one control frame.
    pub async fn write_frame(&self, frame: &Frame) -> PeermapResult<()> {
        let mut wire = frame.encode();
        xor_nonce(&mut wire, self.nonce);
        self.send_message(Message::Binary(wire)).await
    }

    async fn send_message(&self, msg: Message) -> PeermapResult<()> {
        let mut sink = self.sink.lock().await;
        let Some(sink) = sink.as_mut() else {
            return Err(PeermapError::SessionClosed);
        };
        sink.send(msg)
            .await
            .map_err(|e| PeermapError::Transport(e.to_string()))
    }

    async fn send_keepalive(&self) -> PeermapResult<()> {
        self.send_message(Message::Text(String::new())).await
    }

    /// Read from the in-band stream, blocking until bytes arrive. Returns
    /// `SessionClosed` once the session is gone and the queue is drained.
    pub async fn read(&self, buf: &mut [u8]) -> PeermapResult<usize> {
        let n = {
            let mut reader = self.conn_rx.lock().await;
            if !reader.buf.is_empty() {
                let n = buf.len().min(reader.buf.len());
                buf[..n].copy_from_slice(&reader.buf[..n]);
                reader.buf.drain(..n);
                n
            } else {
                let mut closed = self.closed_tx.subscribe();
                let data = tokio::select! {
                    data = reader.rx.recv() => data.ok_or(PeermapError::SessionClosed)?,
                    _ = closed.wait_for(|c| *c) => return Err(PeermapError::SessionClosed),
                };
                let n = buf.len().min(data.len());
                buf[..n].copy_from_slice(&data[..n]);
                if n < data.len() {
                    reader.buf = data[n..].to_vec();
                }
                n
            }
        };
        if let Some(rl) = &self.read_limiter {
            rl.wait_n(n).await;
        }
        Ok(n)
    }

    /// Write to the in-band stream: rate-limited, framed as CONTROL_CONN.
    pub async fn write(&self, b: &[u8]) -> PeermapResult<usize> {
        if let Some(rl) = &self.write_limiter {
            rl.wait_n(b.len()).await;
        }
        let frame = Frame::new(ControlCode::ControlConn, self.id.clone(), b.to_vec());
        self.write_frame(&frame).await?;
        Ok(b.len())
    }

    /// Tear the session down: deregister, emit a normal closure with a
    /// bounded write deadline, wake every waiter.
    pub async fn close(self: &Arc<Self>, pm: &PeerMap) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        pm.directory().remove_session(&self.network, self);
        let _ = self.closed_tx.send(true);
        let mut sink = self.sink.lock().await;
        if let Some(mut ws) = sink.take() {
            let close = Message::Close(Some(CloseFrame {
                code: close_code::NORMAL,
                reason: "".into(),
            }));
            let _ = timeout(CLOSE_DEADLINE, ws.send(close)).await;
        }
    }
}

/// Drive one upgraded session to completion.
pub(crate) async fn run_session(
    pm: Arc<PeerMap>,
    ctx: Arc<NetworkContext>,
    session: Arc<PeerSession>,
    socket: WebSocket,
) {
    let (sink, stream) = socket.split();
    session.attach(sink).await;
    session.touch();

    let keepalive = tokio::spawn(keepalive_loop(
        pm.clone(),
        ctx.clone(),
        session.clone(),
    ));

    if !session.metadata().silence_mode() && !pm.is_public_network(session.network()) {
        pm.broadcast_introductions(&ctx, &session).await;
    }

    read_loop(&pm, &ctx, &session, stream).await;
    session.close(&pm).await;
    let _ = keepalive.await;
}

async fn keepalive_loop(pm: Arc<PeerMap>, ctx: Arc<NetworkContext>, session: Arc<PeerSession>) {
    let mut closed = session.closed_tx.subscribe();
    let mut ticker = interval(KEEPALIVE_INTERVAL);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = closed.wait_for(|c| *c) => break,
            _ = ticker.tick() => {}
        }
        if session.send_keepalive().await.is_err() {
            break;
        }
        if session.idle_for() > INACTIVE_TIMEOUT {
            debug!(peer = %session.id(), "closing inactive session");
            break;
        }
        let remaining = session.claims().deadline_time() - chrono::Utc::now();
        let threshold = pm.secret_validity() - pm.secret_rotation();
        if remaining.to_std().unwrap_or_default() < threshold {
            if let Err(err) = pm.push_new_secret(&ctx, &session).await {
                warn!(peer = %session.id(), %err, "network secret refresh failed");
            }
        }
    }
    session.close(&pm).await;
}

async fn read_loop(
    pm: &Arc<PeerMap>,
    ctx: &Arc<NetworkContext>,
    session: &Arc<PeerSession>,
    mut stream: SplitStream<WebSocket>,
) {
    let mut closed = session.closed_tx.subscribe();
    loop {
        let msg = tokio::select! {
            _ = closed.wait_for(|c| *c) => return,
            msg = stream.next() => msg,
        };
        let msg = match msg {
            Some(Ok(msg)) => msg,
            Some(Err(err)) => {
                debug!(peer = %session.id(), %err, "read loop exited");
                return;
            }
            None => return,
        };
        session.touch();
        let mut b = match msg {
            Message::Binary(b) => b,
            Message::Ping(p) => {
                let _ = session.send_message(Message::Pong(p)).await;
                continue;
            }
            Message::Close(_) => return,
            // text/pong only refresh activity
            _ => continue,
        };

        xor_nonce(&mut b, session.nonce());
        let frame = match Frame::decode(&b) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(peer = %session.id(), %err, "dropping malformed frame");
                continue;
            }
        };

        // discovery frames draw from their own budget so brokerage keeps
        // flowing when the data plane is saturated
        if frame.code.is_discovery() {
            ctx.disco_limiter.wait_n(b.len()).await;
        } else if let Some(rl) = &ctx.ratelimiter {
            rl.wait_n(b.len()).await;
        }

        debug!(op = %frame.code, from = %session.id(), to = %frame.addr, "peer event");
        match frame.code {
            ControlCode::ControlConn => {
                // address field is the sender's own id; payload goes to the
                // session's in-band queue (bounded, backpressures the read)
                if session.conn_tx.send(frame.payload).await.is_err() {
                    return;
                }
            }
            ControlCode::LeadDisco => {
                let Some(target) = pm.directory().find_peer(ctx, &frame.addr) else {
                    debug!(peer = %frame.addr, "discovery target not found");
                    continue;
                };
                pm.broker_traversal(session, &target).await;
            }
            _ => {
                let Some(target) = pm.directory().find_peer(ctx, &frame.addr) else {
                    debug!(peer = %frame.addr, "forward target not found");
                    continue;
                };
                // rewrite the address field from target to source
                let forwarded = Frame::new(frame.code, session.id().clone(), frame.payload);
                let _ = target.write_frame(&forwarded).await;
            }
        }
    }
}
