//! NAT traversal engine
//!
//! One dedicated UDP socket per remote peer. Discovery runs as serialized
//! events consumed by a single task, so the four event classes apply in a
//! deterministic order per agent; everything else only reads the peer map.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use peerguard_proto::{ControlCode, Datagram, Disco, PeerId};
use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, sleep};
use tracing::{debug, error, info, warn};

use crate::control::PeermapLink;
use crate::error::{P2pError, P2pResult};
use crate::stun;

/// Pause between binding requests to consecutive STUN servers.
const STUN_GAP: Duration = Duration::from_secs(3);
/// STUN transactions are garbage-collected past this age.
const STUN_TX_TIMEOUT: Duration = Duration::from_secs(30);
/// Public-address report retry schedule.
const ADDR_REPORT_ATTEMPTS: u32 = 3;
const ADDR_REPORT_GAP: Duration = Duration::from_millis(200);
/// Initial punch-through cadence, escalated to the keepalive interval once
/// the peer confirms or after this many shots.
const PUNCH_INTERVAL: Duration = Duration::from_millis(300);
const PUNCH_ESCALATE_AFTER: u32 = 24;
/// Disco2 may race ahead of Disco1; the event is retried briefly.
const DISCO2_RETRY_GAP: Duration = Duration::from_millis(100);
const DISCO2_RETRY_MAX: u32 = 50;

/// Serialized discovery events.
pub(crate) enum PeerEvent {
    /// Begin discovery: a fresh socket is dedicated to the peer
    Disco1 {
        peer: PeerId,
        socket: Arc<UdpSocket>,
        closer: watch::Sender<bool>,
    },
    /// The remote's learned public address arrived
    Disco2 {
        peer: PeerId,
        addr: SocketAddr,
        attempt: u32,
    },
    /// A ping from the remote validated the path
    Confirm { peer: PeerId, addr: SocketAddr },
    /// Sweep stale contexts and transactions
    Healthcheck,
}

struct PeerContext {
    addr: Option<SocketAddr>,
    socket: Arc<UdpSocket>,
    closer: watch::Sender<bool>,
    last_valid: Option<Instant>,
    update_time: Instant,
}

impl PeerContext {
    fn fresh(&self, keepalive: Duration) -> bool {
        self.last_valid
            .map(|t| t.elapsed() <= 2 * keepalive)
            .unwrap_or(false)
    }
}

struct StunBinding {
    peer_id: PeerId,
    created: Instant,
}

pub(crate) struct NatEngine {
    peer_id: PeerId,
    keepalive: Duration,
    disco: Disco,
    link: Arc<PeermapLink>,
    peers: RwLock<HashMap<PeerId, PeerContext>>,
    stun_servers: StdMutex<Vec<String>>,
    stun_tx_map: DashMap<stun::TxId, StunBinding>,
    event_tx: mpsc::Sender<PeerEvent>,
    stun_tx: mpsc::Sender<Vec<u8>>,
    inbound_tx: mpsc::Sender<Datagram>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl NatEngine {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        peer_id: PeerId,
        keepalive: Duration,
        disco: Disco,
        stun_servers: Vec<String>,
        link: Arc<PeermapLink>,
        event_tx: mpsc::Sender<PeerEvent>,
        stun_tx: mpsc::Sender<Vec<u8>>,
        inbound_tx: mpsc::Sender<Datagram>,
        shutdown: Arc<watch::Sender<bool>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            peer_id,
            keepalive,
            disco,
            link,
            peers: RwLock::new(HashMap::new()),
            stun_servers: StdMutex::new(stun_servers),
            stun_tx_map: DashMap::new(),
            event_tx,
            stun_tx,
            inbound_tx,
            shutdown,
        })
    }

    /// Spawn the event consumer, the STUN response dispatcher, and the
    /// healthcheck timer.
    pub(crate) fn start(
        self: &Arc<Self>,
        mut event_rx: mpsc::Receiver<PeerEvent>,
        mut stun_rx: mpsc::Receiver<Vec<u8>>,
    ) {
        let engine = self.clone();
        tokio::spawn(async move {
            let mut shutdown = engine.shutdown.subscribe();
            loop {
                let event = tokio::select! {
                    _ = shutdown.wait_for(|s| *s) => return,
                    event = event_rx.recv() => match event {
                        Some(event) => event,
                        None => return,
                    },
                };
                engine.handle_peer_event(event);
            }
        });

        let engine = self.clone();
        tokio::spawn(async move {
            let mut shutdown = engine.shutdown.subscribe();
            loop {
                let resp = tokio::select! {
                    _ = shutdown.wait_for(|s| *s) => return,
                    resp = stun_rx.recv() => match resp {
                        Some(resp) => resp,
                        None => return,
                    },
                };
                engine.handle_stun_response(resp).await;
            }
        });

        let engine = self.clone();
        tokio::spawn(async move {
            let mut shutdown = engine.shutdown.subscribe();
            let mut ticker = interval(engine.keepalive / 2 + Duration::from_secs(1));
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.wait_for(|s| *s) => return,
                    _ = ticker.tick() => {}
                }
                let _ = engine.event_tx.send(PeerEvent::Healthcheck).await;
            }
        });
    }

    /// All peer-map mutation funnels through here, one event at a time.
    fn handle_peer_event(&self, event: PeerEvent) {
        let mut peers = self.peers.write().unwrap();
        match event {
            PeerEvent::Disco1 {
                peer,
                socket,
                closer,
            } => {
                let mut ctx = PeerContext {
                    addr: None,
                    socket,
                    closer,
                    last_valid: None,
                    update_time: Instant::now(),
                };
                if let Some(old) = peers.remove(&peer) {
                    let _ = old.closer.send(true);
                    info!(%peer, addr = ?old.addr, "replacing peer socket");
                    ctx.addr = old.addr;
                }
                peers.insert(peer, ctx);
            }
            PeerEvent::Disco2 {
                peer,
                addr,
                attempt,
            } => {
                if let Some(ctx) = peers.get_mut(&peer) {
                    ctx.addr = Some(addr);
                    ctx.update_time = Instant::now();
                } else if attempt < DISCO2_RETRY_MAX {
                    debug!(%peer, %addr, attempt, "peer context not ready, retrying");
                    let event_tx = self.event_tx.clone();
                    tokio::spawn(async move {
                        sleep(DISCO2_RETRY_GAP).await;
                        let _ = event_tx
                            .send(PeerEvent::Disco2 {
                                peer,
                                addr,
                                attempt: attempt + 1,
                            })
                            .await;
                    });
                }
            }
            PeerEvent::Confirm { peer, addr } => {
                debug!(%peer, %addr, "direct path heartbeat");
                if let Some(ctx) = peers.get_mut(&peer) {
                    if let Some(expected) = ctx.addr {
                        if expected != addr {
                            debug!(%peer, %addr, %expected, "ping from unexpected address");
                            return;
                        }
                    }
                    let was_stale = !ctx.fresh(self.keepalive);
                    ctx.last_valid = Some(Instant::now());
                    ctx.addr = Some(addr);
                    if was_stale {
                        info!(%peer, %addr, "direct path established");
                    }
                }
            }
            PeerEvent::Healthcheck => {
                let keepalive = self.keepalive;
                peers.retain(|peer, ctx| {
                    let keep = ctx.fresh(keepalive) || ctx.update_time.elapsed() <= 2 * keepalive;
                    if !keep {
                        let _ = ctx.closer.send(true);
                        info!(%peer, addr = ?ctx.addr, "removing stale peer");
                    }
                    keep
                });
                self.stun_tx_map
                    .retain(|_, binding| binding.created.elapsed() <= STUN_TX_TIMEOUT);
            }
        }
    }

    /// Replace the advertised STUN server list (upgrade headers and
    /// redials refresh it).
    pub(crate) fn set_stun_servers(&self, servers: Vec<String>) {
        if !servers.is_empty() {
            *self.stun_servers.lock().unwrap() = servers;
        }
    }

    /// Begin discovery toward `peer`: dedicate a socket, start its read
    /// loop, and walk the STUN server list until the peer is reachable.
    pub(crate) async fn request_stun(self: Arc<Self>, peer: PeerId, servers: Vec<String>) {
        let socket = match UdpSocket::bind("0.0.0.0:0").await {
            Ok(socket) => Arc::new(socket),
            Err(err) => {
                error!(%err, "udp bind failed");
                return;
            }
        };
        let (closer, closer_rx) = watch::channel(false);
        tokio::spawn(self.clone().run_udp_read_loop(socket.clone(), closer_rx));
        if self
            .event_tx
            .send(PeerEvent::Disco1 {
                peer: peer.clone(),
                socket: socket.clone(),
                closer,
            })
            .await
            .is_err()
        {
            return;
        }

        if !servers.is_empty() {
            *self.stun_servers.lock().unwrap() = servers;
        }
        let servers = self.stun_servers.lock().unwrap().clone();
        if servers.is_empty() {
            return;
        }

        let tx_id = stun::new_tx_id();
        self.stun_tx_map.insert(
            tx_id,
            StunBinding {
                peer_id: peer.clone(),
                created: Instant::now(),
            },
        );
        let mut shutdown = self.shutdown.subscribe();
        for server in servers {
            let addr = match lookup_host(&server).await.ok().and_then(|mut a| a.next()) {
                Some(addr) => addr,
                None => {
                    warn!(%server, "stun server did not resolve");
                    continue;
                }
            };
            if let Err(err) = socket.send_to(&stun::request(&tx_id), addr).await {
                warn!(%server, %err, "stun request failed");
                continue;
            }
            tokio::select! {
                _ = shutdown.wait_for(|s| *s) => return,
                _ = sleep(STUN_GAP) => {}
            }
            if self.peer_connected(&peer) {
                break;
            }
        }
    }

    /// A STUN response arrived on some peer socket: resolve the pending
    /// transaction and report the discovered address to its peer.
    async fn handle_stun_response(&self, resp: Vec<u8>) {
        let (tx_id, addr) = match stun::parse_response(&resp) {
            Ok(parsed) => parsed,
            Err(err) => {
                error!(%err, "skipped invalid stun response");
                return;
            }
        };
        let Some((_, binding)) = self.stun_tx_map.remove(&tx_id) else {
            error!("skipped stun response with unknown transaction");
            return;
        };
        for i in 0..ADDR_REPORT_ATTEMPTS {
            match self
                .link
                .write_frame(
                    ControlCode::NewPeerUdpAddr,
                    &binding.peer_id,
                    addr.to_string().as_bytes(),
                )
                .await
            {
                Ok(()) => {
                    info!(%addr, "node public address found");
                    break;
                }
                Err(err) => {
                    debug!(%err, attempt = i, "address report failed");
                    sleep(ADDR_REPORT_GAP).await;
                }
            }
        }
    }

    /// The remote reported its public address: record it and punch.
    pub(crate) async fn on_peer_udp_addr(self: &Arc<Self>, peer: PeerId, addr: SocketAddr) {
        let _ = self
            .event_tx
            .send(PeerEvent::Disco2 {
                peer: peer.clone(),
                addr,
                attempt: 0,
            })
            .await;
        tokio::spawn(self.clone().punch_loop(peer, addr));
    }

    /// Emit pings until the pinhole opens, then settle into the keepalive
    /// cadence; exit once the peer goes stale at that cadence.
    async fn punch_loop(self: Arc<Self>, peer: PeerId, addr: SocketAddr) {
        let mut shutdown = self.shutdown.subscribe();
        let ping = self.disco.new_ping(&self.peer_id);
        let mut cadence = PUNCH_INTERVAL;
        let mut i = 0u32;
        loop {
            if *shutdown.borrow() {
                info!(%peer, "punch loop exit");
                return;
            }
            let discovered = self.peer_by_addr(&addr).is_some();
            if cadence == self.keepalive && !discovered {
                break;
            }
            if discovered || i >= PUNCH_ESCALATE_AFTER {
                cadence = self.keepalive;
            }
            debug!(%peer, %addr, "punch ping");
            // the context may trail the address report by an event or two;
            // failed shots are retried at the next cadence
            if let Err(err) = self.write_to_udp(&peer, &ping).await {
                debug!(%peer, %err, "punch ping not sent");
            }
            tokio::select! {
                _ = shutdown.wait_for(|s| *s) => return,
                _ = sleep(cadence) => {}
            }
            i += 1;
        }
    }

    /// Per-socket read loop: pings confirm the path, STUN goes to the
    /// dispatcher, everything else is payload from the socket's peer.
    async fn run_udp_read_loop(
        self: Arc<Self>,
        socket: Arc<UdpSocket>,
        mut closer: watch::Receiver<bool>,
    ) {
        let mut shutdown = self.shutdown.subscribe();
        let mut buf = vec![0u8; 65535];
        loop {
            let (n, from) = tokio::select! {
                _ = shutdown.wait_for(|s| *s) => return,
                _ = closer.wait_for(|c| *c) => return,
                r = socket.recv_from(&mut buf) => match r {
                    Ok(r) => r,
                    Err(err) => {
                        debug!(%err, "udp read loop exit");
                        return;
                    }
                },
            };
            if let Some(peer) = self.disco.parse_ping(&buf[..n]) {
                let _ = self
                    .event_tx
                    .send(PeerEvent::Confirm { peer, addr: from })
                    .await;
                continue;
            }
            if stun::is(&buf[..n]) {
                let _ = self.stun_tx.send(buf[..n].to_vec()).await;
                continue;
            }
            let Some(peer) = self.peer_by_addr(&from) else {
                debug!(%from, "datagram from unknown source");
                continue;
            };
            // bounded queue: blocking here backpressures the socket
            if self
                .inbound_tx
                .send(Datagram {
                    peer_id: peer,
                    data: buf[..n].to_vec(),
                })
                .await
                .is_err()
            {
                return;
            }
        }
    }

    /// A direct path is live iff the last validation ping arrived within
    /// twice the keepalive interval.
    pub(crate) fn peer_connected(&self, peer: &PeerId) -> bool {
        self.peers
            .read()
            .unwrap()
            .get(peer)
            .map(|ctx| ctx.fresh(self.keepalive))
            .unwrap_or(false)
    }

    pub(crate) fn connected_peers(&self) -> Vec<PeerId> {
        self.peers
            .read()
            .unwrap()
            .iter()
            .filter(|(_, ctx)| ctx.fresh(self.keepalive))
            .map(|(peer, _)| peer.clone())
            .collect()
    }

    fn peer_by_addr(&self, addr: &SocketAddr) -> Option<PeerId> {
        self.peers
            .read()
            .unwrap()
            .iter()
            .find(|(_, ctx)| ctx.fresh(self.keepalive) && ctx.addr.as_ref() == Some(addr))
            .map(|(peer, _)| peer.clone())
    }

    /// Send on the peer's dedicated socket; absent context or address is a
    /// closed pipe.
    pub(crate) async fn write_to_udp(&self, peer: &PeerId, payload: &[u8]) -> P2pResult<usize> {
        let (socket, addr) = {
            let peers = self.peers.read().unwrap();
            let ctx = peers.get(peer).ok_or(P2pError::TransportClosed)?;
            let addr = ctx.addr.ok_or(P2pError::TransportClosed)?;
            (ctx.socket.clone(), addr)
        };
        debug!(%peer, %addr, "udp write");
        Ok(socket.send_to(payload, addr).await?)
    }
}
