//! Packet connection facade
//!
//! The datagram interface handed to upstream consumers: reads pop the
//! inbound queue, writes take the direct UDP path when the target's last
//! validation ping is recent enough and fall back to relaying otherwise.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use peerguard_auth::NetworkSecret;
use peerguard_proto::{ControlCode, Datagram, Disco, PeerId, SymmAlgo};
use rand::Rng;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::timeout_at;
use tracing::debug;

use crate::config::Config;
use crate::control::{self, PeermapLink};
use crate::error::{P2pError, P2pResult};
use crate::nat::NatEngine;

/// Bound of the datagram inbound queue.
const INBOUND_QUEUE: usize = 1000;
/// Bound of the in-band CONTROL_CONN queue.
const CONTROL_QUEUE: usize = 128;
/// Bound of the serialized discovery event queue.
const EVENT_QUEUE: usize = 256;
/// Bound of the STUN response dispatch queue.
const STUN_QUEUE: usize = 64;

/// A packet-oriented connection addressed by peer ids.
pub struct PacketConn {
    peer_id: PeerId,
    mtu: usize,
    symm: Option<Arc<dyn SymmAlgo>>,
    engine: Arc<NatEngine>,
    link: Arc<PeermapLink>,
    inbound: Mutex<mpsc::Receiver<Datagram>>,
    control: Mutex<mpsc::Receiver<Vec<u8>>>,
    read_deadline: StdMutex<Option<Instant>>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl PacketConn {
    /// Dial the peermap and start the agent tasks: the control loop, the
    /// discovery event consumer, the STUN dispatcher, and the healthcheck
    /// timer.
    pub async fn open(cfg: Config) -> P2pResult<Self> {
        let peer_id = cfg.validate()?;
        let nonce: u8 = rand::thread_rng().gen_range(10..=99);

        let link = PeermapLink::new(nonce, cfg.network.clone());
        let (sink, info) = control::dial(&cfg, nonce, &cfg.network).await?;
        link.attach(sink).await;

        let (shutdown, _) = watch::channel(false);
        let shutdown = Arc::new(shutdown);
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE);
        let (stun_tx, stun_rx) = mpsc::channel(STUN_QUEUE);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
        let (control_tx, control_rx) = mpsc::channel(CONTROL_QUEUE);

        let engine = NatEngine::new(
            peer_id.clone(),
            cfg.keepalive_interval,
            Disco::new(cfg.ping_magic.clone()),
            info.stuns,
            link.clone(),
            event_tx,
            stun_tx,
            inbound_tx.clone(),
            shutdown.clone(),
        );
        engine.start(event_rx, stun_rx);

        let symm = cfg.symm_algo.clone();
        let mtu = cfg.mtu;
        tokio::spawn(control::run_control_loop(
            cfg,
            link.clone(),
            engine.clone(),
            info.stream,
            inbound_tx,
            control_tx,
            shutdown.clone(),
        ));

        Ok(Self {
            peer_id,
            mtu,
            symm,
            engine,
            link,
            inbound: Mutex::new(inbound_rx),
            control: Mutex::new(control_rx),
            read_deadline: StdMutex::new(None),
            shutdown,
        })
    }

    /// This connection's address on the fabric.
    pub fn local_addr(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// Whether a live direct UDP path to `peer` exists right now.
    pub fn peer_connected(&self, peer: &PeerId) -> bool {
        self.engine.peer_connected(peer)
    }

    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.engine.connected_peers()
    }

    /// The most recently pushed network secret, if any rotation happened.
    pub fn network_secret(&self) -> Option<NetworkSecret> {
        self.link.network_secret()
    }

    /// Ask the peermap to broker discovery with `peer` explicitly. Joins
    /// under `silenceMode` receive no introductions, so this is how such
    /// peers initiate traversal.
    pub async fn lead_disco(&self, peer: &PeerId) -> P2pResult<()> {
        self.link
            .write_frame(ControlCode::LeadDisco, peer, &[])
            .await
    }

    /// Receive one datagram, copying its payload into `buf`. Honours the
    /// configured read deadline; `None` means no deadline.
    pub async fn read_from(&self, buf: &mut [u8]) -> P2pResult<(usize, PeerId)> {
        let deadline = *self.read_deadline.lock().unwrap();
        let mut closed = self.shutdown.subscribe();
        let recv = async {
            let mut inbound = self.inbound.lock().await;
            tokio::select! {
                _ = closed.wait_for(|c| *c) => Err(P2pError::TransportClosed),
                dg = inbound.recv() => dg.ok_or(P2pError::TransportClosed),
            }
        };
        let datagram = match deadline {
            Some(deadline) => timeout_at(deadline.into(), recv)
                .await
                .map_err(|_| P2pError::DeadlineExceeded)??,
            None => recv.await?,
        };
        let payload = datagram.try_decrypt(self.symm.as_deref());
        let n = buf.len().min(payload.len());
        buf[..n].copy_from_slice(&payload[..n]);
        Ok((n, datagram.peer_id))
    }

    /// Send one datagram to `peer`: direct UDP when the path is live,
    /// otherwise a RELAY frame through the peermap.
    pub async fn write_to(&self, buf: &[u8], peer: &PeerId) -> P2pResult<usize> {
        if *self.shutdown.borrow() {
            return Err(P2pError::TransportClosed);
        }
        let datagram = Datagram {
            peer_id: peer.clone(),
            data: buf.to_vec(),
        };
        let data = datagram.try_encrypt(self.symm.as_deref());
        if self.engine.peer_connected(peer) {
            self.engine.write_to_udp(peer, &data).await?;
            return Ok(buf.len());
        }
        debug!(%peer, "relay write");
        self.link
            .write_frame(ControlCode::Relay, peer, &data)
            .await?;
        Ok(buf.len())
    }

    /// Receive bytes of the in-band stream multiplexed over the session.
    pub async fn recv_control(&self) -> P2pResult<Vec<u8>> {
        let mut closed = self.shutdown.subscribe();
        let mut control = self.control.lock().await;
        tokio::select! {
            _ = closed.wait_for(|c| *c) => Err(P2pError::TransportClosed),
            b = control.recv() => b.ok_or(P2pError::TransportClosed),
        }
    }

    /// Send bytes on the in-band stream.
    pub async fn send_control(&self, b: &[u8]) -> P2pResult<()> {
        self.link
            .write_frame(ControlCode::ControlConn, &self.peer_id, b)
            .await
    }

    /// Deadline for future `read_from` calls; `None` clears it.
    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        *self.read_deadline.lock().unwrap() = deadline;
    }

    /// Accepted for interface symmetry; writes are not delayed on a
    /// datagram fabric, so the value is ignored.
    pub fn set_write_deadline(&self, _deadline: Option<Instant>) {}

    /// Stop every agent task and close the peermap session with a bounded
    /// write deadline. Blocked reads and writes return `TransportClosed`.
    pub async fn close(&self) {
        if self.shutdown.send_replace(true) {
            return;
        }
        self.link.close().await;
    }
}

impl std::fmt::Debug for PacketConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketConn")
            .field("peer_id", &self.peer_id)
            .field("mtu", &self.mtu)
            .finish()
    }
}
