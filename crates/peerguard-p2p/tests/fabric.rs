//! End-to-end fabric scenarios: an in-process peermap, two agents, and a
//! local STUN stand-in answering binding requests with the observed source
//! address, so hole punching runs entirely over loopback.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use peerguard_auth::{Authenticator, Net};
use peerguard_p2p::{stun, Config as AgentConfig, PacketConn, PeerId};
use peerguard_peermap::{Config as ServerConfig, OidcRegistry, PeerMap};
use tokio::net::UdpSocket;
use tokio::time::{sleep, timeout, Instant};

const SECRET_KEY: &str = "fabric-test-key";

static STATE_SEQ: AtomicU32 = AtomicU32::new(0);

fn state_path() -> std::path::PathBuf {
    std::env::temp_dir().join(format!(
        "peerguard-fabric-{}-{}.json",
        std::process::id(),
        STATE_SEQ.fetch_add(1, Ordering::SeqCst)
    ))
}

async fn start_peermap(stuns: Vec<String>) -> (Arc<PeerMap>, SocketAddr) {
    start_peermap_with(stuns, Duration::from_secs(4 * 3600), Duration::from_secs(3600)).await
}

async fn start_peermap_with(
    stuns: Vec<String>,
    validity: Duration,
    rotation: Duration,
) -> (Arc<PeerMap>, SocketAddr) {
    let cfg = ServerConfig {
        listen: "127.0.0.1:0".into(),
        secret_key: SECRET_KEY.into(),
        stuns,
        state_file: state_path(),
        secret_validity: validity,
        secret_rotation: rotation,
        ..Default::default()
    };
    let pm = PeerMap::new(cfg, OidcRegistry::new()).unwrap();
    tokio::spawn(pm.clone().serve());
    for _ in 0..200 {
        if let Some(addr) = pm.local_addr() {
            return (pm, addr);
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("peermap did not bind");
}

/// Answers every binding request with the sender's observed address.
async fn spawn_stun_responder() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 1500];
        while let Ok((n, from)) = socket.recv_from(&mut buf).await {
            if n >= 20 {
                let mut tx_id = [0u8; 12];
                tx_id.copy_from_slice(&buf[8..20]);
                let _ = socket.send_to(&stun::response(&tx_id, from), from).await;
            }
        }
    });
    addr
}

fn mint_token(network: &str) -> String {
    Authenticator::new(SECRET_KEY)
        .generate_secret(
            &Net {
                id: network.into(),
                ..Default::default()
            },
            chrono::Duration::hours(1),
        )
        .unwrap()
        .0
}

fn agent_cfg(addr: SocketAddr, peer_id: &str) -> AgentConfig {
    AgentConfig::new(vec![format!("ws://{}", addr)], mint_token("net1"), peer_id)
}

fn id(s: &str) -> PeerId {
    s.parse().unwrap()
}

async fn wait_direct(a: &PacketConn, b: &PacketConn, within: Duration) -> bool {
    let deadline = Instant::now() + within;
    while Instant::now() < deadline {
        if a.peer_connected(b.local_addr()) && b.peer_connected(a.local_addr()) {
            return true;
        }
        sleep(Duration::from_millis(100)).await;
    }
    false
}

#[tokio::test]
async fn test_direct_path_establishment() {
    let stun_addr = spawn_stun_responder().await;
    let (pm, addr) = start_peermap(vec![stun_addr.to_string()]).await;

    let alice = PacketConn::open(agent_cfg(addr, "alice")).await.unwrap();
    let bob = PacketConn::open(agent_cfg(addr, "bob")).await.unwrap();

    assert!(
        wait_direct(&alice, &bob, Duration::from_secs(6)).await,
        "no direct path within 6s"
    );

    // the path must survive without the rendezvous: direct UDP only
    pm.shutdown();
    sleep(Duration::from_millis(200)).await;

    alice.write_to(b"hello", &id("bob")).await.unwrap();
    let mut buf = [0u8; 64];
    let (n, from) = timeout(Duration::from_secs(2), bob.read_from(&mut buf))
        .await
        .expect("read timed out")
        .unwrap();
    assert_eq!(&buf[..n], b"hello");
    assert_eq!(from, id("alice"));

    alice.close().await;
    bob.close().await;
}

#[tokio::test]
async fn test_relay_fallback_without_stun() {
    let (pm, addr) = start_peermap(Vec::new()).await;

    let alice = PacketConn::open(agent_cfg(addr, "alice")).await.unwrap();
    let bob = PacketConn::open(agent_cfg(addr, "bob")).await.unwrap();

    // give discovery a moment; without STUN no direct path can form
    sleep(Duration::from_millis(500)).await;
    assert!(!alice.peer_connected(&id("bob")));

    alice.write_to(b"hi", &id("bob")).await.unwrap();
    let mut buf = [0u8; 64];
    let (n, from) = timeout(Duration::from_secs(2), bob.read_from(&mut buf))
        .await
        .expect("relay delivery timed out")
        .unwrap();
    assert_eq!(&buf[..n], b"hi");
    assert_eq!(from, id("alice"));
    assert!(!alice.peer_connected(&id("bob")));

    alice.close().await;
    bob.close().await;
    pm.shutdown();
}

#[tokio::test]
async fn test_silence_mode_suppresses_introductions() {
    let stun_addr = spawn_stun_responder().await;
    let (pm, addr) = start_peermap(vec![stun_addr.to_string()]).await;

    let mut silent_cfg = agent_cfg(addr, "alice");
    silent_cfg.metadata.push(("silenceMode".into(), "1".into()));
    let alice = PacketConn::open(silent_cfg).await.unwrap();
    let bob = PacketConn::open(agent_cfg(addr, "bob")).await.unwrap();

    // no introductions flow in either direction, so with STUN available a
    // direct path would only appear if a NEW_PEER had leaked
    sleep(Duration::from_secs(2)).await;
    assert!(!alice.peer_connected(&id("bob")));
    assert!(!bob.peer_connected(&id("alice")));

    // explicit brokered discovery still works
    bob.lead_disco(&id("alice")).await.unwrap();
    assert!(
        wait_direct(&alice, &bob, Duration::from_secs(6)).await,
        "explicit LEAD_DISCO did not establish a path"
    );

    alice.close().await;
    bob.close().await;
    pm.shutdown();
}

#[tokio::test]
async fn test_secret_rotation_pushed() {
    // validity 30s, rotation 5s: the first keepalive tick finds the
    // remaining validity under the threshold and pushes a fresh secret
    let (pm, addr) =
        start_peermap_with(Vec::new(), Duration::from_secs(30), Duration::from_secs(5)).await;

    let alice = PacketConn::open(agent_cfg(addr, "alice")).await.unwrap();
    assert!(alice.network_secret().is_none());

    let deadline = Instant::now() + Duration::from_secs(15);
    let secret = loop {
        if let Some(secret) = alice.network_secret() {
            break secret;
        }
        assert!(Instant::now() < deadline, "no rotation within 15s");
        sleep(Duration::from_millis(250)).await;
    };
    assert_eq!(secret.network, "net1");
    assert!(secret.expire > chrono::Utc::now());

    alice.close().await;
    pm.shutdown();
}

#[tokio::test]
async fn test_healthcheck_reclaims_dead_path() {
    let stun_addr = spawn_stun_responder().await;
    let (pm, addr) = start_peermap(vec![stun_addr.to_string()]).await;

    let mut cfg_a = agent_cfg(addr, "alice");
    cfg_a.keepalive_interval = Duration::from_secs(1);
    let mut cfg_b = agent_cfg(addr, "bob");
    cfg_b.keepalive_interval = Duration::from_secs(1);
    let alice = PacketConn::open(cfg_a).await.unwrap();
    let bob = PacketConn::open(cfg_b).await.unwrap();

    assert!(wait_direct(&alice, &bob, Duration::from_secs(6)).await);

    // bob goes away: pings stop, alice's context ages out past 2x keepalive
    bob.close().await;
    let deadline = Instant::now() + Duration::from_secs(6);
    while alice.peer_connected(&id("bob")) {
        assert!(Instant::now() < deadline, "stale path never reclaimed");
        sleep(Duration::from_millis(250)).await;
    }

    // subsequent writes fall back to the relay path
    alice.write_to(b"anyone there", &id("bob")).await.unwrap();
    assert!(!alice.peer_connected(&id("bob")));

    alice.close().await;
    pm.shutdown();
}

#[tokio::test]
async fn test_read_deadline_honoured() {
    let (pm, addr) = start_peermap(Vec::new()).await;
    let alice = PacketConn::open(agent_cfg(addr, "alice")).await.unwrap();

    alice.set_read_deadline(Some(std::time::Instant::now() + Duration::from_millis(200)));
    let mut buf = [0u8; 16];
    let started = Instant::now();
    let err = alice.read_from(&mut buf).await.unwrap_err();
    assert!(matches!(err, peerguard_p2p::P2pError::DeadlineExceeded));
    assert!(started.elapsed() >= Duration::from_millis(150));

    // clearing the deadline restores blocking reads
    alice.set_read_deadline(None);
    let blocked = timeout(Duration::from_millis(300), alice.read_from(&mut buf)).await;
    assert!(blocked.is_err());

    alice.close().await;
    pm.shutdown();
}

#[tokio::test]
async fn test_close_unblocks_reader() {
    let (pm, addr) = start_peermap(Vec::new()).await;
    let alice = Arc::new(PacketConn::open(agent_cfg(addr, "alice")).await.unwrap());

    let reader = {
        let alice = alice.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 16];
            alice.read_from(&mut buf).await
        })
    };
    sleep(Duration::from_millis(100)).await;
    alice.close().await;
    let result = timeout(Duration::from_secs(2), reader)
        .await
        .expect("reader stayed blocked")
        .unwrap();
    assert!(matches!(result, Err(peerguard_p2p::P2pError::TransportClosed)));

    pm.shutdown();
}
