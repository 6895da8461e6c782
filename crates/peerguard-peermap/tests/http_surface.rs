//! Upgrade handshake, exporter API, and OIDC callback contracts, driven
//! over real sockets with a raw WebSocket client.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use peerguard_auth::{Authenticator, Net, NetworkSecret};
use peerguard_peermap::{Config, OidcRegistry, PeerMap, UserInfoResolver};
use peerguard_proto::{xor_nonce, ControlCode, Frame, PeerId};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

const SECRET_KEY: &str = "surface-test-key";
const NONCE: u8 = 57;

static STATE_SEQ: AtomicU32 = AtomicU32::new(0);

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn state_path() -> std::path::PathBuf {
    std::env::temp_dir().join(format!(
        "peerguard-surface-{}-{}.json",
        std::process::id(),
        STATE_SEQ.fetch_add(1, Ordering::SeqCst)
    ))
}

async fn start_peermap(oidc: OidcRegistry) -> (Arc<PeerMap>, SocketAddr) {
    let cfg = Config {
        listen: "127.0.0.1:0".into(),
        secret_key: SECRET_KEY.into(),
        stuns: vec!["stun.example.org:3478".into()],
        state_file: state_path(),
        ..Default::default()
    };
    let pm = PeerMap::new(cfg, oidc).unwrap();
    tokio::spawn(pm.clone().serve());
    for _ in 0..200 {
        if let Some(addr) = pm.local_addr() {
            return (pm, addr);
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("peermap did not bind");
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

async fn connect_peer(
    addr: SocketAddr,
    peer_id: &str,
    metadata: Option<&str>,
) -> Result<(WsClient, tokio_tungstenite::tungstenite::http::Response<Option<Vec<u8>>>), WsError> {
    connect_peer_with_token(addr, &mint_token("net1"), peer_id, metadata).await
}

async fn connect_peer_with_token(
    addr: SocketAddr,
    token: &str,
    peer_id: &str,
    metadata: Option<&str>,
) -> Result<(WsClient, tokio_tungstenite::tungstenite::http::Response<Option<Vec<u8>>>), WsError> {
    let mut request = format!("ws://{}/", addr).into_client_request()?;
    let headers = request.headers_mut();
    headers.insert("X-Network", HeaderValue::from_str(token).unwrap());
    if !peer_id.is_empty() {
        headers.insert("X-PeerID", HeaderValue::from_str(peer_id).unwrap());
    }
    headers.insert("X-Nonce", HeaderValue::from_str(&NONCE.to_string()).unwrap());
    if let Some(meta) = metadata {
        headers.insert("X-Metadata", HeaderValue::from_str(meta).unwrap());
    }
    connect_async(request).await
}

fn encode_frame(code: ControlCode, addr: &str, payload: &[u8]) -> Message {
    let frame = Frame::new(code, addr.parse::<PeerId>().unwrap(), payload.to_vec());
    let mut wire = frame.encode();
    xor_nonce(&mut wire, NONCE);
    Message::Binary(wire)
}

/// Read binary frames until one decodes, skipping keepalive text.
async fn next_frame(ws: &mut WsClient) -> Frame {
    loop {
        let msg = timeout(Duration::from_secs(15), ws.next())
            .await
            .expect("no frame before timeout")
            .expect("stream ended")
            .expect("stream errored");
        if let Message::Binary(mut b) = msg {
            xor_nonce(&mut b, NONCE);
            return Frame::decode(&b).expect("undecodable frame");
        }
    }
}

async fn http_request(
    addr: SocketAddr,
    method: &str,
    path: &str,
    token: Option<&str>,
    body: Option<&str>,
) -> (u16, String) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let mut request = format!("{} {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n", method, path, addr);
    if let Some(token) = token {
        request.push_str(&format!("X-Token: {}\r\n", token));
    }
    match body {
        Some(body) => request.push_str(&format!(
            "Content-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        )),
        None => request.push_str("\r\n"),
    }
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    let response = String::from_utf8_lossy(&response).into_owned();
    let status: u16 = response
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .expect("no status line");
    let body = response
        .split_once("\r\n\r\n")
        .map(|(_, b)| b.to_string())
        .unwrap_or_default();
    (status, body)
}

#[tokio::test]
async fn test_upgrade_echoes_nonce_and_advertises_stuns() {
    let (pm, addr) = start_peermap(OidcRegistry::new()).await;
    let (_ws, response) = connect_peer(addr, "alice", None).await.unwrap();

    let nonce = response.headers().get("x-nonce").unwrap().to_str().unwrap();
    assert_eq!(nonce, NONCE.to_string());

    let stuns_b64 = response.headers().get("x-stuns").unwrap();
    let stuns: Vec<String> =
        serde_json::from_slice(&BASE64.decode(stuns_b64.as_bytes()).unwrap()).unwrap();
    assert_eq!(stuns, vec!["stun.example.org:3478".to_string()]);

    pm.shutdown();
}

#[tokio::test]
async fn test_duplicate_peer_rejected_first_session_unaffected() {
    let (pm, addr) = start_peermap(OidcRegistry::new()).await;
    let (mut first, _) = connect_peer(addr, "alice", None).await.unwrap();

    // second upgrade with the same id must fail with 400
    match connect_peer(addr, "alice", None).await {
        Err(WsError::Http(response)) => assert_eq!(response.status().as_u16(), 400),
        other => panic!("expected HTTP 400, got {:?}", other.map(|_| "connected")),
    }

    // the first session still dispatches frames: a self-addressed RELAY
    // comes back with the source rewritten to ourselves
    first
        .send(encode_frame(ControlCode::Relay, "alice", b"echo"))
        .await
        .unwrap();
    let frame = next_frame(&mut first).await;
    assert_eq!(frame.code, ControlCode::Relay);
    assert_eq!(frame.addr.to_string(), "alice");
    assert_eq!(frame.payload, b"echo");

    // the id frees up once the first session closes
    first.close(None).await.unwrap();
    sleep(Duration::from_millis(200)).await;
    assert!(connect_peer(addr, "alice", None).await.is_ok());

    pm.shutdown();
}

#[tokio::test]
async fn test_upgrade_rejections() {
    let (pm, addr) = start_peermap(OidcRegistry::new()).await;

    // invalid token
    match connect_peer_with_token(addr, "not-a-token", "alice", None).await {
        Err(WsError::Http(response)) => assert_eq!(response.status().as_u16(), 403),
        other => panic!("expected 403, got {:?}", other.map(|_| "connected")),
    }

    // metadata that decodes as base64 is the encoded-by-accident case
    let encoded = BASE64.encode("silenceMode=1");
    match connect_peer(addr, "alice", Some(&encoded)).await {
        Err(WsError::Http(response)) => assert_eq!(response.status().as_u16(), 403),
        other => panic!("expected 403, got {:?}", other.map(|_| "connected")),
    }

    // missing peer id
    match connect_peer(addr, "", None).await {
        Err(WsError::Http(response)) => assert_eq!(response.status().as_u16(), 403),
        other => panic!("expected 403, got {:?}", other.map(|_| "connected")),
    }

    pm.shutdown();
}

#[tokio::test]
async fn test_exporter_api() {
    let (pm, addr) = start_peermap(OidcRegistry::new()).await;
    let (_ws, _) = connect_peer(addr, "alice", Some("label=desk")).await.unwrap();

    // unauthenticated
    let (status, _) = http_request(addr, "GET", "/networks", None, None).await;
    assert_eq!(status, 401);

    let token = pm
        .exporter_authenticator()
        .generate_token(chrono::Duration::hours(1))
        .unwrap();

    let (status, body) = http_request(addr, "GET", "/networks", Some(&token), None).await;
    assert_eq!(status, 200);
    let networks: Vec<serde_json::Value> = serde_json::from_str(body.trim()).unwrap();
    assert_eq!(networks.len(), 1);
    assert_eq!(networks[0]["id"], "net1");
    assert_eq!(networks[0]["peersCount"], 1);

    let (status, body) = http_request(addr, "GET", "/peers", Some(&token), None).await;
    assert_eq!(status, 200);
    assert!(body.contains("pg://alice?label=desk"), "body: {}", body);

    pm.shutdown();
}

#[tokio::test]
async fn test_meta_update_fans_out_new_secrets() {
    let (pm, addr) = start_peermap(OidcRegistry::new()).await;
    let (mut ws, _) = connect_peer(addr, "alice", None).await.unwrap();

    let token = pm
        .exporter_authenticator()
        .generate_token(chrono::Duration::hours(1))
        .unwrap();
    let body = r#"{"alias":"office","neighbors":["net2"]}"#;
    let (status, _) =
        http_request(addr, "PUT", "/network/net1/meta", Some(&token), Some(body)).await;
    assert_eq!(status, 200);

    // the member is re-keyed with claims carrying the new neighbour list
    let frame = next_frame(&mut ws).await;
    assert_eq!(frame.code, ControlCode::UpdateNetworkSecret);
    let secret: NetworkSecret = serde_json::from_slice(&frame.payload).unwrap();
    let claims = Authenticator::new(SECRET_KEY).parse_secret(&secret.secret).unwrap();
    assert_eq!(claims.alias.as_deref(), Some("office"));
    assert_eq!(claims.neighbors, vec!["net2".to_string()]);

    // unknown network
    let (status, _) =
        http_request(addr, "PUT", "/network/ghost/meta", Some(&token), Some(body)).await;
    assert_eq!(status, 404);

    pm.shutdown();
}

struct StaticResolver;

#[async_trait]
impl UserInfoResolver for StaticResolver {
    async fn user_info(&self, code: &str) -> Result<String, String> {
        if code == "good-code" {
            Ok("user@example.com".into())
        } else {
            Err("code rejected".into())
        }
    }
}

#[tokio::test]
async fn test_oidc_callback_hands_secret_to_waiter() {
    let oidc = OidcRegistry::new();
    oidc.add_provider("test", Arc::new(StaticResolver));
    let (pm, addr) = start_peermap(oidc).await;

    // the client parks on the token channel first
    let waiter = tokio::spawn(async move {
        http_request(addr, "GET", "/network/token?state=st1", None, None).await
    });
    sleep(Duration::from_millis(100)).await;

    let (status, _) = http_request(
        addr,
        "GET",
        "/oidc/authorize/test?code=good-code&state=st1",
        None,
        None,
    )
    .await;
    assert_eq!(status, 200);

    let (status, body) = waiter.await.unwrap();
    assert_eq!(status, 200);
    let secret: NetworkSecret = serde_json::from_str(body.trim()).unwrap();
    assert_eq!(secret.network, "user@example.com");
    assert!(Authenticator::new(SECRET_KEY).parse_secret(&secret.secret).is_ok());

    // a bad code surfaces the provider failure
    let (status, body) = http_request(
        addr,
        "GET",
        "/oidc/authorize/test?code=bad&state=st2",
        None,
        None,
    )
    .await;
    assert_eq!(status, 502);
    assert!(body.contains("oidc"));

    // unknown provider
    let (status, _) =
        http_request(addr, "GET", "/oidc/authorize/ghost?code=x&state=s", None, None).await;
    assert_eq!(status, 400);

    pm.shutdown();
}

#[tokio::test]
async fn test_control_conn_stream() {
    let (pm, addr) = start_peermap(OidcRegistry::new()).await;
    let (mut ws, _) = connect_peer(addr, "alice", None).await.unwrap();

    let session = pm
        .directory()
        .get_network("net1")
        .unwrap()
        .get_peer(&"alice".parse().unwrap())
        .unwrap();

    // peer -> server: CONTROL_CONN payload lands in the in-band queue
    ws.send(encode_frame(ControlCode::ControlConn, "alice", b"hello stream"))
        .await
        .unwrap();
    let mut buf = [0u8; 5];
    let n = session.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"hello");
    // short reads buffer the remainder
    let mut rest = [0u8; 16];
    let n = session.read(&mut rest).await.unwrap();
    assert_eq!(&rest[..n], b" stream");

    // server -> peer
    session.write(b"welcome").await.unwrap();
    let frame = next_frame(&mut ws).await;
    assert_eq!(frame.code, ControlCode::ControlConn);
    assert_eq!(frame.payload, b"welcome");

    pm.shutdown();
}
