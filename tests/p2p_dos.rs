//! Adversarial wire-level scenarios against a live node
//!
//! A raw TCP client plays attacker: malformed frames, allocation bombs, and
//! out-of-order protocol messages must each end with the node dropping the
//! connection — observed here as EOF on the attacker's socket — while the
//! node itself keeps running.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use obelisk::chain::ChainState;
use obelisk::config::Config;
use obelisk::net::wire::{MessageHeader, serialize_header};
use obelisk::net::{Message, NetworkManager};
use obelisk::net::types::{MAX_PROTOCOL_MESSAGE_LENGTH, REGTEST_MAGIC};

async fn spawn_node() -> (NetworkManager, Arc<Mutex<ChainState>>, tempfile::TempDir) {
    let datadir = tempfile::tempdir().expect("tempdir");
    let config = Config {
        test_nonce: Some(rand::random()),
        ..Config::regtest(datadir.path().to_path_buf())
    };
    let chain = Arc::new(Mutex::new(ChainState::new(ChainState::regtest_genesis())));
    let network = NetworkManager::start(config, chain.clone()).await.expect("node start");
    (network, chain, datadir)
}

async fn connect(network: &NetworkManager) -> TcpStream {
    TcpStream::connect(("127.0.0.1", network.listen_port()))
        .await
        .expect("attacker connect")
}

fn frame(msg: &Message) -> Vec<u8> {
    let payload = msg.serialize();
    let header = MessageHeader::new(REGTEST_MAGIC, msg.command(), &payload);
    let mut bytes = serialize_header(&header);
    bytes.extend_from_slice(&payload);
    bytes
}

/// Read until EOF or time out. Returns true when the node hung up on us.
async fn disconnected(stream: &mut TcpStream, within: Duration) -> bool {
    let mut buf = [0u8; 4096];
    let deadline = tokio::time::Instant::now() + within;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return false;
        }
        match tokio::time::timeout(remaining, stream.read(&mut buf)).await {
            Ok(Ok(0)) => return true,
            Ok(Ok(_)) => continue, // drain whatever the node sent first
            Ok(Err(_)) => return true,
            Err(_) => return false,
        }
    }
}

#[tokio::test]
async fn bad_magic_disconnects() {
    let (node, _chain, _dir) = spawn_node().await;
    let mut stream = connect(&node).await;

    let mut bytes = frame(&Message::Ping(1));
    bytes[0] ^= 0xff;
    stream.write_all(&bytes).await.unwrap();

    assert!(disconnected(&mut stream, Duration::from_secs(5)).await);
}

#[tokio::test]
async fn oversized_length_field_disconnects() {
    let (node, _chain, _dir) = spawn_node().await;
    let mut stream = connect(&node).await;

    let mut bytes = frame(&Message::Ping(1));
    bytes[16..20].copy_from_slice(&(MAX_PROTOCOL_MESSAGE_LENGTH + 1).to_le_bytes());
    stream.write_all(&bytes).await.unwrap();

    assert!(disconnected(&mut stream, Duration::from_secs(5)).await);
}

#[tokio::test]
async fn command_trailer_garbage_disconnects() {
    let (node, _chain, _dir) = spawn_node().await;
    let mut stream = connect(&node).await;

    let mut bytes = frame(&Message::Ping(1));
    // Non-null byte after the command's terminating null
    bytes[4 + 10] = b'!';
    stream.write_all(&bytes).await.unwrap();

    assert!(disconnected(&mut stream, Duration::from_secs(5)).await);
}

#[tokio::test]
async fn compactsize_bomb_disconnects() {
    let (node, _chain, _dir) = spawn_node().await;
    let mut stream = connect(&node).await;

    // HEADERS frame whose payload claims 2^64-1 entries. The checksum is
    // valid, so this passes framing and must die in the decoder without
    // any large allocation.
    let payload = [0xffu8; 9];
    let header = MessageHeader::new(REGTEST_MAGIC, "headers", &payload);
    let mut bytes = serialize_header(&header);
    bytes.extend_from_slice(&payload);
    stream.write_all(&bytes).await.unwrap();

    assert!(disconnected(&mut stream, Duration::from_secs(5)).await);
}

#[tokio::test]
async fn protocol_message_before_version_disconnects() {
    let (node, _chain, _dir) = spawn_node().await;

    // Well-formed PING, but nothing may precede VERSION
    let mut stream = connect(&node).await;
    stream.write_all(&frame(&Message::Ping(7))).await.unwrap();
    assert!(disconnected(&mut stream, Duration::from_secs(5)).await);

    // Same for INV, which additionally requires READY
    let mut stream = connect(&node).await;
    stream
        .write_all(&frame(&Message::Inv(vec![])))
        .await
        .unwrap();
    assert!(disconnected(&mut stream, Duration::from_secs(5)).await);
}

#[tokio::test]
async fn verack_with_payload_disconnects() {
    let (node, _chain, _dir) = spawn_node().await;
    let mut stream = connect(&node).await;

    let payload = vec![0u8; 1];
    let header = MessageHeader::new(REGTEST_MAGIC, "verack", &payload);
    let mut bytes = serialize_header(&header);
    bytes.extend_from_slice(&payload);
    stream.write_all(&bytes).await.unwrap();

    assert!(disconnected(&mut stream, Duration::from_secs(5)).await);
}

#[tokio::test]
async fn node_survives_attack_burst() {
    let (node, chain, _dir) = spawn_node().await;
    chain.lock().unwrap().mine(1, obelisk::types::now() as u32, 0);

    for _ in 0..10 {
        let mut stream = connect(&node).await;
        let _ = stream.write_all(&[0xde, 0xad, 0xbe, 0xef]).await;
        let _ = stream.shutdown().await;
    }
    tokio::time::sleep(Duration::from_millis(500)).await;

    // Reactor still alive and clean
    let stats = node.stats().await.expect("reactor alive");
    assert_eq!(stats.peer_count, 0);
    assert_eq!(chain.lock().unwrap().height(), 1);
}

#[tokio::test]
async fn per_ip_limit_enforced() {
    let (node, _chain, _dir) = spawn_node().await;

    // Two connections from 127.0.0.1 are admitted, the third is closed at
    // accept time
    let mut first = connect(&node).await;
    let mut second = connect(&node).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    let mut third = connect(&node).await;

    assert!(disconnected(&mut third, Duration::from_secs(5)).await);
    // The first two are still live (no EOF yet): sending a valid-looking
    // partial frame keeps them open
    first.write_all(&REGTEST_MAGIC).await.unwrap();
    second.write_all(&REGTEST_MAGIC).await.unwrap();
}
