use std::time::Duration;

use ipchub_client::{Address, CancellationToken, ClientConfig, Connection, IpcClient, IpcError, Payload};
use ipchub_common::{config::DEFAULT_MAX_FRAME_SIZE, handshake, PlatformListener};
use tokio::task::JoinHandle;

const WAIT: Duration = Duration::from_secs(5);

/// Minimal peer: accepts one client presenting `key` and returns its connection.
async fn peer(address: Address, key: &'static str) -> (Address, JoinHandle<Option<Connection>>) {
    let listener = PlatformListener::bind(&address).await.unwrap();
    let address = listener.local_address().unwrap();
    let task = tokio::spawn(async move {
        let mut socket = listener.accept().await.unwrap();
        if !handshake::verify(&mut socket, key).await.unwrap() {
            return None;
        }
        Some(Connection::new(socket, CancellationToken::new(), DEFAULT_MAX_FRAME_SIZE))
    });
    (address, task)
}

#[tokio::test]
async fn test_exchange_and_disconnect() {
    let (address, accepted) = peer(Address::loopback(), "k1").await;
    let client = IpcClient::connect(address.clone(), "k1").await.unwrap();
    assert_eq!(client.address(), &address);

    let server_side = accepted.await.unwrap().unwrap();
    client.send(serde_json::json!({ "ping": 1 })).await.unwrap();
    let received = server_side.receive().await.unwrap().unwrap();
    assert_eq!(received.get("ping").and_then(Payload::as_i64), Some(1));

    server_side.send("pong").await.unwrap();
    assert_eq!(client.receive().await.unwrap(), Some(Payload::from("pong")));

    client.disconnect().await;
    client.disconnect().await;
    assert!(client.is_closed());
    assert_eq!(server_side.receive().await.unwrap(), None);
    assert!(matches!(client.send(1i64).await, Err(IpcError::ChannelClosed)));
}

#[cfg(unix)]
#[tokio::test]
async fn test_connect_over_unix_socket() {
    let tmp = tempfile::TempDir::new().unwrap();
    let (address, accepted) = peer(Address::unix(tmp.path().join("hub.sock")), "k1").await;

    let client = IpcClient::connect(address, "k1").await.unwrap();
    let server_side = accepted.await.unwrap().unwrap();
    server_side.disconnect().await;
    assert_eq!(client.receive().await.unwrap(), None);
}

#[tokio::test]
async fn test_wrong_key_fails_authentication() {
    let (address, accepted) = peer(Address::loopback(), "k1").await;
    let result = IpcClient::connect(address, "wrong").await;
    assert!(matches!(result, Err(IpcError::Authentication(_))));
    assert!(accepted.await.unwrap().is_none());
}

#[tokio::test]
async fn test_connect_without_address_is_rejected() {
    let result = IpcClient::with_config(ClientConfig::new().with_key("k1")).await;
    assert!(matches!(result, Err(IpcError::InvalidAddress(_))));
}

#[tokio::test]
async fn test_connect_to_nothing_fails() {
    let (address, accepted) = peer(Address::loopback(), "k1").await;
    accepted.abort();
    let _ = accepted.await;

    let result = IpcClient::connect(address, "k1").await;
    assert!(matches!(result, Err(IpcError::Connect { .. })));
}

#[tokio::test]
async fn test_connect_times_out_without_acknowledgement() {
    let listener = PlatformListener::bind(&Address::loopback()).await.unwrap();
    let address = listener.local_address().unwrap();
    let _silent = tokio::spawn(async move {
        let _socket = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
    });

    let config = ClientConfig::new()
        .with_address(address)
        .with_key("k1")
        .with_connect_timeout(Duration::from_millis(100));
    let result = tokio::time::timeout(WAIT, IpcClient::with_config(config)).await.unwrap();
    match result {
        Err(IpcError::Connect { source, .. }) => assert_eq!(source.kind(), std::io::ErrorKind::TimedOut),
        other => panic!("expected timeout, got {other:?}"),
    }
}

#[tokio::test]
async fn test_cancellation_aborts_receive() {
    let (address, accepted) = peer(Address::loopback(), "k1").await;
    let cancellation = CancellationToken::new();
    let config = ClientConfig::new()
        .with_address(address)
        .with_key("k1")
        .with_cancellation(cancellation.clone());
    let client = IpcClient::with_config(config).await.unwrap();
    let _server_side = accepted.await.unwrap().unwrap();

    let pending = {
        let connection = client.connection().clone();
        tokio::spawn(async move { connection.receive().await })
    };
    cancellation.cancel();
    let result = tokio::time::timeout(WAIT, pending).await.unwrap().unwrap();
    assert!(matches!(result, Err(IpcError::Cancelled)));
}

#[tokio::test]
async fn test_shutdown_request_is_sent_before_close() {
    let (address, accepted) = peer(Address::loopback(), "k1").await;
    let client = IpcClient::connect(address, "k1").await.unwrap();
    let server_side = accepted.await.unwrap().unwrap();

    client.shutdown_server().await.unwrap();
    assert!(client.is_closed());
    assert_eq!(server_side.receive().await.unwrap(), Some(Payload::Shutdown));
    assert_eq!(server_side.receive().await.unwrap(), None);
}
