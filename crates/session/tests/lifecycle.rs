mod common;

use common::TestBridge;
use pretty_assertions::assert_eq;
use serde_json::json;
use serial_test::serial;
use session::{ProfileStore, Request, SessionError, SessionRegistry, SessionState};
use settings::Config;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use transport::{AuthMethod, ConnectParams, Transport, TransportError};

mockall::mock! {
    pub Connector {}

    #[async_trait::async_trait]
    impl transport::Connector for Connector {
        async fn connect(&self, params: &ConnectParams) -> Result<Arc<dyn Transport>, TransportError>;
    }
}

/// Accepts the TCP connection and then never finishes the handshake.
struct StalledConnector;

#[async_trait::async_trait]
impl transport::Connector for StalledConnector {
    async fn connect(&self, _params: &ConnectParams) -> Result<Arc<dyn Transport>, TransportError> {
        std::future::pending().await
    }
}

#[tokio::test]
async fn disconnect_does_not_wait_for_a_stalled_handshake() {
    let registry = Arc::new(SessionRegistry::new(Arc::new(StalledConnector), Config::default()));
    let id = registry.create_session();
    let session = registry.get(&id).unwrap();

    let connecting = tokio::spawn({
        let registry = registry.clone();
        let id = id.clone();
        async move {
            let params = ConnectParams::new("slow.example", 22, "u", AuthMethod::Password("p".into()));
            registry.connect(&id, params).await
        }
    });
    tokio::time::timeout(Duration::from_secs(2), async {
        while session.state() != SessionState::Connecting {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    tokio::time::timeout(Duration::from_secs(1), registry.disconnect(&id))
        .await
        .expect("disconnect waited on the handshake")
        .unwrap();
    assert_eq!(session.state(), SessionState::Disconnected);
    assert!(registry.session_ids().is_empty());

    let connect = tokio::time::timeout(Duration::from_secs(1), connecting)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(connect, Err(SessionError::Disconnected)));
    assert_eq!(session.status().error, None);
}

#[tokio::test]
async fn disconnect_cascades_to_forwards_and_transfers() {
    let harness = TestBridge::new();
    harness.server.fs().add_file("/slow.bin", vec![1u8; 512 * 1024]);
    harness.server.fs().set_io_delay(Duration::from_millis(10));
    let dir = tempfile::tempdir().unwrap();
    let id = harness.connected_session().await;
    let session = harness.bridge.registry().get(&id).unwrap();

    let forward = harness
        .call(json!({"op": "createLocalPortForward", "sessionId": id, "localPort": 0, "remoteHost": "db", "remotePort": 5432}))
        .await;
    let port = forward["forward"]["bindPort"].as_u64().unwrap() as u16;
    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    client.write_all(b"hello").await.unwrap();
    let mut echoed = [0u8; 5];
    client.read_exact(&mut echoed).await.unwrap();

    harness
        .call(json!({
            "op": "startDownload",
            "sessionId": id,
            "remotePath": "/slow.bin",
            "localPath": dir.path().join("slow.bin").display().to_string(),
            "transferId": "t-1",
        }))
        .await;

    let disconnected = harness.call(json!({"op": "disconnect", "sessionId": id})).await;
    assert_eq!(disconnected, json!({"success": true}));

    assert_eq!(session.state(), SessionState::Disconnected);
    assert!(!session.status().connected);
    assert!(session.list_forwards().is_empty());
    assert!(session
        .list_transfers()
        .iter()
        .all(|progress| progress.status.is_terminal()));
    assert!(!dir.path().join("slow.bin").exists());

    // The tunnel was force-closed: the client sees end-of-stream or a reset.
    let mut rest = Vec::new();
    let read = tokio::time::timeout(Duration::from_secs(2), client.read_to_end(&mut rest))
        .await
        .unwrap();
    assert!(read.map_or(true, |n| n == 0));
    assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());

    let status = harness.call(json!({"op": "getStatus", "sessionId": id})).await;
    assert_eq!(status["connected"], false);
}

#[tokio::test]
async fn remote_close_keeps_the_session_listed() {
    let harness = TestBridge::new();
    let id = harness.connected_session().await;

    harness.server.last_transport().unwrap().drop_link();
    let status = harness
        .poll_until(json!({"op": "getStatus", "sessionId": id}), |status| {
            status["connected"] == false
        })
        .await;
    assert_eq!(status["success"], true);
    assert_eq!(status["state"], "disconnected");
    assert_eq!(status["error"], "Connection closed by remote host");

    let input = harness
        .call(json!({"op": "sendInput", "sessionId": id, "data": "ls\n"}))
        .await;
    assert_eq!(input["error"], "Not connected");

    let reconnect = harness
        .call(json!({"op": "connect", "sessionId": id, "hostname": "h", "username": "u", "password": "p"}))
        .await;
    assert_eq!(reconnect["error"], "Session has been disconnected");

    harness.call(json!({"op": "disconnect", "sessionId": id})).await;
    let gone = harness.call(json!({"op": "getStatus", "sessionId": id})).await;
    assert_eq!(gone["error"], "Session not found");
}

#[tokio::test]
async fn failed_connect_is_never_retried() {
    let mut connector = MockConnector::new();
    connector
        .expect_connect()
        .times(2)
        .returning(|params| Err(TransportError::Unreachable(params.target())));
    let registry = Arc::new(SessionRegistry::new(Arc::new(connector), Config::default()));
    let dir = tempfile::tempdir().unwrap();
    let bridge = session::Bridge::new(registry.clone(), ProfileStore::new(dir.path().join("c.json")));

    let id = registry.create_session();
    let connect = || Request::Connect {
        session_id: id.clone(),
        hostname: "unreachable.test".into(),
        port: Some(2222),
        username: "u".into(),
        password: Some("p".into()),
        key_path: None,
        passphrase: None,
        use_agent: false,
        save: true,
        name: None,
    };

    let first = bridge.handle(connect()).await;
    assert!(!first.success);
    assert_eq!(
        first.error.as_deref(),
        Some("Host unreachable: unreachable.test:2222")
    );
    assert_eq!(registry.status(&id).state, Some(SessionState::Created));

    let second = bridge.handle(connect()).await;
    assert!(!second.success);
    assert!(ProfileStore::new(dir.path().join("c.json")).list().is_empty());
}

#[tokio::test]
async fn sessions_are_independent() {
    let harness = TestBridge::new();
    let first = harness.connected_session().await;
    let second = harness.connected_session().await;

    harness.call(json!({"op": "disconnect", "sessionId": first})).await;
    let status = harness.call(json!({"op": "getStatus", "sessionId": second})).await;
    assert_eq!(status["connected"], true);

    harness
        .call(json!({"op": "sendInput", "sessionId": second, "data": "still here\n"}))
        .await;
    harness
        .poll_until(json!({"op": "getOutput", "sessionId": second}), |output| {
            output["output"] == "still here\n"
        })
        .await;
}

#[tokio::test]
async fn disconnect_all_closes_every_transport() {
    let harness = TestBridge::new();
    for _ in 0..3 {
        harness.connected_session().await;
    }
    harness.bridge.shutdown().await;
    assert!(harness.bridge.registry().session_ids().is_empty());
    assert!(harness.server.last_transport().unwrap().is_closed().await);
}

#[tokio::test]
async fn agent_auth_failure_is_reported() {
    let harness = TestBridge::new();
    let created = harness.call(json!({"op": "createSession"})).await;
    let id = created["sessionId"].as_str().unwrap();
    let response = harness
        .call(json!({"op": "connect", "sessionId": id, "hostname": "h", "username": "u", "useAgent": true}))
        .await;
    assert_eq!(response["success"], false);
    assert!(response["error"]
        .as_str()
        .unwrap()
        .starts_with("SSH agent unavailable"));
    let params = ConnectParams::new("h", 22, "u", AuthMethod::Agent);
    assert!(matches!(
        harness.bridge.registry().connect("session-99", params).await,
        Err(SessionError::NotFound)
    ));
}

#[test]
#[serial]
fn default_profile_store_lives_in_the_config_dir() {
    let dir = std::env::temp_dir().join(format!("skiff-profiles-{}", std::process::id()));
    skiff_paths::set_config_dir(dir.clone());
    let store = ProfileStore::open_default();
    assert_eq!(store.path(), skiff_paths::connections_file().as_path());
    assert_eq!(store.path().parent(), Some(skiff_paths::config_dir().as_path()));
}

#[tokio::test]
#[serial]
async fn saved_profile_round_trips_through_the_default_store() {
    let dir = std::env::temp_dir().join(format!("skiff-profiles-{}", std::process::id()));
    skiff_paths::set_config_dir(dir);
    let store = ProfileStore::open_default();
    store
        .save(session::ConnectionProfile::new(None, "db", 22, "alice", None))
        .unwrap();
    assert!(store.list().iter().any(|saved| saved.key == "db@alice"));
    assert!(store.delete("db@alice").unwrap());
}

#[tokio::test]
async fn unreachable_host_leaves_the_session_retryable() {
    let server = transport::fake::FakeServer::new()
        .with_account(common::USER, common::PASSWORD)
        .with_unreachable("down.example");
    let harness = TestBridge::with_server(server, Config::default());
    let created = harness.call(json!({"op": "createSession"})).await;
    let id = created["sessionId"].as_str().unwrap();

    let failed = harness
        .call(json!({"op": "connect", "sessionId": id, "hostname": "down.example", "username": "u", "password": "p"}))
        .await;
    assert_eq!(failed["success"], false);
    assert!(failed["error"]
        .as_str()
        .unwrap()
        .starts_with("Host unreachable: down.example:22"));

    let retried = harness
        .call(json!({"op": "connect", "sessionId": id, "hostname": "h", "username": "u", "password": "p"}))
        .await;
    assert_eq!(retried, json!({"success": true}));
    assert_eq!(harness.server.connect_count(), 2);
}

#[tokio::test]
#[serial]
async fn download_without_local_path_lands_in_the_downloads_dir() {
    let dir = std::env::temp_dir().join(format!("skiff-downloads-{}", std::process::id()));
    skiff_paths::set_downloads_dir(dir);
    let harness = TestBridge::new();
    harness.server.fs().add_file("/etc/motd", b"welcome\n".to_vec());
    let id = harness.connected_session().await;

    let started = harness
        .call(json!({"op": "startDownload", "sessionId": id, "remotePath": "/etc/motd"}))
        .await;
    let transfer_id = started["transferId"].as_str().unwrap().to_string();
    harness
        .poll_until(
            json!({"op": "getTransferProgress", "sessionId": id, "transferId": transfer_id}),
            |progress| progress["status"] == "completed",
        )
        .await;

    let target = skiff_paths::downloads_dir().join("motd");
    assert_eq!(std::fs::read(&target).unwrap(), b"welcome\n");
    std::fs::remove_file(target).ok();
}
