#![allow(dead_code)]

use serde_json::{json, Value};
use session::{Bridge, ProfileStore, SessionRegistry};
use settings::Config;
use std::sync::Arc;
use std::time::Duration;
use transport::fake::FakeServer;

pub const USER: &str = "u";
pub const PASSWORD: &str = "p";

/// A bridge wired to a fake server with one account, `u`/`p`.
pub struct TestBridge {
    pub server: FakeServer,
    pub bridge: Bridge,
    _dir: tempfile::TempDir,
}

impl TestBridge {
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        Self::with_server(FakeServer::new().with_account(USER, PASSWORD), config)
    }

    pub fn with_server(server: FakeServer, config: Config) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(SessionRegistry::new(server.connector(), config));
        let profiles = ProfileStore::new(dir.path().join("connections.json"));
        Self {
            server,
            bridge: Bridge::new(registry, profiles),
            _dir: dir,
        }
    }

    pub async fn call(&self, request: Value) -> Value {
        let line = self.bridge.handle_json(&request.to_string()).await;
        serde_json::from_str(&line).unwrap()
    }

    /// Create a session and log in with valid credentials.
    pub async fn connected_session(&self) -> String {
        let created = self.call(json!({"op": "createSession"})).await;
        let id = created["sessionId"].as_str().unwrap().to_string();
        let connected = self
            .call(json!({
                "op": "connect",
                "sessionId": id,
                "hostname": "h",
                "port": 22,
                "username": USER,
                "password": PASSWORD,
            }))
            .await;
        assert_eq!(connected, json!({"success": true}), "connect failed");
        id
    }

    /// Re-issue `request` until `done` accepts the response.
    pub async fn poll_until(&self, request: Value, mut done: impl FnMut(&Value) -> bool) -> Value {
        for _ in 0..500 {
            let response = self.call(request.clone()).await;
            if done(&response) {
                return response;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition never met for {request}");
    }
}
