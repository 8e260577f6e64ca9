use crate::profiles::{ConnectionProfile, ProfileStore};
use crate::protocol::{Payload, Request, Response};
use crate::{SessionError, SessionRegistry};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use remote_fs::UploadSource;
use std::sync::Arc;
use transport::{AuthMethod, ConnectParams};
use util::ResultExt;

/// Dispatches typed requests to the registry.
///
/// Every call answers with a [`Response`]; operation failures never touch
/// other sessions and only connection-level failures change session state.
pub struct Bridge {
    registry: Arc<SessionRegistry>,
    profiles: ProfileStore,
}

impl Bridge {
    pub fn new(registry: Arc<SessionRegistry>, profiles: ProfileStore) -> Self {
        Self { registry, profiles }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Handle one JSON request line and encode the answer. A `requestId`
    /// field on the request is echoed back verbatim.
    pub async fn handle_json(&self, line: &str) -> String {
        let value: serde_json::Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(error) => return encode(&Response::failure(format!("Invalid request: {error}")), None),
        };
        let request_id = value.get("requestId").cloned();
        let response = match serde_json::from_value::<Request>(value) {
            Ok(request) => self.handle(request).await,
            Err(error) => Response::failure(format!("Invalid request: {error}")),
        };
        encode(&response, request_id)
    }

    pub async fn handle(&self, request: Request) -> Response {
        let op = request.op();
        match self.dispatch(request).await {
            // Unknown sessions report `connected: false` alongside the error.
            Ok(Some(Payload::Status(status))) if status.state.is_none() => Response {
                success: false,
                error: None,
                payload: Some(Payload::Status(status)),
            },
            Ok(Some(payload)) => Response::with(payload),
            Ok(None) => Response::ok(),
            Err(error) => {
                tracing::debug!(op, %error, "Request failed");
                Response::failure(error)
            }
        }
    }

    /// Disconnect every session.
    pub async fn shutdown(&self) {
        self.registry.disconnect_all().await;
    }

    async fn dispatch(&self, request: Request) -> Result<Option<Payload>, SessionError> {
        let payload = match request {
            Request::CreateSession => Payload::Session {
                session_id: self.registry.create_session(),
            },
            Request::Connect {
                session_id,
                hostname,
                port,
                username,
                password,
                key_path,
                passphrase,
                use_agent,
                save,
                name,
            } => {
                let hostname = hostname.trim();
                let username = username.trim();
                let port = port.unwrap_or(self.registry.config().default_port);
                let key_path = key_path.filter(|path| !path.trim().is_empty());
                let auth = auth_method(password, key_path.as_deref(), passphrase, use_agent)?;
                let params = ConnectParams::new(hostname, port, username, auth);
                self.registry.connect(&session_id, params).await?;
                if save {
                    let profile = ConnectionProfile::new(name, hostname, port, username, key_path);
                    self.profiles
                        .save(profile)
                        .log_err_with("saving connection profile");
                }
                return Ok(None);
            }
            Request::Disconnect { session_id } => {
                self.registry.disconnect(&session_id).await?;
                return Ok(None);
            }
            Request::DisconnectAll => {
                self.registry.disconnect_all().await;
                return Ok(None);
            }
            Request::GetStatus { session_id } => Payload::Status(self.registry.status(&session_id)),

            Request::SendInput { session_id, data } => {
                self.registry.get(&session_id)?.send_input(&data).await?;
                return Ok(None);
            }
            Request::ResizeTerminal {
                session_id,
                cols,
                rows,
            } => {
                self.registry.get(&session_id)?.resize(cols, rows).await?;
                return Ok(None);
            }
            Request::GetOutput { session_id } => Payload::Output {
                output: self.registry.get(&session_id)?.read_output(),
            },

            Request::ListDirectory { session_id, path } => Payload::Files {
                files: self.registry.get(&session_id)?.list_directory(&path).await?,
            },
            Request::CreateDirectory { session_id, path } => {
                self.registry.get(&session_id)?.create_directory(&path).await?;
                return Ok(None);
            }
            Request::RenameFile {
                session_id,
                old_path,
                new_path,
            } => {
                self.registry
                    .get(&session_id)?
                    .rename(&old_path, &new_path)
                    .await?;
                return Ok(None);
            }
            Request::DeleteFile { session_id, path } => {
                self.registry.get(&session_id)?.delete_file(&path).await?;
                return Ok(None);
            }
            Request::DeleteDirectory { session_id, path } => {
                self.registry.get(&session_id)?.delete_directory(&path).await?;
                return Ok(None);
            }
            Request::GetFileInfo { session_id, path } => {
                Payload::FileInfo(self.registry.get(&session_id)?.file_info(&path).await?)
            }

            Request::StartDownload {
                session_id,
                remote_path,
                local_path,
                transfer_id,
            } => {
                let session = self.registry.get(&session_id)?;
                let local_path = local_path
                    .filter(|path| !path.trim().is_empty())
                    .map(|path| skiff_paths::expand_home(&path));
                Payload::TransferStarted {
                    transfer_id: session
                        .start_download(&remote_path, local_path, transfer_id)
                        .await?,
                }
            }
            Request::StartUpload {
                session_id,
                remote_path,
                content,
                local_path,
                transfer_id,
            } => {
                let session = self.registry.get(&session_id)?;
                let source = upload_source(content, local_path)?;
                Payload::TransferStarted {
                    transfer_id: session
                        .start_upload(source, &remote_path, transfer_id)
                        .await?,
                }
            }
            Request::GetTransferProgress {
                session_id,
                transfer_id,
            } => Payload::Transfer(
                self.registry
                    .get(&session_id)?
                    .transfer_progress(&transfer_id)?,
            ),
            Request::CancelTransfer {
                session_id,
                transfer_id,
            } => Payload::Transfer(
                self.registry
                    .get(&session_id)?
                    .cancel_transfer(&transfer_id)
                    .await?,
            ),
            Request::ListTransfers { session_id } => Payload::Transfers {
                transfers: self.registry.get(&session_id)?.list_transfers(),
            },

            Request::CreateLocalPortForward {
                session_id,
                local_port,
                remote_host,
                remote_port,
                bind_address,
            } => {
                let forward = self
                    .registry
                    .get(&session_id)?
                    .create_local_forward(bind_address.as_deref(), local_port, &remote_host, remote_port)
                    .await?;
                Payload::ForwardCreated {
                    forward_id: forward.id.clone(),
                    forward,
                }
            }
            Request::CreateRemotePortForward {
                session_id,
                remote_port,
                local_host,
                local_port,
                bind_address,
            } => {
                let forward = self
                    .registry
                    .get(&session_id)?
                    .create_remote_forward(bind_address.as_deref(), remote_port, &local_host, local_port)
                    .await?;
                Payload::ForwardCreated {
                    forward_id: forward.id.clone(),
                    forward,
                }
            }
            Request::CreateDynamicPortForward {
                session_id,
                socks_port,
                bind_address,
            } => {
                let forward = self
                    .registry
                    .get(&session_id)?
                    .create_dynamic_forward(bind_address.as_deref(), socks_port)
                    .await?;
                Payload::ForwardCreated {
                    forward_id: forward.id.clone(),
                    forward,
                }
            }
            Request::StopPortForward {
                session_id,
                forward_id,
            } => {
                self.registry.get(&session_id)?.stop_forward(&forward_id).await?;
                return Ok(None);
            }
            Request::ListPortForwards { session_id } => Payload::Forwards {
                forwards: self.registry.get(&session_id)?.list_forwards(),
            },

            Request::ExecCommand {
                session_id,
                command,
            } => Payload::Command(self.registry.get(&session_id)?.exec(&command).await?),
            Request::GetResourceUsage { session_id } => {
                Payload::Resources(self.registry.get(&session_id)?.resource_usage().await?)
            }

            Request::GetSavedConnections => Payload::Connections {
                connections: self.profiles.list(),
            },
            Request::DeleteSavedConnection { key } => {
                if !self.profiles.delete(&key)? {
                    return Err(SessionError::InvalidRequest(format!(
                        "Saved connection not found: {key}"
                    )));
                }
                return Ok(None);
            }
        };
        Ok(Some(payload))
    }
}

/// A key file wins over a password; the agent is only used when asked for.
fn auth_method(
    password: Option<String>,
    key_path: Option<&str>,
    passphrase: Option<String>,
    use_agent: bool,
) -> Result<AuthMethod, SessionError> {
    if let Some(path) = key_path {
        return Ok(AuthMethod::KeyFile {
            path: skiff_paths::expand_home(path.trim()),
            passphrase: passphrase.filter(|passphrase| !passphrase.is_empty()),
        });
    }
    if let Some(password) = password.filter(|password| !password.is_empty()) {
        return Ok(AuthMethod::Password(password));
    }
    if use_agent {
        return Ok(AuthMethod::Agent);
    }
    Err(SessionError::missing("password, keyPath or useAgent"))
}

fn upload_source(
    content: Option<String>,
    local_path: Option<String>,
) -> Result<UploadSource, SessionError> {
    if let Some(content) = content {
        let bytes = BASE64
            .decode(content.trim())
            .map_err(|error| SessionError::InvalidRequest(format!("Invalid base64 content: {error}")))?;
        return Ok(UploadSource::Bytes(bytes));
    }
    match local_path.filter(|path| !path.trim().is_empty()) {
        Some(path) => Ok(UploadSource::File(skiff_paths::expand_home(&path))),
        None => Err(SessionError::missing("content")),
    }
}

fn encode(response: &Response, request_id: Option<serde_json::Value>) -> String {
    let mut value = match serde_json::to_value(response) {
        Ok(value) => value,
        Err(error) => {
            util::debug_panic!("Unserializable response: {error}");
            serde_json::json!({"success": false, "error": "Internal error"})
        }
    };
    if let (Some(request_id), Some(object)) = (request_id, value.as_object_mut()) {
        object.insert("requestId".into(), request_id);
    }
    value.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};
    use settings::Config;
    use std::time::Duration;
    use test_case::test_case;
    use transport::fake::FakeServer;

    struct Harness {
        server: FakeServer,
        bridge: Bridge,
        _dir: tempfile::TempDir,
    }

    impl Harness {
        fn new() -> Self {
            let server = FakeServer::new().with_account("u", "p");
            let dir = tempfile::tempdir().unwrap();
            let registry = Arc::new(SessionRegistry::new(server.connector(), Config::default()));
            let profiles = ProfileStore::new(dir.path().join("connections.json"));
            Self {
                server,
                bridge: Bridge::new(registry, profiles),
                _dir: dir,
            }
        }

        async fn call(&self, request: Value) -> Value {
            let line = self.bridge.handle_json(&request.to_string()).await;
            serde_json::from_str(&line).unwrap()
        }

        async fn connected(&self) -> String {
            let created = self.call(json!({"op": "createSession"})).await;
            let id = created["sessionId"].as_str().unwrap().to_string();
            let connected = self
                .call(json!({"op": "connect", "sessionId": id, "hostname": "h", "username": "u", "password": "p"}))
                .await;
            assert_eq!(connected, json!({"success": true}));
            id
        }
    }

    #[tokio::test]
    async fn create_connect_status() {
        let harness = Harness::new();
        let id = harness.connected().await;

        let status = harness.call(json!({"op": "getStatus", "sessionId": id})).await;
        assert_eq!(status["success"], true);
        assert_eq!(status["connected"], true);
        assert_eq!(status["hostname"], "h");
        assert_eq!(status["port"], 22);
    }

    #[tokio::test]
    async fn unknown_session_status() {
        let harness = Harness::new();
        let status = harness.call(json!({"op": "getStatus", "sessionId": "session-7"})).await;
        assert_eq!(
            status,
            json!({"success": false, "id": "session-7", "connected": false, "error": "Session not found"})
        );
    }

    #[test_case("{not json" ; "broken json")]
    #[test_case(r#"{"op": "launchRockets"}"# ; "unknown op")]
    #[test_case(r#"{"op": "listDirectory"}"# ; "missing fields")]
    #[tokio::test]
    async fn malformed_requests(line: &str) {
        let harness = Harness::new();
        let response: Value = serde_json::from_str(&harness.bridge.handle_json(line).await).unwrap();
        assert_eq!(response["success"], false);
        assert!(response["error"]
            .as_str()
            .unwrap()
            .starts_with("Invalid request: "));
    }

    #[tokio::test]
    async fn request_id_is_echoed() {
        let harness = Harness::new();
        let response = harness
            .call(json!({"op": "createSession", "requestId": 41}))
            .await;
        assert_eq!(response["requestId"], 41);
        assert_eq!(response["sessionId"], "session-1");
    }

    #[tokio::test]
    async fn connect_errors_are_inline() {
        let harness = Harness::new();
        let created = harness.call(json!({"op": "createSession"})).await;
        let id = created["sessionId"].as_str().unwrap();

        let missing_host = harness
            .call(json!({"op": "connect", "sessionId": id, "username": "u", "password": "p"}))
            .await;
        assert_eq!(missing_host["error"], "Missing required field: hostname");

        let no_auth = harness
            .call(json!({"op": "connect", "sessionId": id, "hostname": "h", "username": "u"}))
            .await;
        assert_eq!(no_auth["success"], false);
        assert!(no_auth["error"].as_str().unwrap().contains("password"));

        let rejected = harness
            .call(json!({"op": "connect", "sessionId": id, "hostname": "h", "username": "u", "password": "nope"}))
            .await;
        assert_eq!(rejected["error"], "Authentication failed");

        let status = harness.call(json!({"op": "getStatus", "sessionId": id})).await;
        assert_eq!(status["connected"], false);
        assert_eq!(status["state"], "created");
    }

    #[tokio::test]
    async fn shell_round_trip() {
        let harness = Harness::new();
        let id = harness.connected().await;

        let sent = harness
            .call(json!({"op": "sendInput", "sessionId": id, "data": "echo hi\n"}))
            .await;
        assert_eq!(sent, json!({"success": true}));

        let mut output = String::new();
        for _ in 0..100 {
            let polled = harness.call(json!({"op": "getOutput", "sessionId": id})).await;
            output.push_str(polled["output"].as_str().unwrap());
            if output.contains("echo hi") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(output, "echo hi\n");
    }

    #[tokio::test]
    async fn file_operations() {
        let harness = Harness::new();
        harness.server.fs().add_dir("/home/u/docs");
        harness.server.fs().add_file("/home/u/notes.txt", "hello");
        let id = harness.connected().await;

        let listing = harness
            .call(json!({"op": "listDirectory", "sessionId": id, "path": "/home/u"}))
            .await;
        let names: Vec<&str> = listing["files"]
            .as_array()
            .unwrap()
            .iter()
            .map(|entry| entry["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["docs", "notes.txt"]);

        let renamed = harness
            .call(json!({"op": "renameFile", "sessionId": id, "oldPath": "/home/u/notes.txt", "newPath": "/home/u/todo.txt"}))
            .await;
        assert_eq!(renamed["success"], true);

        let info = harness
            .call(json!({"op": "getFileInfo", "sessionId": id, "path": "/home/u/todo.txt"}))
            .await;
        assert_eq!(info["success"], true);
        assert_eq!(info["name"], "todo.txt");
        assert_eq!(info["size"], "5B");

        let missing = harness
            .call(json!({"op": "listDirectory", "sessionId": id, "path": "/nonexistent"}))
            .await;
        assert_eq!(missing["success"], false);
        assert!(missing["error"].as_str().unwrap().contains("/nonexistent"));

        let status = harness.call(json!({"op": "getStatus", "sessionId": id})).await;
        assert_eq!(status["connected"], true);
    }

    #[tokio::test]
    async fn upload_validates_content() {
        let harness = Harness::new();
        harness.server.fs().add_dir("/tmp");
        let id = harness.connected().await;

        let bad = harness
            .call(json!({"op": "startUpload", "sessionId": id, "remotePath": "/tmp/x", "content": "***"}))
            .await;
        assert!(bad["error"].as_str().unwrap().starts_with("Invalid base64 content"));

        let missing = harness
            .call(json!({"op": "startUpload", "sessionId": id, "remotePath": "/tmp/x"}))
            .await;
        assert_eq!(missing["error"], "Missing required field: content");

        let started = harness
            .call(json!({"op": "startUpload", "sessionId": id, "remotePath": "/tmp/x", "content": "aGVsbG8=", "transferId": "up-1"}))
            .await;
        assert_eq!(started, json!({"success": true, "transferId": "up-1"}));

        for _ in 0..100 {
            let progress = harness
                .call(json!({"op": "getTransferProgress", "sessionId": id, "transferId": "up-1"}))
                .await;
            if progress["status"] == "completed" {
                assert_eq!(progress["transferred"], 5);
                assert_eq!(harness.server.fs().contents("/tmp/x").unwrap(), b"hello");
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("upload never completed");
    }

    #[tokio::test]
    async fn forwards_through_the_bridge() {
        let harness = Harness::new();
        let id = harness.connected().await;

        let created = harness
            .call(json!({"op": "createDynamicPortForward", "sessionId": id, "socksPort": 0}))
            .await;
        assert_eq!(created["success"], true);
        assert_eq!(created["forwardId"], "fwd-1");
        assert_eq!(created["forward"]["type"], "dynamic");

        let listed = harness
            .call(json!({"op": "listPortForwards", "sessionId": id}))
            .await;
        assert_eq!(listed["forwards"].as_array().unwrap().len(), 1);

        let stopped = harness
            .call(json!({"op": "stopPortForward", "sessionId": id, "forwardId": "fwd-1"}))
            .await;
        assert_eq!(stopped, json!({"success": true}));
        let again = harness
            .call(json!({"op": "stopPortForward", "sessionId": id, "forwardId": "fwd-1"}))
            .await;
        assert_eq!(again["error"], "Forward fwd-1 not found");
        let listed = harness
            .call(json!({"op": "listPortForwards", "sessionId": id}))
            .await;
        assert_eq!(listed, json!({"success": true, "forwards": []}));
    }

    #[tokio::test]
    async fn saved_connections() {
        let harness = Harness::new();
        let created = harness.call(json!({"op": "createSession"})).await;
        let id = created["sessionId"].as_str().unwrap();
        let connected = harness
            .call(json!({"op": "connect", "sessionId": id, "hostname": "h", "username": "u", "password": "p", "save": true}))
            .await;
        assert_eq!(connected["success"], true);

        let saved = harness.call(json!({"op": "getSavedConnections"})).await;
        assert_eq!(
            saved,
            json!({"success": true, "connections": [
                {"key": "h@u", "name": "u@h", "hostname": "h", "port": 22, "username": "u"}
            ]})
        );

        let deleted = harness
            .call(json!({"op": "deleteSavedConnection", "key": "h@u"}))
            .await;
        assert_eq!(deleted, json!({"success": true}));
        let again = harness
            .call(json!({"op": "deleteSavedConnection", "key": "h@u"}))
            .await;
        assert_eq!(again["success"], false);
    }

    #[tokio::test]
    async fn disconnect_then_operations_fail() {
        let harness = Harness::new();
        let id = harness.connected().await;

        let disconnected = harness.call(json!({"op": "disconnect", "sessionId": id})).await;
        assert_eq!(disconnected, json!({"success": true}));
        let output = harness.call(json!({"op": "getOutput", "sessionId": id})).await;
        assert_eq!(output["error"], "Session not found");
    }

    #[test]
    fn key_file_wins_over_password() {
        let auth = auth_method(Some("p".into()), Some("/keys/id"), Some(String::new()), true).unwrap();
        assert_eq!(
            auth,
            AuthMethod::KeyFile {
                path: "/keys/id".into(),
                passphrase: None
            }
        );
        assert_eq!(
            auth_method(Some(String::new()), None, None, true).unwrap(),
            AuthMethod::Agent
        );
    }
}
