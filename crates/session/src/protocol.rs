//! Wire types for the request/response bridge.
//!
//! Requests are JSON objects tagged by `"op"`; every response is a flat
//! object with `success`, an optional `error` and the payload fields of the
//! operation alongside.

use crate::probe::{CommandOutput, ResourceUsage};
use crate::{SavedConnection, SessionStatus};
use forward::ForwardInfo;
use remote_fs::{FileEntry, FileInfo, TransferProgress};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Request {
    CreateSession,
    Connect {
        session_id: String,
        #[serde(default)]
        hostname: String,
        port: Option<u16>,
        #[serde(default)]
        username: String,
        password: Option<String>,
        key_path: Option<String>,
        passphrase: Option<String>,
        #[serde(default)]
        use_agent: bool,
        /// Store a profile once the connection is up.
        #[serde(default)]
        save: bool,
        name: Option<String>,
    },
    Disconnect {
        session_id: String,
    },
    DisconnectAll,
    GetStatus {
        session_id: String,
    },

    SendInput {
        session_id: String,
        data: String,
    },
    ResizeTerminal {
        session_id: String,
        cols: u16,
        rows: u16,
    },
    GetOutput {
        session_id: String,
    },

    ListDirectory {
        session_id: String,
        path: String,
    },
    CreateDirectory {
        session_id: String,
        path: String,
    },
    RenameFile {
        session_id: String,
        old_path: String,
        new_path: String,
    },
    DeleteFile {
        session_id: String,
        path: String,
    },
    DeleteDirectory {
        session_id: String,
        path: String,
    },
    GetFileInfo {
        session_id: String,
        path: String,
    },

    StartDownload {
        session_id: String,
        remote_path: String,
        local_path: Option<String>,
        transfer_id: Option<String>,
    },
    StartUpload {
        session_id: String,
        remote_path: String,
        /// Base64 file content.
        content: Option<String>,
        local_path: Option<String>,
        transfer_id: Option<String>,
    },
    GetTransferProgress {
        session_id: String,
        transfer_id: String,
    },
    CancelTransfer {
        session_id: String,
        transfer_id: String,
    },
    ListTransfers {
        session_id: String,
    },

    CreateLocalPortForward {
        session_id: String,
        local_port: u16,
        remote_host: String,
        remote_port: u16,
        bind_address: Option<String>,
    },
    CreateRemotePortForward {
        session_id: String,
        remote_port: u16,
        local_host: String,
        local_port: u16,
        bind_address: Option<String>,
    },
    CreateDynamicPortForward {
        session_id: String,
        socks_port: u16,
        bind_address: Option<String>,
    },
    StopPortForward {
        session_id: String,
        forward_id: String,
    },
    ListPortForwards {
        session_id: String,
    },

    ExecCommand {
        session_id: String,
        command: String,
    },
    GetResourceUsage {
        session_id: String,
    },

    GetSavedConnections,
    DeleteSavedConnection {
        key: String,
    },
}

impl Request {
    /// Name of the operation, as sent in `"op"`.
    pub fn op(&self) -> &'static str {
        match self {
            Self::CreateSession => "createSession",
            Self::Connect { .. } => "connect",
            Self::Disconnect { .. } => "disconnect",
            Self::DisconnectAll => "disconnectAll",
            Self::GetStatus { .. } => "getStatus",
            Self::SendInput { .. } => "sendInput",
            Self::ResizeTerminal { .. } => "resizeTerminal",
            Self::GetOutput { .. } => "getOutput",
            Self::ListDirectory { .. } => "listDirectory",
            Self::CreateDirectory { .. } => "createDirectory",
            Self::RenameFile { .. } => "renameFile",
            Self::DeleteFile { .. } => "deleteFile",
            Self::DeleteDirectory { .. } => "deleteDirectory",
            Self::GetFileInfo { .. } => "getFileInfo",
            Self::StartDownload { .. } => "startDownload",
            Self::StartUpload { .. } => "startUpload",
            Self::GetTransferProgress { .. } => "getTransferProgress",
            Self::CancelTransfer { .. } => "cancelTransfer",
            Self::ListTransfers { .. } => "listTransfers",
            Self::CreateLocalPortForward { .. } => "createLocalPortForward",
            Self::CreateRemotePortForward { .. } => "createRemotePortForward",
            Self::CreateDynamicPortForward { .. } => "createDynamicPortForward",
            Self::StopPortForward { .. } => "stopPortForward",
            Self::ListPortForwards { .. } => "listPortForwards",
            Self::ExecCommand { .. } => "execCommand",
            Self::GetResourceUsage { .. } => "getResourceUsage",
            Self::GetSavedConnections => "getSavedConnections",
            Self::DeleteSavedConnection { .. } => "deleteSavedConnection",
        }
    }
}

/// Operation-specific response fields.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged, rename_all_fields = "camelCase")]
pub enum Payload {
    Session { session_id: String },
    Status(SessionStatus),
    Output { output: String },
    Files { files: Vec<FileEntry> },
    FileInfo(FileInfo),
    TransferStarted { transfer_id: String },
    Transfer(TransferProgress),
    Transfers { transfers: Vec<TransferProgress> },
    ForwardCreated { forward_id: String, forward: ForwardInfo },
    Forwards { forwards: Vec<ForwardInfo> },
    Command(CommandOutput),
    Resources(ResourceUsage),
    Connections { connections: Vec<SavedConnection> },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Response {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub payload: Option<Payload>,
}

impl Response {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
            payload: None,
        }
    }

    pub fn with(payload: Payload) -> Self {
        Self {
            success: true,
            error: None,
            payload: Some(payload),
        }
    }

    pub fn failure(error: impl ToString) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
            payload: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use test_case::test_case;

    fn parse(value: serde_json::Value) -> Request {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn connect_fields_are_camel_case() {
        let request = parse(json!({
            "op": "connect",
            "sessionId": "session-1",
            "hostname": "h",
            "port": 2222,
            "username": "u",
            "keyPath": "~/.ssh/id_ed25519",
            "useAgent": false,
            "save": true,
        }));
        assert_eq!(
            request,
            Request::Connect {
                session_id: "session-1".into(),
                hostname: "h".into(),
                port: Some(2222),
                username: "u".into(),
                password: None,
                key_path: Some("~/.ssh/id_ed25519".into()),
                passphrase: None,
                use_agent: false,
                save: true,
                name: None,
            }
        );
    }

    #[test]
    fn connect_without_hostname_still_parses() {
        let request = parse(json!({"op": "connect", "sessionId": "session-1"}));
        assert!(matches!(request, Request::Connect { ref hostname, .. } if hostname.is_empty()));
    }

    #[test_case(json!({"op": "createSession"}), "createSession")]
    #[test_case(json!({"op": "renameFile", "sessionId": "s", "oldPath": "/a", "newPath": "/b"}), "renameFile")]
    #[test_case(json!({"op": "createLocalPortForward", "sessionId": "s", "localPort": 8080, "remoteHost": "localhost", "remotePort": 80}), "createLocalPortForward")]
    #[test_case(json!({"op": "createDynamicPortForward", "sessionId": "s", "socksPort": 1080}), "createDynamicPortForward")]
    #[test_case(json!({"op": "getTransferProgress", "sessionId": "s", "transferId": "t"}), "getTransferProgress")]
    #[test_case(json!({"op": "deleteSavedConnection", "key": "h@u"}), "deleteSavedConnection")]
    fn op_names_round_trip(value: serde_json::Value, op: &str) {
        assert_eq!(parse(value).op(), op);
    }

    #[test_case(json!({"op": "teleport"}) ; "unknown op")]
    #[test_case(json!({"sessionId": "s"}) ; "missing op")]
    #[test_case(json!({"op": "resizeTerminal", "sessionId": "s", "cols": -1, "rows": 24}) ; "negative size")]
    #[test_case(json!({"op": "listDirectory", "sessionId": "s"}) ; "missing path")]
    fn malformed_requests_are_rejected(value: serde_json::Value) {
        assert!(serde_json::from_value::<Request>(value).is_err());
    }

    #[test]
    fn responses_are_flat() {
        assert_eq!(
            serde_json::to_value(Response::with(Payload::Session {
                session_id: "session-1".into()
            }))
            .unwrap(),
            json!({"success": true, "sessionId": "session-1"})
        );
        assert_eq!(
            serde_json::to_value(Response::with(Payload::Output {
                output: "$ ".into()
            }))
            .unwrap(),
            json!({"success": true, "output": "$ "})
        );
        assert_eq!(
            serde_json::to_value(Response::ok()).unwrap(),
            json!({"success": true})
        );
        assert_eq!(
            serde_json::to_value(Response::failure("No such file or directory: /nope")).unwrap(),
            json!({"success": false, "error": "No such file or directory: /nope"})
        );
    }

    #[test]
    fn unknown_status_carries_a_single_error() {
        let response = Response {
            success: false,
            error: None,
            payload: Some(Payload::Status(SessionStatus::not_found("session-4"))),
        };
        assert_eq!(
            serde_json::to_value(response).unwrap(),
            json!({
                "success": false,
                "id": "session-4",
                "connected": false,
                "error": "Session not found",
            })
        );
    }
}
