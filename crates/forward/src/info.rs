use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ForwardKind {
    Local,
    Remote,
    Dynamic,
}

impl ForwardKind {
    fn letter(self) -> char {
        match self {
            Self::Local => 'L',
            Self::Remote => 'R',
            Self::Dynamic => 'D',
        }
    }
}

/// Status snapshot of one forward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardInfo {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ForwardKind,
    pub description: String,
    pub bind_address: String,
    pub bind_port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_port: Option<u16>,
    pub active: bool,
    /// Tunnels currently open.
    pub connections: usize,
    /// Bytes carried toward the SSH side.
    pub bytes_sent: u64,
    /// Bytes carried from the SSH side.
    pub bytes_received: u64,
}

/// `L 127.0.0.1:8080 -> localhost:80`, `D 127.0.0.1:1080 (SOCKS)`.
pub(crate) fn describe(
    kind: ForwardKind,
    bind_address: &str,
    bind_port: u16,
    target: Option<(&str, u16)>,
) -> String {
    let letter = kind.letter();
    match target {
        Some((host, port)) => format!("{letter} {bind_address}:{bind_port} -> {host}:{port}"),
        None => format!("{letter} {bind_address}:{bind_port} (SOCKS)"),
    }
}
