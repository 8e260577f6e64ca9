use std::path::PathBuf;
use std::time::Duration;

/// Which SFTP status the server answered with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SftpErrorKind {
    NotFound,
    PermissionDenied,
    Failure,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Invalid connection parameter: {0}")]
    InvalidParams(String),

    #[error("Host unreachable: {0}")]
    Unreachable(String),

    #[error("Authentication failed")]
    AuthRejected,

    #[error("SSH agent unavailable: {0}")]
    Agent(String),

    #[error("Cannot use key file {}: {message}", path.display())]
    KeyFile { path: PathBuf, message: String },

    #[error("Host key for {host} does not match the one recorded in known_hosts")]
    HostKeyMismatch { host: String },

    #[error("Invalid host key: {0}")]
    HostKey(String),

    #[error("Connection timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("Channel request failed: {0}")]
    Channel(String),

    #[error("{message}")]
    Sftp { kind: SftpErrorKind, message: String },

    #[error("Connection closed")]
    Closed,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Ssh(#[from] russh::Error),
}

impl TransportError {
    pub fn sftp(kind: SftpErrorKind, message: impl Into<String>) -> Self {
        Self::Sftp {
            kind,
            message: message.into(),
        }
    }

    /// Errors after which the connection itself is gone, as opposed to a
    /// single request failing.
    pub fn is_connection_lost(&self) -> bool {
        match self {
            Self::Closed | Self::Unreachable(_) | Self::Timeout(_) => true,
            Self::Ssh(russh::Error::IO(_)) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_are_human_readable() {
        assert_eq!(
            TransportError::MissingField("hostname").to_string(),
            "Missing required field: hostname"
        );
        assert_eq!(
            TransportError::Timeout(Duration::from_secs(30)).to_string(),
            "Connection timed out after 30s"
        );
        assert_eq!(
            TransportError::sftp(SftpErrorKind::NotFound, "No such file").to_string(),
            "No such file"
        );
    }

    #[test]
    fn closed_counts_as_connection_lost() {
        assert!(TransportError::Closed.is_connection_lost());
        assert!(!TransportError::AuthRejected.is_connection_lost());
        assert!(!TransportError::sftp(SftpErrorKind::Failure, "x").is_connection_lost());
    }
}
