use transport::{SftpErrorKind, TransportError};

/// A failed filesystem operation. Never fatal to the session.
#[derive(Debug, thiserror::Error)]
pub enum FsError {
    #[error("No such file or directory: {path}")]
    NotFound { path: String },

    #[error("Permission denied: {path}")]
    PermissionDenied { path: String },

    #[error("Invalid path: {0:?}")]
    InvalidPath(String),

    #[error("SFTP unavailable: {0}")]
    Unavailable(String),

    #[error("{path}: {message}")]
    Failed { path: String, message: String },
}

impl FsError {
    pub(crate) fn from_transport(path: &str, error: TransportError) -> Self {
        let path = path.to_string();
        match error {
            TransportError::Sftp {
                kind: SftpErrorKind::NotFound,
                ..
            } => Self::NotFound { path },
            TransportError::Sftp {
                kind: SftpErrorKind::PermissionDenied,
                ..
            } => Self::PermissionDenied { path },
            error if error.is_connection_lost() => Self::Unavailable(error.to_string()),
            error => Self::Failed {
                path,
                message: error.to_string(),
            },
        }
    }
}

/// Reject paths no server would accept before spending a round trip.
pub(crate) fn validate_path(path: &str) -> Result<(), FsError> {
    if path.trim().is_empty() || path.contains('\0') {
        return Err(FsError::InvalidPath(path.to_string()));
    }
    Ok(())
}
