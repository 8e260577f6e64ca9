use crate::probe::ProbeError;
use crate::profiles::ProfileError;
use forward::ForwardError;
use remote_fs::{FsError, TransferError};
use terminal::PumpError;
use transport::TransportError;

/// Everything a bridge call can fail with. Only connection-level variants
/// change session state; the rest are reported inline.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Session not found")]
    NotFound,

    #[error("Not connected")]
    NotConnected,

    #[error("Session is already connected")]
    AlreadyConnected,

    #[error("Session is already connecting")]
    AlreadyConnecting,

    #[error("Session has been disconnected")]
    Disconnected,

    #[error("{0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Shell(#[from] PumpError),

    #[error(transparent)]
    Fs(#[from] FsError),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error(transparent)]
    Forward(#[from] ForwardError),

    #[error(transparent)]
    Probe(#[from] ProbeError),

    #[error(transparent)]
    Profiles(#[from] ProfileError),
}

impl SessionError {
    pub(crate) fn missing(field: &str) -> Self {
        Self::InvalidRequest(format!("Missing required field: {field}"))
    }
}
