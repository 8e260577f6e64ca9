use std::io;
use transport::TransportError;

#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("Failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("Invalid forward target: {0}")]
    InvalidTarget(String),

    #[error("Remote forward on {address} rejected: {source}")]
    RemoteRejected {
        address: String,
        #[source]
        source: TransportError,
    },

    #[error("Forward {0} not found")]
    NotFound(String),

    #[error("Port forwarding is shut down for this session")]
    ShutDown,
}
