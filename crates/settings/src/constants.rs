//! Centralized configuration constants for skiff.
//!
//! Compile-time defaults for the session engine, organized by component.
//! Most of them can be overridden from `config.toml`.

/// SSH transport configuration.
pub mod ssh {
    use std::time::Duration;

    /// Port used when a connect request does not name one.
    pub const DEFAULT_PORT: u16 = 22;
    /// Upper bound on TCP connect plus handshake plus authentication.
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
    /// Interval between keepalive requests on an idle transport.
    pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
    /// Unanswered keepalives before the transport is considered dead.
    pub const KEEPALIVE_MAX: usize = 3;
}

/// Interactive shell configuration.
pub mod terminal {
    /// Terminal type announced in the pty request.
    pub const TERM: &str = "xterm-256color";
    /// Default terminal width in columns.
    pub const DEFAULT_COLS: u16 = 80;
    /// Default terminal height in rows.
    pub const DEFAULT_ROWS: u16 = 24;
    /// Largest accepted terminal dimension.
    pub const MAX_DIMENSION: u16 = 1000;
    /// Output chunks queued between the channel driver and the pump.
    pub const OUTPUT_QUEUE_DEPTH: usize = 256;
}

/// File transfer configuration.
pub mod transfer {
    use std::time::Duration;

    /// Default chunk size for reads and writes (32 KiB).
    pub const CHUNK_SIZE: usize = 32 * 1024;
    /// Smallest chunk size accepted from config.
    pub const MIN_CHUNK_SIZE: usize = 4 * 1024;
    /// Largest chunk size accepted from config.
    pub const MAX_CHUNK_SIZE: usize = 1024 * 1024;
    /// Bound on how long a cancel waits for the worker to release its handles.
    pub const SETTLE_TIMEOUT: Duration = Duration::from_secs(5);
}

/// Port forwarding configuration.
pub mod forward {
    use std::time::Duration;

    /// Address local and dynamic forwards bind when none is given.
    pub const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1";
    /// Address remote forwards ask the server to bind when none is given.
    pub const DEFAULT_REMOTE_BIND_ADDRESS: &str = "0.0.0.0";
    /// Relay buffer per direction (32 KiB).
    pub const RELAY_BUFFER_SIZE: usize = 32 * 1024;
    /// How long `stop` waits for a listener task to release its socket.
    pub const STOP_TIMEOUT: Duration = Duration::from_secs(1);
    /// Once one side of a tunnel closes, how long the other direction may
    /// keep draining before the tunnel is torn down.
    pub const HALF_CLOSE_GRACE: Duration = Duration::from_secs(1);
    /// Deadline for a SOCKS client to finish its greeting and request.
    pub const SOCKS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
}

/// Settings file validation limits.
pub mod settings {
    /// Maximum settings file size in bytes (64 KB).
    /// Settings files should be tiny; anything larger is suspicious.
    pub const MAX_FILE_SIZE: u64 = 64 * 1024;

    /// Maximum length for string fields (terminal type, paths, log filter).
    pub const MAX_STRING_LENGTH: usize = 256;
}
