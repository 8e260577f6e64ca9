//! Connection handle for skiff.
//!
//! Everything the engine needs from an SSH connection goes through the
//! [`Connector`], [`Transport`] and [`RemoteFs`] traits defined here. The
//! production implementation lives in [`ssh`] and is backed by `russh` and
//! `russh-sftp`; with the `test-support` feature, [`fake`] provides an
//! in-memory server for tests.

mod error;
pub mod known_hosts;
mod params;
mod shell;
mod sftp;
pub mod ssh;

#[cfg(any(test, feature = "test-support"))]
pub mod fake;

pub use error::{SftpErrorKind, TransportError};
pub use known_hosts::{HostKeyCheck, KnownHosts};
pub use params::{AuthMethod, ConnectParams};
pub use shell::{ShellChannel, ShellControl, ShellRequest};
pub use ssh::{SshConnector, SshOptions};

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

pub type Result<T, E = TransportError> = std::result::Result<T, E>;

/// A bidirectional byte stream: a TCP socket or an SSH channel.
pub trait Duplex: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> Duplex for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub type ByteStream = Box<dyn Duplex>;
pub type ByteReader = Box<dyn AsyncRead + Send + Unpin>;
pub type ByteWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Terminal geometry in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtySize {
    pub cols: u16,
    pub rows: u16,
}

impl Default for PtySize {
    fn default() -> Self {
        Self {
            cols: settings::constants::terminal::DEFAULT_COLS,
            rows: settings::constants::terminal::DEFAULT_ROWS,
        }
    }
}

/// Captured result of a one-shot remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the server closed the channel without an exit status.
    pub exit_code: Option<u32>,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteFileKind {
    File,
    Directory,
    Symlink,
    Other,
}

impl RemoteFileKind {
    /// Classify from the `S_IFMT` bits of a POSIX mode.
    pub fn from_mode(mode: u32) -> Self {
        match mode & 0o170000 {
            0o040000 => Self::Directory,
            0o120000 => Self::Symlink,
            0o100000 => Self::File,
            _ => Self::Other,
        }
    }
}

/// Attributes of a remote path, as far as the server reported them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteMetadata {
    pub size: u64,
    /// Full POSIX mode including the file type bits.
    pub permissions: Option<u32>,
    /// Modification time in seconds since the Unix epoch.
    pub modified: Option<u32>,
    pub kind: RemoteFileKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteDirEntry {
    pub name: String,
    pub metadata: RemoteMetadata,
}

/// An inbound connection on a remote (server side) forward.
pub struct ForwardedConnection {
    pub stream: ByteStream,
    pub originator_host: String,
    pub originator_port: u16,
}

/// A listening socket the server opened on our behalf.
pub struct RemoteListener {
    /// Port the server actually bound (differs from the request when it was 0).
    pub bound_port: u16,
    pub connections: mpsc::UnboundedReceiver<ForwardedConnection>,
}

/// Establishes authenticated transports.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, params: &ConnectParams) -> Result<Arc<dyn Transport>>;
}

/// One authenticated SSH connection.
///
/// All methods take `&self`; implementations serialise whatever needs
/// exclusive access internally, scoped to this connection only.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a session channel with a pty and an interactive shell.
    async fn open_shell(&self, size: PtySize, term: &str) -> Result<ShellChannel>;

    /// Open the SFTP subsystem on a fresh channel.
    async fn open_sftp(&self) -> Result<Arc<dyn RemoteFs>>;

    /// Open a `direct-tcpip` channel to `host:port` as seen from the server.
    async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u16,
        originator: SocketAddr,
    ) -> Result<ByteStream>;

    /// Ask the server to listen on `bind_address:port` and forward inbound
    /// connections back to us.
    async fn listen_remote(&self, bind_address: &str, port: u16) -> Result<RemoteListener>;

    /// Undo [`Transport::listen_remote`].
    async fn cancel_remote(&self, bind_address: &str, port: u16) -> Result<()>;

    /// Run a command on its own channel and collect its output.
    async fn exec(&self, command: &str) -> Result<ExecOutput>;

    async fn is_closed(&self) -> bool;

    /// Close the connection. Idempotent.
    async fn disconnect(&self) -> Result<()>;
}

/// Remote filesystem access over one SFTP subchannel.
#[async_trait]
pub trait RemoteFs: Send + Sync {
    async fn read_dir(&self, path: &str) -> Result<Vec<RemoteDirEntry>>;
    async fn create_dir(&self, path: &str) -> Result<()>;
    async fn rename(&self, from: &str, to: &str) -> Result<()>;
    async fn remove_file(&self, path: &str) -> Result<()>;
    async fn remove_dir(&self, path: &str) -> Result<()>;
    async fn metadata(&self, path: &str) -> Result<RemoteMetadata>;
    async fn open_read(&self, path: &str) -> Result<ByteReader>;
    /// Create or truncate `path` for writing.
    async fn create_write(&self, path: &str) -> Result<ByteWriter>;
    async fn close(&self) -> Result<()>;
}
