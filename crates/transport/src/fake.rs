//! In-memory stand-in for an SSH server.
//!
//! [`FakeServer`] hands out a [`Connector`] whose transports echo shell
//! input, serve an in-memory filesystem, answer `direct-tcpip` opens with an
//! echo service (or a real local TCP address), and let tests play the part
//! of remote clients connecting to a remote forward.

use crate::{
    AuthMethod, ByteReader, ByteStream, ByteWriter, ConnectParams, Connector, ExecOutput,
    ForwardedConnection, PtySize, RemoteDirEntry, RemoteFileKind, RemoteFs, RemoteListener,
    RemoteMetadata, Result, SftpErrorKind, ShellChannel, ShellControl, ShellRequest, Transport,
    TransportError,
};
use async_trait::async_trait;
use collections::{BTreeMap, FxHashMap, FxHashSet};
use parking_lot::Mutex;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio::time::Sleep;
use tokio_util::sync::CancellationToken;

/// Modification time stamped on every fake node (2023-11-14 22:13:20 UTC).
pub const FAKE_MTIME: u32 = 1_700_000_000;

const SHELL_QUEUE_DEPTH: usize = 256;
const FIRST_REMOTE_PORT: u16 = 40_000;

#[derive(Default)]
struct ServerState {
    accounts: Mutex<FxHashMap<String, String>>,
    unreachable: Mutex<FxHashSet<String>>,
    exec: Mutex<FxHashMap<String, ExecOutput>>,
    tcp_routes: Mutex<FxHashMap<(String, u16), SocketAddr>>,
    refused: Mutex<FxHashSet<(String, u16)>>,
    fs: MemoryFs,
    connects: AtomicUsize,
    transports: Mutex<Vec<Arc<FakeTransport>>>,
}

/// A scriptable fake server. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct FakeServer {
    state: Arc<ServerState>,
}

impl FakeServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept `password` for `username`. Key-file logins for a known user always succeed.
    pub fn with_account(self, username: &str, password: &str) -> Self {
        self.state
            .accounts
            .lock()
            .insert(username.to_string(), password.to_string());
        self
    }

    /// Make connects to `hostname` fail as if the host were down.
    pub fn with_unreachable(self, hostname: &str) -> Self {
        self.state.unreachable.lock().insert(hostname.to_string());
        self
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(FakeConnector {
            state: self.state.clone(),
        })
    }

    pub fn fs(&self) -> MemoryFs {
        self.state.fs.clone()
    }

    pub fn set_exec(&self, command: &str, output: ExecOutput) {
        self.state.exec.lock().insert(command.to_string(), output);
    }

    /// Route `direct-tcpip` opens for `host:port` to a real local address.
    pub fn route_tcp(&self, host: &str, port: u16, addr: SocketAddr) {
        self.state
            .tcp_routes
            .lock()
            .insert((host.to_string(), port), addr);
    }

    /// Make `direct-tcpip` opens for `host:port` fail.
    pub fn refuse_tcp(&self, host: &str, port: u16) {
        self.state.refused.lock().insert((host.to_string(), port));
    }

    pub fn connect_count(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    /// The most recently established transport, if any.
    pub fn last_transport(&self) -> Option<Arc<FakeTransport>> {
        self.state.transports.lock().last().cloned()
    }
}

struct FakeConnector {
    state: Arc<ServerState>,
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, params: &ConnectParams) -> Result<Arc<dyn Transport>> {
        params.validate()?;
        self.state.connects.fetch_add(1, Ordering::SeqCst);

        if self.state.unreachable.lock().contains(&params.hostname) {
            return Err(TransportError::Unreachable(format!(
                "{}: connection refused",
                params.target()
            )));
        }

        let expected = self.state.accounts.lock().get(&params.username).cloned();
        let accepted = match (&params.auth, expected) {
            (AuthMethod::Password(given), Some(expected)) => *given == expected,
            (AuthMethod::KeyFile { .. }, Some(_)) => true,
            (AuthMethod::Agent, _) => {
                return Err(TransportError::Agent("no agent in the fake server".into()))
            }
            (_, None) => false,
        };
        if !accepted {
            return Err(TransportError::AuthRejected);
        }

        let transport = Arc::new(FakeTransport {
            state: self.state.clone(),
            link: CancellationToken::new(),
            resizes: Arc::default(),
            listeners: Mutex::default(),
            next_remote_port: AtomicU16::new(FIRST_REMOTE_PORT),
            direct_opens: Mutex::default(),
            sftp_opens: AtomicUsize::new(0),
            shell_inputs: Arc::default(),
        });
        self.state.transports.lock().push(transport.clone());
        Ok(transport)
    }
}

/// One fake connection. Obtain it through [`FakeServer::last_transport`].
pub struct FakeTransport {
    state: Arc<ServerState>,
    link: CancellationToken,
    resizes: Arc<Mutex<Vec<PtySize>>>,
    listeners: Mutex<FxHashMap<u16, mpsc::UnboundedSender<ForwardedConnection>>>,
    next_remote_port: AtomicU16,
    direct_opens: Mutex<Vec<(String, u16)>>,
    sftp_opens: AtomicUsize,
    shell_inputs: Arc<Mutex<Vec<u8>>>,
}

impl FakeTransport {
    /// Simulate the network going away: shells end, echo channels close.
    pub fn drop_link(&self) {
        self.link.cancel();
    }

    pub fn resizes(&self) -> Vec<PtySize> {
        self.resizes.lock().clone()
    }

    /// Every byte written to any shell on this transport, in order.
    pub fn shell_input(&self) -> Vec<u8> {
        self.shell_inputs.lock().clone()
    }

    pub fn direct_opens(&self) -> Vec<(String, u16)> {
        self.direct_opens.lock().clone()
    }

    pub fn sftp_opens(&self) -> usize {
        self.sftp_opens.load(Ordering::SeqCst)
    }

    /// Remote ports currently listening for us.
    pub fn remote_ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.listeners.lock().keys().copied().collect();
        ports.sort_unstable();
        ports
    }

    /// Act as a remote client connecting to a remote forward on `port`.
    /// Returns the client's end of the connection.
    pub fn connect_remote_client(&self, port: u16) -> Result<ByteStream> {
        let sender = self
            .listeners
            .lock()
            .get(&port)
            .cloned()
            .ok_or_else(|| TransportError::Channel(format!("nothing listening on {port}")))?;
        let (client, server) = tokio::io::duplex(64 * 1024);
        sender
            .send(ForwardedConnection {
                stream: Box::new(server),
                originator_host: "203.0.113.7".into(),
                originator_port: 50_000,
            })
            .map_err(|_| TransportError::Closed)?;
        Ok(Box::new(client))
    }

    fn ensure_open(&self) -> Result<()> {
        if self.link.is_cancelled() {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn open_shell(&self, _size: PtySize, _term: &str) -> Result<ShellChannel> {
        self.ensure_open()?;
        let (output_tx, output) = mpsc::channel(SHELL_QUEUE_DEPTH);
        let (control, mut requests, closed) = ShellControl::new();
        let link = self.link.clone();
        let resizes = self.resizes.clone();
        let inputs = self.shell_inputs.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = closed.cancelled() => break,
                    _ = link.cancelled() => break,
                    _ = output_tx.closed() => break,
                    Some(request) = requests.recv() => match request {
                        ShellRequest::Write { data, ack } => {
                            inputs.lock().extend_from_slice(&data);
                            let exiting = data == b"exit\n";
                            let delivered = output_tx.send(data).await.is_ok();
                            let _ = ack.send(Ok(()));
                            if exiting || !delivered {
                                break;
                            }
                        }
                        ShellRequest::Resize { size, ack } => {
                            resizes.lock().push(size);
                            let _ = ack.send(Ok(()));
                        }
                    },
                }
            }
        });

        Ok(ShellChannel { output, control })
    }

    async fn open_sftp(&self) -> Result<Arc<dyn RemoteFs>> {
        self.ensure_open()?;
        self.sftp_opens.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(self.state.fs.clone()))
    }

    async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u16,
        _originator: SocketAddr,
    ) -> Result<ByteStream> {
        self.ensure_open()?;
        self.direct_opens.lock().push((host.to_string(), port));

        let key = (host.to_string(), port);
        if self.state.refused.lock().contains(&key) {
            return Err(TransportError::Channel(format!(
                "{host}:{port}: connection refused"
            )));
        }
        let route = self.state.tcp_routes.lock().get(&key).copied();
        if let Some(addr) = route {
            let stream = tokio::net::TcpStream::connect(addr).await?;
            return Ok(Box::new(stream));
        }

        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        let link = self.link.clone();
        tokio::spawn(async move {
            let (mut reader, mut writer) = tokio::io::split(theirs);
            tokio::select! {
                _ = tokio::io::copy(&mut reader, &mut writer) => {}
                _ = link.cancelled() => {}
            }
        });
        Ok(Box::new(ours))
    }

    async fn listen_remote(&self, _bind_address: &str, port: u16) -> Result<RemoteListener> {
        self.ensure_open()?;
        let bound_port = if port == 0 {
            self.next_remote_port.fetch_add(1, Ordering::SeqCst)
        } else {
            port
        };
        let mut listeners = self.listeners.lock();
        if listeners.contains_key(&bound_port) {
            return Err(TransportError::Channel(format!(
                "remote port {bound_port} already in use"
            )));
        }
        let (sender, connections) = mpsc::unbounded_channel();
        listeners.insert(bound_port, sender);
        Ok(RemoteListener {
            bound_port,
            connections,
        })
    }

    async fn cancel_remote(&self, _bind_address: &str, port: u16) -> Result<()> {
        self.listeners.lock().remove(&port);
        Ok(())
    }

    async fn exec(&self, command: &str) -> Result<ExecOutput> {
        self.ensure_open()?;
        let canned = self.state.exec.lock().get(command).cloned();
        Ok(canned.unwrap_or_else(|| ExecOutput {
            stdout: String::new(),
            stderr: format!("sh: {command}: command not found\n"),
            exit_code: Some(127),
        }))
    }

    async fn is_closed(&self) -> bool {
        self.link.is_cancelled()
    }

    async fn disconnect(&self) -> Result<()> {
        self.listeners.lock().clear();
        self.link.cancel();
        Ok(())
    }
}

// ============================================================================
// In-memory filesystem
// ============================================================================

#[derive(Clone)]
enum Node {
    Dir { mode: u32 },
    File { data: Vec<u8>, mode: u32 },
}

impl Node {
    fn metadata(&self) -> RemoteMetadata {
        let (size, mode) = match self {
            Node::Dir { mode } => (4096, *mode),
            Node::File { data, mode } => (data.len() as u64, *mode),
        };
        RemoteMetadata {
            size,
            permissions: Some(mode),
            modified: Some(FAKE_MTIME),
            kind: RemoteFileKind::from_mode(mode),
        }
    }
}

struct FsInner {
    nodes: Mutex<BTreeMap<String, Node>>,
    denied: Mutex<FxHashSet<String>>,
    io_delay: Mutex<Duration>,
    fail_reads_after: Mutex<Option<u64>>,
}

/// A shared in-memory filesystem implementing [`RemoteFs`].
#[derive(Clone)]
pub struct MemoryFs {
    inner: Arc<FsInner>,
}

impl Default for MemoryFs {
    fn default() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert("/".to_string(), Node::Dir { mode: 0o040755 });
        Self {
            inner: Arc::new(FsInner {
                nodes: Mutex::new(nodes),
                denied: Mutex::default(),
                io_delay: Mutex::new(Duration::ZERO),
                fail_reads_after: Mutex::new(None),
            }),
        }
    }
}

fn normalize(path: &str) -> String {
    let mut out = String::from("/");
    for part in path.split('/').filter(|p| !p.is_empty() && *p != ".") {
        if !out.ends_with('/') {
            out.push('/');
        }
        out.push_str(part);
    }
    out
}

fn parent_of(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rsplit_once('/') {
        Some(("", _)) => Some("/"),
        Some((head, _)) => Some(head),
        None => None,
    }
}

fn not_found() -> TransportError {
    TransportError::sftp(SftpErrorKind::NotFound, "No such file")
}

fn failure(message: &str) -> TransportError {
    TransportError::sftp(SftpErrorKind::Failure, message)
}

impl MemoryFs {
    pub fn add_dir(&self, path: &str) {
        let path = normalize(path);
        let mut nodes = self.inner.nodes.lock();
        let mut current = String::new();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            current.push('/');
            current.push_str(part);
            nodes
                .entry(current.clone())
                .or_insert(Node::Dir { mode: 0o040755 });
        }
    }

    pub fn add_file(&self, path: &str, data: impl Into<Vec<u8>>) {
        self.add_file_with_mode(path, data, 0o100644);
    }

    pub fn add_file_with_mode(&self, path: &str, data: impl Into<Vec<u8>>, mode: u32) {
        let path = normalize(path);
        if let Some(parent) = parent_of(&path) {
            self.add_dir(parent);
        }
        self.inner.nodes.lock().insert(
            path,
            Node::File {
                data: data.into(),
                mode,
            },
        );
    }

    pub fn add_symlink(&self, path: &str) {
        self.add_file_with_mode(path, Vec::new(), 0o120777);
    }

    /// Every operation on `path` or below it fails with permission denied.
    pub fn deny(&self, path: &str) {
        self.inner.denied.lock().insert(normalize(path));
    }

    /// Pause this long before every read and write call on opened files.
    pub fn set_io_delay(&self, delay: Duration) {
        *self.inner.io_delay.lock() = delay;
    }

    /// Readers opened from now on fail once they have returned `bytes`.
    pub fn fail_reads_after(&self, bytes: u64) {
        *self.inner.fail_reads_after.lock() = Some(bytes);
    }

    pub fn contents(&self, path: &str) -> Option<Vec<u8>> {
        match self.inner.nodes.lock().get(&normalize(path)) {
            Some(Node::File { data, .. }) => Some(data.clone()),
            _ => None,
        }
    }

    pub fn exists(&self, path: &str) -> bool {
        self.inner.nodes.lock().contains_key(&normalize(path))
    }

    fn check_access(&self, path: &str) -> Result<()> {
        let denied = self.inner.denied.lock();
        let blocked = denied.iter().any(|d| {
            path == d || (path.starts_with(d.as_str()) && path[d.len()..].starts_with('/'))
        });
        if blocked {
            Err(TransportError::sftp(
                SftpErrorKind::PermissionDenied,
                "Permission denied",
            ))
        } else {
            Ok(())
        }
    }

    fn ensure_parent_dir(nodes: &BTreeMap<String, Node>, path: &str) -> Result<()> {
        match parent_of(path).and_then(|parent| nodes.get(parent)) {
            Some(Node::Dir { .. }) => Ok(()),
            Some(Node::File { .. }) => Err(failure("Not a directory")),
            None => Err(not_found()),
        }
    }

    fn pacing(&self) -> (Duration, Option<u64>) {
        (*self.inner.io_delay.lock(), *self.inner.fail_reads_after.lock())
    }
}

#[async_trait]
impl RemoteFs for MemoryFs {
    async fn read_dir(&self, path: &str) -> Result<Vec<RemoteDirEntry>> {
        let path = normalize(path);
        self.check_access(&path)?;
        let nodes = self.inner.nodes.lock();
        match nodes.get(&path) {
            Some(Node::Dir { .. }) => {}
            Some(Node::File { .. }) => return Err(failure("Not a directory")),
            None => return Err(not_found()),
        }
        Ok(nodes
            .iter()
            .filter(|(key, _)| key.as_str() != "/" && parent_of(key) == Some(path.as_str()))
            .map(|(key, node)| RemoteDirEntry {
                name: key.rsplit('/').next().unwrap_or_default().to_string(),
                metadata: node.metadata(),
            })
            .collect())
    }

    async fn create_dir(&self, path: &str) -> Result<()> {
        let path = normalize(path);
        self.check_access(&path)?;
        let mut nodes = self.inner.nodes.lock();
        Self::ensure_parent_dir(&nodes, &path)?;
        if nodes.contains_key(&path) {
            return Err(failure("File exists"));
        }
        nodes.insert(path, Node::Dir { mode: 0o040755 });
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let (from, to) = (normalize(from), normalize(to));
        self.check_access(&from)?;
        self.check_access(&to)?;
        let mut nodes = self.inner.nodes.lock();
        if !nodes.contains_key(&from) {
            return Err(not_found());
        }
        Self::ensure_parent_dir(&nodes, &to)?;
        if nodes.contains_key(&to) {
            return Err(failure("File exists"));
        }
        let prefix = format!("{from}/");
        let moved: Vec<String> = nodes
            .keys()
            .filter(|key| **key == from || key.starts_with(&prefix))
            .cloned()
            .collect();
        for key in moved {
            if let Some(node) = nodes.remove(&key) {
                nodes.insert(format!("{to}{}", &key[from.len()..]), node);
            }
        }
        Ok(())
    }

    async fn remove_file(&self, path: &str) -> Result<()> {
        let path = normalize(path);
        self.check_access(&path)?;
        let mut nodes = self.inner.nodes.lock();
        match nodes.get(&path) {
            Some(Node::File { .. }) => {
                nodes.remove(&path);
                Ok(())
            }
            Some(Node::Dir { .. }) => Err(failure("Is a directory")),
            None => Err(not_found()),
        }
    }

    async fn remove_dir(&self, path: &str) -> Result<()> {
        let path = normalize(path);
        self.check_access(&path)?;
        let mut nodes = self.inner.nodes.lock();
        match nodes.get(&path) {
            Some(Node::Dir { .. }) if path != "/" => {}
            Some(_) => return Err(failure("Not a removable directory")),
            None => return Err(not_found()),
        }
        if nodes.keys().any(|key| parent_of(key) == Some(path.as_str())) {
            return Err(failure("Directory not empty"));
        }
        nodes.remove(&path);
        Ok(())
    }

    async fn metadata(&self, path: &str) -> Result<RemoteMetadata> {
        let path = normalize(path);
        self.check_access(&path)?;
        self.inner
            .nodes
            .lock()
            .get(&path)
            .map(Node::metadata)
            .ok_or_else(not_found)
    }

    async fn open_read(&self, path: &str) -> Result<ByteReader> {
        let path = normalize(path);
        self.check_access(&path)?;
        let data = match self.inner.nodes.lock().get(&path) {
            Some(Node::File { data, .. }) => data.clone(),
            Some(Node::Dir { .. }) => return Err(failure("Is a directory")),
            None => return Err(not_found()),
        };
        let (delay, fail_after) = self.pacing();
        Ok(Box::new(Paced::new(io::Cursor::new(data), delay, fail_after)))
    }

    async fn create_write(&self, path: &str) -> Result<ByteWriter> {
        let path = normalize(path);
        self.check_access(&path)?;
        {
            let mut nodes = self.inner.nodes.lock();
            Self::ensure_parent_dir(&nodes, &path)?;
            if let Some(Node::Dir { .. }) = nodes.get(&path) {
                return Err(failure("Is a directory"));
            }
            nodes.insert(
                path.clone(),
                Node::File {
                    data: Vec::new(),
                    mode: 0o100644,
                },
            );
        }
        let (delay, _) = self.pacing();
        let writer = MemoryWriter {
            inner: self.inner.clone(),
            path,
        };
        Ok(Box::new(Paced::new(writer, delay, None)))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Appends straight into the node, so partial uploads are visible.
struct MemoryWriter {
    inner: Arc<FsInner>,
    path: String,
}

impl AsyncWrite for MemoryWriter {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let mut nodes = self.inner.nodes.lock();
        match nodes.get_mut(&self.path) {
            Some(Node::File { data, .. }) => {
                data.extend_from_slice(buf);
                Poll::Ready(Ok(buf.len()))
            }
            _ => Poll::Ready(Err(io::Error::new(io::ErrorKind::NotFound, "file removed"))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Adds a fixed delay before every I/O call, and optionally fails reads
/// after a byte budget, to make transfers observable mid-flight.
struct Paced<T> {
    inner: T,
    delay: Duration,
    sleep: Option<Pin<Box<Sleep>>>,
    read_budget: Option<u64>,
}

impl<T> Paced<T> {
    fn new(inner: T, delay: Duration, read_budget: Option<u64>) -> Self {
        Self {
            inner,
            delay,
            sleep: None,
            read_budget,
        }
    }

    fn poll_delay(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        if self.delay.is_zero() {
            return Poll::Ready(());
        }
        let delay = self.delay;
        let sleep = self
            .sleep
            .get_or_insert_with(|| Box::pin(tokio::time::sleep(delay)));
        ready!(sleep.as_mut().poll(cx));
        self.sleep = None;
        Poll::Ready(())
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for Paced<T> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_delay(cx));
        if this.read_budget == Some(0) {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "connection lost mid-read",
            )));
        }
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        let read = (buf.filled().len() - before) as u64;
        if let Some(budget) = this.read_budget.as_mut() {
            *budget = budget.saturating_sub(read);
        }
        Poll::Ready(Ok(()))
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for Paced<T> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_delay(cx));
        Pin::new(&mut this.inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn password(user: &str, pass: &str) -> ConnectParams {
        ConnectParams::new("h", 22, user, AuthMethod::Password(pass.into()))
    }

    #[test]
    fn normalize_cleans_slashes() {
        assert_eq!(normalize(""), "/");
        assert_eq!(normalize("/a//b/"), "/a/b");
        assert_eq!(normalize("a/./b"), "/a/b");
        assert_eq!(parent_of("/a/b"), Some("/a"));
        assert_eq!(parent_of("/a"), Some("/"));
        assert_eq!(parent_of("/"), None);
    }

    #[tokio::test]
    async fn wrong_password_is_rejected() {
        let server = FakeServer::new().with_account("u", "p");
        let result = server.connector().connect(&password("u", "nope")).await;
        assert!(matches!(result, Err(TransportError::AuthRejected)));
        assert_eq!(server.connect_count(), 1);
    }

    #[tokio::test]
    async fn shell_echoes_input_in_order() {
        let server = FakeServer::new().with_account("u", "p");
        let transport = server.connector().connect(&password("u", "p")).await.unwrap();
        let mut shell = transport.open_shell(PtySize::default(), "xterm").await.unwrap();
        shell.control.write(b"A".to_vec()).await.unwrap();
        shell.control.write(b"B".to_vec()).await.unwrap();
        assert_eq!(shell.output.recv().await.unwrap(), b"A");
        assert_eq!(shell.output.recv().await.unwrap(), b"B");

        server.last_transport().unwrap().drop_link();
        assert_eq!(shell.output.recv().await, None);
    }

    #[tokio::test]
    async fn memory_fs_round_trip() {
        let fs = MemoryFs::default();
        fs.add_dir("/home/u");
        let mut writer = fs.create_write("/home/u/notes.txt").await.unwrap();
        writer.write_all(b"hello").await.unwrap();
        writer.shutdown().await.unwrap();

        let mut reader = fs.open_read("/home/u/notes.txt").await.unwrap();
        let mut text = String::new();
        reader.read_to_string(&mut text).await.unwrap();
        assert_eq!(text, "hello");

        let names: Vec<String> = fs
            .read_dir("/home/u")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["notes.txt"]);
    }

    #[tokio::test]
    async fn memory_fs_rename_moves_subtree() {
        let fs = MemoryFs::default();
        fs.add_file("/a/b/c.txt", "x");
        fs.rename("/a", "/z").await.unwrap();
        assert!(fs.exists("/z/b/c.txt"));
        assert!(!fs.exists("/a"));
    }

    #[tokio::test]
    async fn memory_fs_denies_below_blocked_path() {
        let fs = MemoryFs::default();
        fs.add_file("/root/secret", "x");
        fs.deny("/root");
        let error = fs.metadata("/root/secret").await.unwrap_err();
        assert!(matches!(
            error,
            TransportError::Sftp {
                kind: SftpErrorKind::PermissionDenied,
                ..
            }
        ));
        assert!(fs.metadata("/rootless").await.is_err());
    }

    #[tokio::test]
    async fn read_budget_breaks_reader() {
        let fs = MemoryFs::default();
        fs.add_file("/big", vec![7u8; 1000]);
        fs.fail_reads_after(10);
        let mut reader = fs.open_read("/big").await.unwrap();
        let mut sink = Vec::new();
        assert!(reader.read_to_end(&mut sink).await.is_err());
    }

    #[tokio::test]
    async fn remote_client_reaches_listener() {
        let server = FakeServer::new().with_account("u", "p");
        let transport = server.connector().connect(&password("u", "p")).await.unwrap();
        let mut listener = transport.listen_remote("0.0.0.0", 0).await.unwrap();
        assert_eq!(listener.bound_port, FIRST_REMOTE_PORT);

        let fake = server.last_transport().unwrap();
        let mut client = fake.connect_remote_client(listener.bound_port).unwrap();
        let mut inbound = listener.connections.recv().await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        inbound.stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }
}
