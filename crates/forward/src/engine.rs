use crate::error::ForwardError;
use crate::info::{describe, ForwardInfo, ForwardKind};
use crate::relay::{relay, RelayEnd, Traffic};
use crate::socks;
use collections::{FxHashSet, IndexMap};
use parking_lot::Mutex;
use settings::constants::forward::{
    DEFAULT_REMOTE_BIND_ADDRESS, SOCKS_HANDSHAKE_TIMEOUT, STOP_TIMEOUT,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use transport::{ForwardedConnection, RemoteListener, Transport};
use util::ResultExt;

/// State shared between a forward, its listener task and its tunnels.
struct ForwardShared {
    id: String,
    cancel: CancellationToken,
    active: AtomicBool,
    tunnels: Mutex<FxHashSet<u64>>,
    next_tunnel: AtomicU64,
    traffic: Traffic,
}

impl ForwardShared {
    fn new(id: String) -> Arc<Self> {
        Arc::new(Self {
            id,
            cancel: CancellationToken::new(),
            active: AtomicBool::new(true),
            tunnels: Mutex::default(),
            next_tunnel: AtomicU64::new(1),
            traffic: Traffic::default(),
        })
    }

    fn open_tunnel(self: &Arc<Self>) -> Tunnel {
        let id = self.next_tunnel.fetch_add(1, Ordering::SeqCst);
        self.tunnels.lock().insert(id);
        Tunnel {
            shared: self.clone(),
            id,
            cancel: self.cancel.child_token(),
        }
    }
}

/// One accepted connection. Deregisters itself when dropped.
struct Tunnel {
    shared: Arc<ForwardShared>,
    id: u64,
    cancel: CancellationToken,
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        self.shared.tunnels.lock().remove(&self.id);
    }
}

struct PortForward {
    kind: ForwardKind,
    bind_address: String,
    bind_port: u16,
    target: Option<(String, u16)>,
    shared: Arc<ForwardShared>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl PortForward {
    fn info(&self) -> ForwardInfo {
        let target = self.target.as_ref().map(|(host, port)| (host.as_str(), *port));
        ForwardInfo {
            id: self.shared.id.clone(),
            kind: self.kind,
            description: describe(self.kind, &self.bind_address, self.bind_port, target),
            bind_address: self.bind_address.clone(),
            bind_port: self.bind_port,
            target_host: target.map(|(host, _)| host.to_string()),
            target_port: target.map(|(_, port)| port),
            active: self.shared.active.load(Ordering::SeqCst),
            connections: self.shared.tunnels.lock().len(),
            bytes_sent: self.shared.traffic.sent(),
            bytes_received: self.shared.traffic.received(),
        }
    }

    /// Close the listener and every tunnel, then wait for the listener task
    /// to release its socket.
    async fn shut_down(&self, transport: &dyn Transport) {
        self.shared.active.store(false, Ordering::SeqCst);
        self.shared.cancel.cancel();

        let handle = self.listener.lock().take();
        if let Some(handle) = handle {
            let abort = handle.abort_handle();
            if tokio::time::timeout(STOP_TIMEOUT, handle).await.is_err() {
                tracing::warn!(forward_id = %self.shared.id, "Listener did not stop in time, aborting");
                abort.abort();
            }
        }

        if self.kind == ForwardKind::Remote {
            transport
                .cancel_remote(&self.bind_address, self.bind_port)
                .await
                .log_err_with("cancelling remote forward");
        }
        tracing::info!(forward_id = %self.shared.id, "Forward stopped");
    }
}

/// The forwards of one session.
///
/// Ids are `fwd-1`, `fwd-2`, ... and are never reused. A forward is only
/// registered once its listener is bound.
pub struct ForwardEngine {
    transport: Arc<dyn Transport>,
    default_bind_address: String,
    forwards: Mutex<IndexMap<String, Arc<PortForward>>>,
    next_id: AtomicU64,
    shut_down: AtomicBool,
    socks_timeout: Duration,
}

impl ForwardEngine {
    /// `default_bind_address` is used for local and dynamic forwards that
    /// don't name one.
    pub fn new(transport: Arc<dyn Transport>, default_bind_address: impl Into<String>) -> Self {
        Self {
            transport,
            default_bind_address: default_bind_address.into(),
            forwards: Mutex::new(IndexMap::default()),
            next_id: AtomicU64::new(1),
            shut_down: AtomicBool::new(false),
            socks_timeout: SOCKS_HANDSHAKE_TIMEOUT,
        }
    }

    /// Listen locally and tunnel each connection to `target_host:target_port`
    /// as seen from the server.
    pub async fn create_local(
        &self,
        bind_address: Option<&str>,
        bind_port: u16,
        target_host: &str,
        target_port: u16,
    ) -> Result<ForwardInfo, ForwardError> {
        validate_target(target_host, target_port)?;
        let bind_address = self.local_bind_address(bind_address);
        let listener = self.bind_local(&bind_address, bind_port).await?;
        let bound_port = local_port(&listener, &bind_address)?;

        let shared = ForwardShared::new(self.allocate_id());
        let target = (target_host.to_string(), target_port);
        let handle = tokio::spawn(accept_local(
            listener,
            shared.clone(),
            self.transport.clone(),
            target.clone(),
        ));
        self.register(ForwardKind::Local, bind_address, bound_port, Some(target), shared, handle)
    }

    /// Ask the server to listen and connect each inbound channel to
    /// `target_host:target_port` on this machine.
    pub async fn create_remote(
        &self,
        bind_address: Option<&str>,
        bind_port: u16,
        target_host: &str,
        target_port: u16,
    ) -> Result<ForwardInfo, ForwardError> {
        validate_target(target_host, target_port)?;
        self.ensure_running()?;
        let bind_address = bind_address
            .filter(|address| !address.trim().is_empty())
            .unwrap_or(DEFAULT_REMOTE_BIND_ADDRESS)
            .to_string();
        let listener = self
            .transport
            .listen_remote(&bind_address, bind_port)
            .await
            .map_err(|source| ForwardError::RemoteRejected {
                address: format!("{bind_address}:{bind_port}"),
                source,
            })?;
        let bound_port = listener.bound_port;

        let shared = ForwardShared::new(self.allocate_id());
        let target = (target_host.to_string(), target_port);
        let handle = tokio::spawn(accept_remote(listener, shared.clone(), target.clone()));
        self.register(ForwardKind::Remote, bind_address, bound_port, Some(target), shared, handle)
    }

    /// Run a SOCKS proxy locally; each client names its own target.
    pub async fn create_dynamic(
        &self,
        bind_address: Option<&str>,
        bind_port: u16,
    ) -> Result<ForwardInfo, ForwardError> {
        let bind_address = self.local_bind_address(bind_address);
        let listener = self.bind_local(&bind_address, bind_port).await?;
        let bound_port = local_port(&listener, &bind_address)?;

        let shared = ForwardShared::new(self.allocate_id());
        let handle = tokio::spawn(accept_dynamic(
            listener,
            shared.clone(),
            self.transport.clone(),
            self.socks_timeout,
        ));
        self.register(ForwardKind::Dynamic, bind_address, bound_port, None, shared, handle)
    }

    /// Stop one forward and remove it from the list.
    pub async fn stop(&self, id: &str) -> Result<(), ForwardError> {
        let forward = self
            .forwards
            .lock()
            .shift_remove(id)
            .ok_or_else(|| ForwardError::NotFound(id.to_string()))?;
        forward.shut_down(self.transport.as_ref()).await;
        Ok(())
    }

    /// Stop every forward and refuse new ones.
    pub async fn stop_all(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
        let forwards: Vec<Arc<PortForward>> =
            self.forwards.lock().drain(..).map(|(_, forward)| forward).collect();
        for forward in forwards {
            forward.shut_down(self.transport.as_ref()).await;
        }
    }

    /// All forwards in creation order.
    pub fn list(&self) -> Vec<ForwardInfo> {
        self.forwards
            .lock()
            .values()
            .map(|forward| forward.info())
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<ForwardInfo> {
        self.forwards.lock().get(id).map(|forward| forward.info())
    }

    fn local_bind_address(&self, requested: Option<&str>) -> String {
        requested
            .map(str::trim)
            .filter(|address| !address.is_empty())
            .unwrap_or(self.default_bind_address.as_str())
            .to_string()
    }

    fn ensure_running(&self) -> Result<(), ForwardError> {
        if self.shut_down.load(Ordering::SeqCst) {
            Err(ForwardError::ShutDown)
        } else {
            Ok(())
        }
    }

    async fn bind_local(&self, address: &str, port: u16) -> Result<TcpListener, ForwardError> {
        self.ensure_running()?;
        TcpListener::bind((address, port))
            .await
            .map_err(|source| ForwardError::Bind {
                address: format!("{address}:{port}"),
                source,
            })
    }

    fn allocate_id(&self) -> String {
        format!("fwd-{}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn register(
        &self,
        kind: ForwardKind,
        bind_address: String,
        bind_port: u16,
        target: Option<(String, u16)>,
        shared: Arc<ForwardShared>,
        handle: JoinHandle<()>,
    ) -> Result<ForwardInfo, ForwardError> {
        let mut forwards = self.forwards.lock();
        // Lost a race with `stop_all`.
        if self.shut_down.load(Ordering::SeqCst) {
            shared.cancel.cancel();
            handle.abort();
            return Err(ForwardError::ShutDown);
        }
        let forward = Arc::new(PortForward {
            kind,
            bind_address,
            bind_port,
            target,
            shared,
            listener: Mutex::new(Some(handle)),
        });
        let info = forward.info();
        tracing::info!(forward_id = %info.id, description = %info.description, "Forward started");
        forwards.insert(info.id.clone(), forward);
        Ok(info)
    }
}

fn validate_target(host: &str, port: u16) -> Result<(), ForwardError> {
    if host.trim().is_empty() {
        return Err(ForwardError::InvalidTarget("missing target host".into()));
    }
    if port == 0 {
        return Err(ForwardError::InvalidTarget(format!("{host}:0")));
    }
    Ok(())
}

fn local_port(listener: &TcpListener, address: &str) -> Result<u16, ForwardError> {
    listener
        .local_addr()
        .map(|addr| addr.port())
        .map_err(|source| ForwardError::Bind {
            address: address.to_string(),
            source,
        })
}

async fn accept_local(
    listener: TcpListener,
    shared: Arc<ForwardShared>,
    transport: Arc<dyn Transport>,
    (target_host, target_port): (String, u16),
) {
    loop {
        let (stream, peer) = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(error) => {
                    tracing::warn!(forward_id = %shared.id, %error, "Accept failed");
                    continue;
                }
            },
        };
        tracing::debug!(forward_id = %shared.id, %peer, "Accepted local connection");
        let tunnel = shared.open_tunnel();
        let transport = transport.clone();
        let target_host = target_host.clone();
        tokio::spawn(async move {
            let channel = tokio::select! {
                _ = tunnel.cancel.cancelled() => return,
                channel = transport.open_direct_tcpip(&target_host, target_port, peer) => channel,
            };
            match channel {
                Ok(channel) => finish_tunnel(&tunnel, stream, channel, peer).await,
                Err(error) => tracing::warn!(
                    forward_id = %tunnel.shared.id,
                    %peer,
                    target = %format!("{target_host}:{target_port}"),
                    %error,
                    "Could not open channel to target"
                ),
            }
        });
    }
    shared.active.store(false, Ordering::SeqCst);
}

async fn accept_remote(
    mut listener: RemoteListener,
    shared: Arc<ForwardShared>,
    (target_host, target_port): (String, u16),
) {
    loop {
        let connection = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break,
            connection = listener.connections.recv() => match connection {
                Some(connection) => connection,
                None => {
                    tracing::info!(forward_id = %shared.id, "Remote listener closed by transport");
                    break;
                }
            },
        };
        let ForwardedConnection {
            stream: channel,
            originator_host,
            originator_port,
        } = connection;
        tracing::debug!(
            forward_id = %shared.id,
            peer = %format!("{originator_host}:{originator_port}"),
            "Inbound forwarded connection"
        );
        let tunnel = shared.open_tunnel();
        let target_host = target_host.clone();
        tokio::spawn(async move {
            let stream = tokio::select! {
                _ = tunnel.cancel.cancelled() => return,
                stream = TcpStream::connect((target_host.as_str(), target_port)) => stream,
            };
            match stream {
                Ok(stream) => {
                    let peer = stream.peer_addr().unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)));
                    finish_tunnel(&tunnel, stream, channel, peer).await;
                }
                Err(error) => tracing::warn!(
                    forward_id = %tunnel.shared.id,
                    target = %format!("{target_host}:{target_port}"),
                    %error,
                    "Could not reach local target"
                ),
            }
        });
    }
    shared.active.store(false, Ordering::SeqCst);
}

async fn accept_dynamic(
    listener: TcpListener,
    shared: Arc<ForwardShared>,
    transport: Arc<dyn Transport>,
    handshake_timeout: Duration,
) {
    loop {
        let (stream, peer) = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(error) => {
                    tracing::warn!(forward_id = %shared.id, %error, "Accept failed");
                    continue;
                }
            },
        };
        tracing::debug!(forward_id = %shared.id, %peer, "Accepted SOCKS client");
        let tunnel = shared.open_tunnel();
        let transport = transport.clone();
        tokio::spawn(async move {
            let cancel = tunnel.cancel.clone();
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = serve_socks(&tunnel, stream, peer, transport.as_ref(), handshake_timeout) => {}
            }
        });
    }
    shared.active.store(false, Ordering::SeqCst);
}

async fn serve_socks(
    tunnel: &Tunnel,
    mut stream: TcpStream,
    peer: SocketAddr,
    transport: &dyn Transport,
    handshake_timeout: Duration,
) {
    let request = match tokio::time::timeout(handshake_timeout, socks::accept(&mut stream)).await {
        Ok(Ok(request)) => request,
        Ok(Err(error)) => {
            tracing::debug!(forward_id = %tunnel.shared.id, %peer, %error, "SOCKS handshake failed");
            return;
        }
        Err(_) => {
            tracing::debug!(forward_id = %tunnel.shared.id, %peer, "SOCKS handshake timed out");
            return;
        }
    };
    match transport
        .open_direct_tcpip(&request.host, request.port, peer)
        .await
    {
        Ok(channel) => {
            if socks::reply(&mut stream, request.version, true).await.is_err() {
                return;
            }
            finish_tunnel(tunnel, stream, channel, peer).await;
        }
        Err(error) => {
            tracing::warn!(
                forward_id = %tunnel.shared.id,
                %peer,
                target = %format!("{}:{}", request.host, request.port),
                %error,
                "SOCKS target unreachable"
            );
            socks::reply(&mut stream, request.version, false).await.log_err();
        }
    }
}

async fn finish_tunnel<L, R>(tunnel: &Tunnel, local: L, remote: R, peer: SocketAddr)
where
    L: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    R: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    match relay(local, remote, &tunnel.shared.traffic, &tunnel.cancel).await {
        RelayEnd::Closed | RelayEnd::Cancelled => {
            tracing::debug!(forward_id = %tunnel.shared.id, %peer, "Tunnel closed");
        }
        RelayEnd::Failed(error) => {
            tracing::debug!(forward_id = %tunnel.shared.id, %peer, %error, "Tunnel failed");
        }
    }
}
