//! `russh` implementation of [`Connector`] and [`Transport`].

use crate::sftp::SftpFs;
use crate::{
    AuthMethod, ByteStream, ConnectParams, Connector, ExecOutput, ForwardedConnection,
    KnownHosts, PtySize, RemoteFs, RemoteListener, Result, ShellChannel, ShellControl,
    ShellRequest, Transport, TransportError,
};
use async_trait::async_trait;
use collections::FxHashMap;
use parking_lot::Mutex;
use russh::client::{self, Handle, Msg};
use russh::keys::{PrivateKeyWithHashAlg, PublicKey};
use russh::{Channel, ChannelMsg, Disconnect};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use util::ResultExt;

/// Inbound `forwarded-tcpip` routes, keyed by the remote port the server bound.
type ForwardRoutes = Arc<Mutex<FxHashMap<u32, mpsc::UnboundedSender<ForwardedConnection>>>>;

/// Knobs for [`SshConnector`], usually filled from `settings::Config`.
#[derive(Debug, Clone)]
pub struct SshOptions {
    pub connect_timeout: Duration,
    pub keepalive_interval: Option<Duration>,
    pub keepalive_max: usize,
    pub known_hosts: PathBuf,
    pub output_queue_depth: usize,
}

impl SshOptions {
    pub fn new(known_hosts: impl Into<PathBuf>) -> Self {
        use settings::constants::{ssh, terminal};
        Self {
            connect_timeout: ssh::CONNECT_TIMEOUT,
            keepalive_interval: Some(ssh::KEEPALIVE_INTERVAL),
            keepalive_max: ssh::KEEPALIVE_MAX,
            known_hosts: known_hosts.into(),
            output_queue_depth: terminal::OUTPUT_QUEUE_DEPTH,
        }
    }
}

pub struct SshConnector {
    options: SshOptions,
    known_hosts: Arc<KnownHosts>,
}

impl SshConnector {
    pub fn new(options: SshOptions) -> Self {
        let known_hosts = Arc::new(KnownHosts::new(options.known_hosts.clone()));
        Self {
            options,
            known_hosts,
        }
    }

    async fn establish(
        &self,
        params: &ConnectParams,
        handler: ClientHandler,
    ) -> Result<Handle<ClientHandler>> {
        let config = Arc::new(client::Config {
            keepalive_interval: self.options.keepalive_interval,
            keepalive_max: self.options.keepalive_max,
            ..Default::default()
        });

        let mut handle = client::connect(config, (params.hostname.as_str(), params.port), handler)
            .await
            .map_err(|error| match error {
                TransportError::Ssh(russh::Error::IO(io)) => {
                    TransportError::Unreachable(format!("{}: {io}", params.target()))
                }
                other => other,
            })?;

        authenticate(&mut handle, params).await?;
        Ok(handle)
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(&self, params: &ConnectParams) -> Result<Arc<dyn Transport>> {
        params.validate()?;

        let routes = ForwardRoutes::default();
        let handler = ClientHandler {
            host: params.hostname.clone(),
            port: params.port,
            known_hosts: self.known_hosts.clone(),
            routes: routes.clone(),
        };

        tracing::info!(
            target = %params.target(),
            user = %params.username,
            auth = params.auth.label(),
            "Connecting"
        );
        let timeout = self.options.connect_timeout;
        let handle = tokio::time::timeout(timeout, self.establish(params, handler))
            .await
            .map_err(|_| TransportError::Timeout(timeout))??;
        tracing::info!(target = %params.target(), "Authenticated");

        Ok(Arc::new(SshTransport {
            handle: RwLock::new(handle),
            routes,
            target: params.target(),
            closed: AtomicBool::new(false),
            output_queue_depth: self.options.output_queue_depth,
        }))
    }
}

async fn authenticate(handle: &mut Handle<ClientHandler>, params: &ConnectParams) -> Result<()> {
    let user = params.username.clone();
    let accepted = match &params.auth {
        AuthMethod::Password(password) => handle
            .authenticate_password(user, password.clone())
            .await?
            .success(),
        AuthMethod::KeyFile { path, passphrase } => {
            let key = russh::keys::load_secret_key(path, passphrase.as_deref()).map_err(|e| {
                TransportError::KeyFile {
                    path: path.clone(),
                    message: e.to_string(),
                }
            })?;
            let hash_alg = handle.best_supported_rsa_hash().await?.flatten();
            handle
                .authenticate_publickey(user, PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg))
                .await?
                .success()
        }
        AuthMethod::Agent => authenticate_with_agent(handle, &user).await?,
    };

    if accepted {
        Ok(())
    } else {
        Err(TransportError::AuthRejected)
    }
}

#[cfg(unix)]
async fn authenticate_with_agent(handle: &mut Handle<ClientHandler>, user: &str) -> Result<bool> {
    use russh::keys::agent::client::AgentClient;
    use russh::keys::agent::AgentIdentity;

    let mut agent = AgentClient::connect_env()
        .await
        .map_err(|e| TransportError::Agent(e.to_string()))?;
    let identities = agent
        .request_identities()
        .await
        .map_err(|e| TransportError::Agent(e.to_string()))?;
    if identities.is_empty() {
        return Err(TransportError::Agent("agent holds no identities".into()));
    }

    let hash_alg = handle.best_supported_rsa_hash().await?.flatten();
    for identity in identities {
        let AgentIdentity::PublicKey { key, .. } = identity else {
            continue;
        };
        match handle
            .authenticate_publickey_with(user, key, hash_alg, &mut agent)
            .await
        {
            Ok(result) if result.success() => return Ok(true),
            Ok(_) => continue,
            Err(error) => tracing::debug!("Agent signing failed: {error:?}"),
        }
    }
    Ok(false)
}

#[cfg(not(unix))]
async fn authenticate_with_agent(_handle: &mut Handle<ClientHandler>, _user: &str) -> Result<bool> {
    Err(TransportError::Agent("agent authentication needs SSH_AUTH_SOCK".into()))
}

/// Per-connection callbacks from the russh event loop.
pub(crate) struct ClientHandler {
    host: String,
    port: u16,
    known_hosts: Arc<KnownHosts>,
    routes: ForwardRoutes,
}

impl client::Handler for ClientHandler {
    type Error = TransportError;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool> {
        let line = server_public_key
            .to_openssh()
            .map_err(|e| TransportError::HostKey(e.to_string()))?;
        self.known_hosts
            .clone()
            .verify_blocking(self.host.clone(), self.port, line.to_string())
            .await?;
        Ok(true)
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<()> {
        let route = self.routes.lock().get(&connected_port).cloned();
        let Some(route) = route else {
            tracing::warn!(
                bind = %format!("{connected_address}:{connected_port}"),
                "Forwarded connection for a port we are not listening on"
            );
            return Ok(());
        };
        let connection = ForwardedConnection {
            stream: Box::new(channel.into_stream()),
            originator_host: originator_address.to_string(),
            originator_port: u16::try_from(originator_port).unwrap_or_default(),
        };
        if route.send(connection).is_err() {
            tracing::debug!(port = connected_port, "Remote forward already stopped");
        }
        Ok(())
    }
}

pub struct SshTransport {
    // Read for channel opens, write for the few requests russh wants `&mut` for.
    handle: RwLock<Handle<ClientHandler>>,
    routes: ForwardRoutes,
    target: String,
    closed: AtomicBool,
    output_queue_depth: usize,
}

#[async_trait]
impl Transport for SshTransport {
    async fn open_shell(&self, size: PtySize, term: &str) -> Result<ShellChannel> {
        let channel = self.handle.read().await.channel_open_session().await?;
        channel
            .request_pty(false, term, size.cols.into(), size.rows.into(), 0, 0, &[])
            .await?;
        channel.request_shell(false).await?;
        tracing::debug!(target = %self.target, cols = size.cols, rows = size.rows, "Shell opened");
        Ok(drive_shell(channel, self.output_queue_depth))
    }

    async fn open_sftp(&self) -> Result<Arc<dyn RemoteFs>> {
        let channel = self.handle.read().await.channel_open_session().await?;
        channel.request_subsystem(true, "sftp").await?;
        let fs = SftpFs::start(channel.into_stream()).await?;
        tracing::debug!(target = %self.target, "SFTP subsystem opened");
        Ok(Arc::new(fs))
    }

    async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u16,
        originator: SocketAddr,
    ) -> Result<ByteStream> {
        let channel = self
            .handle
            .read()
            .await
            .channel_open_direct_tcpip(
                host,
                port.into(),
                originator.ip().to_string(),
                originator.port().into(),
            )
            .await?;
        Ok(Box::new(channel.into_stream()))
    }

    async fn listen_remote(&self, bind_address: &str, port: u16) -> Result<RemoteListener> {
        let bound = self
            .handle
            .write()
            .await
            .tcpip_forward(bind_address, port.into())
            .await?;
        let bound_port = if bound == 0 { u32::from(port) } else { bound };

        let (sender, connections) = mpsc::unbounded_channel();
        self.routes.lock().insert(bound_port, sender);
        tracing::info!(bind = %format!("{bind_address}:{bound_port}"), "Remote listener opened");

        Ok(RemoteListener {
            bound_port: u16::try_from(bound_port)
                .map_err(|_| TransportError::Channel(format!("server bound invalid port {bound_port}")))?,
            connections,
        })
    }

    async fn cancel_remote(&self, bind_address: &str, port: u16) -> Result<()> {
        self.routes.lock().remove(&u32::from(port));
        if self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.handle
            .read()
            .await
            .cancel_tcpip_forward(bind_address, port.into())
            .await?;
        Ok(())
    }

    async fn exec(&self, command: &str) -> Result<ExecOutput> {
        let mut channel = self.handle.read().await.channel_open_session().await?;
        channel.exec(true, command).await?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_code = None;
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { data } => stdout.extend_from_slice(&data),
                ChannelMsg::ExtendedData { data, ext: 1 } => stderr.extend_from_slice(&data),
                ChannelMsg::ExitStatus { exit_status } => exit_code = Some(exit_status),
                _ => {}
            }
        }

        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code,
        })
    }

    async fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.handle.read().await.is_closed()
    }

    async fn disconnect(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.routes.lock().clear();
        let handle = self.handle.read().await;
        if !handle.is_closed() {
            handle
                .disconnect(Disconnect::ByApplication, "", "en")
                .await
                .log_err_with("sending disconnect");
        }
        tracing::info!(target = %self.target, "Disconnected");
        Ok(())
    }
}

/// Spawn the task that owns an interactive channel.
fn drive_shell(mut channel: Channel<Msg>, queue_depth: usize) -> ShellChannel {
    let (output_tx, output) = mpsc::channel(queue_depth);
    let (control, mut requests, closed) = ShellControl::new();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = closed.cancelled() => {
                    channel.close().await.log_err_with("closing shell channel");
                    break;
                }
                msg = channel.wait() => match msg {
                    Some(ChannelMsg::Data { data }) | Some(ChannelMsg::ExtendedData { data, .. }) => {
                        if output_tx.send(data.to_vec()).await.is_err() {
                            break;
                        }
                    }
                    Some(ChannelMsg::ExitStatus { exit_status }) => {
                        tracing::debug!(exit_status, "Remote shell exited");
                    }
                    Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => break,
                    Some(_) => {}
                },
                Some(request) = requests.recv() => match request {
                    ShellRequest::Write { data, ack } => {
                        let result = channel.data(&data[..]).await.map_err(TransportError::from);
                        let _ = ack.send(result);
                    }
                    ShellRequest::Resize { size, ack } => {
                        let result = channel
                            .window_change(size.cols.into(), size.rows.into(), 0, 0)
                            .await
                            .map_err(TransportError::from);
                        let _ = ack.send(result);
                    }
                },
            }
        }
        tracing::trace!("Shell driver finished");
    });

    ShellChannel { output, control }
}
