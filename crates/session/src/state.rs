use crate::probe::{self, CommandOutput, ResourceUsage};
use crate::SessionError;
use forward::{ForwardEngine, ForwardInfo};
use parking_lot::Mutex;
use remote_fs::{
    FileEntry, FileInfo, SftpFacade, TransferEngine, TransferError, TransferId, TransferProgress,
    UploadSource,
};
use serde::Serialize;
use settings::Config;
use std::path::PathBuf;
use std::sync::Arc;
use terminal::{OutputBuffer, PumpExit, ShellPump};
use tokio_util::sync::CancellationToken;
use transport::{ConnectParams, Connector, PtySize, Transport};
use util::ResultExt;

pub(crate) const REMOTE_CLOSED: &str = "Connection closed by remote host";

/// Shell lines that end the remote login.
const LOGOUT_COMMANDS: &[&str] = &["exit", "logout", "quit", "bye"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Created,
    Connecting,
    Connected,
    /// Terminal. Reconnecting means a new session.
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub id: String,
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<SessionState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Seconds since the Unix epoch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SessionStatus {
    pub(crate) fn not_found(id: &str) -> Self {
        Self {
            id: id.to_string(),
            connected: false,
            state: None,
            hostname: None,
            username: None,
            port: None,
            last_activity: None,
            error: Some(SessionError::NotFound.to_string()),
        }
    }
}

#[derive(Default)]
struct Details {
    hostname: Option<String>,
    username: Option<String>,
    port: Option<u16>,
    last_activity: Option<i64>,
    error: Option<String>,
}

/// Everything that only exists while connected.
struct Live {
    transport: Arc<dyn Transport>,
    pump: ShellPump,
    sftp: SftpFacade,
    forwards: ForwardEngine,
}

impl Live {
    async fn shut_down(&self) {
        self.pump.stop();
        self.forwards.stop_all().await;
        self.sftp.close().await;
        self.transport.disconnect().await.log_err_with("closing transport");
    }
}

/// One remote login and everything hanging off it.
///
/// Connect and teardown are serialised by a per-session async lock.
/// Teardown fires `closing` first, so an in-flight connect gives the lock up
/// instead of making a disconnect wait out the handshake. Every other call
/// only takes short synchronous locks and then talks to the transport
/// without blocking other sessions.
pub struct Session {
    id: String,
    config: Arc<Config>,
    state: Mutex<SessionState>,
    details: Mutex<Details>,
    output: Arc<OutputBuffer>,
    transfers: TransferEngine,
    live: Mutex<Option<Arc<Live>>>,
    lifecycle: tokio::sync::Mutex<()>,
    closing: CancellationToken,
}

impl Session {
    pub(crate) fn new(id: String, config: Arc<Config>) -> Self {
        Self {
            id,
            transfers: TransferEngine::new(config.chunk_size()),
            config,
            state: Mutex::new(SessionState::Created),
            details: Mutex::new(Details::default()),
            output: Arc::new(OutputBuffer::new()),
            live: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
            closing: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    pub fn status(&self) -> SessionStatus {
        let state = self.state();
        let details = self.details.lock();
        SessionStatus {
            id: self.id.clone(),
            connected: state == SessionState::Connected,
            state: Some(state),
            hostname: details.hostname.clone(),
            username: details.username.clone(),
            port: details.port,
            last_activity: details.last_activity,
            error: details.error.clone(),
        }
    }

    /// Authenticate, open the shell and start pumping it.
    ///
    /// A failure puts the session back in `created`, so the same id can
    /// try again. Nothing is retried here.
    pub(crate) async fn connect(
        self: &Arc<Self>,
        connector: &dyn Connector,
        params: ConnectParams,
    ) -> Result<(), SessionError> {
        if self.state() == SessionState::Connecting {
            return Err(SessionError::AlreadyConnecting);
        }
        let _lifecycle = self.lifecycle.lock().await;
        {
            let mut state = self.state.lock();
            match *state {
                SessionState::Created => *state = SessionState::Connecting,
                SessionState::Connecting => return Err(SessionError::AlreadyConnecting),
                SessionState::Connected => return Err(SessionError::AlreadyConnected),
                SessionState::Disconnected => return Err(SessionError::Disconnected),
            }
        }

        tracing::info!(
            session_id = %self.id,
            target = %params.target(),
            auth = params.auth.label(),
            "Connecting"
        );
        match self.establish(connector, &params).await {
            Ok(live) => {
                *self.live.lock() = Some(Arc::new(live));
                *self.state.lock() = SessionState::Connected;
                let mut details = self.details.lock();
                details.hostname = Some(params.hostname);
                details.username = Some(params.username);
                details.port = Some(params.port);
                details.error = None;
                details.last_activity = Some(now());
                tracing::info!(session_id = %self.id, "Connected");
                Ok(())
            }
            Err(error) if self.closing.is_cancelled() => {
                tracing::info!(session_id = %self.id, "Connect abandoned, session is closing");
                Err(error)
            }
            Err(error) => {
                *self.state.lock() = SessionState::Created;
                self.details.lock().error = Some(error.to_string());
                tracing::warn!(session_id = %self.id, %error, "Connect failed");
                Err(error)
            }
        }
    }

    async fn establish(
        self: &Arc<Self>,
        connector: &dyn Connector,
        params: &ConnectParams,
    ) -> Result<Live, SessionError> {
        let transport = tokio::select! {
            biased;
            _ = self.closing.cancelled() => return Err(SessionError::Disconnected),
            transport = connector.connect(params) => transport?,
        };
        let (cols, rows) = self.config.terminal_size();
        let size = PtySize { cols, rows };
        let channel = tokio::select! {
            biased;
            _ = self.closing.cancelled() => Err(SessionError::Disconnected),
            channel = transport.open_shell(size, &self.config.terminal_type) => channel.map_err(SessionError::from),
        };
        let channel = match channel {
            Ok(channel) => channel,
            Err(error) => {
                transport.disconnect().await.log_err_with("closing transport");
                return Err(error);
            }
        };

        let weak = Arc::downgrade(self);
        let pump = ShellPump::spawn(channel, size, self.output.clone(), move |exit| {
            if exit != PumpExit::EndOfStream {
                return;
            }
            if let Some(session) = weak.upgrade() {
                tokio::spawn(async move {
                    session.teardown(Some(REMOTE_CLOSED.to_string())).await;
                });
            }
        });

        Ok(Live {
            sftp: SftpFacade::new(transport.clone()),
            forwards: ForwardEngine::new(transport.clone(), self.config.forward_bind_address.clone()),
            transport,
            pump,
        })
    }

    /// Mark the session disconnected and release everything it owns:
    /// transfers, shell, forwards (with their open tunnels), SFTP and the
    /// transport. Idempotent.
    pub(crate) async fn teardown(&self, reason: Option<String>) {
        self.closing.cancel();
        let _lifecycle = self.lifecycle.lock().await;
        let previous = std::mem::replace(&mut *self.state.lock(), SessionState::Disconnected);
        if previous != SessionState::Disconnected {
            match reason {
                Some(reason) => {
                    tracing::warn!(session_id = %self.id, %reason, "Session lost");
                    self.details.lock().error = Some(reason);
                }
                None => tracing::info!(session_id = %self.id, "Disconnecting"),
            }
        }

        let live = self.live.lock().take();
        self.transfers.cancel_all().await;
        if let Some(live) = live {
            live.shut_down().await;
        }
    }

    fn live(&self) -> Result<Arc<Live>, SessionError> {
        let live = self.live.lock().clone().ok_or(SessionError::NotConnected)?;
        self.touch();
        Ok(live)
    }

    fn touch(&self) {
        self.details.lock().last_activity = Some(now());
    }

    pub async fn send_input(&self, data: &str) -> Result<(), SessionError> {
        let live = self.live()?;
        live.pump.send_input(data.as_bytes()).await?;
        if is_logout_command(data) {
            tracing::debug!(session_id = %self.id, "Logout command sent to shell");
        }
        Ok(())
    }

    pub async fn resize(&self, cols: u16, rows: u16) -> Result<(), SessionError> {
        self.live()?.pump.resize(cols, rows).await?;
        Ok(())
    }

    /// Drain pending shell output. Output produced just before a remote
    /// close stays readable after the session is disconnected.
    pub fn read_output(&self) -> String {
        let output = self.output.drain_text();
        if !output.is_empty() {
            self.touch();
        }
        output
    }

    pub async fn list_directory(&self, path: &str) -> Result<Vec<FileEntry>, SessionError> {
        Ok(self.live()?.sftp.list(path).await?)
    }

    pub async fn create_directory(&self, path: &str) -> Result<(), SessionError> {
        Ok(self.live()?.sftp.mkdir(path).await?)
    }

    pub async fn rename(&self, from: &str, to: &str) -> Result<(), SessionError> {
        Ok(self.live()?.sftp.rename(from, to).await?)
    }

    pub async fn delete_file(&self, path: &str) -> Result<(), SessionError> {
        Ok(self.live()?.sftp.remove(path).await?)
    }

    pub async fn delete_directory(&self, path: &str) -> Result<(), SessionError> {
        Ok(self.live()?.sftp.rmdir(path).await?)
    }

    pub async fn file_info(&self, path: &str) -> Result<FileInfo, SessionError> {
        Ok(self.live()?.sftp.stat(path).await?)
    }

    /// Start a download to `local_path`, or into the download directory
    /// under the remote file name.
    pub async fn start_download(
        &self,
        remote_path: &str,
        local_path: Option<PathBuf>,
        transfer_id: Option<TransferId>,
    ) -> Result<TransferId, SessionError> {
        let live = self.live()?;
        let local_path = match local_path {
            Some(path) => path,
            None => self.default_download_path(remote_path)?,
        };
        let fs = live.sftp.handle().await?;
        Ok(self
            .transfers
            .start_download(fs, transfer_id, remote_path, local_path)?)
    }

    pub async fn start_upload(
        &self,
        source: UploadSource,
        remote_path: &str,
        transfer_id: Option<TransferId>,
    ) -> Result<TransferId, SessionError> {
        let fs = self.live()?.sftp.handle().await?;
        Ok(self
            .transfers
            .start_upload(fs, transfer_id, source, remote_path)?)
    }

    /// Progress stays queryable after the session is gone.
    pub fn transfer_progress(&self, transfer_id: &str) -> Result<TransferProgress, SessionError> {
        self.transfers
            .progress(transfer_id)
            .ok_or_else(|| TransferError::NotFound(transfer_id.to_string()).into())
    }

    pub async fn cancel_transfer(&self, transfer_id: &str) -> Result<TransferProgress, SessionError> {
        Ok(self.transfers.cancel(transfer_id).await?)
    }

    pub fn list_transfers(&self) -> Vec<TransferProgress> {
        self.transfers.list()
    }

    pub async fn create_local_forward(
        &self,
        bind_address: Option<&str>,
        local_port: u16,
        remote_host: &str,
        remote_port: u16,
    ) -> Result<ForwardInfo, SessionError> {
        let live = self.live()?;
        Ok(live
            .forwards
            .create_local(bind_address, local_port, remote_host, remote_port)
            .await?)
    }

    pub async fn create_remote_forward(
        &self,
        bind_address: Option<&str>,
        remote_port: u16,
        local_host: &str,
        local_port: u16,
    ) -> Result<ForwardInfo, SessionError> {
        let live = self.live()?;
        Ok(live
            .forwards
            .create_remote(bind_address, remote_port, local_host, local_port)
            .await?)
    }

    pub async fn create_dynamic_forward(
        &self,
        bind_address: Option<&str>,
        socks_port: u16,
    ) -> Result<ForwardInfo, SessionError> {
        let live = self.live()?;
        Ok(live.forwards.create_dynamic(bind_address, socks_port).await?)
    }

    pub async fn stop_forward(&self, forward_id: &str) -> Result<(), SessionError> {
        Ok(self.live()?.forwards.stop(forward_id).await?)
    }

    /// Empty once the session is disconnected.
    pub fn list_forwards(&self) -> Vec<ForwardInfo> {
        self.live
            .lock()
            .as_ref()
            .map(|live| live.forwards.list())
            .unwrap_or_default()
    }

    pub async fn exec(&self, command: &str) -> Result<CommandOutput, SessionError> {
        let live = self.live()?;
        probe::exec_command(live.transport.as_ref(), command).await
    }

    pub async fn resource_usage(&self) -> Result<ResourceUsage, SessionError> {
        let live = self.live()?;
        probe::resource_usage(live.transport.as_ref()).await
    }

    fn default_download_path(&self, remote_path: &str) -> Result<PathBuf, SessionError> {
        let name = remote_path
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .filter(|name| !name.is_empty() && *name != "." && *name != "..")
            .ok_or_else(|| {
                SessionError::InvalidRequest(format!("Cannot derive a file name from {remote_path:?}"))
            })?;
        let dir = self
            .config
            .download_dir()
            .unwrap_or_else(|| skiff_paths::downloads_dir().clone());
        Ok(dir.join(name))
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

fn is_logout_command(input: &str) -> bool {
    LOGOUT_COMMANDS.contains(&input.trim())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use remote_fs::TransferStatus;
    use std::future::Future;
    use std::time::Duration;
    use tracing_test::traced_test;
    use transport::fake::FakeServer;
    use transport::AuthMethod;

    fn params(password: &str) -> ConnectParams {
        ConnectParams::new("h", 22, "u", AuthMethod::Password(password.into()))
    }

    fn new_session(config: Config) -> Arc<Session> {
        Arc::new(Session::new("session-1".into(), Arc::new(config)))
    }

    async fn connected(server: &FakeServer) -> Arc<Session> {
        let session = new_session(Config::default());
        session
            .connect(server.connector().as_ref(), params("p"))
            .await
            .unwrap();
        session
    }

    async fn eventually<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        for _ in 0..200 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    async fn read_until(session: &Session, expected: &str) -> String {
        let mut seen = String::new();
        for _ in 0..200 {
            seen.push_str(&session.read_output());
            if seen.contains(expected) {
                return seen;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {expected:?} in shell output, got {seen:?}");
    }

    #[tokio::test]
    async fn connect_moves_to_connected() {
        let server = FakeServer::new().with_account("u", "p");
        let session = connected(&server).await;

        let status = session.status();
        assert_eq!(status.state, Some(SessionState::Connected));
        assert!(status.connected);
        assert_eq!(status.hostname.as_deref(), Some("h"));
        assert_eq!(status.username.as_deref(), Some("u"));
        assert_eq!(status.port, Some(22));
        assert!(status.last_activity.is_some());
        assert_eq!(status.error, None);
    }

    #[tokio::test]
    async fn failed_connect_can_be_retried() {
        let server = FakeServer::new().with_account("u", "p");
        let session = new_session(Config::default());
        let connector = server.connector();

        let error = session.connect(connector.as_ref(), params("wrong")).await.unwrap_err();
        assert!(matches!(error, SessionError::Transport(_)));
        assert_eq!(session.state(), SessionState::Created);
        assert_eq!(session.status().error.as_deref(), Some("Authentication failed"));

        session.connect(connector.as_ref(), params("p")).await.unwrap();
        assert!(session.is_connected());
        assert_eq!(session.status().error, None);
        assert_eq!(server.connect_count(), 2);
    }

    #[tokio::test]
    #[traced_test]
    async fn failed_connect_is_logged_without_secrets() {
        let server = FakeServer::new().with_account("u", "p");
        let session = new_session(Config::default());
        let result = session
            .connect(server.connector().as_ref(), params("s3cret-pw"))
            .await;
        assert!(result.is_err());
        assert!(logs_contain("Connect failed"));
        assert!(!logs_contain("s3cret-pw"));
    }

    #[tokio::test]
    async fn connect_twice_is_rejected() {
        let server = FakeServer::new().with_account("u", "p");
        let session = connected(&server).await;
        let again = session.connect(server.connector().as_ref(), params("p")).await;
        assert!(matches!(again, Err(SessionError::AlreadyConnected)));
        assert_eq!(server.connect_count(), 1);
    }

    #[tokio::test]
    async fn disconnected_session_never_reconnects() {
        let server = FakeServer::new().with_account("u", "p");
        let session = connected(&server).await;
        session.teardown(None).await;

        assert!(!session.status().connected);
        let again = session.connect(server.connector().as_ref(), params("p")).await;
        assert!(matches!(again, Err(SessionError::Disconnected)));
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn shell_output_keeps_input_order() {
        let server = FakeServer::new().with_account("u", "p");
        let session = connected(&server).await;

        session.send_input("A").await.unwrap();
        session.send_input("B").await.unwrap();
        let output = read_until(&session, "AB").await;
        assert_eq!(output, "AB");
        assert_eq!(session.read_output(), "");
    }

    #[tokio::test]
    async fn resize_is_forwarded_and_validated() {
        let server = FakeServer::new().with_account("u", "p");
        let session = connected(&server).await;

        session.resize(120, 40).await.unwrap();
        let transport = server.last_transport().unwrap();
        assert_eq!(transport.resizes(), vec![PtySize { cols: 120, rows: 40 }]);
        assert!(matches!(
            session.resize(0, 40).await,
            Err(SessionError::Shell(_))
        ));
    }

    #[tokio::test]
    async fn remote_exit_tears_the_session_down() {
        let server = FakeServer::new().with_account("u", "p");
        let session = connected(&server).await;
        session
            .create_local_forward(None, 0, "localhost", 80)
            .await
            .unwrap();

        session.send_input("exit\n").await.unwrap();
        eventually(|| async { session.state() == SessionState::Disconnected }).await;

        let status = session.status();
        assert!(!status.connected);
        assert_eq!(status.error.as_deref(), Some(REMOTE_CLOSED));
        assert!(session.list_forwards().is_empty());
        assert_eq!(read_until(&session, "exit").await, "exit\n");
        assert!(matches!(
            session.send_input("ls\n").await,
            Err(SessionError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn dropped_link_is_reported_once() {
        let server = FakeServer::new().with_account("u", "p");
        let session = connected(&server).await;

        server.last_transport().unwrap().drop_link();
        eventually(|| async { !session.is_connected() }).await;
        assert_eq!(session.status().error.as_deref(), Some(REMOTE_CLOSED));

        session.teardown(None).await;
        assert_eq!(session.status().error.as_deref(), Some(REMOTE_CLOSED));
    }

    #[tokio::test]
    async fn teardown_cancels_transfers_and_forwards() {
        let server = FakeServer::new().with_account("u", "p");
        server.fs().add_file("/big.bin", vec![7u8; 256 * 1024]);
        server.fs().set_io_delay(Duration::from_millis(20));
        let dir = tempfile::tempdir().unwrap();
        let session = connected(&server).await;

        let forward = session
            .create_dynamic_forward(None, 0)
            .await
            .unwrap();
        let transfer = session
            .start_download("/big.bin", Some(dir.path().join("big.bin")), None)
            .await
            .unwrap();
        assert_eq!(session.list_forwards()[0].id, forward.id);

        session.teardown(None).await;

        assert!(session.list_forwards().is_empty());
        let progress = session.transfer_progress(&transfer).unwrap();
        assert_eq!(progress.status, TransferStatus::Cancelled);
        assert!(!dir.path().join("big.bin").exists());
        let port = forward.bind_port;
        assert!(tokio::net::TcpListener::bind(("127.0.0.1", port)).await.is_ok());
    }

    #[tokio::test]
    async fn operations_need_a_connection() {
        let session = new_session(Config::default());
        assert!(matches!(
            session.list_directory("/").await,
            Err(SessionError::NotConnected)
        ));
        assert!(matches!(
            session.exec("uptime").await,
            Err(SessionError::NotConnected)
        ));
        assert!(session.list_forwards().is_empty());
        assert_eq!(session.read_output(), "");
    }

    #[tokio::test]
    async fn download_defaults_to_configured_directory() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            download_directory: Some(dir.path().display().to_string()),
            ..Config::default()
        };
        let server = FakeServer::new().with_account("u", "p");
        server.fs().add_dir("/srv");
        server.fs().add_file("/srv/report.txt", "quarterly");
        let session = new_session(config);
        session
            .connect(server.connector().as_ref(), params("p"))
            .await
            .unwrap();

        let id = session.start_download("/srv/report.txt", None, None).await.unwrap();
        eventually(|| async {
            session.transfer_progress(&id).unwrap().status == TransferStatus::Completed
        })
        .await;
        assert_eq!(
            std::fs::read_to_string(dir.path().join("report.txt")).unwrap(),
            "quarterly"
        );

        assert!(matches!(
            session.start_download("/", None, None).await,
            Err(SessionError::InvalidRequest(_))
        ));
    }

    #[test]
    fn logout_commands() {
        assert!(is_logout_command("exit\n"));
        assert!(is_logout_command("  logout\r"));
        assert!(!is_logout_command("exit 1\n"));
        assert!(!is_logout_command("ls\n"));
    }
}
