//! Chunked, cancellable uploads and downloads.
//!
//! Every transfer runs on its own task and publishes progress through a
//! small locked state block that callers poll. Status only moves forward:
//! `pending -> running -> completed | error | cancelled`, or straight from
//! `pending` to `error`/`cancelled`. Once terminal, counters freeze.

use crate::error::validate_path;
use collections::IndexMap;
use human_bytes::human_bytes;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use settings::constants::transfer::SETTLE_TIMEOUT;
use std::fmt::Display;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use transport::{RemoteFileKind, RemoteFs};
use util::ResultExt;

pub type TransferId = String;

/// Suffix of the sibling file a download is written to before it is renamed
/// into place.
const PARTIAL_SUFFIX: &str = ".part";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferDirection {
    Upload,
    Download,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    Pending,
    Running,
    Completed,
    Error,
    Cancelled,
}

impl TransferStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Cancelled)
    }

    fn can_become(self, next: Self) -> bool {
        use TransferStatus::*;
        matches!(
            (self, next),
            (Pending, Running | Error | Cancelled) | (Running, Completed | Error | Cancelled)
        )
    }
}

/// Snapshot of one transfer, as returned to pollers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferProgress {
    pub transfer_id: TransferId,
    pub direction: TransferDirection,
    pub status: TransferStatus,
    pub transferred: u64,
    pub total: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_path: Option<String>,
    pub remote_path: String,
}

/// What an upload reads from.
#[derive(Debug)]
pub enum UploadSource {
    File(PathBuf),
    Bytes(Vec<u8>),
}

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("Transfer id {0} is already in use")]
    DuplicateId(TransferId),
    #[error("Transfer {0} not found")]
    NotFound(TransferId),
    #[error("Transfer {0} has already finished")]
    AlreadyFinished(TransferId),
    #[error("Invalid path: {0:?}")]
    InvalidPath(String),
    #[error("Transfers are shut down for this session")]
    ShutDown,
}

struct TransferState {
    status: TransferStatus,
    transferred: u64,
    total: u64,
    error: Option<String>,
}

struct Transfer {
    id: TransferId,
    direction: TransferDirection,
    local_path: Option<PathBuf>,
    remote_path: String,
    state: Mutex<TransferState>,
    cancel: CancellationToken,
    /// Cancelled by the worker on its way out, after cleanup.
    finished: CancellationToken,
}

impl Transfer {
    fn progress(&self) -> TransferProgress {
        let state = self.state.lock();
        TransferProgress {
            transfer_id: self.id.clone(),
            direction: self.direction,
            status: state.status,
            transferred: state.transferred,
            total: state.total,
            error: state.error.clone(),
            local_path: self
                .local_path
                .as_ref()
                .map(|path| path.display().to_string()),
            remote_path: self.remote_path.clone(),
        }
    }

    fn status(&self) -> TransferStatus {
        self.state.lock().status
    }

    fn transition(&self, next: TransferStatus, error: Option<String>) -> bool {
        let mut state = self.state.lock();
        if !state.status.can_become(next) {
            return false;
        }
        state.status = next;
        state.error = error;
        true
    }

    fn set_total(&self, total: u64) {
        let mut state = self.state.lock();
        if state.status == TransferStatus::Running {
            state.total = total.max(state.transferred);
        }
    }

    fn advance(&self, bytes: usize) {
        let mut state = self.state.lock();
        if state.status != TransferStatus::Running {
            return;
        }
        state.transferred += bytes as u64;
        if state.transferred > state.total {
            state.total = state.transferred;
        }
    }

    /// Mark cancelled and wake the worker. Returns false if already terminal.
    fn request_cancel(&self) -> bool {
        let cancelled = self.transition(TransferStatus::Cancelled, None);
        self.cancel.cancel();
        cancelled
    }
}

enum Outcome {
    Completed,
    Cancelled,
    Failed(String),
}

fn describe(error: impl Display) -> String {
    error.to_string()
}

/// Per-session transfer table.
pub struct TransferEngine {
    transfers: RwLock<IndexMap<TransferId, Arc<Transfer>>>,
    chunk_size: usize,
    shut_down: AtomicBool,
}

impl TransferEngine {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            transfers: RwLock::new(IndexMap::default()),
            chunk_size: chunk_size.max(1),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Copy `remote_path` to `local_path`, creating missing local parents.
    ///
    /// Returns as soon as the worker is spawned.
    pub fn start_download(
        &self,
        fs: Arc<dyn RemoteFs>,
        id: Option<TransferId>,
        remote_path: &str,
        local_path: PathBuf,
    ) -> Result<TransferId, TransferError> {
        validate_path(remote_path).map_err(|_| TransferError::InvalidPath(remote_path.into()))?;
        if local_path.as_os_str().is_empty() || local_path.file_name().is_none() {
            return Err(TransferError::InvalidPath(local_path.display().to_string()));
        }
        let transfer = self.register(
            id,
            TransferDirection::Download,
            Some(local_path),
            remote_path,
        )?;
        tracing::info!(
            transfer_id = %transfer.id,
            remote = %transfer.remote_path,
            "Starting download"
        );
        tokio::spawn(run_download(transfer.clone(), fs, self.chunk_size));
        Ok(transfer.id.clone())
    }

    /// Copy `source` to `remote_path`. Returns as soon as the worker is spawned.
    pub fn start_upload(
        &self,
        fs: Arc<dyn RemoteFs>,
        id: Option<TransferId>,
        source: UploadSource,
        remote_path: &str,
    ) -> Result<TransferId, TransferError> {
        validate_path(remote_path).map_err(|_| TransferError::InvalidPath(remote_path.into()))?;
        let local_path = match &source {
            UploadSource::File(path) if path.as_os_str().is_empty() => {
                return Err(TransferError::InvalidPath(String::new()))
            }
            UploadSource::File(path) => Some(path.clone()),
            UploadSource::Bytes(_) => None,
        };
        let transfer = self.register(id, TransferDirection::Upload, local_path, remote_path)?;
        tracing::info!(
            transfer_id = %transfer.id,
            remote = %transfer.remote_path,
            "Starting upload"
        );
        tokio::spawn(run_upload(transfer.clone(), fs, source, self.chunk_size));
        Ok(transfer.id.clone())
    }

    pub fn progress(&self, id: &str) -> Option<TransferProgress> {
        self.transfers.read().get(id).map(|transfer| transfer.progress())
    }

    /// Every transfer ever started in this session, oldest first.
    pub fn list(&self) -> Vec<TransferProgress> {
        self.transfers
            .read()
            .values()
            .map(|transfer| transfer.progress())
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.transfers
            .read()
            .values()
            .filter(|transfer| !transfer.status().is_terminal())
            .count()
    }

    /// Cancel a transfer and wait for its worker to release its handles and
    /// remove partial output.
    pub async fn cancel(&self, id: &str) -> Result<TransferProgress, TransferError> {
        let transfer = self
            .transfers
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| TransferError::NotFound(id.to_string()))?;
        if !transfer.request_cancel() {
            return Err(TransferError::AlreadyFinished(id.to_string()));
        }
        tracing::info!(transfer_id = id, "Transfer cancel requested");
        settle(&transfer).await;
        Ok(transfer.progress())
    }

    /// Cancel everything still in flight and refuse new transfers.
    pub async fn cancel_all(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
        let pending: Vec<Arc<Transfer>> = self
            .transfers
            .read()
            .values()
            .filter(|transfer| transfer.request_cancel())
            .cloned()
            .collect();
        if !pending.is_empty() {
            tracing::info!(count = pending.len(), "Cancelling in-flight transfers");
        }
        for transfer in &pending {
            settle(transfer).await;
        }
    }

    fn register(
        &self,
        id: Option<TransferId>,
        direction: TransferDirection,
        local_path: Option<PathBuf>,
        remote_path: &str,
    ) -> Result<Arc<Transfer>, TransferError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(TransferError::ShutDown);
        }
        let id = id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let mut transfers = self.transfers.write();
        if transfers.contains_key(&id) {
            return Err(TransferError::DuplicateId(id));
        }
        let transfer = Arc::new(Transfer {
            id: id.clone(),
            direction,
            local_path,
            remote_path: remote_path.to_string(),
            state: Mutex::new(TransferState {
                status: TransferStatus::Pending,
                transferred: 0,
                total: 0,
                error: None,
            }),
            cancel: CancellationToken::new(),
            finished: CancellationToken::new(),
        });
        transfers.insert(id, transfer.clone());
        Ok(transfer)
    }
}

async fn settle(transfer: &Transfer) {
    if tokio::time::timeout(SETTLE_TIMEOUT, transfer.finished.cancelled())
        .await
        .is_err()
    {
        tracing::warn!(transfer_id = %transfer.id, "Transfer worker did not stop in time");
    }
}

fn partial_path(local: &Path) -> PathBuf {
    let mut name = local.file_name().unwrap_or_default().to_os_string();
    name.push(PARTIAL_SUFFIX);
    local.with_file_name(name)
}

async fn run_download(transfer: Arc<Transfer>, fs: Arc<dyn RemoteFs>, chunk_size: usize) {
    let Some(local) = transfer.local_path.clone() else {
        util::debug_panic!("download {} has no local path", transfer.id);
        transfer.finished.cancel();
        return;
    };
    let partial = partial_path(&local);
    let created = AtomicBool::new(false);

    let outcome = if transfer.transition(TransferStatus::Running, None) {
        tokio::select! {
            biased;
            _ = transfer.cancel.cancelled() => Outcome::Cancelled,
            result = download_body(&transfer, fs.as_ref(), &partial, &local, chunk_size, &created) => {
                match result {
                    Ok(()) => Outcome::Completed,
                    Err(_) if transfer.cancel.is_cancelled() => Outcome::Cancelled,
                    Err(message) => Outcome::Failed(message),
                }
            }
        }
    } else {
        Outcome::Cancelled
    };
    let outcome = commit_download(&partial, &local, outcome).await;

    if !matches!(outcome, Outcome::Completed) && created.load(Ordering::SeqCst) {
        if let Err(error) = tokio::fs::remove_file(&partial).await {
            if error.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(transfer_id = %transfer.id, %error, "Could not remove partial download");
            }
        }
    }
    finish(&transfer, outcome);
}

async fn download_body(
    transfer: &Transfer,
    fs: &dyn RemoteFs,
    partial: &Path,
    local: &Path,
    chunk_size: usize,
    created: &AtomicBool,
) -> Result<(), String> {
    let metadata = fs.metadata(&transfer.remote_path).await.map_err(describe)?;
    if metadata.kind == RemoteFileKind::Directory {
        return Err(format!("{} is a directory", transfer.remote_path));
    }
    transfer.set_total(metadata.size);

    let mut reader = fs.open_read(&transfer.remote_path).await.map_err(describe)?;
    if let Some(parent) = local.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(describe)?;
    }
    let mut file = tokio::fs::File::create(partial).await.map_err(describe)?;
    created.store(true, Ordering::SeqCst);

    let mut buf = vec![0u8; chunk_size];
    loop {
        if transfer.cancel.is_cancelled() {
            return Err("cancelled".into());
        }
        let read = reader.read(&mut buf).await.map_err(describe)?;
        if read == 0 {
            break;
        }
        file.write_all(&buf[..read]).await.map_err(describe)?;
        transfer.advance(read);
    }
    file.flush().await.map_err(describe)?;
    drop(file);
    Ok(())
}

/// Move a fully written download into place. Runs outside the cancellable
/// section: once the last byte is on disk the transfer either completes or
/// fails, it is never reported cancelled with the target present.
async fn commit_download(partial: &Path, local: &Path, outcome: Outcome) -> Outcome {
    match outcome {
        Outcome::Completed => match tokio::fs::rename(partial, local).await {
            Ok(()) => Outcome::Completed,
            Err(error) => Outcome::Failed(describe(error)),
        },
        other => other,
    }
}

async fn run_upload(
    transfer: Arc<Transfer>,
    fs: Arc<dyn RemoteFs>,
    source: UploadSource,
    chunk_size: usize,
) {
    let created = AtomicBool::new(false);

    let outcome = if transfer.transition(TransferStatus::Running, None) {
        tokio::select! {
            biased;
            _ = transfer.cancel.cancelled() => Outcome::Cancelled,
            result = upload_body(&transfer, fs.as_ref(), source, chunk_size, &created) => {
                match result {
                    Ok(()) => Outcome::Completed,
                    Err(_) if transfer.cancel.is_cancelled() => Outcome::Cancelled,
                    Err(message) => Outcome::Failed(message),
                }
            }
        }
    } else {
        Outcome::Cancelled
    };

    if !matches!(outcome, Outcome::Completed) && created.load(Ordering::SeqCst) {
        fs.remove_file(&transfer.remote_path)
            .await
            .log_err_with("removing partial upload");
    }
    finish(&transfer, outcome);
}

async fn upload_body(
    transfer: &Transfer,
    fs: &dyn RemoteFs,
    source: UploadSource,
    chunk_size: usize,
    created: &AtomicBool,
) -> Result<(), String> {
    let mut reader: Box<dyn AsyncRead + Send + Unpin> = match source {
        UploadSource::Bytes(bytes) => {
            transfer.set_total(bytes.len() as u64);
            Box::new(Cursor::new(bytes))
        }
        UploadSource::File(path) => {
            let file = tokio::fs::File::open(&path)
                .await
                .map_err(|error| format!("{}: {error}", path.display()))?;
            let metadata = file.metadata().await.map_err(describe)?;
            if metadata.is_dir() {
                return Err(format!("{} is a directory", path.display()));
            }
            transfer.set_total(metadata.len());
            Box::new(file)
        }
    };

    let mut writer = fs
        .create_write(&transfer.remote_path)
        .await
        .map_err(describe)?;
    created.store(true, Ordering::SeqCst);

    let mut buf = vec![0u8; chunk_size];
    loop {
        if transfer.cancel.is_cancelled() {
            return Err("cancelled".into());
        }
        let read = reader.read(&mut buf).await.map_err(describe)?;
        if read == 0 {
            break;
        }
        writer.write_all(&buf[..read]).await.map_err(describe)?;
        transfer.advance(read);
    }
    writer.shutdown().await.map_err(describe)?;
    Ok(())
}

fn finish(transfer: &Transfer, outcome: Outcome) {
    match outcome {
        Outcome::Completed => {
            if transfer.transition(TransferStatus::Completed, None) {
                let total = transfer.state.lock().total;
                tracing::info!(
                    transfer_id = %transfer.id,
                    direction = ?transfer.direction,
                    size = %human_bytes(total as f64),
                    "Transfer complete"
                );
            }
        }
        Outcome::Cancelled => {
            transfer.transition(TransferStatus::Cancelled, None);
            tracing::info!(transfer_id = %transfer.id, "Transfer cancelled");
        }
        Outcome::Failed(message) => {
            tracing::warn!(transfer_id = %transfer.id, error = %message, "Transfer failed");
            transfer.transition(TransferStatus::Error, Some(message));
        }
    }
    transfer.finished.cancel();
}
