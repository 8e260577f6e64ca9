use crate::error::{validate_path, FsError};
use crate::listing::{sort_entries, FileEntry, FileInfo};
use std::sync::Arc;
use tokio::sync::Mutex;
use transport::{RemoteFs, Transport};
use util::ResultExt;

/// File operations over a session's SFTP subchannel.
///
/// The subchannel opens on first use and stays open until [`close`] or
/// until the link drops, after which the next call reopens it.
///
/// [`close`]: SftpFacade::close
pub struct SftpFacade {
    transport: Arc<dyn Transport>,
    fs: Mutex<Option<Arc<dyn RemoteFs>>>,
}

impl SftpFacade {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            fs: Mutex::new(None),
        }
    }

    /// The open subchannel, opening it if needed.
    pub async fn handle(&self) -> Result<Arc<dyn RemoteFs>, FsError> {
        let mut slot = self.fs.lock().await;
        if let Some(fs) = slot.as_ref() {
            return Ok(fs.clone());
        }
        let fs = self
            .transport
            .open_sftp()
            .await
            .map_err(|error| FsError::Unavailable(error.to_string()))?;
        tracing::debug!("SFTP subchannel opened");
        *slot = Some(fs.clone());
        Ok(fs)
    }

    pub async fn list(&self, path: &str) -> Result<Vec<FileEntry>, FsError> {
        validate_path(path)?;
        let fs = self.handle().await?;
        let raw = self.check(path, fs.read_dir(path).await).await?;
        let mut entries: Vec<FileEntry> = raw
            .into_iter()
            .filter(|entry| entry.name != "." && entry.name != "..")
            .map(FileEntry::from_remote)
            .collect();
        sort_entries(&mut entries);
        Ok(entries)
    }

    pub async fn mkdir(&self, path: &str) -> Result<(), FsError> {
        validate_path(path)?;
        let fs = self.handle().await?;
        self.check(path, fs.create_dir(path).await).await
    }

    pub async fn rename(&self, from: &str, to: &str) -> Result<(), FsError> {
        validate_path(from)?;
        validate_path(to)?;
        let fs = self.handle().await?;
        self.check(from, fs.rename(from, to).await).await
    }

    pub async fn remove(&self, path: &str) -> Result<(), FsError> {
        validate_path(path)?;
        let fs = self.handle().await?;
        self.check(path, fs.remove_file(path).await).await
    }

    /// Remove an empty directory.
    pub async fn rmdir(&self, path: &str) -> Result<(), FsError> {
        validate_path(path)?;
        let fs = self.handle().await?;
        self.check(path, fs.remove_dir(path).await).await
    }

    pub async fn stat(&self, path: &str) -> Result<FileInfo, FsError> {
        validate_path(path)?;
        let fs = self.handle().await?;
        let metadata = self.check(path, fs.metadata(path).await).await?;
        Ok(FileInfo::from_metadata(path, metadata))
    }

    pub async fn is_open(&self) -> bool {
        self.fs.lock().await.is_some()
    }

    /// Close the subchannel if it is open. Idempotent.
    pub async fn close(&self) {
        if let Some(fs) = self.fs.lock().await.take() {
            fs.close().await.log_err_with("closing SFTP subchannel");
        }
    }

    async fn check<T>(&self, path: &str, result: transport::Result<T>) -> Result<T, FsError> {
        match result {
            Ok(value) => Ok(value),
            Err(error) => {
                let error = FsError::from_transport(path, error);
                if matches!(error, FsError::Unavailable(_)) {
                    self.fs.lock().await.take();
                }
                tracing::debug!(path, %error, "SFTP operation failed");
                Err(error)
            }
        }
    }
}
