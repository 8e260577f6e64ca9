//! [`RemoteFs`] over a `russh-sftp` client session.

use crate::{
    ByteReader, ByteWriter, RemoteDirEntry, RemoteFileKind, RemoteFs, RemoteMetadata, Result,
    SftpErrorKind, TransportError,
};
use async_trait::async_trait;
use russh_sftp::client::error::Error as SftpError;
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::{FileAttributes, StatusCode};
use tokio::io::{AsyncRead, AsyncWrite};

pub(crate) struct SftpFs {
    session: SftpSession,
}

impl SftpFs {
    pub(crate) async fn start<S>(stream: S) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let session = SftpSession::new(stream).await.map_err(sftp_error)?;
        Ok(Self { session })
    }
}

fn sftp_error(error: SftpError) -> TransportError {
    let kind = match &error {
        SftpError::Status(status) => match status.status_code {
            StatusCode::NoSuchFile => SftpErrorKind::NotFound,
            StatusCode::PermissionDenied => SftpErrorKind::PermissionDenied,
            _ => SftpErrorKind::Failure,
        },
        _ => SftpErrorKind::Failure,
    };
    TransportError::sftp(kind, error.to_string())
}

fn to_metadata(attrs: &FileAttributes) -> RemoteMetadata {
    RemoteMetadata {
        size: attrs.size.unwrap_or(0),
        permissions: attrs.permissions,
        modified: attrs.mtime,
        kind: attrs
            .permissions
            .map(RemoteFileKind::from_mode)
            .unwrap_or(RemoteFileKind::Other),
    }
}

#[async_trait]
impl RemoteFs for SftpFs {
    async fn read_dir(&self, path: &str) -> Result<Vec<RemoteDirEntry>> {
        let entries = self.session.read_dir(path).await.map_err(sftp_error)?;
        Ok(entries
            .filter(|entry| {
                let name = entry.file_name();
                name != "." && name != ".."
            })
            .map(|entry| RemoteDirEntry {
                name: entry.file_name(),
                metadata: to_metadata(&entry.metadata()),
            })
            .collect())
    }

    async fn create_dir(&self, path: &str) -> Result<()> {
        self.session.create_dir(path).await.map_err(sftp_error)
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        self.session.rename(from, to).await.map_err(sftp_error)
    }

    async fn remove_file(&self, path: &str) -> Result<()> {
        self.session.remove_file(path).await.map_err(sftp_error)
    }

    async fn remove_dir(&self, path: &str) -> Result<()> {
        self.session.remove_dir(path).await.map_err(sftp_error)
    }

    async fn metadata(&self, path: &str) -> Result<RemoteMetadata> {
        let attrs = self.session.metadata(path).await.map_err(sftp_error)?;
        Ok(to_metadata(&attrs))
    }

    async fn open_read(&self, path: &str) -> Result<ByteReader> {
        let file = self.session.open(path).await.map_err(sftp_error)?;
        Ok(Box::new(file))
    }

    async fn create_write(&self, path: &str) -> Result<ByteWriter> {
        let file = self.session.create(path).await.map_err(sftp_error)?;
        Ok(Box::new(file))
    }

    async fn close(&self) -> Result<()> {
        self.session.close().await.map_err(sftp_error)
    }
}
