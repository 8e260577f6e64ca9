//! Remote file browsing and transfers for skiff.
//!
//! [`SftpFacade`] wraps one lazily opened SFTP subchannel per session and
//! turns its answers into listing entries ready for display.
//! [`TransferEngine`] runs chunked, cancellable uploads and downloads, each
//! on its own task, and exposes their progress for polling.

mod error;
mod facade;
pub mod listing;
mod transfer;

pub use error::FsError;
pub use facade::SftpFacade;
pub use listing::{EntryKind, FileEntry, FileInfo};
pub use transfer::{
    TransferDirection, TransferEngine, TransferError, TransferId, TransferProgress,
    TransferStatus, UploadSource,
};
