//! Directory entries as the file browser shows them.

use serde::Serialize;
use std::cmp::Ordering;
use transport::{RemoteDirEntry, RemoteFileKind, RemoteMetadata};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Directory,
    File,
    Symlink,
}

impl From<RemoteFileKind> for EntryKind {
    fn from(kind: RemoteFileKind) -> Self {
        match kind {
            RemoteFileKind::Directory => Self::Directory,
            RemoteFileKind::Symlink => Self::Symlink,
            RemoteFileKind::File | RemoteFileKind::Other => Self::File,
        }
    }
}

/// One row of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub name: String,
    /// Compact size, e.g. `12B` or `1.5K`.
    pub size: String,
    /// Local modification time, e.g. `Mar 04 09:15`.
    pub date: String,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    /// `ls -l` style mode string.
    pub permissions: String,
    pub raw_size: u64,
}

impl FileEntry {
    pub fn from_remote(entry: RemoteDirEntry) -> Self {
        let RemoteDirEntry { name, metadata } = entry;
        Self {
            name,
            size: format_size(metadata.size),
            date: format_date(metadata.modified),
            kind: metadata.kind.into(),
            permissions: format_permissions(metadata.permissions),
            raw_size: metadata.size,
        }
    }
}

/// Result of a `stat`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileInfo {
    pub path: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    pub size: String,
    pub raw_size: u64,
    pub date: String,
    /// Seconds since the Unix epoch, when the server reported it.
    pub modified: Option<u32>,
    pub permissions: String,
    pub mode: Option<u32>,
}

impl FileInfo {
    pub fn from_metadata(path: &str, metadata: RemoteMetadata) -> Self {
        let name = path
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .filter(|name| !name.is_empty())
            .unwrap_or("/")
            .to_string();
        Self {
            path: path.to_string(),
            name,
            kind: metadata.kind.into(),
            size: format_size(metadata.size),
            raw_size: metadata.size,
            date: format_date(metadata.modified),
            modified: metadata.modified,
            permissions: format_permissions(metadata.permissions),
            mode: metadata.permissions,
        }
    }
}

/// Directories first, then everything else, each group by case-insensitive name.
pub fn sort_entries(entries: &mut [FileEntry]) {
    entries.sort_by(|a, b| {
        let a_dir = a.kind == EntryKind::Directory;
        let b_dir = b.kind == EntryKind::Directory;
        match b_dir.cmp(&a_dir) {
            Ordering::Equal => a.name.to_lowercase().cmp(&b.name.to_lowercase()),
            other => other,
        }
    });
}

pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "K", "M", "G", "T"];
    let mut size = bytes as f64;
    for (index, unit) in UNITS.iter().enumerate() {
        if size < 1024.0 {
            return if index == 0 {
                format!("{size:.0}{unit}")
            } else {
                format!("{size:.1}{unit}")
            };
        }
        size /= 1024.0;
    }
    format!("{size:.1}P")
}

pub fn format_date(modified: Option<u32>) -> String {
    modified
        .and_then(|secs| chrono::DateTime::from_timestamp(i64::from(secs), 0))
        .map(|utc| {
            utc.with_timezone(&chrono::Local)
                .format("%b %d %H:%M")
                .to_string()
        })
        .unwrap_or_default()
}

pub fn format_permissions(mode: Option<u32>) -> String {
    let Some(mode) = mode else {
        return "?---------".to_string();
    };
    let mut out = String::with_capacity(10);
    out.push(match mode & 0o170000 {
        0o040000 => 'd',
        0o120000 => 'l',
        0o020000 => 'c',
        0o060000 => 'b',
        0o010000 => 'p',
        0o140000 => 's',
        _ => '-',
    });
    for (shift, special, set_exec, set_only) in [
        (6, 0o4000, 's', 'S'),
        (3, 0o2000, 's', 'S'),
        (0, 0o1000, 't', 'T'),
    ] {
        let bits = (mode >> shift) & 0o7;
        out.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        out.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        out.push(match (bits & 0o1 != 0, mode & special != 0) {
            (true, true) => set_exec,
            (false, true) => set_only,
            (true, false) => 'x',
            (false, false) => '-',
        });
    }
    out
}
