//! Trust-on-first-use host key store.
//!
//! Entries use the OpenSSH `known_hosts` line format so the file can be
//! inspected (or pruned) with the usual tools: `host keytype base64` for
//! port 22 and `[host]:port keytype base64` otherwise. Hashed entries and
//! markers such as `@revoked` are skipped rather than interpreted.

use crate::TransportError;
use parking_lot::Mutex;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Outcome of a successful host key check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKeyCheck {
    /// The key matched a recorded entry.
    Known,
    /// The host was unknown; the key has been recorded.
    Learned,
}

pub struct KnownHosts {
    path: PathBuf,
    // Serialises read-check-append across concurrent handshakes.
    lock: Mutex<()>,
}

impl KnownHosts {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check `key` (an OpenSSH public key line, `keytype base64 [comment]`)
    /// for `host:port`, recording it if the host has no key of that type yet.
    pub fn verify(&self, host: &str, port: u16, key: &str) -> Result<HostKeyCheck, TransportError> {
        let (key_type, key_blob) = split_key(key)
            .ok_or_else(|| TransportError::HostKey(format!("unparseable key {key:?}")))?;
        let pattern = host_pattern(host, port);

        let _guard = self.lock.lock();
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };

        for line in content.lines() {
            let Some((hosts, stored_type, stored_blob)) = parse_line(line) else {
                continue;
            };
            if stored_type != key_type || !hosts.split(',').any(|h| h == pattern) {
                continue;
            }
            if stored_blob == key_blob {
                tracing::trace!(host = %pattern, "Host key matches known_hosts");
                return Ok(HostKeyCheck::Known);
            }
            tracing::warn!(host = %pattern, key_type, "Host key mismatch");
            return Err(TransportError::HostKeyMismatch { host: pattern });
        }

        self.append(&pattern, key_type, key_blob)?;
        tracing::info!(host = %pattern, key_type, path = %self.path.display(), "Learned new host key");
        Ok(HostKeyCheck::Learned)
    }

    /// [`KnownHosts::verify`] on the blocking pool, so file access never
    /// stalls a runtime worker mid-handshake.
    pub async fn verify_blocking(
        self: Arc<Self>,
        host: String,
        port: u16,
        key: String,
    ) -> Result<HostKeyCheck, TransportError> {
        tokio::task::spawn_blocking(move || self.verify(&host, port, &key))
            .await
            .map_err(|error| TransportError::HostKey(format!("host key check aborted: {error}")))?
    }

    fn append(&self, pattern: &str, key_type: &str, key_blob: &str) -> Result<(), TransportError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{pattern} {key_type} {key_blob}")?;
        Ok(())
    }
}

fn host_pattern(host: &str, port: u16) -> String {
    if port == 22 {
        host.to_string()
    } else {
        format!("[{host}]:{port}")
    }
}

fn split_key(key: &str) -> Option<(&str, &str)> {
    let mut fields = key.split_whitespace();
    Some((fields.next()?, fields.next()?))
}

fn parse_line(line: &str) -> Option<(&str, &str, &str)> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') || line.starts_with('|') || line.starts_with('@') {
        return None;
    }
    let mut fields = line.split_whitespace();
    Some((fields.next()?, fields.next()?, fields.next()?))
}
