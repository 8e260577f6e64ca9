//! Saved connection profiles in `connections.json`.
//!
//! Profiles are keyed `hostname@username`. Secrets are never written here.

use collections::BTreeMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum ProfileError {
    #[error("Cannot access {}: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },
    #[error("Corrupt connections file {}: {source}", path.display())]
    Corrupt {
        path: PathBuf,
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionProfile {
    pub name: String,
    pub hostname: String,
    pub port: u16,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_path: Option<String>,
}

impl ConnectionProfile {
    /// A profile named `username@hostname` unless `name` is given.
    pub fn new(
        name: Option<String>,
        hostname: &str,
        port: u16,
        username: &str,
        key_path: Option<String>,
    ) -> Self {
        Self {
            name: name
                .filter(|name| !name.trim().is_empty())
                .unwrap_or_else(|| format!("{username}@{hostname}")),
            hostname: hostname.to_string(),
            port,
            username: username.to_string(),
            key_path,
        }
    }

    pub fn key(&self) -> String {
        format!("{}@{}", self.hostname, self.username)
    }
}

/// A profile as listed to the UI, with its key alongside.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SavedConnection {
    pub key: String,
    #[serde(flatten)]
    pub profile: ConnectionProfile,
}

type Profiles = BTreeMap<String, ConnectionProfile>;

pub struct ProfileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl ProfileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Store at [`skiff_paths::connections_file`].
    pub fn open_default() -> Self {
        Self::new(skiff_paths::connections_file())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All profiles sorted by key. An unreadable file lists as empty.
    pub fn list(&self) -> Vec<SavedConnection> {
        let _guard = self.lock.lock();
        match self.load() {
            Ok(profiles) => profiles
                .into_iter()
                .map(|(key, profile)| SavedConnection { key, profile })
                .collect(),
            Err(error) => {
                tracing::warn!(%error, "Ignoring saved connections");
                Vec::new()
            }
        }
    }

    /// Insert or replace a profile; returns its key.
    pub fn save(&self, profile: ConnectionProfile) -> Result<String, ProfileError> {
        let _guard = self.lock.lock();
        let mut profiles = self.load()?;
        let key = profile.key();
        profiles.insert(key.clone(), profile);
        self.store(&profiles)?;
        tracing::info!(key = %key, "Saved connection profile");
        Ok(key)
    }

    /// `false` if no profile had that key.
    pub fn delete(&self, key: &str) -> Result<bool, ProfileError> {
        let _guard = self.lock.lock();
        let mut profiles = self.load()?;
        if profiles.remove(key).is_none() {
            return Ok(false);
        }
        self.store(&profiles)?;
        tracing::info!(key, "Deleted connection profile");
        Ok(true)
    }

    fn load(&self) -> Result<Profiles, ProfileError> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(Profiles::new()),
            Err(source) => {
                return Err(ProfileError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        if text.trim().is_empty() {
            return Ok(Profiles::new());
        }
        serde_json::from_str(&text).map_err(|source| ProfileError::Corrupt {
            path: self.path.clone(),
            source,
        })
    }

    /// Write through a temp file so a crash never leaves half a file.
    fn store(&self, profiles: &Profiles) -> Result<(), ProfileError> {
        let io_error = |source| ProfileError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(io_error)?;
        }
        let json = serde_json::to_string_pretty(profiles).map_err(|source| ProfileError::Corrupt {
            path: self.path.clone(),
            source,
        })?;
        let temp = self.path.with_extension("json.tmp");
        std::fs::write(&temp, json).map_err(io_error)?;
        restrict_permissions(&temp).map_err(io_error)?;
        std::fs::rename(&temp, &self.path).map_err(io_error)
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> io::Result<()> {
    Ok(())
}
