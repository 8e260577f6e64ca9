//! Centralized path management for skiff.
//!
//! All application directories are lazily initialized and cached.
//! Use `set_*` functions before first access to override for testing.

use std::path::PathBuf;
use std::sync::OnceLock;

static CONFIG_DIR: OnceLock<PathBuf> = OnceLock::new();
static DATA_DIR: OnceLock<PathBuf> = OnceLock::new();
static DOWNLOADS_DIR: OnceLock<PathBuf> = OnceLock::new();

/// ~/.config/skiff (or platform equivalent)
pub fn config_dir() -> &'static PathBuf {
    CONFIG_DIR.get_or_init(|| {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("skiff")
    })
}

/// ~/.local/share/skiff (or platform equivalent)
pub fn data_dir() -> &'static PathBuf {
    DATA_DIR.get_or_init(|| {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("skiff")
    })
}

/// Where downloads land when the caller gives no explicit local path.
///
/// The user's download folder when the platform has one, otherwise
/// `data_dir()/downloads`.
pub fn downloads_dir() -> &'static PathBuf {
    DOWNLOADS_DIR.get_or_init(|| {
        dirs::download_dir().unwrap_or_else(|| data_dir().join("downloads"))
    })
}

/// Override config dir (must be called before first access). For testing.
pub fn set_config_dir(path: PathBuf) {
    let _ = CONFIG_DIR.set(path);
}

/// Override downloads dir (must be called before first access). For testing.
pub fn set_downloads_dir(path: PathBuf) {
    let _ = DOWNLOADS_DIR.set(path);
}

/// Config file path: config_dir()/config.toml
pub fn config_file() -> PathBuf {
    config_dir().join("config.toml")
}

/// Trust-on-first-use host key store: config_dir()/known_hosts
pub fn known_hosts_file() -> PathBuf {
    config_dir().join("known_hosts")
}

/// Saved connection profiles: config_dir()/connections.json
pub fn connections_file() -> PathBuf {
    config_dir().join("connections.json")
}

/// Expand a leading `~` to the home directory. Other paths pass through.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(home) = dirs::home_dir() {
        if path == "~" {
            return home;
        }
        if let Some(rest) = path.strip_prefix("~/") {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
