//! TOML config file support.
//!
//! Config location: `~/.config/skiff/config.toml`

use crate::constants;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// User-facing config parsed from TOML.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    /// SSH port used when a connect request omits one.
    pub default_port: u16,
    /// Seconds allowed for connect, handshake and authentication.
    pub connect_timeout_secs: u64,
    /// Seconds between keepalives on an idle connection (0 disables).
    pub keepalive_interval_secs: u64,
    /// Terminal type sent with the pty request.
    pub terminal_type: String,
    /// Initial shell width in columns.
    pub terminal_cols: u16,
    /// Initial shell height in rows.
    pub terminal_rows: u16,
    /// Transfer chunk size in bytes.
    pub transfer_chunk_size: usize,
    /// Address local and dynamic forwards bind by default.
    pub forward_bind_address: String,
    /// Where downloads without an explicit local path are written.
    pub download_directory: Option<String>,
    /// tracing filter directive used when RUST_LOG is unset (e.g. "skiff=debug").
    pub log_level: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_port: constants::ssh::DEFAULT_PORT,
            connect_timeout_secs: constants::ssh::CONNECT_TIMEOUT.as_secs(),
            keepalive_interval_secs: constants::ssh::KEEPALIVE_INTERVAL.as_secs(),
            terminal_type: constants::terminal::TERM.to_string(),
            terminal_cols: constants::terminal::DEFAULT_COLS,
            terminal_rows: constants::terminal::DEFAULT_ROWS,
            transfer_chunk_size: constants::transfer::CHUNK_SIZE,
            forward_bind_address: constants::forward::DEFAULT_BIND_ADDRESS.to_string(),
            download_directory: None,
            log_level: None,
        }
    }
}

impl Config {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }

    /// `None` when keepalives are disabled.
    pub fn keepalive_interval(&self) -> Option<Duration> {
        (self.keepalive_interval_secs > 0).then(|| Duration::from_secs(self.keepalive_interval_secs))
    }

    /// Chunk size clamped to the supported range.
    pub fn chunk_size(&self) -> usize {
        self.transfer_chunk_size.clamp(
            constants::transfer::MIN_CHUNK_SIZE,
            constants::transfer::MAX_CHUNK_SIZE,
        )
    }

    /// Initial shell geometry as `(cols, rows)`, clamped to sane bounds.
    pub fn terminal_size(&self) -> (u16, u16) {
        let max = constants::terminal::MAX_DIMENSION;
        (
            self.terminal_cols.clamp(1, max),
            self.terminal_rows.clamp(1, max),
        )
    }

    /// Download directory with a leading `~` expanded.
    pub fn download_dir(&self) -> Option<PathBuf> {
        self.download_directory
            .as_deref()
            .map(skiff_paths::expand_home)
    }

    /// Replace out-of-range values with defaults, logging each one.
    fn sanitized(mut self) -> Self {
        let defaults = Config::default();
        let max_len = constants::settings::MAX_STRING_LENGTH;

        if self.default_port == 0 {
            tracing::warn!("default-port must be non-zero, using {}", defaults.default_port);
            self.default_port = defaults.default_port;
        }
        if self.terminal_type.is_empty() || self.terminal_type.len() > max_len {
            tracing::warn!("Ignoring invalid terminal-type");
            self.terminal_type = defaults.terminal_type;
        }
        if self.forward_bind_address.is_empty() || self.forward_bind_address.len() > max_len {
            tracing::warn!("Ignoring invalid forward-bind-address");
            self.forward_bind_address = defaults.forward_bind_address;
        }
        if self
            .download_directory
            .as_ref()
            .is_some_and(|dir| dir.is_empty() || dir.len() > max_len)
        {
            tracing::warn!("Ignoring invalid download-directory");
            self.download_directory = None;
        }
        if self
            .log_level
            .as_ref()
            .is_some_and(|level| level.len() > max_len)
        {
            tracing::warn!("Ignoring over-long log-level");
            self.log_level = None;
        }
        self
    }
}

/// Default config file content with comments (generated on first launch).
const DEFAULT_CONFIG: &str = r#"# skiff configuration
# Read once at startup; restart the engine to apply changes.

# SSH port used when a connection does not specify one
default-port = 22

# Seconds allowed for connecting, key exchange and authentication
connect-timeout-secs = 30

# Seconds between keepalives on an idle connection (0 disables)
keepalive-interval-secs = 30

# Terminal type and initial size of interactive shells
terminal-type = "xterm-256color"
terminal-cols = 80
terminal-rows = 24

# Bytes per read/write when transferring files (4096 - 1048576)
transfer-chunk-size = 32768

# Address that local and SOCKS forwards listen on
# Use "0.0.0.0" to expose forwards to other machines on your network
forward-bind-address = "127.0.0.1"

# Where downloads go when no local path is given (defaults to your Downloads folder)
# download-directory = "~/Downloads"

# Log filter used when RUST_LOG is unset
# log-level = "skiff=debug,info"
"#;

/// Return the config file path.
pub fn config_path() -> PathBuf {
    skiff_paths::config_file()
}

/// Ensure the config file exists, creating a default if missing.
/// Returns the path to the config file.
pub fn ensure_config_file() -> Option<PathBuf> {
    let path = config_path();
    if !path.exists() {
        let parent = path.parent()?;
        std::fs::create_dir_all(parent).ok()?;
        std::fs::write(&path, DEFAULT_CONFIG).ok()?;
        tracing::info!("Created default config at {:?}", path);
    }
    Some(path)
}

/// Load and parse the config file. Returns default on any error.
pub fn load_config() -> Config {
    load_config_from(&config_path())
}

/// Load and parse a config file at an explicit path. Returns default on any error.
pub fn load_config_from(path: &Path) -> Config {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("Failed to read config: {}", e);
            }
            return Config::default();
        }
    };

    // Size guard
    if content.len() > constants::settings::MAX_FILE_SIZE as usize {
        tracing::warn!(
            "Config file too large ({} bytes), using defaults",
            content.len()
        );
        return Config::default();
    }

    match toml::from_str::<Config>(&content) {
        Ok(cfg) => cfg.sanitized(),
        Err(e) => {
            tracing::warn!("Failed to parse config.toml: {}", e);
            Config::default()
        }
    }
}
