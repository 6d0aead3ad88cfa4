//! Daemon configuration: `/etc/qubes/remote.conf`, `KEY=VALUE` lines.
//!
//! The recognised keys form a closed set; anything else earns a warning
//! and is ignored so future options can ship without breaking old
//! daemons.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};

/// Default configuration file location.
pub const DEFAULT_CONF_PATH: &str = "/etc/qubes/remote.conf";

/// Environment override for the config path. A packaging/test hook only —
/// protocol behaviour is controlled solely by the file's contents.
pub const CONF_ENV: &str = "QVM_REMOTE_CONF";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Authorised guest domains (`QVM_REMOTE_VMS`).
    pub vms: Vec<String>,
    /// Pause between poll passes (`QVM_REMOTE_POLL_INTERVAL`).
    pub poll_interval: Duration,
    /// Per-request execution timeout (`QVM_REMOTE_EXEC_TIMEOUT`).
    pub exec_timeout: Duration,
    /// Command body cap (`QVM_REMOTE_MAX_CMD_BYTES`).
    pub max_cmd_bytes: usize,
    /// Per-stream capture cap (`QVM_REMOTE_MAX_OUT_BYTES`).
    pub max_out_bytes: usize,
    /// Guest account commands are fetched from (`QVM_REMOTE_VM_USER`).
    pub vm_user: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            vms: Vec::new(),
            poll_interval: Duration::from_secs(1),
            exec_timeout: Duration::from_secs(300),
            max_cmd_bytes: 1_048_576,
            max_out_bytes: 10_485_760,
            vm_user: "user".to_string(),
        }
    }
}

impl Config {
    /// Parse the `KEY=VALUE` format. Unrecognised keys and unparseable
    /// values are warned about and skipped, never fatal.
    pub fn parse(text: &str) -> Self {
        let mut config = Self::default();
        for raw in text.lines() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                tracing::warn!(line, "ignoring configuration line without '='");
                continue;
            };
            let (key, value) = (key.trim(), value.trim());
            match key {
                "QVM_REMOTE_VMS" => {
                    config.vms = value.split_whitespace().map(String::from).collect();
                }
                "QVM_REMOTE_POLL_INTERVAL" => {
                    parse_into(key, value, &mut config.poll_interval, |n| {
                        Duration::from_secs(n)
                    });
                }
                "QVM_REMOTE_EXEC_TIMEOUT" => {
                    parse_into(key, value, &mut config.exec_timeout, |n| {
                        Duration::from_secs(n)
                    });
                }
                "QVM_REMOTE_MAX_CMD_BYTES" => {
                    parse_into(key, value, &mut config.max_cmd_bytes, |n| n as usize);
                }
                "QVM_REMOTE_MAX_OUT_BYTES" => {
                    parse_into(key, value, &mut config.max_out_bytes, |n| n as usize);
                }
                "QVM_REMOTE_VM_USER" => {
                    config.vm_user = value.to_string();
                }
                _ => tracing::warn!(key, "ignoring unknown configuration key"),
            }
        }
        config
    }

    /// Load the file at `path`; an absent file is the default config.
    ///
    /// # Errors
    ///
    /// Returns an error when the file exists but cannot be read.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Ok(Self::parse(&text))
    }
}

fn parse_into<T>(key: &str, value: &str, slot: &mut T, make: impl Fn(u64) -> T) {
    match value.parse::<u64>() {
        Ok(n) if n > 0 => *slot = make(n),
        _ => tracing::warn!(key, value, "ignoring unparseable configuration value"),
    }
}

/// Resolve the configuration path: env override, else the system default.
pub fn conf_path() -> PathBuf {
    std::env::var(CONF_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONF_PATH))
}

/// Key directory lives next to the config file.
pub fn key_dir(conf: &Path) -> PathBuf {
    conf.with_file_name("remote.d")
}

/// Domain names are used as filenames and qvm-run arguments; only the
/// shape Qubes itself allows is let through.
pub fn valid_domain(name: &str) -> bool {
    let mut bytes = name.bytes();
    match bytes.next() {
        Some(b) if b.is_ascii_alphanumeric() => {}
        _ => return false,
    }
    name.len() <= 31 && bytes.all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// Config file handle that re-reads on mtime changes.
pub struct ConfigWatcher {
    path: PathBuf,
    mtime: Option<SystemTime>,
    config: Config,
}

impl ConfigWatcher {
    /// # Errors
    ///
    /// Fails when an existing config file cannot be read (fatal at
    /// startup; the daemon must not silently run with an empty set).
    pub fn new(path: &Path) -> Result<Self> {
        let config = Config::load(path)?;
        Ok(Self {
            mtime: mtime_of(path),
            path: path.to_path_buf(),
            config,
        })
    }

    pub fn current(&self) -> &Config {
        &self.config
    }

    /// Reload when the file's mtime moved. Read failures keep the last
    /// good config and are reported to the caller.
    pub fn reload_if_changed(&mut self) -> Result<bool> {
        let now = mtime_of(&self.path);
        if now == self.mtime {
            return Ok(false);
        }
        self.config = Config::load(&self.path)?;
        self.mtime = now;
        tracing::info!(path = %self.path.display(), "configuration reloaded");
        Ok(true)
    }
}

fn mtime_of(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}
