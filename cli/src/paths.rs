//! Guest-side directory layout under `~/.qvm-remote`.

use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use qvm_remote_common::{AuthKey, RemoteError};

/// Name of the current data directory under `$HOME`.
pub const DATA_DIR: &str = ".qvm-remote";

/// Data directory used by pre-rename releases; migrated on sight.
pub const LEGACY_DATA_DIR: &str = ".qubes-remote";

/// Resolved paths of one guest's qvm-remote state.
#[derive(Debug, Clone)]
pub struct GuestDirs {
    pub root: PathBuf,
    pub key_file: PathBuf,
    pub audit_log: PathBuf,
    pub pending: PathBuf,
    pub running: PathBuf,
    pub results: PathBuf,
    pub history: PathBuf,
}

impl GuestDirs {
    /// Layout rooted at the real home directory, with legacy migration and
    /// directory creation applied.
    ///
    /// # Errors
    ///
    /// Fails when the home directory cannot be determined, when both the
    /// legacy and current data directories exist, or on I/O errors.
    pub fn resolve() -> Result<Self> {
        let home = dirs::home_dir()
            .ok_or_else(|| anyhow::anyhow!("cannot determine home directory"))?;
        migrate_legacy(&home)?;
        let dirs = Self::under(&home);
        dirs.ensure()?;
        Ok(dirs)
    }

    /// Layout rooted at an explicit home (used in tests).
    #[must_use]
    pub fn under(home: &Path) -> Self {
        let root = home.join(DATA_DIR);
        let queue = root.join("queue");
        Self {
            key_file: root.join("auth.key"),
            audit_log: root.join("audit.log"),
            pending: queue.join("pending"),
            running: queue.join("running"),
            results: queue.join("results"),
            history: root.join("history"),
            root,
        }
    }

    /// Create the directory tree, mode 0700 throughout.
    ///
    /// # Errors
    ///
    /// Returns an error if a directory cannot be created or chmodded.
    pub fn ensure(&self) -> Result<()> {
        for dir in [
            &self.root,
            &self.pending,
            &self.running,
            &self.results,
            &self.history,
        ] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating directory {}", dir.display()))?;
            set_mode(dir, 0o700)
                .with_context(|| format!("setting permissions on {}", dir.display()))?;
        }
        Ok(())
    }

    /// Read and parse the stored key.
    ///
    /// # Errors
    ///
    /// `RemoteError::NoKey` when the file is absent or holds anything other
    /// than 64 lowercase hex characters.
    pub fn load_key(&self) -> Result<AuthKey> {
        let text = match std::fs::read_to_string(&self.key_file) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(RemoteError::NoKey.into());
            }
            Err(e) => {
                return Err(anyhow::Error::new(RemoteError::Io(e))
                    .context(format!("reading {}", self.key_file.display())));
            }
        };
        AuthKey::from_hex(text.trim()).map_err(|_| RemoteError::NoKey.into())
    }

    /// Write the key file with mode 0600.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or chmodded.
    pub fn store_key(&self, key: &AuthKey) -> Result<()> {
        write_private(&self.key_file, format!("{}\n", key.to_hex()).as_bytes())
    }
}

/// Rename the legacy data directory into place. Never merges: if both
/// layouts exist the user must pick one, so fail loudly.
fn migrate_legacy(home: &Path) -> Result<()> {
    let legacy = home.join(LEGACY_DATA_DIR);
    let current = home.join(DATA_DIR);
    if !legacy.exists() {
        return Ok(());
    }
    if current.exists() {
        return Err(RemoteError::Io(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!(
                "both {} and {} exist; refusing to merge, remove one",
                legacy.display(),
                current.display()
            ),
        ))
        .into());
    }
    std::fs::rename(&legacy, &current)
        .with_context(|| format!("migrating {} to {}", legacy.display(), current.display()))
}

/// Write a file and force its mode to 0600.
pub fn write_private(path: &Path, bytes: &[u8]) -> Result<()> {
    std::fs::write(path, bytes).with_context(|| format!("writing {}", path.display()))?;
    set_mode(path, 0o600).with_context(|| format!("setting permissions on {}", path.display()))
}

fn set_mode(path: &Path, _mode: u32) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(_mode))?;
    }
    Ok(())
}
