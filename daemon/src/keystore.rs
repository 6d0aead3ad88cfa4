//! Per-domain key storage under `remote.d/`.
//!
//! One file per authorised domain, `<domain>.key`, 64 hex chars, mode
//! 0600 inside a 0700 directory. The store is stateless: every operation
//! goes to disk, so workers can read concurrently without coordination.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use qvm_remote_common::auth::KeyError;
use qvm_remote_common::AuthKey;

use crate::config::valid_domain;

#[derive(Debug, Error)]
pub enum KeyStoreError {
    #[error("invalid domain name {0:?}")]
    InvalidDomain(String),

    #[error("no key on file for domain '{0}'")]
    Missing(String),

    #[error("a key for domain '{0}' already exists; pass --replace to rotate it")]
    Exists(String),

    #[error("key file for domain '{domain}' is malformed: {source}")]
    Malformed {
        domain: String,
        source: KeyError,
    },

    #[error("{}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: io::Error,
    },
}

pub struct KeyStore {
    dir: PathBuf,
}

impl KeyStore {
    /// Open the store, creating the directory (mode 0700) when absent.
    ///
    /// # Errors
    ///
    /// Returns an error when the directory cannot be created or chmodded.
    pub fn open(dir: &Path) -> Result<Self, KeyStoreError> {
        std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
        set_mode(dir, 0o700).map_err(|e| io_err(dir, e))?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn key_path(&self, domain: &str) -> Result<PathBuf, KeyStoreError> {
        if !valid_domain(domain) {
            return Err(KeyStoreError::InvalidDomain(domain.to_string()));
        }
        Ok(self.dir.join(format!("{domain}.key")))
    }

    /// Read a domain's key. `Ok(None)` when no key is on file; a present
    /// but malformed file is an error, not an absent key.
    ///
    /// # Errors
    ///
    /// `InvalidDomain`, `Malformed`, or I/O.
    pub fn load(&self, domain: &str) -> Result<Option<AuthKey>, KeyStoreError> {
        let path = self.key_path(domain)?;
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_err(&path, e)),
        };
        AuthKey::from_hex(text.trim())
            .map(Some)
            .map_err(|source| KeyStoreError::Malformed {
                domain: domain.to_string(),
                source,
            })
    }

    /// Install a key, mode 0600. Refuses to overwrite unless `replace`.
    ///
    /// # Errors
    ///
    /// `Exists` without `replace`, `InvalidDomain`, or I/O.
    pub fn install(
        &self,
        domain: &str,
        key: &AuthKey,
        replace: bool,
    ) -> Result<(), KeyStoreError> {
        let path = self.key_path(domain)?;
        if path.exists() && !replace {
            return Err(KeyStoreError::Exists(domain.to_string()));
        }
        std::fs::write(&path, format!("{}\n", key.to_hex())).map_err(|e| io_err(&path, e))?;
        set_mode(&path, 0o600).map_err(|e| io_err(&path, e))?;
        Ok(())
    }

    /// Remove a domain's key.
    ///
    /// # Errors
    ///
    /// `Missing` when there is nothing to revoke.
    pub fn remove(&self, domain: &str) -> Result<(), KeyStoreError> {
        let path = self.key_path(domain)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(KeyStoreError::Missing(domain.to_string()))
            }
            Err(e) => Err(io_err(&path, e)),
        }
    }

    /// Enumerate `(domain, fingerprint)` pairs, sorted by domain.
    /// Malformed key files are listed with a placeholder fingerprint so
    /// the operator can spot them.
    ///
    /// # Errors
    ///
    /// Returns an error when the directory cannot be listed.
    pub fn list(&self) -> Result<Vec<(String, String)>, KeyStoreError> {
        let mut entries = Vec::new();
        let iter = std::fs::read_dir(&self.dir).map_err(|e| io_err(&self.dir, e))?;
        for entry in iter {
            let entry = entry.map_err(|e| io_err(&self.dir, e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(domain) = name.strip_suffix(".key") else {
                continue;
            };
            if !valid_domain(domain) {
                continue;
            }
            let fingerprint = match self.load(domain) {
                Ok(Some(key)) => key.fingerprint(),
                _ => "(malformed)".to_string(),
            };
            entries.push((domain.to_string(), fingerprint));
        }
        entries.sort();
        Ok(entries)
    }
}

fn io_err(path: &Path, source: io::Error) -> KeyStoreError {
    KeyStoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn set_mode(path: &Path, _mode: u32) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(_mode))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, KeyStore) {
        let dir = TempDir::new().expect("tempdir");
        let store = KeyStore::open(&dir.path().join("remote.d")).expect("open");
        (dir, store)
    }

    #[test]
    fn test_install_load_round_trip() {
        let (_dir, store) = store();
        let key = AuthKey::generate();
        store.install("work", &key, false).expect("install");
        let loaded = store.load("work").expect("load").expect("present");
        assert_eq!(loaded.to_hex(), key.to_hex());
    }

    #[test]
    fn test_load_absent_is_none() {
        let (_dir, store) = store();
        assert!(store.load("work").expect("load").is_none());
    }

    #[test]
    fn test_install_refuses_overwrite_without_replace() {
        let (_dir, store) = store();
        let first = AuthKey::generate();
        store.install("work", &first, false).expect("install");

        let second = AuthKey::generate();
        assert!(matches!(
            store.install("work", &second, false),
            Err(KeyStoreError::Exists(_))
        ));

        store.install("work", &second, true).expect("rotate");
        let loaded = store.load("work").expect("load").expect("present");
        assert_eq!(loaded.to_hex(), second.to_hex());
    }

    #[test]
    fn test_remove_then_load_is_none() {
        let (_dir, store) = store();
        store.install("work", &AuthKey::generate(), false).expect("install");
        store.remove("work").expect("remove");
        assert!(store.load("work").expect("load").is_none());
        assert!(matches!(
            store.remove("work"),
            Err(KeyStoreError::Missing(_))
        ));
    }

    #[test]
    fn test_list_shows_fingerprints_not_keys() {
        let (_dir, store) = store();
        let key = AuthKey::generate();
        store.install("work", &key, false).expect("install");
        store.install("personal", &AuthKey::generate(), false).expect("install");

        let listed = store.list().expect("list");
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].0, "personal");
        assert_eq!(listed[1].0, "work");
        assert_eq!(listed[1].1, key.fingerprint());
        assert_ne!(listed[1].1, &key.to_hex()[..16], "fingerprint must not be key material");
    }

    #[test]
    fn test_rejects_traversal_domain_names() {
        let (_dir, store) = store();
        assert!(matches!(
            store.load("../escape"),
            Err(KeyStoreError::InvalidDomain(_))
        ));
        assert!(matches!(
            store.install("a/b", &AuthKey::generate(), false),
            Err(KeyStoreError::InvalidDomain(_))
        ));
    }

    #[test]
    fn test_malformed_key_file_is_an_error() {
        let (_dir, store) = store();
        std::fs::write(store.dir().join("work.key"), "nonsense\n").expect("write");
        assert!(matches!(
            store.load("work"),
            Err(KeyStoreError::Malformed { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_modes_are_0700_and_0600() {
        use std::os::unix::fs::PermissionsExt;
        let (_dir, store) = store();
        store.install("work", &AuthKey::generate(), false).expect("install");

        let dir_mode = std::fs::metadata(store.dir()).expect("metadata").permissions().mode();
        assert_eq!(dir_mode & 0o777, 0o700);
        let key_mode = std::fs::metadata(store.dir().join("work.key"))
            .expect("metadata")
            .permissions()
            .mode();
        assert_eq!(key_mode & 0o777, 0o600);
    }
}
