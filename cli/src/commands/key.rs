//! `qvm-remote key` — manage the shared authentication key.

use anyhow::Result;

use qvm_remote_common::{AuthKey, RemoteError};

use crate::cli::KeyCmd;
use crate::paths::GuestDirs;

pub fn run(dirs: &GuestDirs, cmd: KeyCmd) -> Result<u8> {
    match cmd {
        KeyCmd::Gen { replace } => {
            if dirs.key_file.exists() && !replace {
                anyhow::bail!(
                    "a key already exists at {}; pass --replace to overwrite it",
                    dirs.key_file.display()
                );
            }
            let key = AuthKey::generate();
            dirs.store_key(&key)?;
            println!("{}", key.to_hex());
            Ok(0)
        }
        KeyCmd::Show => {
            println!("{}", dirs.load_key()?.to_hex());
            Ok(0)
        }
        KeyCmd::Import { hex, replace } => {
            let key = AuthKey::from_hex(hex.trim()).map_err(RemoteError::from)?;
            if dirs.key_file.exists() {
                let same = dirs
                    .load_key()
                    .map(|existing| existing.to_hex() == key.to_hex())
                    .unwrap_or(false);
                if same {
                    return Ok(0);
                }
                if !replace {
                    anyhow::bail!(
                        "a different key already exists at {}; pass --replace to overwrite it",
                        dirs.key_file.display()
                    );
                }
            }
            dirs.store_key(&key)?;
            Ok(0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, GuestDirs) {
        let home = TempDir::new().expect("tempdir");
        let dirs = GuestDirs::under(home.path());
        dirs.ensure().expect("ensure");
        (home, dirs)
    }

    #[test]
    fn test_gen_refuses_overwrite_without_replace() {
        let (_home, dirs) = setup();
        run(&dirs, KeyCmd::Gen { replace: false }).expect("first gen");
        let before = dirs.load_key().expect("key").to_hex();

        assert!(run(&dirs, KeyCmd::Gen { replace: false }).is_err());
        assert_eq!(dirs.load_key().expect("key").to_hex(), before);

        run(&dirs, KeyCmd::Gen { replace: true }).expect("replace gen");
        assert_ne!(dirs.load_key().expect("key").to_hex(), before);
    }

    #[test]
    fn test_import_same_key_is_noop() {
        let (_home, dirs) = setup();
        let hex = "ab".repeat(32);
        run(
            &dirs,
            KeyCmd::Import {
                hex: hex.clone(),
                replace: false,
            },
        )
        .expect("import");
        // Importing the identical key again succeeds without --replace.
        run(
            &dirs,
            KeyCmd::Import {
                hex: hex.clone(),
                replace: false,
            },
        )
        .expect("re-import");
        assert_eq!(dirs.load_key().expect("key").to_hex(), hex);
    }

    #[test]
    fn test_import_different_key_needs_replace() {
        let (_home, dirs) = setup();
        run(
            &dirs,
            KeyCmd::Import {
                hex: "ab".repeat(32),
                replace: false,
            },
        )
        .expect("import");
        let different = "cd".repeat(32);
        assert!(run(
            &dirs,
            KeyCmd::Import {
                hex: different.clone(),
                replace: false
            }
        )
        .is_err());
        run(
            &dirs,
            KeyCmd::Import {
                hex: different.clone(),
                replace: true,
            },
        )
        .expect("replace import");
        assert_eq!(dirs.load_key().expect("key").to_hex(), different);
    }

    #[test]
    fn test_import_rejects_malformed_hex() {
        let (_home, dirs) = setup();
        let err = run(
            &dirs,
            KeyCmd::Import {
                hex: "bad".into(),
                replace: false,
            },
        )
        .expect_err("must reject");
        assert_eq!(crate::failure_code(&err), 2);
    }
}
