//! Administrative key operations: `authorize`, `revoke`, `keys`.

use anyhow::{Context, Result};
use serde::Serialize;

use qvm_remote_common::AuthKey;

use crate::config;
use crate::keystore::KeyStore;

#[derive(Serialize)]
struct KeyEntry {
    domain: String,
    fingerprint: String,
}

pub fn authorize(domain: &str, hex: &str, replace: bool) -> Result<()> {
    let key = AuthKey::from_hex(hex.trim())
        .context("key must be 64 lowercase hex characters")?;
    let store = open_store()?;
    store.install(domain, &key, replace)?;
    println!("authorized {domain} ({})", key.fingerprint());
    Ok(())
}

pub fn revoke(domain: &str) -> Result<()> {
    let store = open_store()?;
    store.remove(domain)?;
    println!("revoked {domain}");
    Ok(())
}

pub fn keys(json: bool) -> Result<()> {
    let entries = open_store()?.list()?;
    if json {
        let entries: Vec<KeyEntry> = entries
            .into_iter()
            .map(|(domain, fingerprint)| KeyEntry {
                domain,
                fingerprint,
            })
            .collect();
        println!(
            "{}",
            serde_json::to_string(&entries).context("serialising key listing")?
        );
    } else if entries.is_empty() {
        println!("no authorised domains");
    } else {
        for (domain, fingerprint) in entries {
            println!("{domain}  {fingerprint}");
        }
    }
    Ok(())
}

fn open_store() -> Result<KeyStore> {
    let dir = config::key_dir(&config::conf_path());
    KeyStore::open(&dir).with_context(|| format!("opening key directory {}", dir.display()))
}
