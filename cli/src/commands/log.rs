//! `qvm-remote log` — print the tail of the guest audit log.

use anyhow::{Context, Result};

use qvm_remote_common::audit::AuditLog;

use crate::paths::GuestDirs;

pub fn run(dirs: &GuestDirs, lines: usize) -> Result<u8> {
    let tail = AuditLog::tail(&dirs.audit_log, lines)
        .with_context(|| format!("reading {}", dirs.audit_log.display()))?;
    for line in tail {
        println!("{line}");
    }
    Ok(0)
}
