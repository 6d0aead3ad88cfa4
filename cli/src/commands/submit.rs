//! Submission: queue a command, await the result, replay it byte-exact.

use std::io::{Read, Write};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use qvm_remote_common::audit::{AuditEvent, AuditLog};
use qvm_remote_common::validate::{validate_command, DEFAULT_MAX_CMD_BYTES};
use qvm_remote_common::{Cid, RemoteError};

use crate::paths::GuestDirs;
use crate::queue::{self, ResultBundle};

/// One completed round trip through the queue.
pub struct Transaction {
    pub bundle: ResultBundle,
    pub elapsed_ms: u64,
}

/// Submit a command from argv (joined by spaces) or stdin, replay the
/// remote stdout/stderr verbatim, and exit with the remote code.
///
/// # Errors
///
/// `invalid-input`, `no-key`, `submit-failed`, `timeout` or `ioerror`, each
/// mapped to its own exit code by `main`.
pub async fn run(dirs: &GuestDirs, args: &[String], timeout_secs: u64) -> Result<u8> {
    let body = if args.is_empty() {
        let mut buf = Vec::new();
        std::io::stdin()
            .read_to_end(&mut buf)
            .context("reading command from stdin")?;
        buf
    } else {
        args.join(" ").into_bytes()
    };

    if let Err(e) = validate_command(&body, DEFAULT_MAX_CMD_BYTES) {
        if let Ok(audit) = AuditLog::open(&dirs.audit_log) {
            let _ = audit.append(&AuditEvent::Error {
                cid: None,
                domain: None,
                reason: format!("rejected submission: {e}"),
            });
        }
        return Err(RemoteError::from(e).into());
    }

    let tx = round_trip(dirs, &body, timeout_secs).await?;

    let mut stdout = std::io::stdout();
    stdout.write_all(&tx.bundle.stdout).context("writing stdout")?;
    stdout.flush().context("flushing stdout")?;
    let mut stderr = std::io::stderr();
    stderr.write_all(&tx.bundle.stderr).context("writing stderr")?;
    stderr.flush().context("flushing stderr")?;

    Ok(tx.bundle.exit_code.clamp(0, 255) as u8)
}

/// Queue `body`, poll until the result bundle lands or the deadline
/// passes, then archive and clean up. Shared by submission and `ping`.
///
/// # Errors
///
/// `RemoteError::Timeout` on deadline; otherwise queue or audit I/O.
pub async fn round_trip(dirs: &GuestDirs, body: &[u8], timeout_secs: u64) -> Result<Transaction> {
    let key = dirs.load_key()?;
    let audit = AuditLog::open(&dirs.audit_log)
        .with_context(|| format!("opening {}", dirs.audit_log.display()))?;

    let cid = Cid::generate();
    let started = Instant::now();
    queue::enqueue(dirs, &cid, body, &key)?;
    audit
        .append(&AuditEvent::Submit {
            cid: cid.clone(),
            bytes_in: body.len(),
        })
        .context("appending to audit log")?;

    match queue::await_result(dirs, &cid, Duration::from_secs(timeout_secs)).await? {
        Some(bundle) => {
            queue::archive(dirs, &cid, body, &bundle)?;
            queue::clear_results(dirs, &cid)?;
            let elapsed_ms = started.elapsed().as_millis() as u64;
            let duration_ms = bundle
                .meta
                .as_ref()
                .map_or(elapsed_ms, |meta| meta.duration_ms);
            audit
                .append(&AuditEvent::Result {
                    cid,
                    exit_code: bundle.exit_code,
                    duration_ms,
                })
                .context("appending to audit log")?;
            Ok(Transaction { bundle, elapsed_ms })
        }
        None => {
            queue::abandon_pending(dirs, &cid);
            let _ = audit.append(&AuditEvent::Error {
                cid: Some(cid),
                domain: None,
                reason: format!("no result after {timeout_secs}s"),
            });
            Err(RemoteError::Timeout(timeout_secs).into())
        }
    }
}
