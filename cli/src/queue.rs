//! Pending-queue writes and the poll-for-result loop.
//!
//! Write ordering is the protocol's readiness signal: the token file goes
//! to disk before the command body, so the daemon can never observe a body
//! whose `.auth` sibling is missing.

use std::io;
use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use qvm_remote_common::meta::ResultMeta;
use qvm_remote_common::{AuthKey, Cid, RemoteError};

use crate::paths::{write_private, GuestDirs};

/// Nominal poll interval while waiting for a result.
const POLL_TICK: Duration = Duration::from_millis(200);

/// One completed request as read back from the results directory.
#[derive(Debug)]
pub struct ResultBundle {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i32,
    pub meta: Option<ResultMeta>,
}

/// Queue a request: token first, body second, both mode 0600.
///
/// # Errors
///
/// Any failure is a `submit-failed`: a half-written pair (token without
/// body) is inert, the daemon will skip it.
pub fn enqueue(dirs: &GuestDirs, cid: &Cid, body: &[u8], key: &AuthKey) -> Result<()> {
    let tag = key.tag(cid);
    write_private(&dirs.pending.join(cid.auth_name()), tag.as_bytes())
        .map_err(|e| RemoteError::SubmitFailed(format!("{e:#}")))?;
    write_private(&dirs.pending.join(cid.as_str()), body)
        .map_err(|e| RemoteError::SubmitFailed(format!("{e:#}")))?;
    Ok(())
}

/// Poll the results directory until `<cid>.exit` appears or the deadline
/// passes. Returns `None` on deadline.
///
/// # Errors
///
/// Returns an error if a bundle appears but cannot be read.
pub async fn await_result(
    dirs: &GuestDirs,
    cid: &Cid,
    deadline: Duration,
) -> Result<Option<ResultBundle>> {
    let started = Instant::now();
    let exit_path = dirs.results.join(cid.exit_name());
    loop {
        if exit_path.exists() {
            return read_bundle(dirs, cid).map(Some);
        }
        let remaining = deadline.saturating_sub(started.elapsed());
        if remaining.is_zero() {
            return Ok(None);
        }
        tokio::time::sleep(POLL_TICK.min(remaining)).await;
    }
}

/// Read the four result files. The daemon writes `.exit` last, so by the
/// time the poll loop sees it the rest of the bundle is complete.
fn read_bundle(dirs: &GuestDirs, cid: &Cid) -> Result<ResultBundle> {
    let read = |name: String| -> Result<Vec<u8>> {
        let path = dirs.results.join(name);
        match std::fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(anyhow::Error::new(RemoteError::Io(e))
                .context(format!("reading {}", path.display()))),
        }
    };
    let exit_text = String::from_utf8_lossy(&read(cid.exit_name())?).trim().to_string();
    let exit_code = exit_text
        .parse()
        .with_context(|| format!("unparseable exit code {exit_text:?}"))?;
    let meta_bytes = read(cid.meta_name())?;
    let meta = ResultMeta::parse(&String::from_utf8_lossy(&meta_bytes)).ok();
    Ok(ResultBundle {
        stdout: read(cid.out_name())?,
        stderr: read(cid.err_name())?,
        exit_code,
        meta,
    })
}

/// Unlink the result bundle and any running tombstone once the caller has
/// consumed them; the daemon never re-reads its own results.
pub fn clear_results(dirs: &GuestDirs, cid: &Cid) -> Result<()> {
    for name in [cid.out_name(), cid.err_name(), cid.exit_name(), cid.meta_name()] {
        remove_if_present(&dirs.results.join(name))?;
    }
    remove_if_present(&dirs.running.join(cid.as_str()))
}

/// Best-effort removal of the pending pair after a local timeout; if the
/// daemon already claimed the request these files are gone.
pub fn abandon_pending(dirs: &GuestDirs, cid: &Cid) {
    let _ = std::fs::remove_file(dirs.pending.join(cid.as_str()));
    let _ = std::fs::remove_file(dirs.pending.join(cid.auth_name()));
}

/// Archive one transaction under `history/YYYY-MM-DD/`.
///
/// # Errors
///
/// Returns an error if the archive directory or files cannot be written.
pub fn archive(dirs: &GuestDirs, cid: &Cid, body: &[u8], bundle: &ResultBundle) -> Result<()> {
    let day = chrono::Local::now().format("%Y-%m-%d").to_string();
    let dir = dirs.history.join(day);
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("creating history directory {}", dir.display()))?;
    write_private(&dir.join(format!("{cid}.cmd")), body)?;
    write_private(&dir.join(cid.out_name()), &bundle.stdout)?;
    write_private(&dir.join(cid.err_name()), &bundle.stderr)?;
    write_private(
        &dir.join(cid.exit_name()),
        format!("{}\n", bundle.exit_code).as_bytes(),
    )?;
    if let Some(meta) = &bundle.meta {
        write_private(&dir.join(cid.meta_name()), meta.render().as_bytes())?;
    }
    Ok(())
}

fn remove_if_present(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(anyhow::Error::new(RemoteError::Io(e))
            .context(format!("removing {}", path.display()))),
    }
}
