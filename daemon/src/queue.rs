//! Remote queue operations against a guest's `~/.qvm-remote`, via
//! [`GuestExec`].
//!
//! Everything here is the dom0 half of the queue contract: the guest is
//! the only writer of `pending/`, dom0 is the only unlinker of `pending/`
//! after authentication and the only writer of `results/`.

use std::process::Output;
use std::time::Duration;

use anyhow::Result;

use qvm_remote_common::meta::ResultMeta;
use qvm_remote_common::Cid;

use crate::qvm::{GuestExec, FETCH_TIMEOUT, LIST_TIMEOUT, WRITE_TIMEOUT};
use crate::sandbox::ExecOutcome;

const PENDING: &str = "$HOME/.qvm-remote/queue/pending";
const RUNNING: &str = "$HOME/.qvm-remote/queue/running";
const RESULTS: &str = "$HOME/.qvm-remote/queue/results";

/// List the pending directory and return validated cids, sorted. Names
/// ending in `.auth` are token siblings; anything else that fails cid
/// validation is hostile or junk and is skipped with a warning.
///
/// # Errors
///
/// Returns an error when the listing itself fails (domain unreachable).
pub async fn list_pending(exec: &impl GuestExec, domain: &str) -> Result<Vec<Cid>> {
    let script = format!("ls -1 -- \"{PENDING}\" 2>/dev/null || true");
    let output = exec.run(domain, &script, LIST_TIMEOUT).await?;
    let output = ensure_success(domain, "list pending queue", output)?;

    let mut cids = Vec::new();
    for name in String::from_utf8_lossy(&output.stdout).lines() {
        let name = name.trim();
        if name.is_empty() || name.ends_with(".auth") {
            continue;
        }
        match Cid::parse(name) {
            Ok(cid) => cids.push(cid),
            Err(_) => {
                tracing::warn!(domain, name, "ignoring malformed pending entry");
            }
        }
    }
    cids.sort();
    Ok(cids)
}

/// Fetch a request's token file. `None` when the sibling is not there
/// yet — the pair is treated as not-yet-ready and left alone.
///
/// # Errors
///
/// Returns an error if the fetch cannot be spawned or times out.
pub async fn fetch_token(
    exec: &impl GuestExec,
    domain: &str,
    cid: &Cid,
) -> Result<Option<String>> {
    let script = format!("cat -- \"{PENDING}/{}\"", cid.auth_name());
    let output = exec.run(domain, &script, FETCH_TIMEOUT).await?;
    if !output.status.success() {
        return Ok(None);
    }
    Ok(Some(
        String::from_utf8_lossy(&output.stdout).trim().to_string(),
    ))
}

/// Fetch a request's body, reading at most `cap + 1` bytes so an
/// oversized body is detected without hauling the whole thing across.
/// `None` when the body vanished between listing and fetch.
///
/// # Errors
///
/// Returns an error if the fetch cannot be spawned or times out.
pub async fn fetch_body(
    exec: &impl GuestExec,
    domain: &str,
    cid: &Cid,
    cap: usize,
) -> Result<Option<Vec<u8>>> {
    let script = format!("head -c {} \"{PENDING}/{cid}\"", cap + 1);
    let output = exec.run(domain, &script, FETCH_TIMEOUT).await?;
    if !output.status.success() {
        return Ok(None);
    }
    Ok(Some(output.stdout))
}

/// Unlink a request's pending pair.
///
/// # Errors
///
/// Returns an error when the unlink fails; callers treat that as a
/// per-request failure, not a daemon failure.
pub async fn remove_pending(exec: &impl GuestExec, domain: &str, cid: &Cid) -> Result<()> {
    let script = format!(
        "rm -f -- \"{PENDING}/{cid}\" \"{PENDING}/{}\"",
        cid.auth_name()
    );
    let output = exec.run(domain, &script, FETCH_TIMEOUT).await?;
    ensure_success(domain, "remove pending pair", output).map(|_| ())
}

/// Drop a tombstone in `running/`, guarding against duplicate execution
/// within one pass.
///
/// # Errors
///
/// Returns an error when the write fails; the tombstone is advisory so
/// callers may downgrade this to a log line.
pub async fn mark_running(exec: &impl GuestExec, domain: &str, cid: &Cid) -> Result<()> {
    let script = format!("umask 077; mkdir -p \"{RUNNING}\"; : > \"{RUNNING}/{cid}\"");
    let output = exec.run(domain, &script, FETCH_TIMEOUT).await?;
    ensure_success(domain, "mark running", output).map(|_| ())
}

/// Remove the running tombstone.
///
/// # Errors
///
/// Returns an error when the unlink fails.
pub async fn clear_running(exec: &impl GuestExec, domain: &str, cid: &Cid) -> Result<()> {
    let script = format!("rm -f -- \"{RUNNING}/{cid}\"");
    let output = exec.run(domain, &script, FETCH_TIMEOUT).await?;
    ensure_success(domain, "clear running", output).map(|_| ())
}

/// Write the result bundle. `.out`, `.err` and `.meta` land first;
/// `.exit` goes last because its presence is what the submitter polls on.
///
/// # Errors
///
/// Returns an error when any write fails; the bundle is then incomplete
/// but, lacking `.exit`, invisible to the submitter.
pub async fn write_results(
    exec: &impl GuestExec,
    domain: &str,
    cid: &Cid,
    outcome: &ExecOutcome,
    meta: &ResultMeta,
) -> Result<()> {
    put_file(exec, domain, &cid.out_name(), &outcome.stdout).await?;
    put_file(exec, domain, &cid.err_name(), &outcome.stderr).await?;
    put_file(exec, domain, &cid.meta_name(), meta.render().as_bytes()).await?;
    put_file(
        exec,
        domain,
        &cid.exit_name(),
        format!("{}\n", outcome.exit_code).as_bytes(),
    )
    .await
}

async fn put_file(
    exec: &impl GuestExec,
    domain: &str,
    name: &str,
    bytes: &[u8],
) -> Result<()> {
    let script = format!("umask 077; mkdir -p \"{RESULTS}\"; cat > \"{RESULTS}/{name}\"");
    let output = exec
        .run_with_stdin(domain, &script, bytes, write_timeout(bytes.len()))
        .await?;
    ensure_success(domain, "write result file", output).map(|_| ())
}

// Large captures over a slow qrexec channel can need more than the flat
// write timeout; scale it by payload size.
fn write_timeout(len: usize) -> Duration {
    WRITE_TIMEOUT + Duration::from_secs((len / 1_048_576) as u64)
}

fn ensure_success(domain: &str, what: &str, output: Output) -> Result<Output> {
    if output.status.success() {
        return Ok(output);
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    anyhow::bail!(
        "{what} in domain '{domain}' failed ({}): {}",
        output.status,
        stderr.trim()
    )
}
