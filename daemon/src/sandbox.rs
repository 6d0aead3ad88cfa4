//! Bounded local execution of an authenticated command body.
//!
//! Each request gets a throwaway 0700 work directory holding the body as
//! an executable script, a cleaned environment, capped output capture,
//! and a wall-clock timeout that takes the whole process group down.

use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Environment variables the child keeps; everything else is dropped.
const KEPT_ENV: [&str; 5] = ["PATH", "HOME", "USER", "LANG", "TERM"];

/// Exit code recorded when the execution timeout fires.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Per-request execution bounds, snapshotted from the config.
#[derive(Debug, Clone, Copy)]
pub struct SandboxLimits {
    pub timeout: Duration,
    pub max_out_bytes: usize,
}

/// What one execution produced.
#[derive(Debug)]
pub struct ExecOutcome {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub duration_ms: u64,
    pub truncated_out: bool,
    pub truncated_err: bool,
    pub timed_out: bool,
}

impl ExecOutcome {
    /// Synthesised outcome for `--dry-run`: the shell is never invoked.
    #[must_use]
    pub fn dry_run(preview: &str) -> Self {
        Self {
            exit_code: 0,
            stdout: format!("[dry-run] would execute: {preview}\n").into_bytes(),
            stderr: Vec::new(),
            duration_ms: 0,
            truncated_out: false,
            truncated_err: false,
            timed_out: false,
        }
    }
}

/// Run `body` through the shell under `limits`.
///
/// # Errors
///
/// Returns an error when the work directory cannot be prepared or the
/// shell cannot be spawned; a failing or timed-out command is an
/// `ExecOutcome`, not an error.
pub async fn execute(body: &[u8], limits: &SandboxLimits) -> Result<ExecOutcome> {
    let dir = tempfile::Builder::new()
        .prefix("qvm-remote.")
        .tempdir()
        .context("creating work directory")?;
    set_mode(dir.path(), 0o700).context("restricting work directory")?;

    let script = dir.path().join("cmd.sh");
    std::fs::write(&script, body)
        .with_context(|| format!("writing {}", script.display()))?;
    set_mode(&script, 0o700)
        .with_context(|| format!("setting permissions on {}", script.display()))?;

    let home = dirs::home_dir().unwrap_or_else(|| "/".into());
    let mut command = tokio::process::Command::new("/bin/bash");
    command
        .arg(&script)
        .env_clear()
        .env("PWD", &home)
        .current_dir(&home)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for var in KEPT_ENV {
        if let Ok(value) = std::env::var(var) {
            command.env(var, value);
        }
    }
    #[cfg(unix)]
    command.process_group(0);

    let started = Instant::now();
    let mut child = command.spawn().context("spawning shell")?;

    // Readers run as tasks so they keep draining (and survive) whichever
    // way the select below resolves.
    let out_task = tokio::spawn(read_capped(child.stdout.take(), limits.max_out_bytes));
    let err_task = tokio::spawn(read_capped(child.stderr.take(), limits.max_out_bytes));

    let mut timed_out = false;
    let status = tokio::select! {
        status = child.wait() => Some(status.context("waiting for shell")?),
        () = tokio::time::sleep(limits.timeout) => {
            timed_out = true;
            kill_process_group(&child);
            let _ = child.kill().await;
            let _ = child.wait().await;
            None
        }
    };

    let (stdout, truncated_out) = out_task.await.context("collecting stdout")?;
    let (stderr, truncated_err) = err_task.await.context("collecting stderr")?;

    let exit_code = match status {
        Some(status) => exit_code_of(status),
        None => TIMEOUT_EXIT_CODE,
    };
    Ok(ExecOutcome {
        exit_code,
        stdout,
        stderr,
        duration_ms: started.elapsed().as_millis() as u64,
        truncated_out,
        truncated_err,
        timed_out,
    })
}

/// Read to EOF, keeping at most `cap` bytes. Draining past the cap keeps
/// the child from blocking on a full pipe.
async fn read_capped<R: AsyncRead + Unpin>(handle: Option<R>, cap: usize) -> (Vec<u8>, bool) {
    let Some(mut reader) = handle else {
        return (Vec::new(), false);
    };
    let mut kept = Vec::new();
    let mut truncated = false;
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = cap.saturating_sub(kept.len());
                let take = room.min(n);
                kept.extend_from_slice(&buf[..take]);
                if take < n {
                    truncated = true;
                }
            }
        }
    }
    (kept, truncated)
}

fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    1
}

#[cfg(unix)]
fn kill_process_group(child: &tokio::process::Child) {
    if let Some(pid) = child.id() {
        unsafe {
            let pgid = libc::getpgid(pid as libc::pid_t);
            if pgid >= 0 {
                libc::killpg(pgid, libc::SIGKILL);
            }
        }
    }
}

#[cfg(not(unix))]
fn kill_process_group(_child: &tokio::process::Child) {}

fn set_mode(path: &Path, _mode: u32) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(_mode))?;
    }
    Ok(())
}
