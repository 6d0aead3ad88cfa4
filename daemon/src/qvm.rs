//! Guest-exec abstraction over `qvm-run` — enables test doubles.
//!
//! Every cross-domain operation funnels through [`GuestExec`]. The
//! production implementation shells out to `qvm-run --pass-io
//! --no-autostart`, which streams stdio without ever starting a halted
//! domain; test doubles return canned output without touching Qubes.

use std::future::Future;
use std::process::{Output, Stdio};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::AsyncReadExt;

/// Timeout for listing a pending directory.
pub const LIST_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for fetching one queue file.
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for writing one result file back.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(60);

/// Timeout for the is-running check.
pub const CHECK_TIMEOUT: Duration = Duration::from_secs(10);

/// Host-initiated execution inside a guest domain.
///
/// The futures are `Send` because workers and per-domain passes run on a
/// multi-threaded runtime; implementations just write `async fn`.
pub trait GuestExec {
    /// Run `script` through the guest's shell as the configured user.
    ///
    /// # Errors
    ///
    /// Returns an error if the command cannot be spawned or exceeds
    /// `timeout`.
    fn run(
        &self,
        domain: &str,
        script: &str,
        timeout: Duration,
    ) -> impl Future<Output = Result<Output>> + Send;

    /// Same as [`GuestExec::run`] with `input` piped to the script's
    /// stdin.
    ///
    /// # Errors
    ///
    /// Returns an error if the command cannot be spawned or exceeds
    /// `timeout`.
    fn run_with_stdin(
        &self,
        domain: &str,
        script: &str,
        input: &[u8],
        timeout: Duration,
    ) -> impl Future<Output = Result<Output>> + Send;

    /// Whether the domain is currently running. Must never start it.
    ///
    /// # Errors
    ///
    /// Returns an error if the platform query cannot be spawned.
    fn is_running(&self, domain: &str) -> impl Future<Output = Result<bool>> + Send;
}

/// Production implementation — shells out to the Qubes tools.
pub struct QvmRun {
    vm_user: String,
}

impl QvmRun {
    #[must_use]
    pub fn new(vm_user: String) -> Self {
        Self { vm_user }
    }

    async fn qvm_run(
        &self,
        domain: &str,
        script: &str,
        input: Option<&[u8]>,
        timeout: Duration,
    ) -> Result<Output> {
        let mut command = tokio::process::Command::new("qvm-run");
        command
            .args([
                "--pass-io",
                "--no-autostart",
                "--user",
                &self.vm_user,
                "--",
                domain,
                script,
            ])
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().context("failed to spawn qvm-run")?;

        // Feed stdin from a task so a full pipe cannot deadlock the reads.
        let stdin_task = child.stdin.take().map(|mut stdin| {
            let input = input.unwrap_or_default().to_vec();
            tokio::spawn(async move {
                use tokio::io::AsyncWriteExt;
                let _ = stdin.write_all(&input).await;
                let _ = stdin.shutdown().await;
            })
        });

        let mut stdout_handle = child.stdout.take();
        let mut stderr_handle = child.stderr.take();

        // Read stdout/stderr concurrently with wait() to avoid pipe
        // deadlock, and kill explicitly on timeout — dropping the future
        // alone would leave the qvm-run process behind.
        tokio::select! {
            result = async {
                let (status, stdout, stderr) = tokio::join!(
                    child.wait(),
                    async {
                        let mut buf = Vec::new();
                        if let Some(ref mut h) = stdout_handle {
                            let _ = h.read_to_end(&mut buf).await;
                        }
                        buf
                    },
                    async {
                        let mut buf = Vec::new();
                        if let Some(ref mut h) = stderr_handle {
                            let _ = h.read_to_end(&mut buf).await;
                        }
                        buf
                    },
                );
                if let Some(task) = stdin_task {
                    let _ = task.await;
                }
                Ok(Output {
                    status: status.context("waiting for qvm-run")?,
                    stdout,
                    stderr,
                })
            } => result,
            () = tokio::time::sleep(timeout) => {
                let _ = child.kill().await;
                anyhow::bail!(
                    "qvm-run in domain '{domain}' timed out after {}s",
                    timeout.as_secs()
                )
            }
        }
    }
}

impl GuestExec for QvmRun {
    async fn run(&self, domain: &str, script: &str, timeout: Duration) -> Result<Output> {
        self.qvm_run(domain, script, None, timeout).await
    }

    async fn run_with_stdin(
        &self,
        domain: &str,
        script: &str,
        input: &[u8],
        timeout: Duration,
    ) -> Result<Output> {
        self.qvm_run(domain, script, Some(input), timeout).await
    }

    async fn is_running(&self, domain: &str) -> Result<bool> {
        let mut child = tokio::process::Command::new("qvm-check")
            .args(["--running", "--quiet", "--", domain])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .context("failed to spawn qvm-check")?;

        tokio::select! {
            status = child.wait() => {
                Ok(status.context("waiting for qvm-check")?.success())
            }
            () = tokio::time::sleep(CHECK_TIMEOUT) => {
                let _ = child.kill().await;
                anyhow::bail!("qvm-check for domain '{domain}' timed out")
            }
        }
    }
}
