//! The pull-model serve loop: one coordinator, a bounded worker pool.
//!
//! The coordinator ticks once per poll interval, reloads the authorised
//! set when the config file changed, consults a short-lived running-state
//! cache, and dispatches at most one pass per domain at a time. Passes
//! fetch pending requests in cid order and feed them through a bounded
//! channel into the workers, which authenticate, execute and write
//! results back. All cross-task interaction is message passing.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::sync::{mpsc, oneshot, watch};

use qvm_remote_common::audit::{AuditEvent, AuditLog, CMD_PREVIEW_MAX};
use qvm_remote_common::meta::ResultMeta;
use qvm_remote_common::Cid;

use crate::config::{self, Config, ConfigWatcher};
use crate::keystore::KeyStore;
use crate::queue;
use crate::qvm::{GuestExec, QvmRun};
use crate::sandbox::{self, ExecOutcome, SandboxLimits};

/// Control-side audit trail.
pub const AUDIT_LOG_PATH: &str = "/var/log/qubes/qvm-remote.log";

/// Concurrent execution workers.
const WORKER_POOL: usize = 8;

/// Depth of the coordinator→worker channel; passes block (back-pressure)
/// when the pool is saturated.
const WORK_QUEUE_DEPTH: usize = 32;

/// How long a domain's running/halted answer is trusted.
const RUNNING_CACHE_TTL: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Default)]
pub struct ServeOptions {
    /// One pass over all domains, then exit.
    pub once: bool,
    /// Synthesise results without invoking the shell.
    pub dry_run: bool,
    /// Serve only this domain.
    pub vm: Option<String>,
}

/// Long-lived daemon state shared between the coordinator and workers.
pub struct Engine<G> {
    pub exec: G,
    pub keys: KeyStore,
    pub audit: AuditLog,
    pub dry_run: bool,
}

struct WorkItem {
    domain: String,
    cid: Cid,
    body: Vec<u8>,
    token: String,
    unauthenticated: bool,
    limits: SandboxLimits,
    done: oneshot::Sender<()>,
}

/// Production entry point: wire up config, keys, audit and `qvm-run`,
/// then run the loop.
///
/// # Errors
///
/// Only startup failures are fatal: an unreadable existing config file,
/// an uncreatable key directory, or an unopenable audit log.
pub async fn run(opts: ServeOptions) -> Result<()> {
    let conf_path = config::conf_path();
    let watcher = ConfigWatcher::new(&conf_path)
        .with_context(|| format!("loading {}", conf_path.display()))?;
    let keys = KeyStore::open(&config::key_dir(&conf_path)).context("opening key directory")?;
    let audit = AuditLog::open(Path::new(AUDIT_LOG_PATH))
        .with_context(|| format!("opening {AUDIT_LOG_PATH}"))?;
    let exec = QvmRun::new(watcher.current().vm_user.clone());

    tracing::info!(
        domains = watcher.current().vms.len(),
        once = opts.once,
        dry_run = opts.dry_run,
        "qvm-remote-dom0 starting"
    );

    let engine = Arc::new(Engine {
        exec,
        keys,
        audit,
        dry_run: opts.dry_run,
    });
    serve_loop(engine, watcher, opts).await
}

/// The coordinator loop. Public so tests can drive it against a
/// [`GuestExec`] double and a temporary config/key/audit layout.
///
/// # Errors
///
/// Propagates nothing per-request; only infrastructure failures.
pub async fn serve_loop<G: GuestExec + Send + Sync + 'static>(
    engine: Arc<Engine<G>>,
    mut watcher: ConfigWatcher,
    opts: ServeOptions,
) -> Result<()> {
    let (work_tx, work_rx) = mpsc::channel::<WorkItem>(WORK_QUEUE_DEPTH);
    let work_rx = Arc::new(tokio::sync::Mutex::new(work_rx));
    let mut workers = tokio::task::JoinSet::new();
    for _ in 0..WORKER_POOL {
        workers.spawn(worker(engine.clone(), work_rx.clone()));
    }

    let (pass_done_tx, mut pass_done_rx) = mpsc::channel::<String>(WORKER_POOL * 4);
    let mut in_flight: HashSet<String> = HashSet::new();
    let mut cache = RunningCache::new(RUNNING_CACHE_TTL);
    let mut stop = spawn_signal_listener();

    loop {
        let tick_start = Instant::now();
        if let Err(e) = watcher.reload_if_changed() {
            tracing::warn!(error = format!("{e:#}"), "config reload failed; keeping previous");
        }
        let cfg = watcher.current().clone();

        while let Ok(domain) = pass_done_rx.try_recv() {
            in_flight.remove(&domain);
        }

        let domains: Vec<String> = match &opts.vm {
            Some(domain) => vec![domain.clone()],
            None => cfg.vms.clone(),
        };
        // An empty authorised set is the legacy commissioning mode: nothing
        // is polled unless --vm names a domain explicitly, and that domain
        // then runs unauthenticated.
        let unauthenticated = cfg.vms.is_empty();

        for domain in &domains {
            if !config::valid_domain(domain) {
                tracing::warn!(domain, "skipping invalid domain name");
                continue;
            }
            if in_flight.contains(domain) {
                // Single-flight: a pass slower than the poll interval
                // skips ticks rather than overlapping itself.
                continue;
            }
            if !cache.is_running(&engine.exec, domain).await {
                continue;
            }
            if unauthenticated {
                tracing::warn!(domain, "authorised domain set is empty; serving without authentication");
            }
            in_flight.insert(domain.clone());
            let engine = engine.clone();
            let cfg = cfg.clone();
            let work_tx = work_tx.clone();
            let pass_done_tx = pass_done_tx.clone();
            let domain = domain.clone();
            tokio::spawn(async move {
                if let Err(e) =
                    run_domain_pass(&engine, &domain, &cfg, &work_tx, unauthenticated).await
                {
                    tracing::warn!(domain, error = format!("{e:#}"), "domain pass failed");
                    let _ = engine.audit.append(&AuditEvent::Error {
                        cid: None,
                        domain: Some(domain.clone()),
                        reason: format!("{e:#}"),
                    });
                }
                let _ = pass_done_tx.send(domain).await;
            });
        }

        if opts.once {
            break;
        }
        let sleep_for = cfg.poll_interval.saturating_sub(tick_start.elapsed());
        tokio::select! {
            () = tokio::time::sleep(sleep_for) => {}
            _ = stop.changed() => {
                tracing::info!("termination signal received; draining in-flight work");
                break;
            }
        }
    }

    // Let the current passes finish (each bounded by the exec timeout),
    // then close the work channel so the pool drains and exits.
    while !in_flight.is_empty() {
        match pass_done_rx.recv().await {
            Some(domain) => {
                in_flight.remove(&domain);
            }
            None => break,
        }
    }
    drop(work_tx);
    while workers.join_next().await.is_some() {}
    Ok(())
}

/// One pass over a single running domain: list, fetch, dispatch in cid
/// order, then wait for every dispatched request to complete.
async fn run_domain_pass<G: GuestExec>(
    engine: &Engine<G>,
    domain: &str,
    cfg: &Config,
    work_tx: &mpsc::Sender<WorkItem>,
    unauthenticated: bool,
) -> Result<()> {
    let cids = queue::list_pending(&engine.exec, domain).await?;
    let mut completions = Vec::new();

    for cid in cids {
        let Some(token) = queue::fetch_token(&engine.exec, domain, &cid).await? else {
            // The submitter writes the token before the body; a body
            // without its sibling is a half-written request, leave it.
            tracing::debug!(domain, %cid, "token not yet present; leaving for next pass");
            continue;
        };
        let Some(body) = queue::fetch_body(&engine.exec, domain, &cid, cfg.max_cmd_bytes).await?
        else {
            tracing::debug!(domain, %cid, "body vanished between list and fetch");
            continue;
        };
        if body.len() > cfg.max_cmd_bytes {
            engine.audit.append(&AuditEvent::Error {
                cid: Some(cid.clone()),
                domain: Some(domain.to_string()),
                reason: format!("command exceeds {} bytes", cfg.max_cmd_bytes),
            })?;
            queue::remove_pending(&engine.exec, domain, &cid).await?;
            continue;
        }
        engine.audit.append(&AuditEvent::Recv {
            cid: cid.clone(),
            domain: domain.to_string(),
            bytes_in: body.len(),
        })?;

        let (done_tx, done_rx) = oneshot::channel();
        let item = WorkItem {
            domain: domain.to_string(),
            cid,
            body,
            token,
            unauthenticated,
            limits: SandboxLimits {
                timeout: cfg.exec_timeout,
                max_out_bytes: cfg.max_out_bytes,
            },
            done: done_tx,
        };
        if work_tx.send(item).await.is_err() {
            break; // shutting down
        }
        completions.push(done_rx);
    }

    for done in completions {
        let _ = done.await;
    }
    Ok(())
}

async fn worker<G: GuestExec + Send + Sync + 'static>(
    engine: Arc<Engine<G>>,
    work_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<WorkItem>>>,
) {
    loop {
        let item = { work_rx.lock().await.recv().await };
        let Some(item) = item else { break };
        process_item(&engine, item).await;
    }
}

async fn process_item<G: GuestExec>(engine: &Engine<G>, item: WorkItem) {
    let WorkItem {
        domain,
        cid,
        body,
        token,
        unauthenticated,
        limits,
        done,
    } = item;
    if let Err(e) = engine
        .handle_request(&domain, &cid, &body, &token, unauthenticated, limits)
        .await
    {
        tracing::warn!(domain, %cid, error = format!("{e:#}"), "request processing failed");
        let _ = engine.audit.append(&AuditEvent::Error {
            cid: Some(cid),
            domain: Some(domain),
            reason: format!("{e:#}"),
        });
    }
    let _ = done.send(());
}

impl<G: GuestExec> Engine<G> {
    /// The per-request sequence: authenticate → unlink-pending → execute
    /// → write-results. Unlinking before execution makes the request
    /// at-most-once even across a daemon crash.
    async fn handle_request(
        &self,
        domain: &str,
        cid: &Cid,
        body: &[u8],
        token: &str,
        unauthenticated: bool,
        limits: SandboxLimits,
    ) -> Result<()> {
        if unauthenticated {
            tracing::warn!(domain, %cid, "executing without authentication");
        } else {
            let Some(key) = self.keys.load(domain)? else {
                // Authorised domain without a key on file: never execute,
                // leave the queue so authorising later lets it proceed.
                self.audit.append(&AuditEvent::AuthDeny {
                    cid: cid.clone(),
                    domain: domain.to_string(),
                })?;
                return Ok(());
            };
            if !key.verify(cid, token) {
                // Silent discard: the failed principal learns nothing.
                self.audit.append(&AuditEvent::AuthFail {
                    cid: cid.clone(),
                    domain: domain.to_string(),
                })?;
                queue::remove_pending(&self.exec, domain, cid).await?;
                return Ok(());
            }
            self.audit.append(&AuditEvent::AuthOk {
                cid: cid.clone(),
                domain: domain.to_string(),
            })?;
        }

        queue::remove_pending(&self.exec, domain, cid).await?;
        if let Err(e) = queue::mark_running(&self.exec, domain, cid).await {
            tracing::debug!(domain, %cid, error = format!("{e:#}"), "tombstone write failed");
        }

        let preview = preview(body);
        self.audit.append(&AuditEvent::Exec {
            cid: cid.clone(),
            domain: domain.to_string(),
            cmd_preview: preview.clone(),
        })?;

        let outcome = if self.dry_run {
            ExecOutcome::dry_run(&preview)
        } else {
            sandbox::execute(body, &limits).await?
        };

        let meta = ResultMeta {
            id: cid.to_string(),
            exit_code: outcome.exit_code,
            duration_ms: outcome.duration_ms,
            truncated_out: outcome.truncated_out,
            truncated_err: outcome.truncated_err,
            timed_out: outcome.timed_out,
        };
        queue::write_results(&self.exec, domain, cid, &outcome, &meta).await?;
        if let Err(e) = queue::clear_running(&self.exec, domain, cid).await {
            tracing::debug!(domain, %cid, error = format!("{e:#}"), "tombstone removal failed");
        }

        if outcome.timed_out {
            self.audit.append(&AuditEvent::Timeout {
                cid: cid.clone(),
                domain: domain.to_string(),
                duration_ms: outcome.duration_ms,
            })?;
        } else {
            self.audit.append(&AuditEvent::Done {
                cid: cid.clone(),
                domain: domain.to_string(),
                exit_code: outcome.exit_code,
                duration_ms: outcome.duration_ms,
                truncated_out: outcome.truncated_out,
                truncated_err: outcome.truncated_err,
            })?;
        }
        Ok(())
    }
}

/// Printable prefix of a command body for EXEC records and dry-run
/// output.
fn preview(body: &[u8]) -> String {
    let head = &body[..body.len().min(CMD_PREVIEW_MAX)];
    String::from_utf8_lossy(head)
        .chars()
        .filter(|c| !c.is_control())
        .collect()
}

struct RunningCache {
    ttl: Duration,
    entries: HashMap<String, (Instant, bool)>,
}

impl RunningCache {
    fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
        }
    }

    async fn is_running<G: GuestExec>(&mut self, exec: &G, domain: &str) -> bool {
        if let Some((at, running)) = self.entries.get(domain) {
            if at.elapsed() < self.ttl {
                return *running;
            }
        }
        let running = match exec.is_running(domain).await {
            Ok(running) => running,
            Err(e) => {
                tracing::warn!(domain, error = format!("{e:#}"), "running-state query failed");
                false
            }
        };
        self.entries.insert(domain.to_string(), (Instant::now(), running));
        running
    }
}

fn spawn_signal_listener() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_termination().await;
        let _ = tx.send(true);
    });
    rx
}

async fn wait_for_termination() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
