//! Serve-loop tests against a canned [`GuestExec`] double.
//!
//! The double answers the daemon's guest-side scripts from in-memory
//! tables and records every call, so the tests can assert on the exact
//! cross-domain traffic a pass produces without touching Qubes.

#![allow(clippy::expect_used)]

use std::collections::HashMap;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Output};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use tempfile::TempDir;

use qvm_remote_common::audit::AuditLog;
use qvm_remote_common::{AuthKey, Cid};
use qvm_remote_dom0::config::ConfigWatcher;
use qvm_remote_dom0::keystore::KeyStore;
use qvm_remote_dom0::qvm::GuestExec;
use qvm_remote_dom0::serve::{serve_loop, Engine, ServeOptions};

// ── Output helpers ───────────────────────────────────────────────────────────

fn ok_output(stdout: &[u8]) -> Output {
    Output {
        status: ExitStatus::from_raw(0),
        stdout: stdout.to_vec(),
        stderr: Vec::new(),
    }
}

fn err_output() -> Output {
    Output {
        status: ExitStatus::from_raw(1 << 8),
        stdout: Vec::new(),
        stderr: b"No such file or directory".to_vec(),
    }
}

// ── The double ───────────────────────────────────────────────────────────────

#[derive(Default)]
struct MockGuest {
    running: bool,
    listings: HashMap<String, String>,
    files: HashMap<(String, String), Vec<u8>>,
    calls: Mutex<Vec<(String, String)>>,
    writes: Mutex<Vec<(String, String, Vec<u8>)>>,
}

impl MockGuest {
    fn seed_request(&mut self, domain: &str, cid: &Cid, body: &[u8], token: &str) {
        let listing = self.listings.entry(domain.to_string()).or_default();
        listing.push_str(&format!("{cid}\n{}\n", cid.auth_name()));
        self.files
            .insert((domain.to_string(), cid.as_str().to_string()), body.to_vec());
        self.files.insert(
            (domain.to_string(), cid.auth_name()),
            token.as_bytes().to_vec(),
        );
    }

    fn scripts(&self) -> Vec<String> {
        self.calls
            .lock()
            .expect("calls lock")
            .iter()
            .map(|(_, script)| script.clone())
            .collect()
    }

    fn writes_for(&self, domain: &str) -> Vec<(String, Vec<u8>)> {
        self.writes
            .lock()
            .expect("writes lock")
            .iter()
            .filter(|(d, _, _)| d == domain)
            .map(|(_, script, input)| (script.clone(), input.clone()))
            .collect()
    }
}

/// `.../pending/<name>"` → `<name>`.
fn file_name_of(script: &str) -> Option<String> {
    script
        .rsplit('/')
        .next()
        .map(|tail| tail.trim_end_matches('"').to_string())
}

impl GuestExec for MockGuest {
    async fn run(&self, domain: &str, script: &str, _timeout: Duration) -> Result<Output> {
        self.calls
            .lock()
            .expect("calls lock")
            .push((domain.to_string(), script.to_string()));

        if script.starts_with("ls -1") {
            let listing = self.listings.get(domain).cloned().unwrap_or_default();
            return Ok(ok_output(listing.as_bytes()));
        }
        if script.starts_with("cat -- ") || script.starts_with("head -c") {
            let name = file_name_of(script).expect("file name in script");
            return Ok(match self.files.get(&(domain.to_string(), name)) {
                Some(bytes) => ok_output(bytes),
                None => err_output(),
            });
        }
        // rm / tombstone scripts succeed silently.
        Ok(ok_output(b""))
    }

    async fn run_with_stdin(
        &self,
        domain: &str,
        script: &str,
        input: &[u8],
        _timeout: Duration,
    ) -> Result<Output> {
        self.calls
            .lock()
            .expect("calls lock")
            .push((domain.to_string(), script.to_string()));
        self.writes.lock().expect("writes lock").push((
            domain.to_string(),
            script.to_string(),
            input.to_vec(),
        ));
        Ok(ok_output(b""))
    }

    async fn is_running(&self, _domain: &str) -> Result<bool> {
        Ok(self.running)
    }
}

// ── Harness ──────────────────────────────────────────────────────────────────

struct Harness {
    _tmp: TempDir,
    engine: Arc<Engine<MockGuest>>,
    watcher: ConfigWatcher,
    audit_path: PathBuf,
}

impl Harness {
    fn new(conf: &str, mock: MockGuest, dry_run: bool) -> Self {
        let tmp = TempDir::new().expect("tempdir");
        let conf_path = tmp.path().join("remote.conf");
        std::fs::write(&conf_path, conf).expect("write conf");
        let watcher = ConfigWatcher::new(&conf_path).expect("watcher");
        let keys = KeyStore::open(&tmp.path().join("remote.d")).expect("key store");
        let audit_path = tmp.path().join("audit.log");
        let audit = AuditLog::open(&audit_path).expect("audit log");
        Self {
            engine: Arc::new(Engine {
                exec: mock,
                keys,
                audit,
                dry_run,
            }),
            watcher,
            audit_path,
            _tmp: tmp,
        }
    }

    async fn run_once(self) -> (Arc<Engine<MockGuest>>, String) {
        let opts = ServeOptions {
            once: true,
            dry_run: self.engine.dry_run,
            vm: None,
        };
        serve_loop(self.engine.clone(), self.watcher, opts)
            .await
            .expect("serve pass");
        let audit = std::fs::read_to_string(&self.audit_path).expect("audit file");
        (self.engine, audit)
    }
}

fn running_mock() -> MockGuest {
    MockGuest {
        running: true,
        ..Default::default()
    }
}

// ── Scenarios ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_dry_run_happy_path_never_invokes_shell() {
    let key = AuthKey::generate();
    let cid = Cid::generate();
    let mut mock = running_mock();
    mock.seed_request("work", &cid, b"echo hello", &key.tag(&cid));

    let harness = Harness::new("QVM_REMOTE_VMS=work\n", mock, true);
    harness.engine.keys.install("work", &key, false).expect("install key");
    let (engine, audit) = harness.run_once().await;

    for kind in ["RECV", "AUTH-OK", "EXEC", "DONE"] {
        assert!(audit.contains(kind), "audit missing {kind}:\n{audit}");
    }
    assert!(!audit.contains("AUTH-FAIL"));

    let writes = engine.exec.writes_for("work");
    assert_eq!(writes.len(), 4, "out, err, meta, exit");
    assert!(writes[0].0.contains(".out"));
    assert!(writes[0].1.starts_with(b"[dry-run]"));
    assert!(
        writes.last().expect("writes").0.contains(".exit"),
        ".exit must land last"
    );

    // Pending pair is unlinked before any result write.
    let scripts = engine.exec.scripts();
    let rm_idx = scripts
        .iter()
        .position(|s| s.starts_with("rm -f") && s.contains("pending"))
        .expect("pending unlink");
    let write_idx = scripts
        .iter()
        .position(|s| s.contains("results"))
        .expect("result write");
    assert!(rm_idx < write_idx, "unlink-pending must precede writes");
}

#[tokio::test]
async fn test_bad_token_is_discarded_silently() {
    let key = AuthKey::generate();
    let cid = Cid::generate();
    let mut mock = running_mock();
    mock.seed_request("work", &cid, b"echo nope", &"0".repeat(64));

    let harness = Harness::new("QVM_REMOTE_VMS=work\n", mock, false);
    harness.engine.keys.install("work", &key, false).expect("install key");
    let (engine, audit) = harness.run_once().await;

    assert_eq!(audit.matches("AUTH-FAIL").count(), 1, "{audit}");
    assert!(!audit.contains("EXEC"));
    assert!(!audit.contains("DONE"));

    assert!(engine.exec.writes_for("work").is_empty(), "no result bundle");
    let scripts = engine.exec.scripts();
    assert!(
        scripts.iter().any(|s| s.starts_with("rm -f") && s.contains("pending")),
        "pending pair must be unlinked"
    );
}

#[tokio::test]
async fn test_missing_key_denies_and_leaves_queue() {
    let cid = Cid::generate();
    let mut mock = running_mock();
    mock.seed_request("work", &cid, b"echo x", &"0".repeat(64));

    let harness = Harness::new("QVM_REMOTE_VMS=work\n", mock, false);
    let (engine, audit) = harness.run_once().await;

    assert!(audit.contains("AUTH-DENY"), "{audit}");
    assert!(!audit.contains("EXEC"));
    let scripts = engine.exec.scripts();
    assert!(
        !scripts.iter().any(|s| s.starts_with("rm -f")),
        "queue must be left for later authorisation"
    );
    assert!(engine.exec.writes_for("work").is_empty());
}

#[tokio::test]
async fn test_body_without_token_is_left_for_next_pass() {
    let cid = Cid::generate();
    let mut mock = running_mock();
    // Body listed and present, but no .auth sibling on disk yet.
    mock.listings.insert("work".into(), format!("{cid}\n"));
    mock.files
        .insert(("work".into(), cid.as_str().into()), b"echo x".to_vec());

    let key = AuthKey::generate();
    let harness = Harness::new("QVM_REMOTE_VMS=work\n", mock, false);
    harness.engine.keys.install("work", &key, false).expect("install key");
    let (engine, audit) = harness.run_once().await;

    assert!(!audit.contains("RECV"), "{audit}");
    let scripts = engine.exec.scripts();
    assert!(!scripts.iter().any(|s| s.starts_with("rm -f")));
}

#[tokio::test]
async fn test_multi_domain_isolation_with_identical_cids() {
    let key_work = AuthKey::generate();
    let key_personal = AuthKey::generate();
    let cid = Cid::generate(); // same cid in both domains is legal

    let mut mock = running_mock();
    mock.seed_request("work", &cid, b"echo from-work", &key_work.tag(&cid));
    mock.seed_request("personal", &cid, b"echo from-personal", &key_personal.tag(&cid));

    let harness = Harness::new("QVM_REMOTE_VMS=work personal\n", mock, true);
    harness.engine.keys.install("work", &key_work, false).expect("install");
    harness
        .engine
        .keys
        .install("personal", &key_personal, false)
        .expect("install");
    let (engine, audit) = harness.run_once().await;

    assert_eq!(audit.matches("DONE").count(), 2, "{audit}");
    assert!(audit.contains("domain=work"));
    assert!(audit.contains("domain=personal"));

    let work_writes = engine.exec.writes_for("work");
    let personal_writes = engine.exec.writes_for("personal");
    assert_eq!(work_writes.len(), 4);
    assert_eq!(personal_writes.len(), 4);
    assert!(
        String::from_utf8_lossy(&work_writes[0].1).contains("from-work"),
        "work's result must come from work's body"
    );
    assert!(String::from_utf8_lossy(&personal_writes[0].1).contains("from-personal"));
}

#[tokio::test]
async fn test_real_execution_writes_shell_output() {
    let key = AuthKey::generate();
    let cid = Cid::generate();
    let mut mock = running_mock();
    mock.seed_request("work", &cid, b"echo hello", &key.tag(&cid));

    let harness = Harness::new("QVM_REMOTE_VMS=work\n", mock, false);
    harness.engine.keys.install("work", &key, false).expect("install key");
    let (engine, audit) = harness.run_once().await;

    assert!(audit.contains("DONE"), "{audit}");
    let writes = engine.exec.writes_for("work");
    let out = writes.iter().find(|(s, _)| s.contains(".out")).expect("out file");
    assert_eq!(out.1, b"hello\n");
    let exit = writes.iter().find(|(s, _)| s.contains(".exit")).expect("exit file");
    assert_eq!(exit.1, b"0\n");
}

#[tokio::test]
async fn test_remote_timeout_records_124() {
    let key = AuthKey::generate();
    let cid = Cid::generate();
    let mut mock = running_mock();
    mock.seed_request("work", &cid, b"sleep 30", &key.tag(&cid));

    let harness = Harness::new(
        "QVM_REMOTE_VMS=work\nQVM_REMOTE_EXEC_TIMEOUT=1\n",
        mock,
        false,
    );
    harness.engine.keys.install("work", &key, false).expect("install key");
    let (engine, audit) = harness.run_once().await;

    assert!(audit.contains("TIMEOUT"), "{audit}");
    let writes = engine.exec.writes_for("work");
    let exit = writes.iter().find(|(s, _)| s.contains(".exit")).expect("exit file");
    assert_eq!(exit.1, b"124\n");
    let meta = writes.iter().find(|(s, _)| s.contains(".meta")).expect("meta file");
    assert!(String::from_utf8_lossy(&meta.1).contains("timeout=1"));
}

#[tokio::test]
async fn test_halted_domain_is_skipped_entirely() {
    let mut mock = MockGuest::default(); // running = false
    let cid = Cid::generate();
    mock.seed_request("work", &cid, b"echo x", &"0".repeat(64));

    let harness = Harness::new("QVM_REMOTE_VMS=work\n", mock, false);
    let (engine, audit) = harness.run_once().await;

    assert!(engine.exec.scripts().is_empty(), "no guest-exec traffic");
    assert!(!audit.contains("RECV"));
}

#[tokio::test]
async fn test_oversized_body_is_rejected_before_auth() {
    let key = AuthKey::generate();
    let cid = Cid::generate();
    let mut mock = running_mock();
    mock.seed_request("work", &cid, b"123456789", &key.tag(&cid));

    let harness = Harness::new(
        "QVM_REMOTE_VMS=work\nQVM_REMOTE_MAX_CMD_BYTES=4\n",
        mock,
        false,
    );
    harness.engine.keys.install("work", &key, false).expect("install key");
    let (engine, audit) = harness.run_once().await;

    assert!(audit.contains("ERROR"), "{audit}");
    assert!(audit.contains("exceeds"));
    assert!(!audit.contains("RECV"));
    let scripts = engine.exec.scripts();
    assert!(scripts.iter().any(|s| s.starts_with("rm -f")));
    assert!(engine.exec.writes_for("work").is_empty());
}

#[tokio::test]
async fn test_malformed_queue_names_are_never_fetched() {
    let mut mock = running_mock();
    mock.listings.insert(
        "work".into(),
        "../../../etc/shadow\njunk name\n.hidden\n".to_string(),
    );

    let key = AuthKey::generate();
    let harness = Harness::new("QVM_REMOTE_VMS=work\n", mock, false);
    harness.engine.keys.install("work", &key, false).expect("install key");
    let (engine, _audit) = harness.run_once().await;

    let scripts = engine.exec.scripts();
    assert!(
        !scripts.iter().any(|s| s.starts_with("cat") || s.starts_with("head")),
        "malformed names must not be fetched: {scripts:?}"
    );
}
