//! Append-only audit log, written on both sides of the protocol.
//!
//! One event per line, grep-friendly:
//! `2026-08-02T15:04:05Z AUTH-FAIL cid=20260802-... domain=work`.
//! Rotation is the operator's concern; both sides keep the file at mode
//! 0600.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{SecondsFormat, Utc};

use crate::cid::Cid;

/// One protocol event. Field sets are fixed per kind; values are sanitised
/// before they reach the log so every record stays on one line.
#[derive(Debug, Clone)]
pub enum AuditEvent {
    Submit {
        cid: Cid,
        bytes_in: usize,
    },
    Recv {
        cid: Cid,
        domain: String,
        bytes_in: usize,
    },
    AuthOk {
        cid: Cid,
        domain: String,
    },
    AuthFail {
        cid: Cid,
        domain: String,
    },
    /// Request seen from a domain that has no key on file.
    AuthDeny {
        cid: Cid,
        domain: String,
    },
    Exec {
        cid: Cid,
        domain: String,
        cmd_preview: String,
    },
    Done {
        cid: Cid,
        domain: String,
        exit_code: i32,
        duration_ms: u64,
        truncated_out: bool,
        truncated_err: bool,
    },
    Timeout {
        cid: Cid,
        domain: String,
        duration_ms: u64,
    },
    Error {
        cid: Option<Cid>,
        domain: Option<String>,
        reason: String,
    },
    Result {
        cid: Cid,
        exit_code: i32,
        duration_ms: u64,
    },
}

/// Longest command preview an `EXEC` record carries.
pub const CMD_PREVIEW_MAX: usize = 120;

impl AuditEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Submit { .. } => "SUBMIT",
            Self::Recv { .. } => "RECV",
            Self::AuthOk { .. } => "AUTH-OK",
            Self::AuthFail { .. } => "AUTH-FAIL",
            Self::AuthDeny { .. } => "AUTH-DENY",
            Self::Exec { .. } => "EXEC",
            Self::Done { .. } => "DONE",
            Self::Timeout { .. } => "TIMEOUT",
            Self::Error { .. } => "ERROR",
            Self::Result { .. } => "RESULT",
        }
    }

    fn fields(&self) -> String {
        match self {
            Self::Submit { cid, bytes_in } => format!("cid={cid} bytes_in={bytes_in}"),
            Self::Recv {
                cid,
                domain,
                bytes_in,
            } => format!("cid={cid} domain={domain} bytes_in={bytes_in}"),
            Self::AuthOk { cid, domain }
            | Self::AuthFail { cid, domain }
            | Self::AuthDeny { cid, domain } => format!("cid={cid} domain={domain}"),
            Self::Exec {
                cid,
                domain,
                cmd_preview,
            } => format!(
                "cid={cid} domain={domain} cmd=\"{}\"",
                sanitize(cmd_preview, CMD_PREVIEW_MAX)
            ),
            Self::Done {
                cid,
                domain,
                exit_code,
                duration_ms,
                truncated_out,
                truncated_err,
            } => format!(
                "cid={cid} domain={domain} exit_code={exit_code} duration_ms={duration_ms} \
                 truncated_out={} truncated_err={}",
                u8::from(*truncated_out),
                u8::from(*truncated_err),
            ),
            Self::Timeout {
                cid,
                domain,
                duration_ms,
            } => format!("cid={cid} domain={domain} duration_ms={duration_ms}"),
            Self::Error {
                cid,
                domain,
                reason,
            } => {
                let mut out = String::new();
                if let Some(cid) = cid {
                    out.push_str(&format!("cid={cid} "));
                }
                if let Some(domain) = domain {
                    out.push_str(&format!("domain={} ", sanitize(domain, 64)));
                }
                out.push_str(&format!("reason=\"{}\"", sanitize(reason, 200)));
                out
            }
            Self::Result {
                cid,
                exit_code,
                duration_ms,
            } => format!("cid={cid} exit_code={exit_code} duration_ms={duration_ms}"),
        }
    }

    /// Full record line, without the trailing newline.
    pub fn to_line(&self) -> String {
        format!(
            "{} {} {}",
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            self.kind(),
            self.fields(),
        )
    }
}

/// Drop control bytes and double quotes, cap the length.
fn sanitize(value: &str, max: usize) -> String {
    value
        .chars()
        .filter(|c| !c.is_control() && *c != '"')
        .take(max)
        .collect()
}

/// Handle on one side's audit file. Cloneable across tasks via `Arc`; the
/// internal mutex serialises writers so records never interleave.
pub struct AuditLog {
    path: PathBuf,
    file: Mutex<std::fs::File>,
}

impl AuditLog {
    /// Open (creating if needed) the audit file in append mode and force
    /// its permissions to 0600.
    pub fn open(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record. Each record is a single write followed by a
    /// flush, so a crash can lose at most the record being written.
    pub fn append(&self, event: &AuditEvent) -> io::Result<()> {
        let line = event.to_line();
        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        writeln!(file, "{line}")?;
        file.flush()
    }

    /// Last `n` records of the file at `path`; absent file reads as empty.
    pub fn tail(path: &Path, n: usize) -> io::Result<Vec<String>> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let lines: Vec<&str> = text.lines().collect();
        let start = lines.len().saturating_sub(n);
        Ok(lines[start..].iter().map(|s| s.to_string()).collect())
    }
}
