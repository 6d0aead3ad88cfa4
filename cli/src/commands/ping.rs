//! `qvm-remote ping` — round-trip a trivial command through the queue.

use anyhow::Result;

use crate::commands::submit;
use crate::paths::GuestDirs;

/// The probe the daemon should echo straight back.
const PING_COMMAND: &[u8] = b"echo pong";

pub async fn run(dirs: &GuestDirs, timeout_secs: u64) -> Result<u8> {
    let tx = submit::round_trip(dirs, PING_COMMAND, timeout_secs).await?;
    if tx.bundle.exit_code == 0 && tx.bundle.stdout.starts_with(b"pong") {
        println!("pong from dom0 ({} ms)", tx.elapsed_ms);
        Ok(0)
    } else {
        eprintln!(
            "unexpected ping reply (exit {})",
            tx.bundle.exit_code
        );
        Ok(1)
    }
}
