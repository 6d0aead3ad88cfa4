//! Boot-time service management via systemctl.

use std::io::{IsTerminal, Write};
use std::time::Duration;

use anyhow::{Context, Result};

pub const SERVICE_UNIT: &str = "qvm-remote-dom0.service";

/// What the operator must type before the daemon is enabled at boot.
const CONFIRM_PHRASE: &str = "enable remote execution";

const SYSTEMCTL_TIMEOUT: Duration = Duration::from_secs(30);

/// Enable and start the service. Requires the confirmation phrase on a
/// terminal; `--yes` bypasses for provisioning.
///
/// # Errors
///
/// Returns an error when confirmation fails or systemctl does.
pub async fn enable(yes: bool) -> Result<()> {
    if !yes {
        confirm()?;
    }
    systemctl(&["enable", "--now", SERVICE_UNIT]).await?;
    println!("{SERVICE_UNIT} enabled");
    Ok(())
}

/// Disable and stop the service. No confirmation: turning remote
/// execution off must never be gated.
///
/// # Errors
///
/// Returns an error when systemctl fails.
pub async fn disable() -> Result<()> {
    systemctl(&["disable", "--now", SERVICE_UNIT]).await?;
    println!("{SERVICE_UNIT} disabled");
    Ok(())
}

fn confirm() -> Result<()> {
    if !std::io::stdin().is_terminal() {
        anyhow::bail!("refusing to enable without a terminal; pass --yes for provisioning");
    }
    eprintln!("This lets authorised qubes run commands in dom0.");
    eprint!("Type '{CONFIRM_PHRASE}' to continue: ");
    std::io::stderr().flush().context("flushing prompt")?;
    let mut line = String::new();
    std::io::stdin()
        .read_line(&mut line)
        .context("reading confirmation")?;
    if line.trim() != CONFIRM_PHRASE {
        anyhow::bail!("confirmation phrase did not match; not enabling");
    }
    Ok(())
}

async fn systemctl(args: &[&str]) -> Result<()> {
    let mut child = tokio::process::Command::new("systemctl")
        .args(args)
        .kill_on_drop(true)
        .spawn()
        .context("failed to spawn systemctl")?;

    tokio::select! {
        status = child.wait() => {
            let status = status.context("waiting for systemctl")?;
            anyhow::ensure!(status.success(), "systemctl {} failed ({status})", args.join(" "));
            Ok(())
        }
        () = tokio::time::sleep(SYSTEMCTL_TIMEOUT) => {
            let _ = child.kill().await;
            anyhow::bail!("systemctl {} timed out", args.join(" "))
        }
    }
}
