//! CLI argument parsing with clap derive.

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::serve::{self, ServeOptions};
use crate::{admin, service};

/// Dom0 executor daemon for qvm-remote
#[derive(Parser)]
#[command(name = "qvm-remote-dom0", version, args_conflicts_with_subcommands = true)]
pub struct Cli {
    /// Perform exactly one pass over all domains, then exit
    #[arg(long)]
    pub once: bool,

    /// Log what would run and synthesise results without invoking the shell
    #[arg(long)]
    pub dry_run: bool,

    /// Serve only this domain
    #[arg(long, value_name = "DOMAIN")]
    pub vm: Option<String>,

    #[command(subcommand)]
    pub command: Option<AdminCmd>,
}

#[derive(Subcommand)]
pub enum AdminCmd {
    /// Install an authorisation key for a domain
    Authorize {
        domain: String,

        /// 64 lowercase hex characters
        key: String,

        /// Rotate an existing key
        #[arg(long)]
        replace: bool,
    },

    /// Remove a domain's key
    Revoke { domain: String },

    /// List authorised domains and key fingerprints
    Keys {
        /// Emit a JSON array instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Enable the boot-time service (asks for confirmation)
    Enable {
        /// Skip the interactive confirmation (provisioning)
        #[arg(long)]
        yes: bool,
    },

    /// Disable the boot-time service
    Disable,
}

impl Cli {
    /// Execute the selected command.
    ///
    /// # Errors
    ///
    /// Returns an error when the command fails; per-request serve errors
    /// are handled inside the loop and never surface here.
    pub async fn run(self) -> Result<()> {
        match self.command {
            Some(AdminCmd::Authorize {
                domain,
                key,
                replace,
            }) => admin::authorize(&domain, &key, replace),
            Some(AdminCmd::Revoke { domain }) => admin::revoke(&domain),
            Some(AdminCmd::Keys { json }) => admin::keys(json),
            Some(AdminCmd::Enable { yes }) => service::enable(yes).await,
            Some(AdminCmd::Disable) => service::disable().await,
            None => {
                serve::run(ServeOptions {
                    once: self.once,
                    dry_run: self.dry_run,
                    vm: self.vm,
                })
                .await
            }
        }
    }
}
