//! CLI argument parsing with clap derive.

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::commands;
use crate::paths::GuestDirs;

/// Execute commands in dom0 from an unprivileged qube
#[derive(Parser)]
#[command(name = "qvm-remote", version, args_conflicts_with_subcommands = true)]
pub struct Cli {
    /// Seconds to wait for the result before giving up
    #[arg(
        long,
        env = "QVM_REMOTE_TIMEOUT",
        default_value_t = 30,
        value_parser = clap::value_parser!(u64).range(1..),
    )]
    pub timeout: u64,

    /// Command to run in dom0; read from stdin when absent
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,

    #[command(subcommand)]
    pub verb: Option<Verb>,
}

#[derive(Subcommand)]
pub enum Verb {
    /// Manage the shared authentication key
    #[command(subcommand)]
    Key(KeyCmd),

    /// Round-trip a trivial command to check the channel
    Ping,

    /// Print the tail of the guest audit log
    Log {
        /// Number of lines to show
        #[arg(default_value_t = 20)]
        lines: usize,
    },

    /// List recent archived commands
    History,
}

#[derive(Subcommand)]
pub enum KeyCmd {
    /// Generate a new key and print it
    Gen {
        /// Overwrite an existing key
        #[arg(long)]
        replace: bool,
    },

    /// Print the stored key
    Show,

    /// Install a key supplied as 64 hex characters
    Import {
        hex: String,

        /// Overwrite an existing, different key
        #[arg(long)]
        replace: bool,
    },
}

impl Cli {
    /// Execute the selected verb and return the process exit code.
    ///
    /// # Errors
    ///
    /// Returns an error when the guest directory layout cannot be set up or
    /// the verb itself fails; `main` maps the error to an exit code.
    pub async fn run(self) -> Result<u8> {
        let dirs = GuestDirs::resolve()?;
        match self.verb {
            Some(Verb::Key(cmd)) => commands::key::run(&dirs, cmd),
            Some(Verb::Ping) => commands::ping::run(&dirs, self.timeout).await,
            Some(Verb::Log { lines }) => commands::log::run(&dirs, lines),
            Some(Verb::History) => commands::history::run(&dirs),
            None => commands::submit::run(&dirs, &self.command, self.timeout).await,
        }
    }
}
