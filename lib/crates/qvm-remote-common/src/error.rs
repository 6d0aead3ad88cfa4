//! Client-facing error taxonomy.
//!
//! Every submitter failure terminates the process with a distinct exit
//! code; the daemon uses the same kinds as values in its audit trail but
//! never exits over a per-request failure.

use thiserror::Error;

use crate::auth::KeyError;
use crate::validate::CommandError;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("{0}")]
    InvalidInput(#[from] CommandError),

    #[error("{0}")]
    InvalidKey(#[from] KeyError),

    #[error("no authentication key found; run 'qvm-remote key gen' first")]
    NoKey,

    #[error("failed to submit request: {0}")]
    SubmitFailed(String),

    #[error("timed out waiting for result after {0}s")]
    Timeout(u64),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl RemoteError {
    /// Process exit code for this failure.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::InvalidInput(_) | Self::InvalidKey(_) => 2,
            Self::NoKey => 3,
            Self::SubmitFailed(_) => 4,
            Self::Io(_) => 5,
            Self::Timeout(_) => 124,
        }
    }
}
