//! Guest-side library behind the `qvm-remote` binary.

#![cfg_attr(test, allow(clippy::expect_used))]

pub mod cli;
pub mod commands;
pub mod paths;
pub mod queue;

use qvm_remote_common::RemoteError;

/// Map a failure to the submitter's exit code: a typed [`RemoteError`]
/// carries its own code, a bare I/O error anywhere in the chain means 5,
/// anything else is the generic 1.
pub fn failure_code(err: &anyhow::Error) -> u8 {
    if let Some(remote) = err.downcast_ref::<RemoteError>() {
        return remote.exit_code();
    }
    if err.chain().any(|cause| cause.is::<std::io::Error>()) {
        return 5;
    }
    1
}
