//! Command admission checks.

use thiserror::Error;

/// Default command-body cap, overridable on the daemon side via
/// `QVM_REMOTE_MAX_CMD_BYTES`.
pub const DEFAULT_MAX_CMD_BYTES: usize = 1_048_576;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("empty command")]
    Empty,

    #[error("command is {len} bytes, limit is {max}")]
    TooLarge { len: usize, max: usize },

    #[error("command contains a NUL byte")]
    NulByte,

    #[error("command contains control byte 0x{0:02x}")]
    ControlByte(u8),
}

/// Reject command bodies the protocol refuses to carry: empty after
/// trimming, over the size cap, or containing NUL / control bytes other
/// than tab, newline and carriage return. Exactly `max_len` bytes is still
/// accepted.
pub fn validate_command(bytes: &[u8], max_len: usize) -> Result<(), CommandError> {
    if bytes.trim_ascii().is_empty() {
        return Err(CommandError::Empty);
    }
    if bytes.len() > max_len {
        return Err(CommandError::TooLarge {
            len: bytes.len(),
            max: max_len,
        });
    }
    for &b in bytes {
        if b == 0 {
            return Err(CommandError::NulByte);
        }
        if (b < 0x20 && !matches!(b, b'\t' | b'\n' | b'\r')) || b == 0x7f {
            return Err(CommandError::ControlByte(b));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_command_is_accepted() {
        assert_eq!(validate_command(b"echo hello", DEFAULT_MAX_CMD_BYTES), Ok(()));
    }

    #[test]
    fn test_tabs_and_newlines_are_allowed() {
        assert_eq!(
            validate_command(b"ls\t-l\nwc -l\r\n", DEFAULT_MAX_CMD_BYTES),
            Ok(())
        );
    }

    #[test]
    fn test_empty_and_whitespace_only_are_rejected() {
        assert_eq!(validate_command(b"", 100), Err(CommandError::Empty));
        assert_eq!(validate_command(b"  \n\t ", 100), Err(CommandError::Empty));
    }

    #[test]
    fn test_size_boundary_is_inclusive() {
        let exactly = vec![b'a'; DEFAULT_MAX_CMD_BYTES];
        assert_eq!(validate_command(&exactly, DEFAULT_MAX_CMD_BYTES), Ok(()));

        let over = vec![b'a'; DEFAULT_MAX_CMD_BYTES + 1];
        assert_eq!(
            validate_command(&over, DEFAULT_MAX_CMD_BYTES),
            Err(CommandError::TooLarge {
                len: DEFAULT_MAX_CMD_BYTES + 1,
                max: DEFAULT_MAX_CMD_BYTES,
            })
        );
    }

    #[test]
    fn test_nul_byte_is_rejected() {
        assert_eq!(validate_command(b"echo \0", 100), Err(CommandError::NulByte));
    }

    #[test]
    fn test_control_bytes_are_rejected() {
        assert_eq!(
            validate_command(b"echo \x1b[31m", 100),
            Err(CommandError::ControlByte(0x1b))
        );
        assert_eq!(
            validate_command(b"del \x7f", 100),
            Err(CommandError::ControlByte(0x7f))
        );
    }
}
