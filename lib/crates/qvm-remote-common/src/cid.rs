//! Request identifiers.
//!
//! A `Cid` names one request for its whole lifetime: it is the queue file
//! name, the HMAC message, and the base name of the result bundle. The
//! format is `YYYYMMDD-HHMMSS-<pid>-<rand8>` where `rand8` is 8 hex digits
//! from the OS CSPRNG, so names sort approximately by submission time while
//! staying unpredictable.

use std::fmt;

use chrono::Utc;
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;

/// Upper bound on a cid's length; anything longer is garbage.
const MAX_CID_LEN: usize = 64;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("malformed request identifier: {0:?}")]
pub struct CidError(pub String);

/// A validated request identifier.
///
/// Daemon code must only construct a `Cid` through [`Cid::generate`] or
/// [`Cid::parse`]; directory listings read out of a guest are untrusted and
/// must pass `parse` before the name is ever used as a path component.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Cid(String);

impl Cid {
    /// Generate a fresh identifier from the current time, this process's
    /// pid, and 32 bits of CSPRNG entropy.
    pub fn generate() -> Self {
        let mut rnd = [0u8; 4];
        OsRng.fill_bytes(&mut rnd);
        Self(format!(
            "{}-{}-{}",
            Utc::now().format("%Y%m%d-%H%M%S"),
            std::process::id(),
            hex::encode(rnd),
        ))
    }

    /// Validate an untrusted name against the exact cid shape.
    pub fn parse(s: &str) -> Result<Self, CidError> {
        let err = || CidError(s.chars().take(MAX_CID_LEN).collect());
        if s.len() > MAX_CID_LEN {
            return Err(err());
        }
        let parts: Vec<&str> = s.split('-').collect();
        let [date, time, pid, rand] = parts.as_slice() else {
            return Err(err());
        };
        let digits = |p: &str| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit());
        let lower_hex = |p: &str| p.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
        if date.len() != 8 || !digits(date) {
            return Err(err());
        }
        if time.len() != 6 || !digits(time) {
            return Err(err());
        }
        if pid.len() > 10 || !digits(pid) {
            return Err(err());
        }
        if rand.len() != 8 || !lower_hex(rand) {
            return Err(err());
        }
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// File name of the authentication token sibling.
    pub fn auth_name(&self) -> String {
        format!("{}.auth", self.0)
    }

    pub fn out_name(&self) -> String {
        format!("{}.out", self.0)
    }

    pub fn err_name(&self) -> String {
        format!("{}.err", self.0)
    }

    pub fn exit_name(&self) -> String {
        format!("{}.exit", self.0)
    }

    pub fn meta_name(&self) -> String {
        format!("{}.meta", self.0)
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Cid {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
