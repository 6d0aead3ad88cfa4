//! Per-domain shared secrets and request tokens.
//!
//! Each authorised guest domain shares one 256-bit key with dom0. The only
//! thing that ever crosses the trust boundary is the token: the lowercase
//! hex HMAC-SHA256 of the request identifier under that key.

use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::cid::Cid;

type HmacSha256 = Hmac<Sha256>;

/// Length of a key in its on-disk hex form.
pub const KEY_HEX_LEN: usize = 64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("key must be exactly {KEY_HEX_LEN} lowercase hex characters")]
    Malformed,
}

/// A 256-bit shared secret.
#[derive(Clone)]
pub struct AuthKey([u8; 32]);

impl AuthKey {
    /// Generate a fresh key from the OS CSPRNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Parse the on-disk form. Only lowercase hex is accepted; an uppercase
    /// or truncated key file is treated as malformed rather than fixed up.
    pub fn from_hex(s: &str) -> Result<Self, KeyError> {
        if s.len() != KEY_HEX_LEN
            || !s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
        {
            return Err(KeyError::Malformed);
        }
        let decoded = hex::decode(s).map_err(|_| KeyError::Malformed)?;
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&decoded);
        Ok(Self(bytes))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Compute the authentication token for a request.
    pub fn tag(&self, cid: &Cid) -> String {
        let mut mac =
            HmacSha256::new_from_slice(&self.0).expect("hmac accepts keys of any length");
        mac.update(cid.as_str().as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Verify a presented token in constant time.
    ///
    /// The expected token is recomputed and the full hex strings compared
    /// with [`ConstantTimeEq`]; a wrong-length presentation fails without
    /// leaking anything beyond the (public) token length.
    pub fn verify(&self, cid: &Cid, presented: &str) -> bool {
        let expected = self.tag(cid);
        presented.len() == expected.len()
            && bool::from(expected.as_bytes().ct_eq(presented.as_bytes()))
    }

    /// Short display hash for `keys` listings. Never reveals key material.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.0);
        hex::encode(&digest[..8])
    }
}

impl std::fmt::Debug for AuthKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AuthKey({})", self.fingerprint())
    }
}
