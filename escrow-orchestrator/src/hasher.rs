//! Content fingerprints
//!
//! SHA-256 digests rendered as 64 lowercase hex characters. A fingerprint is
//! the content-addressing key for every evidence and audit link.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::{canonical::canonicalize, EscrowResult};

/// Hex-encoded SHA-256 digest
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fingerprint raw document bytes
pub fn hash_bytes(bytes: &[u8]) -> Fingerprint {
    Fingerprint(hex::encode(Sha256::digest(bytes)))
}

/// Canonicalize a value, then fingerprint its UTF-8 bytes
pub fn hash_event<T: Serialize + ?Sized>(event: &T) -> EscrowResult<Fingerprint> {
    let canonical = canonicalize(event)?;
    Ok(hash_bytes(canonical.as_bytes()))
}
