//! Item fingerprints for change detection.
//!
//! A fingerprint is a SHA-256 digest over every field that is not classed
//! `Never`. Two items with equal fingerprints are considered unchanged
//! relative to each other.

use crate::{classifier::ItemClassifier, EquivalenceClass, Error, Item};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Fixed size digest of an item's comparison-relevant content.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Digest length in bytes.
    pub const LEN: usize = 32;

    /// Fingerprint of an item under the given classifier.
    ///
    /// Fields are fed in name order as `name \0 canonical-json \0`; null
    /// values are skipped the same way comparisons treat them as absent.
    pub fn of(item: &Item, classifier: &ItemClassifier) -> Self {
        let mut hasher = Sha256::new();
        for (name, value) in item.fields() {
            if value.is_null() || classifier.classify(name) == EquivalenceClass::Never {
                continue;
            }
            hasher.update(name.as_bytes());
            hasher.update([0u8]);
            hasher.update(value.to_string().as_bytes());
            hasher.update([0u8]);
        }
        Self(hasher.finalize().into())
    }

    /// Digest of raw bytes, used for snapshot checksums.
    pub fn digest(bytes: &[u8]) -> Self {
        Self(Sha256::digest(bytes).into())
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Whether this is the all-zero placeholder.
    pub fn is_empty(&self) -> bool {
        self.0 == [0u8; 32]
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(digits: &str) -> crate::error::Result<Self> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(digits, &mut bytes)
            .map_err(|e| Error::InvalidSnapshot(format!("bad fingerprint '{}': {}", digits, e)))?;
        Ok(Self(bytes))
    }
}

impl std::fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Fingerprint({})", &self.to_hex()[..12])
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl TryFrom<String> for Fingerprint {
    type Error = Error;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        Self::from_hex(&value)
    }
}

impl From<Fingerprint> for String {
    fn from(fp: Fingerprint) -> Self {
        fp.to_hex()
    }
}
