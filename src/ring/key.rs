//! Fixed-size keys used for ring positions, object names, and checksums.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Size of a DSDC key in bytes.
pub const KEY_SIZE: usize = 20;

/// A 20-byte key. Object names, ring node positions, membership snapshot
/// fingerprints, and content checksums are all values of this type; keys
/// compare byte-wise so that `BTreeMap<Key, _>` gives ring order for free.
#[derive(
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    Serialize,
    Deserialize,
)]
pub struct Key([u8; KEY_SIZE]);

/// Content checksums are keys over the object's value bytes.
pub type Cksum = Key;

impl Key {
    /// The all-zeroes key, used as the "have nothing" fingerprint.
    pub fn zero() -> Self {
        Key([0; KEY_SIZE])
    }

    /// Creates a key from raw bytes.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Key(bytes)
    }

    /// Digests arbitrary bytes down to a key (SHA-256 truncated to 20
    /// bytes).
    pub fn digest(data: &[u8]) -> Self {
        let hash = Sha256::digest(data);
        let mut bytes = [0u8; KEY_SIZE];
        bytes.copy_from_slice(&hash[..KEY_SIZE]);
        Key(bytes)
    }

    /// Digests a UTF-8 name down to a key.
    pub fn of_name(name: &str) -> Self {
        Self::digest(name.as_bytes())
    }

    /// Checks that `data` digests back to this key. Used to validate an
    /// object's bytes against its stored checksum.
    pub fn verify(&self, data: &[u8]) -> bool {
        *self == Self::digest(data)
    }

    /// Borrows the raw key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// True if this is the all-zeroes key.
    pub fn is_zero(&self) -> bool {
        self.0 == [0; KEY_SIZE]
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        // abbreviated hex is plenty for log lines
        for byte in &self.0[..4] {
            write!(f, "{:02x}", byte)?;
        }
        write!(f, "..")
    }
}
