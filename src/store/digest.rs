use std::io::Read;

use sha2::{Digest, Sha256};

use crate::codec::{self, Encoding};
use crate::error::Result;

/// Running content hash of a slice.
///
/// Grains must be fed in `grain_key` order. Each contributes
/// `sha256(grain_key || decoded payload)`; the slice hash is the SHA-256 of
/// those digests, hex encoded. Payloads are decoded straight into the hasher.
pub struct ContentDigest {
    outer: Sha256,
    count: i64,
}

impl Default for ContentDigest {
    fn default() -> Self {
        Self::new()
    }
}

impl ContentDigest {
    #[must_use]
    pub fn new() -> Self {
        Self {
            outer: Sha256::new(),
            count: 0,
        }
    }

    pub fn add(&mut self, grain_key: &str, encoding: Encoding, payload: &str) -> Result<()> {
        self.add_reader(grain_key, encoding, payload.as_bytes())
    }

    /// Like [`add`](Self::add), reading the payload text from `payload`.
    pub fn add_reader<R: Read>(&mut self, grain_key: &str, encoding: Encoding, payload: R) -> Result<()> {
        let mut inner = Sha256::new();
        inner.update(grain_key.as_bytes());
        codec::decode_from(payload, encoding, &mut inner)?;
        self.outer.update(inner.finalize());
        self.count += 1;
        Ok(())
    }

    #[must_use]
    pub fn count(&self) -> i64 {
        self.count
    }

    #[must_use]
    pub fn finish(self) -> String {
        hex::encode(self.outer.finalize())
    }
}
