//! Content hashing: SHA-1 digests of files and of structured data.
//!
//! SHA-1 is what the on-disk dependency records carry; digests are rendered
//! as lowercase hex.

use std::io::Read;

use sha1::{Digest, Sha1};

use crate::error::Result;

const UNIT_SEPARATOR: u8 = 0x1F;

/// Digest of a file's bytes, streamed in chunks.
pub fn hash_file(path: &str) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha1::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Incremental hash over structured fields, with a separator between fields
/// so adjacent values cannot alias.
pub struct StableHasher(Sha1);

impl StableHasher {
    pub fn new() -> Self {
        StableHasher(Sha1::new())
    }

    pub fn field(&mut self, bytes: impl AsRef<[u8]>) -> &mut Self {
        self.0.update(bytes.as_ref());
        self.0.update([UNIT_SEPARATOR]);
        self
    }

    pub fn finish(self) -> String {
        hex::encode(self.0.finalize())
    }
}

impl Default for StableHasher {
    fn default() -> Self {
        StableHasher::new()
    }
}
