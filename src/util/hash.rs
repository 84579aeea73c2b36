//! Content hashing and the digests recorded in staleness sidecars.
//!
//! Everything the staleness analyzer compares by content flows through
//! here, which makes the framing part of the on-disk sidecar format:
//! changing it makes every recorded digest mismatch, so the format
//! version is folded into each digest and old sidecars simply read as
//! stale.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

// Bumped when the digest framing changes.
const FORMAT_VERSION: u32 = 1;

/// Hex length of a shortened digest as stored in sidecars.
const SHORT_LEN: usize = 16;

/// Content hash of a file, streamed through a 64k buffer.
pub fn sha256_file(path: &Path) -> Result<String> {
    let file = File::open(path)
        .with_context(|| format!("failed to open file for hashing: {}", path.display()))?;

    let mut reader = BufReader::with_capacity(64 * 1024, file);
    let mut hasher = Sha256::new();
    std::io::copy(&mut reader, &mut hasher)
        .with_context(|| format!("failed to read file for hashing: {}", path.display()))?;

    Ok(hex::encode(hasher.finalize()))
}

/// Accumulates the components of a staleness digest.
///
/// Components are length-prefixed rather than delimited, so a component
/// may contain any byte without colliding with its neighbors, and every
/// digest is seeded with the format version.
pub struct Fingerprint {
    hasher: Sha256,
}

impl Fingerprint {
    /// Start a digest, seeded with the format version.
    pub fn new() -> Self {
        let mut hasher = Sha256::new();
        hasher.update(FORMAT_VERSION.to_le_bytes());
        Fingerprint { hasher }
    }

    /// Add one string component.
    pub fn update_str(&mut self, s: &str) -> &mut Self {
        self.hasher.update((s.len() as u64).to_le_bytes());
        self.hasher.update(s.as_bytes());
        self
    }

    /// Add a key/value pair, e.g. a context variable or an input path
    /// with its content hash.
    pub fn update_kv(&mut self, key: &str, value: &str) -> &mut Self {
        self.update_str(key).update_str(value)
    }

    /// Finalize to a full hex digest.
    pub fn finish(self) -> String {
        hex::encode(self.hasher.finalize())
    }

    /// Finalize to the shortened form stored in sidecars.
    pub fn finish_short(self) -> String {
        self.finish()[..SHORT_LEN].to_string()
    }
}

impl Default for Fingerprint {
    fn default() -> Self {
        Fingerprint::new()
    }
}

/// Digest of a context view, as recorded in a sidecar.
///
/// The caller supplies the pairs in a stable order (the context map is
/// ordered); two views digest equal exactly when they hold the same keys
/// with the same values.
pub fn context_digest<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> String {
    let mut fp = Fingerprint::new();
    for (key, value) in pairs {
        fp.update_kv(key, value);
    }
    fp.finish_short()
}
