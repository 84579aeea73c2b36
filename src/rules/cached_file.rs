//! A capability whose output is a stable digest of its inputs.
//!
//! Downstream rules depend on the digest file instead of the raw inputs.
//! Because the digest only changes when input *content* changes, a
//! whitespace-preserving touch upstream stops cascading right here.
//! Register the rule with `with_hash_inputs(true)` so the digest itself
//! is also skipped when contents are unchanged.

use crate::core::rule::{BuildCx, Capability};
use crate::errors::BuildError;
use crate::util::fs as kfs;
use crate::util::hash::{sha256_file, Fingerprint};

/// Writes one line: the combined content hash of every input, in input
/// order.
#[derive(Debug, Default)]
pub struct CachedFile;

impl CachedFile {
    pub fn new() -> Self {
        CachedFile
    }
}

impl Capability for CachedFile {
    fn version(&self) -> u32 {
        1
    }

    fn build(
        &self,
        cx: &BuildCx<'_>,
        output: &str,
        inputs: &[String],
        _changed: &[String],
    ) -> Result<(), BuildError> {
        let mut fp = Fingerprint::new();
        for input in inputs {
            let hash = sha256_file(&cx.abspath(input)).map_err(|e| BuildError::io(input, e))?;
            fp.update_kv(input, &hash);
        }

        let digest = fp.finish();
        kfs::write_string(&cx.abspath(output), &digest)
            .map_err(|e| BuildError::io(output, e))?;
        Ok(())
    }
}
