//! A capability whose build is exactly a symlink to its single input.

use crate::core::rule::{BuildCx, Capability};
use crate::errors::BuildError;
use crate::util::fs as kfs;

/// Makes the output a relative symlink to the rule's one input.
#[derive(Debug, Default)]
pub struct CreateSymlink;

impl CreateSymlink {
    pub fn new() -> Self {
        CreateSymlink
    }
}

impl Capability for CreateSymlink {
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
        let [input] = inputs else {
            return Err(cx.failure(format!(
                "can only symlink to one file, got {} inputs",
                inputs.len()
            )));
        };

        kfs::symlink_relative(&cx.abspath(input), &cx.abspath(output))
            .map_err(|e| BuildError::io(output, e))
    }
}
