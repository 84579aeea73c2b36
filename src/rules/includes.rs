//! Transitive include-line scanning for computed inputs.
//!
//! Many languages name their dependencies in source text: `#include` for
//! C, `@import` for stylesheets, `require()` for scripts. A scanner turns
//! those lines into extra inputs so touching an included file rebuilds
//! everything that pulls it in, transitively.

use regex::Regex;

use crate::core::rule::InputsCx;
use crate::errors::BuildError;

/// Finds include-style references with a regex and follows them
/// transitively.
///
/// The regex must have exactly one capture group yielding the included
/// path, which is resolved relative to the including file. Intended for
/// use inside [`Capability::computed_inputs`](crate::Capability): hand it
/// the current inputs as seeds and return what it discovers.
#[derive(Debug, Clone)]
pub struct IncludeScanner {
    pattern: Regex,
}

impl IncludeScanner {
    /// Compile a scanner from a regex with one capture group, e.g.
    /// `@import\s+"([^"]+)"`.
    pub fn new(pattern: &str) -> Result<Self, BuildError> {
        let pattern = Regex::new(pattern).map_err(|e| BuildError::InvalidRule {
            label: pattern.to_string(),
            reason: format!("include regex does not compile: {e}"),
        })?;
        if pattern.captures_len() != 2 {
            return Err(BuildError::InvalidRule {
                label: pattern.to_string(),
                reason: "include regex needs exactly one capture group".to_string(),
            });
        }
        Ok(IncludeScanner { pattern })
    }

    /// Scan `seeds` and everything they include, returning the includes
    /// discovered (the seeds themselves are not repeated).
    ///
    /// Generated files are brought up to date before being read, since an
    /// include line may live in a file that is itself built. A seed that
    /// cannot be read yet is skipped; the fixpoint in the resolver will
    /// come back to it once it exists.
    pub fn transitive(
        &self,
        cx: &InputsCx<'_>,
        seeds: &[String],
    ) -> Result<Vec<String>, BuildError> {
        let mut queue: Vec<String> = seeds.to_vec();
        let mut discovered: Vec<String> = Vec::new();
        let mut index = 0;

        while index < queue.len() {
            let file = queue[index].clone();
            index += 1;

            cx.ensure_built(&file)?;
            let Ok(contents) = std::fs::read_to_string(cx.project().abspath(&file)) else {
                tracing::debug!("cannot read {} yet; skipping its includes", file);
                continue;
            };

            for caps in self.pattern.captures_iter(&contents) {
                let includee = resolve_includee(&file, &caps[1])?;
                if !queue.contains(&includee) {
                    tracing::debug!("{} includes {}", file, includee);
                    queue.push(includee.clone());
                    discovered.push(includee);
                }
            }
        }

        Ok(discovered)
    }
}

/// Resolve an include reference relative to the including file, keeping
/// the result inside the project.
fn resolve_includee(includer: &str, includee: &str) -> Result<String, BuildError> {
    let dir = match includer.rfind('/') {
        Some(i) => &includer[..i],
        None => "",
    };
    let joined = if dir.is_empty() {
        includee.to_string()
    } else {
        format!("{dir}/{includee}")
    };

    let mut parts: Vec<&str> = Vec::new();
    for part in joined.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if parts.pop().is_none() {
                    return Err(BuildError::bad_request(format!(
                        "include `{includee}` in `{includer}` escapes the project root"
                    )));
                }
            }
            p => parts.push(p),
        }
    }
    Ok(parts.join("/"))
}
