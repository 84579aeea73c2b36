//! Staleness analysis and the per-output sidecar record.
//!
//! A node is rebuilt when its output is missing, an input is newer than
//! the output, the rule's version or the context digest no longer match
//! what the sidecar recorded, the input set itself changed, or a non-input
//! dependency is newer. Anything else is fresh and costs only cached
//! stats.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::builder::fsview::FsView;
use crate::builder::graph::Node;
use crate::core::paths::Project;
use crate::errors::BuildError;
use crate::util::fs as kfs;

/// Suffix of the metadata record written next to each output.
pub const SIDECAR_SUFFIX: &str = ".__meta__";

/// What the last successful build of an output looked like.
///
/// Written only on success, so a failed build leaves the node stale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sidecar {
    /// Capability version at build time.
    pub version_tag: u32,

    /// Digest of the context view at build time.
    pub context_digest: String,

    /// The expanded input list, so adding or removing a glob or computed
    /// input is detected even when mtimes are quiet.
    pub inputs: Vec<String>,

    /// Content hashes of inputs, recorded for hash-checked rules only.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub input_hashes: BTreeMap<String, String>,
}

impl Sidecar {
    /// Project-relative path of the sidecar for `target`.
    pub fn path_for(target: &str) -> String {
        format!("{target}{SIDECAR_SUFFIX}")
    }

    /// Load the sidecar for `target`. Missing or unparsable records come
    /// back as `None`; either way the node will rebuild.
    pub fn load(project: &Project, target: &str) -> Option<Sidecar> {
        let abs = project.abspath(&Self::path_for(target));
        let contents = std::fs::read_to_string(abs).ok()?;
        match serde_json::from_str(&contents) {
            Ok(sidecar) => Some(sidecar),
            Err(e) => {
                tracing::warn!("discarding unparsable sidecar for {}: {}", target, e);
                None
            }
        }
    }

    /// Persist the sidecar for `target`.
    pub fn save(&self, project: &Project, target: &str) -> Result<(), BuildError> {
        let abs = project.abspath(&Self::path_for(target));
        let contents = serde_json::to_string_pretty(self)
            .map_err(|e| BuildError::io(Self::path_for(target), e))?;
        kfs::write_string(&abs, &contents).map_err(|e| BuildError::io(Self::path_for(target), e))
    }
}

/// The verdict for one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Freshness {
    /// Up to date; the capability is not invoked.
    Fresh,
    /// Needs a rebuild. `changed` is the subset of inputs responsible,
    /// which is every input when the output has to be recreated from
    /// scratch.
    Stale { changed: Vec<String> },
}

impl Freshness {
    /// True if the node needs building.
    pub fn is_stale(&self) -> bool {
        matches!(self, Freshness::Stale { .. })
    }
}

/// Decide whether `node` needs rebuilding.
///
/// Called in dependency order, after the node's children have finished,
/// so input mtimes reflect this build.
pub fn check(project: &Project, view: &FsView, node: &Node) -> Result<Freshness, BuildError> {
    let out = view.stat(project, &node.target);

    if !out.exists {
        tracing::debug!("{} not up to date: output missing", node.target);
        return Ok(stale_all(node));
    }

    let Some(sidecar) = Sidecar::load(project, &node.target) else {
        tracing::debug!("{} not up to date: no sidecar", node.target);
        return Ok(stale_all(node));
    };

    if sidecar.version_tag != node.version_tag {
        tracing::debug!(
            "{} not up to date: rule version {} -> {}",
            node.target,
            sidecar.version_tag,
            node.version_tag
        );
        return Ok(stale_all(node));
    }

    if sidecar.context_digest != node.context_view.digest() {
        tracing::debug!("{} not up to date: context changed", node.target);
        return Ok(stale_all(node));
    }

    let recorded: BTreeSet<&String> = sidecar.inputs.iter().collect();
    let current: BTreeSet<&String> = node.inputs.iter().collect();
    if recorded != current {
        let changed: Vec<String> = recorded
            .symmetric_difference(&current)
            .map(|s| s.to_string())
            .collect();
        tracing::debug!(
            "{} not up to date: input set changed ({:?})",
            node.target,
            changed
        );
        return Ok(Freshness::Stale { changed });
    }

    let mut changed = Vec::new();
    for input in &node.inputs {
        let info = view.stat(project, input);
        if !info.exists {
            if input.starts_with('/') {
                // Opaque host-binary input; absence is not ours to judge.
                continue;
            }
            tracing::debug!("{} not up to date: {} is missing", node.target, input);
            changed.push(input.clone());
            continue;
        }
        // Same-nanosecond writes count as fresh.
        if info.mtime_ns > out.mtime_ns {
            if node.rule.hash_inputs() {
                let current_hash = view.hash(project, input)?;
                if sidecar.input_hashes.get(input) == Some(&current_hash) {
                    tracing::debug!(
                        "{}: {} mtime moved but content is unchanged",
                        node.target,
                        input
                    );
                    continue;
                }
            }
            tracing::debug!("{} not up to date: {} has changed", node.target, input);
            changed.push(input.clone());
        }
    }

    if !changed.is_empty() {
        return Ok(Freshness::Stale { changed });
    }

    for dep in &node.non_input_deps {
        let info = view.stat(project, dep);
        if info.exists && info.mtime_ns > out.mtime_ns {
            tracing::debug!(
                "{} not up to date: non-input dep {} is newer",
                node.target,
                dep
            );
            // Non-input deps are not handed to the capability, so the
            // changed list stays input-only.
            return Ok(Freshness::Stale {
                changed: Vec::new(),
            });
        }
    }

    tracing::debug!("{} is up to date", node.target);
    Ok(Freshness::Fresh)
}

/// Build the sidecar to persist after a successful build of `node`.
pub fn sidecar_for(
    project: &Project,
    view: &FsView,
    node: &Node,
) -> Result<Sidecar, BuildError> {
    let mut input_hashes = BTreeMap::new();
    if node.rule.hash_inputs() {
        for input in &node.inputs {
            if view.stat(project, input).exists {
                input_hashes.insert(input.clone(), view.hash(project, input)?);
            }
        }
    }
    Ok(Sidecar {
        version_tag: node.version_tag,
        context_digest: node.context_view.digest(),
        inputs: node.inputs.clone(),
        input_hashes,
    })
}

fn stale_all(node: &Node) -> Freshness {
    Freshness::Stale {
        changed: node.inputs.clone(),
    }
}
