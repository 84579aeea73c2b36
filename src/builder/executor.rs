//! The build executor.
//!
//! Walks a plan level by level, running independent nodes in parallel on
//! the engine's thread pool. Each node is claimed through the
//! single-flight table, checked for staleness, and then either skipped,
//! satisfied by a symlink, or built by its capability.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use rayon::prelude::*;

use crate::builder::engine::{BuildOptions, Engine};
use crate::builder::flight::{Claim, FlightResult};
use crate::builder::graph::{Node, Plan};
use crate::builder::staleness::{self, Freshness};
use crate::core::rule::BuildCx;
use crate::errors::BuildError;
use crate::util::fs as kfs;

/// Cooperative cancellation for a build invocation.
///
/// Cancelling stops new nodes from being dispatched; capability `build`
/// calls already running are allowed to finish.
#[derive(Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        CancelToken::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// True once cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Drive a plan to completion. Returns every target that was actually
/// rebuilt.
///
/// The first failure relevant to a requested root is returned; other
/// failures are logged. Siblings already dispatched when a node fails run
/// to completion, and nodes downstream of a failure are failed without
/// being dispatched.
pub fn execute(
    engine: &Engine,
    plan: &Plan,
    options: &BuildOptions,
) -> Result<Vec<String>, BuildError> {
    if plan.is_empty() {
        return Ok(Vec::new());
    }

    tracing::debug!("executing plan with {} nodes", plan.len());

    let failures: Mutex<HashMap<String, BuildError>> = Mutex::new(HashMap::new());
    let rebuilt: Mutex<Vec<String>> = Mutex::new(Vec::new());

    for level in plan.levels() {
        engine.pool().install(|| {
            level.par_iter().for_each(|target| {
                let node = plan.node(target).expect("level entry without node");

                if options.cancel().is_cancelled() {
                    failures.lock().unwrap().insert(
                        target.clone(),
                        BuildError::Cancelled {
                            target: target.clone(),
                        },
                    );
                    return;
                }

                let failed_dep = {
                    let failed = failures.lock().unwrap();
                    node.inputs
                        .iter()
                        .chain(node.non_input_deps.iter())
                        .find(|dep| failed.contains_key(*dep))
                        .cloned()
                };
                if let Some(dep) = failed_dep {
                    failures.lock().unwrap().insert(
                        target.clone(),
                        BuildError::BuildFailed {
                            label: node.rule.label().to_string(),
                            output: target.clone(),
                            argv: None,
                            stderr: None,
                            message: format!("dependency `{dep}` failed to build"),
                        },
                    );
                    return;
                }

                match build_node(engine, node, options.is_forced()) {
                    Ok(true) => rebuilt.lock().unwrap().push(target.clone()),
                    Ok(false) => {}
                    Err(e) => {
                        failures.lock().unwrap().insert(target.clone(), e);
                    }
                }
            });
        });
    }

    let failures = failures.into_inner().unwrap();
    if failures.is_empty() {
        return Ok(rebuilt.into_inner().unwrap());
    }

    if failures.len() > 1 {
        tracing::warn!("{} targets failed in this build", failures.len());
        for (target, error) in &failures {
            tracing::warn!("  {}: {}", target, error);
        }
    }

    // Prefer the failure attached to a requested root; everything else
    // cascaded into one of those anyway.
    let chosen = plan
        .roots()
        .iter()
        .find_map(|root| failures.get(root))
        .cloned()
        .unwrap_or_else(|| {
            let mut keys: Vec<&String> = failures.keys().collect();
            keys.sort();
            failures[keys[0]].clone()
        });
    Err(chosen)
}

/// Build one node through the single-flight table.
fn build_node(engine: &Engine, node: &Node, force: bool) -> FlightResult {
    match engine.flights().claim(&node.split_group) {
        Claim::Follower(waiter) => {
            tracing::debug!("attaching to in-flight build of {}", node.target);
            waiter.wait()
        }
        Claim::Leader(guard) => {
            let result = build_as_leader(engine, node, force);
            guard.complete(result.clone());
            result
        }
    }
}

/// The leader path: staleness check, then symlink fast path or capability
/// invocation, then bookkeeping.
fn build_as_leader(engine: &Engine, node: &Node, force: bool) -> FlightResult {
    let project = engine.project();
    let view = engine.view();

    // A forced build skips the freshness check entirely and treats every
    // input as changed.
    let changed = if force {
        tracing::debug!("{} rebuild forced", node.target);
        node.inputs.clone()
    } else {
        match staleness::check(project, view, node)? {
            Freshness::Fresh => return Ok(false),
            Freshness::Stale { changed } => changed,
        }
    };

    for output in &node.split_group {
        kfs::ensure_parent_dir(&project.abspath(output))
            .map_err(|e| BuildError::io(output, e))?;
    }

    if let Some(candidate) = &node.symlink_to {
        if view.stat(project, candidate).exists {
            tracing::debug!("building {} by symlinking to {}", node.target, candidate);
            kfs::symlink_relative(&project.abspath(candidate), &project.abspath(&node.target))
                .map_err(|e| BuildError::io(&node.target[..], e))?;
            finish_outputs(engine, node)?;
            tracing::info!("built {} -> {}", node.target, candidate);
            return Ok(true);
        }
        tracing::debug!(
            "symlink candidate {} for {} does not exist; building normally",
            candidate,
            node.target
        );
    }

    // A leftover symlink must go before a real build, or the capability
    // would write through it into the link target.
    let abs_output = project.abspath(&node.target);
    if abs_output
        .symlink_metadata()
        .map(|m| m.file_type().is_symlink())
        .unwrap_or(false)
    {
        std::fs::remove_file(&abs_output).map_err(|e| BuildError::io(&node.target[..], e))?;
    }

    tracing::debug!(
        "building {} (changed: {:?})",
        node.target,
        changed
    );
    let cx = BuildCx::new(
        project,
        node.rule.label(),
        &node.target,
        &node.context,
        engine.subprocess_timeout(),
    );
    node.rule
        .capability()
        .build(&cx, &node.target, &node.inputs, &changed)?;

    finish_outputs(engine, node)?;
    tracing::info!("built {}", node.target);
    Ok(true)
}

/// Post-build bookkeeping for the whole split group: invalidate the view,
/// verify the outputs exist, then persist sidecars. Sidecars are written
/// last so a failure here leaves the node stale.
fn finish_outputs(engine: &Engine, node: &Node) -> Result<(), BuildError> {
    let project = engine.project();
    let view = engine.view();

    for output in &node.split_group {
        view.invalidate(output);
        if !view.stat(project, output).exists {
            return Err(BuildError::MissingOutput {
                label: node.rule.label().to_string(),
                output: output.clone(),
            });
        }
    }

    let sidecar = staleness::sidecar_for(project, view, node)?;
    for output in &node.split_group {
        sidecar.save(project, output)?;
    }
    Ok(())
}
