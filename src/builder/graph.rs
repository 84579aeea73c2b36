//! Dependency-graph construction.
//!
//! The resolver expands a requested target into a plan: one node per
//! generated file, each carrying its rule, variable bindings, fully
//! expanded input list, and a level. Leaves (source files) are level 0 and
//! are not stored; a node's level is one above its deepest dependency, so
//! building level by level satisfies every edge.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crate::builder::engine::Engine;
use crate::core::context::BuildContext;
use crate::core::paths;
use crate::core::pattern::{self, Bindings};
use crate::core::rule::{InputsCx, Rule};
use crate::errors::BuildError;

/// A rule instantiated against one concrete target.
#[derive(Clone)]
pub struct Node {
    pub target: String,
    pub rule: Arc<Rule>,
    pub bindings: Bindings,
    /// Caller context with pattern bindings layered on top.
    pub context: BuildContext,
    /// `context` restricted to the rule's used keys; this is what the
    /// staleness digest covers.
    pub context_view: BuildContext,
    /// Capability version at plan time.
    pub version_tag: u32,
    /// Fully expanded inputs, in order: static first, computed appended.
    pub inputs: Vec<String>,
    /// Built before this node, not passed to the capability.
    pub non_input_deps: Vec<String>,
    /// Symlink fast-path candidate, if the capability offers one.
    pub symlink_to: Option<String>,
    /// Every output produced by one `build` call, sorted; contains at
    /// least the target itself.
    pub split_group: Vec<String>,
    pub level: usize,
}

/// The DAG of nodes rooted at the requested targets.
pub struct Plan {
    nodes: HashMap<String, Node>,
    /// Targets grouped by level, ascending from 1.
    levels: Vec<Vec<String>>,
    roots: Vec<String>,
}

impl Plan {
    /// Look up a node by target.
    pub fn node(&self, target: &str) -> Option<&Node> {
        self.nodes.get(target)
    }

    /// Targets grouped by level; build each group after the previous one.
    pub fn levels(&self) -> &[Vec<String>] {
        &self.levels
    }

    /// The generated targets the host asked for.
    pub fn roots(&self) -> &[String] {
        &self.roots
    }

    /// Number of nodes in the plan.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True if nothing needs building.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

struct Slot {
    node: Node,
    /// None while the node's dependencies are still being resolved;
    /// revisiting such a node is how cycles surface.
    level: Option<usize>,
}

/// Expands targets into a [`Plan`].
pub struct Resolver<'e> {
    engine: &'e Engine,
    context: &'e BuildContext,
    /// Forced builds carry through to immediate builds run for input
    /// discovery.
    force: bool,
    slots: HashMap<String, Slot>,
    stack: Vec<String>,
}

impl<'e> Resolver<'e> {
    pub fn new(engine: &'e Engine, context: &'e BuildContext, force: bool) -> Self {
        Resolver::with_stack(engine, context, Vec::new(), force)
    }

    /// A resolver whose cycle-detection stack is seeded from an outer
    /// resolution, so immediate builds triggered during input discovery
    /// still catch cycles that span the two.
    pub fn with_stack(
        engine: &'e Engine,
        context: &'e BuildContext,
        stack: Vec<String>,
        force: bool,
    ) -> Self {
        Resolver {
            engine,
            context,
            force,
            slots: HashMap::new(),
            stack,
        }
    }

    /// Resolve every target (plus dependencies) into a plan.
    pub fn resolve(mut self, targets: &[String]) -> Result<Plan, BuildError> {
        let mut roots = Vec::new();
        for target in targets {
            let target = paths::canonicalize(target)?;
            self.add_target(&target)?;
            if self.engine.project().is_generated(&target) {
                roots.push(target);
            }
        }

        let mut levels: Vec<Vec<String>> = Vec::new();
        let mut nodes = HashMap::new();
        for (target, slot) in self.slots {
            let mut node = slot.node;
            node.level = slot.level.unwrap_or(1);
            while levels.len() < node.level {
                levels.push(Vec::new());
            }
            levels[node.level - 1].push(target.clone());
            nodes.insert(target, node);
        }
        // Deterministic order within a level.
        for level in &mut levels {
            level.sort();
        }

        Ok(Plan {
            nodes,
            levels,
            roots,
        })
    }

    /// Add one target and everything it depends on. Returns the target's
    /// level.
    fn add_target(&mut self, target: &str) -> Result<usize, BuildError> {
        let project = self.engine.project();

        if !project.is_generated(target) {
            if target.starts_with('/') {
                // Host-binary input; opaque to the graph.
                return Ok(0);
            }
            // Source files must exist; there is no rule to make them.
            if !self.engine.view().stat(project, target).exists {
                return Err(BuildError::bad_request(format!(
                    "source file `{target}` does not exist"
                )));
            }
            return Ok(0);
        }

        if let Some(slot) = self.slots.get(target) {
            return match slot.level {
                Some(level) => Ok(level),
                None => Err(self.cycle_error(target)),
            };
        }
        if self.stack.iter().any(|t| t == target) {
            return Err(self.cycle_error(target));
        }

        let Some((rule, bindings)) = self.engine.registry().find(target) else {
            return Err(BuildError::UnknownTarget {
                target: target.to_string(),
            });
        };
        tracing::debug!("{} matches compile rule `{}`", target, rule.label());

        // On the stack from here on, so input discovery that reaches back
        // into this target (through an immediate build) is caught as a
        // cycle instead of recursing forever. Errors abandon the whole
        // resolver, so there is no unwind bookkeeping.
        self.stack.push(target.to_string());

        let context = self.context.merged(&bindings);
        let context_view = context.restricted(&rule.capability().used_context_keys());
        let version_tag = rule.capability().version();

        let inputs = self.expand_inputs(target, &rule, &bindings, &context)?;

        let mut non_input_deps =
            pattern::resolve_patterns(project, rule.non_input_dep_patterns(), &bindings)?;
        non_input_deps.extend(rule.capability().non_input_deps(target, &bindings));
        let mut non_input_deps = canonicalize_all(&non_input_deps)?;

        let symlink_to = match rule.capability().maybe_symlink_to(target, &bindings) {
            Some(candidate) => {
                let candidate = paths::canonicalize(&candidate)?;
                if candidate != target {
                    // Build the candidate before us so the fast path has
                    // something to point at.
                    non_input_deps.push(candidate.clone());
                    Some(candidate)
                } else {
                    None
                }
            }
            None => None,
        };
        dedup_in_place(&mut non_input_deps);

        let mut split_group: BTreeSet<String> = rule
            .capability()
            .split_outputs(target, &bindings)
            .into_iter()
            .map(|p| paths::canonicalize(&p))
            .collect::<Result<_, _>>()?;
        split_group.insert(target.to_string());
        let split_group: Vec<String> = split_group.into_iter().collect();

        let node = Node {
            target: target.to_string(),
            rule: Arc::clone(&rule),
            bindings,
            context,
            context_view,
            version_tag,
            inputs: inputs.clone(),
            non_input_deps: non_input_deps.clone(),
            symlink_to,
            split_group,
            level: 0,
        };
        self.slots.insert(
            target.to_string(),
            Slot { node, level: None },
        );

        // Dependencies are inputs plus non-input deps; the latter only
        // promise build-before ordering.
        let mut deps: Vec<String> = inputs;
        deps.extend(non_input_deps);
        dedup_in_place(&mut deps);

        let mut max_dep_level = 0;
        for dep in &deps {
            let dep_level = self.add_target(dep)?;
            max_dep_level = max_dep_level.max(dep_level);
        }

        self.stack.pop();
        let level = max_dep_level + 1;
        self.slots.get_mut(target).unwrap().level = Some(level);
        tracing::debug!("adding {} to dependency graph at level {}", target, level);
        Ok(level)
    }

    /// Static input expansion followed by the computed-inputs fixpoint.
    fn expand_inputs(
        &self,
        target: &str,
        rule: &Arc<Rule>,
        bindings: &Bindings,
        context: &BuildContext,
    ) -> Result<Vec<String>, BuildError> {
        let project = self.engine.project();

        let static_inputs =
            pattern::resolve_patterns(project, rule.input_patterns(), bindings)?;
        let mut inputs = canonicalize_all(&static_inputs)?;
        dedup_in_place(&mut inputs);

        let engine = self.engine;
        let caller_context = self.context;
        let force = self.force;
        let stack = self.stack.clone();
        let ensure_built = move |path: &str| -> Result<(), BuildError> {
            engine.build_now(path, caller_context, &stack, force)
        };
        let cx = InputsCx::new(project, context, &ensure_built);

        let limit = self.engine.computed_inputs_limit();
        let mut rounds = 0;
        loop {
            let extra = rule.capability().computed_inputs(&cx, target, &inputs)?;
            let extra = canonicalize_all(&extra)?;
            let fresh: Vec<String> = {
                let known: BTreeSet<&String> = inputs.iter().collect();
                extra
                    .into_iter()
                    .filter(|p| !known.contains(p))
                    .collect()
            };
            if fresh.is_empty() {
                break;
            }
            // Computed inputs only ever grow; append in the order the
            // capability returned them.
            inputs.extend(fresh);
            dedup_in_place(&mut inputs);

            rounds += 1;
            if rounds >= limit {
                return Err(BuildError::ComputedInputsDivergence {
                    target: target.to_string(),
                    rounds,
                });
            }
        }

        Ok(inputs)
    }

    fn cycle_error(&self, target: &str) -> BuildError {
        let start = self
            .stack
            .iter()
            .position(|t| t == target)
            .unwrap_or(0);
        let mut chain: Vec<String> = self.stack[start..].to_vec();
        chain.push(target.to_string());
        BuildError::CycleDetected { chain }
    }
}

fn canonicalize_all(paths: &[String]) -> Result<Vec<String>, BuildError> {
    paths.iter().map(|p| paths::canonicalize(p)).collect()
}

fn dedup_in_place(paths: &mut Vec<String>) {
    let mut seen = BTreeSet::new();
    paths.retain(|p| seen.insert(p.clone()));
}
