//! The engine: the public face of the build system.
//!
//! An [`Engine`] owns the rule registry, the filesystem view, the
//! single-flight table, and a worker pool. Nothing is process-global;
//! several independent engines can coexist in one process, which is how
//! the test suite isolates projects from each other.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::builder::executor::{self, CancelToken};
use crate::builder::flight::FlightTable;
use crate::builder::fsview::FsView;
use crate::builder::graph::Resolver;
use crate::core::context::BuildContext;
use crate::core::paths::{self, Project};
use crate::core::registry::RuleRegistry;
use crate::core::rule::{Capability, Rule};
use crate::errors::BuildError;

/// Configuration fixed at engine construction, before any rules are
/// registered.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    project_root: PathBuf,
    genfiles_prefix: String,
    workers: usize,
    computed_inputs_limit: usize,
    subprocess_timeout: Option<Duration>,
}

impl EngineConfig {
    /// Defaults: outputs under `genfiles/`, one worker per CPU, ten
    /// rounds of computed-input discovery, no subprocess timeout.
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        EngineConfig {
            project_root: project_root.into(),
            genfiles_prefix: "genfiles".to_string(),
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            computed_inputs_limit: 10,
            subprocess_timeout: None,
        }
    }

    /// Directory (relative to the root) that generated files live under.
    pub fn genfiles_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.genfiles_prefix = prefix.into();
        self
    }

    /// Number of nodes that may build concurrently.
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Maximum rounds of the computed-inputs fixpoint before giving up.
    pub fn computed_inputs_limit(mut self, limit: usize) -> Self {
        self.computed_inputs_limit = limit.max(1);
        self
    }

    /// Kill capability subprocesses that outlive this and fail the node
    /// with a timeout.
    pub fn subprocess_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.subprocess_timeout = timeout;
        self
    }
}

/// Per-invocation options for the build entry points.
#[derive(Clone, Default)]
pub struct BuildOptions {
    cancel: CancelToken,
    force: bool,
}

impl BuildOptions {
    pub fn new() -> Self {
        BuildOptions::default()
    }

    /// Attach a cancellation token the host can trip from another
    /// thread.
    pub fn cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Rebuild every node in the plan even if it is up to date. Useful
    /// when outputs are suspected of being wrong on disk, or when
    /// debugging a rule.
    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// The cancellation token for this invocation.
    pub fn cancel(&self) -> &CancelToken {
        &self.cancel
    }

    /// Whether freshness checks are bypassed.
    pub fn is_forced(&self) -> bool {
        self.force
    }
}

/// An embedded build engine. See the crate docs for the model.
pub struct Engine {
    project: Project,
    registry: RuleRegistry,
    view: FsView,
    flights: FlightTable,
    pool: rayon::ThreadPool,
    computed_inputs_limit: usize,
    subprocess_timeout: Option<Duration>,
}

impl Engine {
    /// Build an engine from configuration.
    pub fn new(config: EngineConfig) -> Result<Engine> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.workers)
            .thread_name(|i| format!("kake-worker-{i}"))
            .build()
            .context("failed to build worker pool")?;

        Ok(Engine {
            project: Project::new(config.project_root, config.genfiles_prefix),
            registry: RuleRegistry::new(),
            view: FsView::new(),
            flights: FlightTable::new(),
            pool,
            computed_inputs_limit: config.computed_inputs_limit,
            subprocess_timeout: config.subprocess_timeout,
        })
    }

    /// The project this engine builds.
    pub fn project(&self) -> &Project {
        &self.project
    }

    /// The shared filesystem view.
    pub fn view(&self) -> &FsView {
        &self.view
    }

    pub(crate) fn registry(&self) -> &RuleRegistry {
        &self.registry
    }

    pub(crate) fn flights(&self) -> &FlightTable {
        &self.flights
    }

    pub(crate) fn pool(&self) -> &rayon::ThreadPool {
        &self.pool
    }

    pub(crate) fn computed_inputs_limit(&self) -> usize {
        self.computed_inputs_limit
    }

    pub(crate) fn subprocess_timeout(&self) -> Option<Duration> {
        self.subprocess_timeout
    }

    /// Register a rule. Rules are registered once at host startup and
    /// live for the life of the engine.
    pub fn register(&self, rule: Rule) -> Result<(), BuildError> {
        self.registry.register(&self.project, rule)
    }

    /// Convenience form of [`register`](Self::register) for rules with no
    /// extra options.
    pub fn register_compile(
        &self,
        label: impl Into<String>,
        output_pattern: &str,
        input_patterns: impl IntoIterator<Item = impl Into<String>>,
        capability: Arc<dyn Capability>,
    ) -> Result<(), BuildError> {
        self.register(Rule::new(label, output_pattern, input_patterns, capability)?)
    }

    /// Bring one target up to date. Returns whether it was actually
    /// rebuilt.
    pub fn build(&self, target: &str, context: &BuildContext) -> Result<bool, BuildError> {
        let canonical = paths::canonicalize(target)?;
        let rebuilt = self.build_many(&[target], context)?;
        Ok(rebuilt.contains(&canonical))
    }

    /// Bring several targets up to date over one shared plan, coalescing
    /// common dependencies. Returns the requested targets that were
    /// rebuilt.
    pub fn build_many<S: AsRef<str>>(
        &self,
        targets: &[S],
        context: &BuildContext,
    ) -> Result<Vec<String>, BuildError> {
        self.build_with(targets, context, &BuildOptions::new())
    }

    /// [`build_many`](Self::build_many) with per-invocation options:
    /// host-controlled cancellation and forced rebuilds.
    pub fn build_with<S: AsRef<str>>(
        &self,
        targets: &[S],
        context: &BuildContext,
        options: &BuildOptions,
    ) -> Result<Vec<String>, BuildError> {
        let targets: Vec<String> = targets
            .iter()
            .map(|t| paths::canonicalize(t.as_ref()))
            .collect::<Result<_, _>>()?;

        let plan = Resolver::new(self, context, options.is_forced()).resolve(&targets)?;
        let rebuilt = executor::execute(self, &plan, options)?;

        Ok(rebuilt
            .into_iter()
            .filter(|t| targets.contains(t))
            .collect())
    }

    /// Drop every cached stat and hash. Call when files may have changed
    /// behind the engine's back, e.g. on a watcher gap or a signal.
    pub fn invalidate_filesystem_view(&self) {
        tracing::debug!("invalidating the filesystem view");
        self.view.invalidate_all();
    }

    /// Build one target right now, in the middle of resolving another.
    /// Used by input discovery when it must read a generated file. A
    /// forced outer build forces the immediate one too, matching what
    /// the caller asked for.
    pub(crate) fn build_now(
        &self,
        target: &str,
        context: &BuildContext,
        stack: &[String],
        force: bool,
    ) -> Result<(), BuildError> {
        let target = paths::canonicalize(target)?;
        if stack.iter().any(|t| t == &target) {
            let start = stack.iter().position(|t| t == &target).unwrap_or(0);
            let mut chain = stack[start..].to_vec();
            chain.push(target);
            return Err(BuildError::CycleDetected { chain });
        }

        tracing::debug!("immediate build of {} to discover inputs", target);
        let plan = Resolver::with_stack(self, context, stack.to_vec(), force)
            .resolve(&[target])?;
        executor::execute(self, &plan, &BuildOptions::new().force(force))?;
        Ok(())
    }
}
