//! Compile rules and the capability contract they implement.
//!
//! A [`Rule`] pairs an output pattern with input patterns and a
//! [`Capability`], the object that knows how to produce the output. The
//! capability surface is one trait with optional methods; concrete rules
//! implement the subset they need.

use std::sync::Arc;
use std::time::Duration;

use crate::core::context::BuildContext;
use crate::core::paths::Project;
use crate::core::pattern::{Bindings, OutputPattern};
use crate::errors::BuildError;
use crate::util::process::{ProcessBuilder, ProcessError};

/// Everything a capability may need while building one output: the
/// project, the per-node context (caller variables plus pattern-variable
/// bindings), and subprocess helpers.
pub struct BuildCx<'a> {
    project: &'a Project,
    label: &'a str,
    output: &'a str,
    context: &'a BuildContext,
    subprocess_timeout: Option<Duration>,
}

impl<'a> BuildCx<'a> {
    pub(crate) fn new(
        project: &'a Project,
        label: &'a str,
        output: &'a str,
        context: &'a BuildContext,
        subprocess_timeout: Option<Duration>,
    ) -> Self {
        BuildCx {
            project,
            label,
            output,
            context,
            subprocess_timeout,
        }
    }

    /// The project being built.
    pub fn project(&self) -> &Project {
        self.project
    }

    /// The per-node context: caller variables with pattern bindings
    /// layered on top.
    pub fn context(&self) -> &BuildContext {
        self.context
    }

    /// Absolute path for a project-relative one.
    pub fn abspath(&self, rel: &str) -> std::path::PathBuf {
        self.project.abspath(rel)
    }

    /// A `BuildFailed` error tagged with this node's rule and output.
    pub fn failure(&self, message: impl Into<String>) -> BuildError {
        BuildError::BuildFailed {
            label: self.label.to_string(),
            output: self.output.to_string(),
            argv: None,
            stderr: None,
            message: message.into(),
        }
    }

    /// Run a subprocess with the project root as working directory,
    /// requiring a zero exit status.
    ///
    /// Stderr is captured and attached to the failure on a non-zero exit.
    pub fn call<S: AsRef<str>>(&self, argv: &[S]) -> Result<(), BuildError> {
        self.call_with_output(argv).map(|_| ())
    }

    /// Like [`call`](Self::call) but returns captured stdout.
    pub fn call_with_output<S: AsRef<str>>(&self, argv: &[S]) -> Result<Vec<u8>, BuildError> {
        let argv: Vec<String> = argv.iter().map(|s| s.as_ref().to_string()).collect();
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| self.failure("empty argv"))?;

        tracing::debug!("calling {:?} for {}", argv, self.output);
        let result = ProcessBuilder::new(program)
            .args(args)
            .cwd(self.project.root())
            .timeout(self.subprocess_timeout)
            .exec();

        let output = match result {
            Ok(output) => output,
            Err(ProcessError::TimedOut { timeout, .. }) => {
                return Err(BuildError::Timeout {
                    target: self.output.to_string(),
                    secs: timeout.as_secs(),
                })
            }
            Err(e) => return Err(self.failure(e.to_string())),
        };

        if !output.status.success() {
            return Err(BuildError::BuildFailed {
                label: self.label.to_string(),
                output: self.output.to_string(),
                argv: Some(argv.clone()),
                stderr: Some(String::from_utf8_lossy(&output.stderr).into_owned()),
                message: format!("`{}` exited with {}", argv.join(" "), output.status),
            });
        }

        Ok(output.stdout)
    }
}

/// Context handed to `computed_inputs`, which runs at plan time rather
/// than build time.
pub struct InputsCx<'a> {
    project: &'a Project,
    context: &'a BuildContext,
    ensure_built: &'a dyn Fn(&str) -> Result<(), BuildError>,
}

impl<'a> InputsCx<'a> {
    pub(crate) fn new(
        project: &'a Project,
        context: &'a BuildContext,
        ensure_built: &'a dyn Fn(&str) -> Result<(), BuildError>,
    ) -> Self {
        InputsCx {
            project,
            context,
            ensure_built,
        }
    }

    /// The project being built.
    pub fn project(&self) -> &Project {
        self.project
    }

    /// The per-node context.
    pub fn context(&self) -> &BuildContext {
        self.context
    }

    /// Bring a generated path up to date right now so the hook can read
    /// it. Source paths are a no-op. Needed when input discovery has to
    /// inspect a file that is itself built, e.g. imports of a generated
    /// stylesheet.
    pub fn ensure_built(&self, path: &str) -> Result<(), BuildError> {
        if self.project.is_generated(path) {
            (self.ensure_built)(path)
        } else {
            Ok(())
        }
    }
}

/// The contract compile rules implement.
///
/// `version` and `build` are required; everything else has a no-op
/// default. A capability's `build` must not call back into
/// [`Engine::build`](crate::Engine::build); concurrent requests for its
/// target are coalesced onto one in-flight build, so the nested call would
/// wait on itself. Reading files directly is fine.
pub trait Capability: Send + Sync {
    /// An integer the rule author bumps whenever `build` semantics change
    /// in a way that alters output bytes. A bump makes every output of the
    /// rule stale.
    fn version(&self) -> u32;

    /// Produce `output` from `inputs`.
    ///
    /// `changed` is the subset of inputs responsible for the staleness
    /// decision (all of them on a first build), which may enable
    /// incremental work. Must be deterministic given the same inputs,
    /// context view, and version.
    fn build(
        &self,
        cx: &BuildCx<'_>,
        output: &str,
        inputs: &[String],
        changed: &[String],
    ) -> Result<(), BuildError>;

    /// Extra inputs discovered by inspecting the current ones (e.g.
    /// `@import` lines in a stylesheet). Called repeatedly until the
    /// returned set adds nothing new; returning paths already present is
    /// how the fixpoint terminates.
    fn computed_inputs(
        &self,
        _cx: &InputsCx<'_>,
        _output: &str,
        _current_inputs: &[String],
    ) -> Result<Vec<String>, BuildError> {
        Ok(Vec::new())
    }

    /// Context keys whose values affect the output. Only these keys enter
    /// the staleness digest.
    fn used_context_keys(&self) -> Vec<String> {
        Vec::new()
    }

    /// All outputs produced atomically by one `build` invocation. An
    /// empty list (the default) means the rule has a single output.
    fn split_outputs(&self, _output: &str, _bindings: &Bindings) -> Vec<String> {
        Vec::new()
    }

    /// A path this output may be byte-identical to. If it exists, the
    /// executor symlinks to it instead of invoking `build`.
    fn maybe_symlink_to(&self, _output: &str, _bindings: &Bindings) -> Option<String> {
        None
    }

    /// Paths that must be up to date before this node builds but are not
    /// passed to `build`.
    fn non_input_deps(&self, _output: &str, _bindings: &Bindings) -> Vec<String> {
        Vec::new()
    }
}

/// A registered compile rule: how to produce files matching one output
/// pattern.
#[derive(Clone)]
pub struct Rule {
    label: String,
    output: OutputPattern,
    inputs: Vec<String>,
    capability: Arc<dyn Capability>,
    non_input_deps: Vec<String>,
    hash_inputs: bool,
}

impl Rule {
    /// Create a rule. The output pattern must parse; further validation
    /// (generated prefix, collisions) happens at registration.
    pub fn new(
        label: impl Into<String>,
        output_pattern: &str,
        input_patterns: impl IntoIterator<Item = impl Into<String>>,
        capability: Arc<dyn Capability>,
    ) -> Result<Self, BuildError> {
        Ok(Rule {
            label: label.into(),
            output: OutputPattern::parse(output_pattern)?,
            inputs: input_patterns.into_iter().map(Into::into).collect(),
            capability,
            non_input_deps: Vec::new(),
            hash_inputs: false,
        })
    }

    /// Add patterns that are built before this rule's outputs but not
    /// passed to `build`.
    pub fn with_non_input_deps(
        mut self,
        patterns: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.non_input_deps = patterns.into_iter().map(Into::into).collect();
        self
    }

    /// Compare input contents by hash when mtimes move. Worth it for
    /// expensive outputs whose inputs get touched without changing, e.g.
    /// by switching branches.
    pub fn with_hash_inputs(mut self, hash_inputs: bool) -> Self {
        self.hash_inputs = hash_inputs;
        self
    }

    /// The rule's diagnostic label.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// The compiled output pattern.
    pub fn output(&self) -> &OutputPattern {
        &self.output
    }

    /// The static input patterns, in declaration order.
    pub fn input_patterns(&self) -> &[String] {
        &self.inputs
    }

    /// The non-input dependency patterns.
    pub fn non_input_dep_patterns(&self) -> &[String] {
        &self.non_input_deps
    }

    /// The builder object.
    pub fn capability(&self) -> &Arc<dyn Capability> {
        &self.capability
    }

    /// Whether staleness falls back to content hashes for this rule.
    pub fn hash_inputs(&self) -> bool {
        self.hash_inputs
    }
}

impl std::fmt::Debug for Rule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rule")
            .field("label", &self.label)
            .field("output", &self.output.text())
            .field("inputs", &self.inputs)
            .field("non_input_deps", &self.non_input_deps)
            .field("hash_inputs", &self.hash_inputs)
            .finish()
    }
}
