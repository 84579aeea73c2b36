//! Error taxonomy for the build engine.
//!
//! Every failure mode the engine can surface to the host is a distinct
//! variant. The type is `Clone` so a single failure can be handed to every
//! caller coalesced onto the same in-flight build.

use thiserror::Error;

/// An error raised while registering rules or building targets.
#[derive(Debug, Clone, Error)]
pub enum BuildError {
    /// No rule matches the target and it is not a source file.
    #[error("no rule found to generate `{target}`")]
    UnknownTarget { target: String },

    /// Registration detected two rules claiming the same output.
    #[error("rule `{label}` collides with rule `{existing}` on output `{output}`")]
    AmbiguousRule {
        label: String,
        existing: String,
        output: String,
    },

    /// A rule failed registration-time validation.
    #[error("invalid rule `{label}`: {reason}")]
    InvalidRule { label: String, reason: String },

    /// The resolver found a dependency cycle.
    #[error("circular dependencies: {}", .chain.join(" -> "))]
    CycleDetected { chain: Vec<String> },

    /// The request itself is malformed and retrying will not help.
    #[error("bad request: {reason}")]
    BadRequest { reason: String },

    /// The computed-inputs loop did not converge.
    #[error("computed inputs for `{target}` did not converge after {rounds} rounds")]
    ComputedInputsDivergence { target: String, rounds: usize },

    /// A capability's `build` failed, or its subprocess exited non-zero.
    #[error("build failed for `{output}` (rule `{label}`): {message}")]
    BuildFailed {
        label: String,
        output: String,
        argv: Option<Vec<String>>,
        stderr: Option<String>,
        message: String,
    },

    /// `build` returned success but the declared output does not exist.
    #[error("rule `{label}` reported success but `{output}` was not created")]
    MissingOutput { label: String, output: String },

    /// The host cancelled the build before this target was dispatched.
    #[error("build of `{target}` was cancelled")]
    Cancelled { target: String },

    /// A subprocess exceeded the configured per-node timeout.
    #[error("build of `{target}` timed out after {secs}s")]
    Timeout { target: String, secs: u64 },

    /// An unexpected filesystem error outside a capability's control.
    #[error("i/o error on `{path}`: {message}")]
    Io { path: String, message: String },
}

impl BuildError {
    /// Wrap a filesystem error with the path it occurred on.
    pub fn io(path: impl Into<String>, err: impl std::fmt::Display) -> Self {
        BuildError::Io {
            path: path.into(),
            message: err.to_string(),
        }
    }

    /// A malformed request.
    pub fn bad_request(reason: impl Into<String>) -> Self {
        BuildError::BadRequest {
            reason: reason.into(),
        }
    }

    /// True if the failure is the caller's fault rather than the build's.
    ///
    /// Front-ends use this to pick a 4xx-style response over a 5xx-style
    /// one.
    pub fn is_bad_request(&self) -> bool {
        matches!(
            self,
            BuildError::BadRequest { .. } | BuildError::UnknownTarget { .. }
        )
    }
}
