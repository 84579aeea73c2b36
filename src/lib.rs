//! Kake - an embeddable incremental build engine.
//!
//! Kake keeps a registry of compile rules, resolves a requested target into
//! a dependency graph, decides which nodes are stale against a cached
//! filesystem view, and rebuilds the stale ones in dependency order while
//! coalescing concurrent requests for the same target. It is designed to be
//! embedded in a long-lived host process (typically a development web
//! server) where a no-op build must cost microseconds.

pub mod builder;
pub mod core;
pub mod errors;
pub mod rules;
pub mod util;

pub use crate::builder::engine::{BuildOptions, Engine, EngineConfig};
pub use crate::builder::executor::CancelToken;
pub use crate::builder::fsview::{FileInfo, FsView};
pub use crate::core::context::BuildContext;
pub use crate::core::paths::Project;
pub use crate::core::pattern::Bindings;
pub use crate::core::rule::{BuildCx, Capability, InputsCx, Rule};
pub use crate::errors::BuildError;
