//! The build context: caller-supplied key/value variables.
//!
//! A context travels with every build request. Rules declare which keys
//! they read via `used_context_keys()`; those keys (and only those) enter
//! the staleness digest, so changing an unrelated key never triggers a
//! rebuild.

use std::collections::BTreeMap;

use crate::util::hash;

/// An ordered map of context variables.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildContext {
    vars: BTreeMap<String, String>,
}

impl BuildContext {
    /// An empty context.
    pub fn new() -> Self {
        BuildContext::default()
    }

    /// Set a variable, returning self for chaining.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    /// Set a variable.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(key.into(), value.into());
    }

    /// Look up a variable.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(|s| s.as_str())
    }

    /// Number of variables.
    pub fn len(&self) -> usize {
        self.vars.len()
    }

    /// True if no variables are set.
    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Iterate over variables in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// A copy of this context with `extra` entries layered on top.
    ///
    /// Used to inject pattern-variable bindings into the per-node context.
    pub fn merged(&self, extra: &BTreeMap<String, String>) -> BuildContext {
        let mut vars = self.vars.clone();
        for (k, v) in extra {
            vars.insert(k.clone(), v.clone());
        }
        BuildContext { vars }
    }

    /// The subset of this context containing only `keys`.
    ///
    /// Absent keys are simply omitted, which makes "key not set" and "key
    /// set to empty" distinct states in the digest.
    pub fn restricted(&self, keys: &[String]) -> BuildContext {
        let mut vars = BTreeMap::new();
        for key in keys {
            if let Some(value) = self.vars.get(key) {
                vars.insert(key.clone(), value.clone());
            }
        }
        BuildContext { vars }
    }

    /// A stable digest of the context, for the staleness sidecar.
    pub fn digest(&self) -> String {
        hash::context_digest(self.iter())
    }
}

impl FromIterator<(String, String)> for BuildContext {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        BuildContext {
            vars: iter.into_iter().collect(),
        }
    }
}
