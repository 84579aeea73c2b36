//! The rule registry: append-only storage plus the output-pattern
//! resolver.
//!
//! Lookup priority, in order: an exact literal output beats any pattern;
//! among patterns, fewest wildcard tokens wins; remaining ties go to the
//! earliest registration (with a warning, since relying on registration
//! order is fragile).

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::core::paths::Project;
use crate::core::pattern::{self, Bindings};
use crate::core::rule::Rule;
use crate::errors::BuildError;

#[derive(Default)]
struct Inner {
    rules: Vec<Arc<Rule>>,
    /// Literal output path to index in `rules`.
    literals: HashMap<String, usize>,
    labels: HashMap<String, usize>,
}

/// Registry of compile rules. Registration happens at host startup; reads
/// dominate afterwards.
#[derive(Default)]
pub struct RuleRegistry {
    inner: RwLock<Inner>,
}

impl RuleRegistry {
    pub fn new() -> Self {
        RuleRegistry::default()
    }

    /// Register a rule.
    ///
    /// Fails if the output is not under the generated prefix, the label is
    /// taken, or the output collides with an existing rule: duplicate
    /// literals are rejected, as is a pattern that matches a literal
    /// already present. Registering a literal covered by an existing
    /// pattern is allowed; the literal is a refinement and wins at lookup.
    pub fn register(&self, project: &Project, rule: Rule) -> Result<(), BuildError> {
        let output_text = rule.output().text().to_string();
        let label = rule.label().to_string();

        if !output_text.starts_with(project.gen_prefix()) {
            return Err(BuildError::InvalidRule {
                label,
                reason: format!(
                    "output `{}` must live under `{}`",
                    output_text,
                    project.gen_prefix()
                ),
            });
        }

        // Globbing over generated files cannot work: the files may not
        // exist yet when the glob runs.
        for input in rule.input_patterns() {
            if project.is_generated(input) && pattern::has_glob_metachar(input) {
                return Err(BuildError::InvalidRule {
                    label,
                    reason: format!("glob over generated files is not supported: `{input}`"),
                });
            }
        }

        let mut inner = self.inner.write().unwrap();

        if inner.labels.contains_key(&label) {
            return Err(BuildError::InvalidRule {
                label,
                reason: "label is already registered".to_string(),
            });
        }

        if rule.output().is_literal() {
            if let Some(&idx) = inner.literals.get(&output_text) {
                return Err(BuildError::AmbiguousRule {
                    label,
                    existing: inner.rules[idx].label().to_string(),
                    output: output_text,
                });
            }
        } else {
            // A new pattern must not swallow an output some rule already
            // claims literally.
            let collision = inner
                .literals
                .iter()
                .find(|(lit, _)| rule.output().matches(lit).is_some());
            if let Some((lit, &idx)) = collision {
                return Err(BuildError::AmbiguousRule {
                    label,
                    existing: inner.rules[idx].label().to_string(),
                    output: lit.clone(),
                });
            }
            let duplicate = inner
                .rules
                .iter()
                .position(|r| r.output().text() == output_text);
            if let Some(idx) = duplicate {
                return Err(BuildError::AmbiguousRule {
                    label,
                    existing: inner.rules[idx].label().to_string(),
                    output: output_text,
                });
            }
        }

        tracing::debug!("registering compile rule `{}` for {}", label, output_text);

        let idx = inner.rules.len();
        if rule.output().is_literal() {
            inner.literals.insert(output_text, idx);
        }
        inner.labels.insert(label, idx);
        inner.rules.push(Arc::new(rule));
        Ok(())
    }

    /// Find the rule that produces `target`, with its variable bindings,
    /// or `None` if nothing matches.
    pub fn find(&self, target: &str) -> Option<(Arc<Rule>, Bindings)> {
        let inner = self.inner.read().unwrap();

        if let Some(&idx) = inner.literals.get(target) {
            return Some((Arc::clone(&inner.rules[idx]), Bindings::new()));
        }

        let mut best: Option<(usize, usize, Bindings)> = None;
        let mut tied_with: Option<usize> = None;
        for (idx, rule) in inner.rules.iter().enumerate() {
            if rule.output().is_literal() {
                continue;
            }
            let Some(bindings) = rule.output().matches(target) else {
                continue;
            };
            let wc = rule.output().wildcards();
            let best_wc = best.as_ref().map(|(_, wc, _)| *wc);
            match best_wc {
                None => best = Some((idx, wc, bindings)),
                Some(b) if wc < b => {
                    best = Some((idx, wc, bindings));
                    tied_with = None;
                }
                Some(b) if wc == b && tied_with.is_none() => {
                    // Earlier registration wins; remember the loser so we
                    // can warn about the ambiguity.
                    tied_with = Some(idx);
                }
                Some(_) => {}
            }
        }

        let (idx, _, bindings) = best?;
        if let Some(loser) = tied_with {
            tracing::warn!(
                "rules `{}` and `{}` match `{}` equally well; picking `{}` (registered first)",
                inner.rules[idx].label(),
                inner.rules[loser].label(),
                target,
                inner.rules[idx].label(),
            );
        }
        Some((Arc::clone(&inner.rules[idx]), bindings))
    }

    /// Number of registered rules.
    pub fn len(&self) -> usize {
        self.inner.read().unwrap().rules.len()
    }

    /// True if no rules are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::rule::{BuildCx, Capability};
    use std::sync::Arc;

    struct Noop;

    impl Capability for Noop {
        fn version(&self) -> u32 {
            1
        }

        fn build(
            &self,
            _cx: &BuildCx<'_>,
            _output: &str,
            _inputs: &[String],
            _changed: &[String],
        ) -> Result<(), BuildError> {
            Ok(())
        }
    }

    fn rule(label: &str, output: &str) -> Rule {
        Rule::new(label, output, Vec::<String>::new(), Arc::new(Noop)).unwrap()
    }

    fn project() -> Project {
        Project::new("/srv/app", "genfiles")
    }

    #[test]
    fn test_literal_wins_over_pattern() {
        let registry = RuleRegistry::new();
        let p = project();
        registry
            .register(&p, rule("generic", "genfiles/js/{name}.js"))
            .unwrap();
        registry
            .register(&p, rule("special", "genfiles/js/app.js"))
            .unwrap();

        let (found, bindings) = registry.find("genfiles/js/app.js").unwrap();
        assert_eq!(found.label(), "special");
        assert!(bindings.is_empty());

        let (found, bindings) = registry.find("genfiles/js/other.js").unwrap();
        assert_eq!(found.label(), "generic");
        assert_eq!(bindings.get("name").map(String::as_str), Some("other"));
    }

    #[test]
    fn test_fewest_wildcards_wins() {
        let registry = RuleRegistry::new();
        let p = project();
        registry
            .register(&p, rule("loose", "genfiles/{a}/{b}.css"))
            .unwrap();
        registry
            .register(&p, rule("tight", "genfiles/css/{b}.css"))
            .unwrap();

        let (found, _) = registry.find("genfiles/css/site.css").unwrap();
        assert_eq!(found.label(), "tight");
    }

    #[test]
    fn test_tie_goes_to_earliest_registration() {
        let registry = RuleRegistry::new();
        let p = project();
        registry
            .register(&p, rule("first", "genfiles/a/{x}.js"))
            .unwrap();
        registry
            .register(&p, rule("second", "genfiles/{y}/q.js"))
            .unwrap();

        let (found, _) = registry.find("genfiles/a/q.js").unwrap();
        assert_eq!(found.label(), "first");
    }

    #[test]
    fn test_duplicate_literal_rejected() {
        let registry = RuleRegistry::new();
        let p = project();
        registry.register(&p, rule("one", "genfiles/x.txt")).unwrap();
        let err = registry
            .register(&p, rule("two", "genfiles/x.txt"))
            .unwrap_err();
        assert!(matches!(err, BuildError::AmbiguousRule { .. }));
    }

    #[test]
    fn test_pattern_subsuming_literal_rejected() {
        let registry = RuleRegistry::new();
        let p = project();
        registry.register(&p, rule("exact", "genfiles/x.txt")).unwrap();
        let err = registry
            .register(&p, rule("broad", "genfiles/{name}.txt"))
            .unwrap_err();
        assert!(matches!(err, BuildError::AmbiguousRule { .. }));
    }

    #[test]
    fn test_output_must_be_generated() {
        let registry = RuleRegistry::new();
        let err = registry
            .register(&project(), rule("bad", "js/app.js"))
            .unwrap_err();
        assert!(matches!(err, BuildError::InvalidRule { .. }));
    }

    #[test]
    fn test_no_globs_over_generated_inputs() {
        let registry = RuleRegistry::new();
        let r = Rule::new(
            "bad",
            "genfiles/all.js",
            ["genfiles/js/*.js"],
            Arc::new(Noop),
        )
        .unwrap();
        let err = registry.register(&project(), r).unwrap_err();
        assert!(matches!(err, BuildError::InvalidRule { .. }));
    }

    #[test]
    fn test_duplicate_label_rejected() {
        let registry = RuleRegistry::new();
        let p = project();
        registry.register(&p, rule("dup", "genfiles/a.txt")).unwrap();
        let err = registry
            .register(&p, rule("dup", "genfiles/b.txt"))
            .unwrap_err();
        assert!(matches!(err, BuildError::InvalidRule { .. }));
    }

    #[test]
    fn test_no_match() {
        let registry = RuleRegistry::new();
        assert!(registry.find("genfiles/none.js").is_none());
        assert!(registry.is_empty());
    }
}
