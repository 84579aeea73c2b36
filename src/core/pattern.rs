//! The pattern language for rule outputs and inputs.
//!
//! Output patterns are literal paths with optional variable segments:
//! `{name}` matches a non-empty run without slashes and binds `name`;
//! `{{name}}` matches across slashes and binds; `**` matches any number of
//! path segments without binding; `*` and `?` are single-segment globs. A
//! variable repeated within one pattern must bind the same text at every
//! occurrence.
//!
//! Input patterns are strings in the same language, resolved in two steps:
//! variable substitution from the output match, then shell-glob expansion
//! of whatever metacharacters remain.

use std::collections::BTreeMap;

use regex::Regex;

use crate::core::paths::Project;
use crate::errors::BuildError;

/// Variable bindings produced by matching an output pattern.
pub type Bindings = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Literal(String),
    /// `{name}`: one non-slash run, bound.
    Var(String),
    /// `{{name}}`: may cross slashes, bound.
    DeepVar(String),
    /// `**`: may cross slashes, not bound.
    DeepStar,
    /// `*`
    Star,
    /// `?`
    Question,
}

fn tokenize(pattern: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut literal = String::new();
    let mut i = 0;

    let flush = |literal: &mut String, tokens: &mut Vec<Token>| {
        if !literal.is_empty() {
            tokens.push(Token::Literal(std::mem::take(literal)));
        }
    };

    while i < pattern.len() {
        let rest = &pattern[i..];
        let c = rest.chars().next().unwrap();
        match c {
            '{' => {
                flush(&mut literal, &mut tokens);
                let deep = rest.starts_with("{{");
                let open = if deep { 2 } else { 1 };
                let close = if deep { "}}" } else { "}" };
                let body = &rest[open..];
                let end = body
                    .find(close)
                    .ok_or_else(|| format!("unterminated variable in `{pattern}`"))?;
                let name = &body[..end];
                if name.is_empty()
                    || !name
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || c == '_')
                {
                    return Err(format!("bad variable name `{name}` in `{pattern}`"));
                }
                tokens.push(if deep {
                    Token::DeepVar(name.to_string())
                } else {
                    Token::Var(name.to_string())
                });
                i += open + end + close.len();
            }
            '*' => {
                flush(&mut literal, &mut tokens);
                if rest.starts_with("**") {
                    tokens.push(Token::DeepStar);
                    i += 2;
                } else {
                    tokens.push(Token::Star);
                    i += 1;
                }
            }
            '?' => {
                flush(&mut literal, &mut tokens);
                tokens.push(Token::Question);
                i += 1;
            }
            '}' => return Err(format!("stray `}}` in `{pattern}`")),
            _ => {
                literal.push(c);
                i += c.len_utf8();
            }
        }
    }
    flush(&mut literal, &mut tokens);
    Ok(tokens)
}

/// A compiled output pattern.
#[derive(Debug, Clone)]
pub struct OutputPattern {
    text: String,
    regex: Regex,
    /// Regex group index (1-based) to variable name, in order.
    groups: Vec<String>,
    wildcards: usize,
}

impl OutputPattern {
    /// Parse and compile a pattern. Fails on malformed variables.
    pub fn parse(text: &str) -> Result<Self, BuildError> {
        let tokens = tokenize(text).map_err(|reason| BuildError::InvalidRule {
            label: text.to_string(),
            reason,
        })?;

        let mut source = String::from("^");
        let mut groups = Vec::new();
        let mut wildcards = 0;
        for token in &tokens {
            match token {
                Token::Literal(lit) => source.push_str(&regex::escape(lit)),
                Token::Var(name) => {
                    // The regex engine has no backreferences, so repeated
                    // variables get their own group and are checked for
                    // equality after the match.
                    source.push_str("([^/]+)");
                    groups.push(name.clone());
                    wildcards += 1;
                }
                Token::DeepVar(name) => {
                    source.push_str("(.+)");
                    groups.push(name.clone());
                    wildcards += 1;
                }
                Token::DeepStar => {
                    // `**/` may also match zero segments.
                    if source.ends_with('/') {
                        source.pop();
                        source.push_str("(?:/.*)?");
                    } else {
                        source.push_str(".*");
                    }
                    wildcards += 1;
                }
                Token::Star => {
                    source.push_str("[^/]*");
                    wildcards += 1;
                }
                Token::Question => {
                    source.push_str("[^/]");
                    wildcards += 1;
                }
            }
        }
        source.push('$');

        let regex = Regex::new(&source).map_err(|e| BuildError::InvalidRule {
            label: text.to_string(),
            reason: format!("pattern does not compile: {e}"),
        })?;

        Ok(OutputPattern {
            text: text.to_string(),
            regex,
            groups,
            wildcards,
        })
    }

    /// The pattern source text.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Number of wildcard tokens; zero means the pattern is a literal path.
    pub fn wildcards(&self) -> usize {
        self.wildcards
    }

    /// True if the pattern contains no wildcards at all.
    pub fn is_literal(&self) -> bool {
        self.wildcards == 0
    }

    /// Match a concrete target, returning variable bindings on success.
    ///
    /// A repeated variable must capture the same text everywhere or the
    /// match fails.
    pub fn matches(&self, target: &str) -> Option<Bindings> {
        let caps = self.regex.captures(target)?;
        let mut bindings = Bindings::new();
        for (idx, name) in self.groups.iter().enumerate() {
            let value = caps.get(idx + 1)?.as_str();
            match bindings.get(name) {
                Some(prev) if prev != value => return None,
                _ => {
                    bindings.insert(name.clone(), value.to_string());
                }
            }
        }
        Some(bindings)
    }
}

/// True if the string still contains shell-glob metacharacters.
pub fn has_glob_metachar(s: &str) -> bool {
    s.contains('*') || s.contains('?') || s.contains('[')
}

/// Substitute `{var}` and `{{var}}` occurrences from `bindings`.
///
/// Unbound variables are an error; the caller has no way to expand them.
pub fn substitute(pattern: &str, bindings: &Bindings) -> Result<String, BuildError> {
    let tokens = tokenize(pattern).map_err(|reason| BuildError::InvalidRule {
        label: pattern.to_string(),
        reason,
    })?;

    let mut out = String::new();
    for token in tokens {
        match token {
            Token::Literal(lit) => out.push_str(&lit),
            Token::Var(name) | Token::DeepVar(name) => match bindings.get(&name) {
                Some(value) => out.push_str(value),
                None => {
                    return Err(BuildError::InvalidRule {
                        label: pattern.to_string(),
                        reason: format!("no binding for variable `{name}`"),
                    })
                }
            },
            Token::DeepStar => out.push_str("**"),
            Token::Star => out.push('*'),
            Token::Question => out.push('?'),
        }
    }
    Ok(out)
}

/// Expand a glob pattern against the project tree.
///
/// Returns project-relative matches of regular files, sorted and deduped.
pub fn expand_glob(project: &Project, pattern: &str) -> Result<Vec<String>, BuildError> {
    let full = project.abspath(pattern);
    let full_str = full.to_string_lossy();

    let mut results = Vec::new();
    let entries = glob::glob(&full_str).map_err(|e| BuildError::InvalidRule {
        label: pattern.to_string(),
        reason: format!("invalid glob pattern: {e}"),
    })?;

    for entry in entries {
        match entry {
            Ok(path) => {
                if path.is_file() {
                    if let Some(rel) = project.relative(&path) {
                        results.push(rel);
                    }
                }
            }
            Err(e) => {
                tracing::warn!("glob error under `{}`: {}", pattern, e);
            }
        }
    }

    results.sort();
    results.dedup();
    Ok(results)
}

/// Resolve a list of input patterns: substitute bindings, then expand any
/// remaining globs. Non-glob patterns pass through as single paths.
pub fn resolve_patterns(
    project: &Project,
    patterns: &[String],
    bindings: &Bindings,
) -> Result<Vec<String>, BuildError> {
    let mut resolved = Vec::new();
    for pattern in patterns {
        let substituted = substitute(pattern, bindings)?;
        if has_glob_metachar(&substituted) {
            resolved.extend(expand_glob(project, &substituted)?);
        } else {
            resolved.push(substituted);
        }
    }
    Ok(resolved)
}
