//! Project-relative path handling.
//!
//! Every path the engine works with is relative to the project root and
//! uses forward slashes. Paths under the generated prefix are produced by
//! rules; everything else is a source file. Absolute paths are permitted
//! only as rule inputs referencing host-system binaries and are opaque to
//! the dependency graph.

use std::path::{Path, PathBuf};

use crate::errors::BuildError;

/// The project a build engine operates on: a root directory plus the
/// prefix that generated files live under.
#[derive(Debug, Clone)]
pub struct Project {
    root: PathBuf,
    gen_prefix: String,
}

impl Project {
    /// Create a project rooted at `root` with generated files under
    /// `gen_prefix` (stored with a trailing slash).
    pub fn new(root: impl Into<PathBuf>, gen_prefix: impl Into<String>) -> Self {
        let mut gen_prefix = gen_prefix.into();
        if !gen_prefix.ends_with('/') {
            gen_prefix.push('/');
        }
        Project {
            root: root.into(),
            gen_prefix,
        }
    }

    /// The project root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The generated-files prefix, with trailing slash (e.g. `genfiles/`).
    pub fn gen_prefix(&self) -> &str {
        &self.gen_prefix
    }

    /// True if `path` is produced by a rule rather than checked in.
    pub fn is_generated(&self, path: &str) -> bool {
        path.starts_with(&self.gen_prefix)
    }

    /// Return an absolute path for a project-relative one. Absolute inputs
    /// (host binaries) pass through untouched.
    pub fn abspath(&self, rel: &str) -> PathBuf {
        let p = Path::new(rel);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.root.join(rel)
        }
    }

    /// Relativize an absolute path under the project root, if it is one.
    pub fn relative(&self, abs: &Path) -> Option<String> {
        abs.strip_prefix(&self.root)
            .ok()
            .map(|p| p.to_string_lossy().replace('\\', "/"))
    }
}

/// Canonicalize a target or input path to project-relative, forward-slash
/// form.
///
/// Rejects empty paths, backslashes, and any `..` traversal. Absolute
/// paths are returned as-is (they only make sense as opaque inputs; the
/// resolver enforces that separately). Redundant `./` segments and
/// duplicate slashes are stripped.
pub fn canonicalize(path: &str) -> Result<String, BuildError> {
    if path.is_empty() {
        return Err(BuildError::bad_request("empty path"));
    }
    if path.contains('\\') {
        return Err(BuildError::bad_request(format!(
            "path must use forward slashes: `{path}`"
        )));
    }

    let absolute = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => continue,
            ".." => {
                return Err(BuildError::bad_request(format!(
                    "path escapes the project root: `{path}`"
                )))
            }
            p => parts.push(p),
        }
    }
    if parts.is_empty() {
        return Err(BuildError::bad_request(format!("degenerate path: `{path}`")));
    }

    let joined = parts.join("/");
    Ok(if absolute { format!("/{joined}") } else { joined })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonicalize() {
        assert_eq!(canonicalize("a/b/c.txt").unwrap(), "a/b/c.txt");
        assert_eq!(canonicalize("./a//b/./c").unwrap(), "a/b/c");
        assert_eq!(canonicalize("/usr/bin/node").unwrap(), "/usr/bin/node");

        assert!(canonicalize("").is_err());
        assert!(canonicalize("../etc/passwd").is_err());
        assert!(canonicalize("a/../../b").is_err());
        assert!(canonicalize("a\\b").is_err());
    }

    #[test]
    fn test_classification() {
        let project = Project::new("/srv/app", "genfiles");
        assert!(project.is_generated("genfiles/js/app.js"));
        assert!(!project.is_generated("js/app.js"));
        assert!(!project.is_generated("genfiles2/js/app.js"));
        assert_eq!(project.gen_prefix(), "genfiles/");
    }

    #[test]
    fn test_abspath() {
        let project = Project::new("/srv/app", "genfiles");
        assert_eq!(
            project.abspath("genfiles/a.txt"),
            PathBuf::from("/srv/app/genfiles/a.txt")
        );
        assert_eq!(project.abspath("/usr/bin/node"), PathBuf::from("/usr/bin/node"));
    }

    #[test]
    fn test_relative() {
        let project = Project::new("/srv/app", "genfiles");
        assert_eq!(
            project.relative(Path::new("/srv/app/css/site.css")),
            Some("css/site.css".to_string())
        );
        assert_eq!(project.relative(Path::new("/elsewhere/x")), None);
    }
}
