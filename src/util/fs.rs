//! Filesystem utilities.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};

/// Ensure a directory exists, creating it if necessary.
pub fn ensure_dir(path: &Path) -> Result<()> {
    if !path.exists() {
        fs::create_dir_all(path)
            .with_context(|| format!("failed to create directory: {}", path.display()))?;
    }
    Ok(())
}

/// Ensure the parent directory of a file exists.
pub fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    Ok(())
}

/// Read a file to string, with nice error messages.
pub fn read_to_string(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("failed to read file: {}", path.display()))
}

/// Write a string to a file, creating parent directories if needed.
pub fn write_string(path: &Path, contents: &str) -> Result<()> {
    ensure_parent_dir(path)?;
    fs::write(path, contents).with_context(|| format!("failed to write file: {}", path.display()))
}

/// Write bytes to a file, creating parent directories if needed.
pub fn write_bytes(path: &Path, contents: &[u8]) -> Result<()> {
    ensure_parent_dir(path)?;
    fs::write(path, contents).with_context(|| format!("failed to write file: {}", path.display()))
}

/// Compute the relative path from `base` to `path`.
///
/// Both paths must be absolute. Walks up from `base` with `..` components
/// until a common ancestor is found.
pub fn relative_to(path: &Path, base: &Path) -> PathBuf {
    let path_parts: Vec<Component> = path.components().collect();
    let base_parts: Vec<Component> = base.components().collect();

    let common = path_parts
        .iter()
        .zip(base_parts.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut rel = PathBuf::new();
    for _ in common..base_parts.len() {
        rel.push("..");
    }
    for part in &path_parts[common..] {
        rel.push(part);
    }
    rel
}

/// Create a symlink (platform-aware).
#[cfg(unix)]
fn symlink_raw(src: &Path, dst: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(src, dst)
}

#[cfg(windows)]
fn symlink_raw(src: &Path, dst: &Path) -> io::Result<()> {
    if src.is_dir() {
        std::os::windows::fs::symlink_dir(src, dst)
    } else {
        std::os::windows::fs::symlink_file(src, dst)
    }
}

/// Create or refresh a relative symlink at `from` pointing to `to`.
///
/// Both arguments must be absolute paths. The link contents are the
/// relative path from `from`'s directory to `to`, so the link stays valid
/// if the whole tree is moved. An existing link that already points to the
/// right place is left untouched.
pub fn symlink_relative(to: &Path, from: &Path) -> Result<()> {
    ensure_parent_dir(from)?;

    let link_dir = from.parent().unwrap_or_else(|| Path::new("/"));
    let rel = relative_to(to, link_dir);

    if let Ok(existing) = fs::read_link(from) {
        if existing == rel {
            return Ok(());
        }
    }

    if from.symlink_metadata().is_ok() {
        fs::remove_file(from)
            .with_context(|| format!("failed to remove stale link: {}", from.display()))?;
    }

    tracing::debug!("creating symlink {} -> {}", from.display(), rel.display());
    symlink_raw(&rel, from)
        .with_context(|| format!("failed to create symlink: {}", from.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_relative_to() {
        assert_eq!(
            relative_to(Path::new("/a/b/c.txt"), Path::new("/a/d")),
            PathBuf::from("../b/c.txt")
        );
        assert_eq!(
            relative_to(Path::new("/a/b/c.txt"), Path::new("/a/b")),
            PathBuf::from("c.txt")
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_relative() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("src/en/page.txt");
        let link = tmp.path().join("genfiles/fr/page.txt");
        write_string(&target, "hello").unwrap();

        symlink_relative(&target, &link).unwrap();
        assert_eq!(fs::read_to_string(&link).unwrap(), "hello");
        assert_eq!(
            fs::read_link(&link).unwrap(),
            PathBuf::from("../../src/en/page.txt")
        );

        // Re-creating the same link is a no-op.
        symlink_relative(&target, &link).unwrap();

        // Retargeting replaces the link.
        let other = tmp.path().join("src/es/page.txt");
        write_string(&other, "hola").unwrap();
        symlink_relative(&other, &link).unwrap();
        assert_eq!(fs::read_to_string(&link).unwrap(), "hola");
    }
}
