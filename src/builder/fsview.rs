//! A process-lifetime cache of stat results and content hashes.
//!
//! Re-statting every input on every request is what makes naive build
//! systems slow to no-op. The view caches `stat` results (including
//! negative ones) until the engine invalidates them: after a successful
//! rebuild of the file they describe, or wholesale when the host asks.
//!
//! The view trusts that files do not change behind its back between
//! invalidations; hosts that cannot guarantee that (no file watcher) call
//! [`FsView::invalidate_all`] before building.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::UNIX_EPOCH;

use crate::core::paths::Project;
use crate::errors::BuildError;
use crate::util::hash::sha256_file;

/// Cached information about one path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    /// False for cached negative lookups.
    pub exists: bool,
    /// Modification time in nanoseconds since the epoch; 0 when absent.
    pub mtime_ns: u128,
    /// File size in bytes; 0 when absent.
    pub size: u64,
    /// Content hash, filled lazily by [`FsView::hash`].
    pub hash: Option<String>,
}

impl FileInfo {
    fn absent() -> Self {
        FileInfo {
            exists: false,
            mtime_ns: 0,
            size: 0,
            hash: None,
        }
    }
}

/// Shared cache of file metadata, keyed by project-relative path (or the
/// absolute path for host-binary inputs).
#[derive(Default)]
pub struct FsView {
    entries: RwLock<HashMap<String, FileInfo>>,
}

impl FsView {
    pub fn new() -> Self {
        FsView::default()
    }

    /// Stat a path, consulting the cache first. Negative results are
    /// cached too.
    pub fn stat(&self, project: &Project, path: &str) -> FileInfo {
        if let Some(info) = self.entries.read().unwrap().get(path) {
            return info.clone();
        }

        let info = read_info(project, path);
        self.entries
            .write()
            .unwrap()
            .insert(path.to_string(), info.clone());
        info
    }

    /// Content hash of a path, computed lazily and memoized alongside the
    /// stat entry. Fails if the file is missing or unreadable.
    pub fn hash(&self, project: &Project, path: &str) -> Result<String, BuildError> {
        let info = self.stat(project, path);
        if !info.exists {
            return Err(BuildError::io(path, "cannot hash a missing file"));
        }
        if let Some(hash) = info.hash {
            return Ok(hash);
        }

        let hash = sha256_file(&project.abspath(path)).map_err(|e| BuildError::io(path, e))?;

        let mut entries = self.entries.write().unwrap();
        // Attach to the existing entry; if it was invalidated while we
        // hashed, insert fresh so the hash stays paired with its stat.
        let entry = entries
            .entry(path.to_string())
            .or_insert_with(|| read_info(project, path));
        entry.hash = Some(hash.clone());
        Ok(hash)
    }

    /// Drop the cached entry for one path.
    pub fn invalidate(&self, path: &str) {
        self.entries.write().unwrap().remove(path);
    }

    /// Drop everything. Host-initiated, e.g. on a filesystem-watcher
    /// overflow or a signal.
    pub fn invalidate_all(&self) {
        self.entries.write().unwrap().clear();
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    /// True if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn read_info(project: &Project, path: &str) -> FileInfo {
    let abs = project.abspath(path);
    match std::fs::metadata(&abs) {
        Ok(meta) => {
            let mtime_ns = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_nanos())
                .unwrap_or(0);
            FileInfo {
                exists: true,
                mtime_ns,
                size: meta.len(),
                hash: None,
            }
        }
        Err(_) => FileInfo::absent(),
    }
}
