//! Staging area for downloaded inputs and produced artifacts.
//!
//! Every temporary path the bot touches is allocated here and released
//! here. Call sites acquire paths through a [`StagingScope`] so that
//! everything staged during one operation is released when the scope
//! drops, on every exit path.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

/// A file downloaded into the staging area, as the session tracks it.
///
/// Immutable once created. The session owns the record; the staging area
/// owns the on-disk lifetime.
#[derive(Clone, Debug)]
pub struct StagedFile {
    /// Display name as the user sent it (used for archive entry names and
    /// captions, never the staging path).
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
}

/// Allocates process-unique staging paths and releases them.
#[derive(Debug)]
pub struct Staging {
    root: PathBuf,
    seq: AtomicU64,
}

impl Staging {
    pub fn new(root: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            root: root.into(),
            seq: AtomicU64::new(1),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Return a path unique within the process lifetime. The path does not
    /// exist yet; whoever stages content writes to it. `suffix` is appended
    /// verbatim (e.g. ".mp4", "_extracted").
    pub fn allocate(&self, suffix: &str) -> PathBuf {
        let n = self.seq.fetch_add(1, Ordering::SeqCst);
        let pid = std::process::id();
        self.root.join(format!("stage_{pid}_{n}{suffix}"))
    }

    /// Best-effort deletion. Missing or already-deleted paths are fine;
    /// anything else is logged and swallowed.
    pub fn release(&self, path: &Path) {
        let res = match fs::symlink_metadata(path) {
            Err(_) => return, // already gone
            Ok(md) if md.is_dir() => fs::remove_dir_all(path),
            Ok(_) => fs::remove_file(path),
        };
        if let Err(e) = res {
            tracing::warn!(path = %path.display(), error = %e, "failed to release staged path");
        }
    }

    /// Open a scope that releases everything staged through it on drop.
    pub fn scope(self: &Arc<Self>) -> StagingScope {
        StagingScope {
            staging: Arc::clone(self),
            paths: Vec::new(),
        }
    }
}

/// Scoped acquisition of staged paths.
///
/// Paths allocated (or adopted) through the scope are released exactly
/// once, when the scope drops, whether the operation body returned
/// normally, failed, or was cancelled.
pub struct StagingScope {
    staging: Arc<Staging>,
    paths: Vec<PathBuf>,
}

impl StagingScope {
    pub fn allocate(&mut self, suffix: &str) -> PathBuf {
        let p = self.staging.allocate(suffix);
        self.paths.push(p.clone());
        p
    }

    /// Track a path produced outside the scope (e.g. files enumerated from
    /// an extraction directory) so it is released with the rest.
    pub fn adopt(&mut self, path: PathBuf) {
        self.paths.push(path);
    }

    pub fn tracked(&self) -> &[PathBuf] {
        &self.paths
    }

    /// Release everything now instead of waiting for drop.
    pub fn release_now(&mut self) {
        for p in self.paths.drain(..) {
            self.staging.release(&p);
        }
    }
}

impl Drop for StagingScope {
    fn drop(&mut self) {
        self.release_now();
    }
}
