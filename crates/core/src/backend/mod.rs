//! Versioned-storage backends.
//!
//! The branch manager drives history exclusively through
//! [`VersionedStorage`]. Paths crossing this interface are absolute resource
//! paths (`/content/file1.txt`); each backend maps them to its own layout.

pub mod git;
pub mod snapshot;

use std::path::Path;

use crate::conflict::ResolvePolicy;
use crate::errors::BackendError;
use crate::models::{CommitDesc, FileStatus, ResetMode, Signature};

pub use git::GitBackend;
pub use snapshot::SnapshotBackend;

/// Result of merging the canonical head into a branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The branch already contains the canonical head.
    UpToDate,
    /// The branch head moved forward to the canonical head.
    FastForward { head: String },
    /// A conflict-free merge was committed automatically.
    Merged { commit: CommitDesc },
    /// The merge was applied to the working tree but awaits commitMerge.
    /// `conflicts` lists the unmerged resource paths (possibly empty).
    Pending { conflicts: Vec<String> },
}

/// Primitive operations the core needs from a versioned-storage engine.
pub trait VersionedStorage: Send + Sync {
    /// Short engine name for logs.
    fn name(&self) -> &'static str;

    /// Name of the metadata directory the engine keeps at the root of every
    /// working directory. Resource operations never expose or touch it.
    fn metadata_dir(&self) -> &'static str;

    /// Create a canonical history at `location`, committing the contents of
    /// `seed` (if any) as the first commit.
    fn init_canonical(
        &self,
        location: &Path,
        seed: Option<&Path>,
        author: &Signature,
        message: &str,
    ) -> Result<CommitDesc, BackendError>;

    /// Clone the canonical head into a fresh `working_dir`.
    fn clone_canonical(&self, canonical: &Path, working_dir: &Path) -> Result<(), BackendError>;

    /// Whether `dir` holds a working directory of this engine.
    fn is_working_dir(&self, dir: &Path) -> bool;

    /// Working-tree delta against the last commit, sorted by path.
    fn status(&self, working_dir: &Path) -> Result<Vec<FileStatus>, BackendError>;

    /// Whether a merge has been started and not yet committed.
    fn merge_pending(&self, working_dir: &Path) -> Result<bool, BackendError>;

    /// Record the whole working-tree delta as a new commit.
    fn commit(
        &self,
        working_dir: &Path,
        message: &str,
        author: &Signature,
    ) -> Result<CommitDesc, BackendError>;

    /// Finalize a pending merge as a two-parent commit.
    fn commit_merge(
        &self,
        working_dir: &Path,
        message: &str,
        author: &Signature,
    ) -> Result<CommitDesc, BackendError>;

    /// Fetch the canonical head and merge it into the branch.
    fn merge_canonical(
        &self,
        working_dir: &Path,
        author: &Signature,
    ) -> Result<MergeOutcome, BackendError>;

    /// Apply one side of a conflict to `path` and mark it resolved.
    fn resolve(
        &self,
        working_dir: &Path,
        path: &str,
        policy: ResolvePolicy,
    ) -> Result<(), BackendError>;

    /// Fast-forward the canonical head to the branch head.
    fn publish(&self, working_dir: &Path) -> Result<(), BackendError>;

    /// Move the branch head to `commit_id`.
    fn reset(&self, working_dir: &Path, mode: ResetMode, commit_id: &str)
        -> Result<(), BackendError>;

    /// Up to `max_count` commits reachable from the branch head, newest first.
    fn log(&self, working_dir: &Path, max_count: usize) -> Result<Vec<CommitDesc>, BackendError>;

    /// File content of `path` at `revision` (a branch name, `HEAD` or a
    /// commit id).
    fn read_at(&self, working_dir: &Path, revision: &str, path: &str)
        -> Result<Vec<u8>, BackendError>;

    /// Re-create `path` (file or subtree) in the working tree as it is in the
    /// last commit. Paths absent from the last commit are left absent.
    fn restore(&self, working_dir: &Path, path: &str) -> Result<(), BackendError>;
}

/// `/content/a.txt` -> `content/a.txt`.
pub(crate) fn repo_path(resource_path: &str) -> &str {
    resource_path.trim_start_matches('/')
}

/// `content/a.txt` -> `/content/a.txt`.
pub(crate) fn resource_path(repo_path: &str) -> String {
    format!("/{}", repo_path.trim_start_matches('/'))
}
