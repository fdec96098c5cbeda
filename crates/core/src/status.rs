//! Branch status computation.
//!
//! Status is never stored: every call asks the backend for the working-tree
//! delta and derives the branch state from it.

use std::path::Path;

use tracing::debug;

use crate::backend::VersionedStorage;
use crate::errors::RepoError;
use crate::models::{BranchState, BranchStatus, FileStatus, IndexStatus};

/// Stateless status computation over a backend.
pub struct StatusAggregator;

impl StatusAggregator {
    /// Compute the full status of the branch checked out at `working_dir`.
    pub fn compute(
        backend: &dyn VersionedStorage,
        working_dir: &Path,
        name: &str,
    ) -> Result<BranchStatus, RepoError> {
        let file_status = backend.status(working_dir)?;
        let merge_pending = backend.merge_pending(working_dir)?;
        let state = Self::derive_state(&file_status, merge_pending);
        debug!(
            branch = name,
            %state,
            entries = file_status.len(),
            merge_pending,
            "computed branch status"
        );
        Ok(BranchStatus {
            name: name.to_string(),
            state,
            file_status,
            merge_pending,
        })
    }

    /// Any unmerged entry makes the branch MERGE; otherwise any entry (or a
    /// merge awaiting commitMerge) makes it DIRTY.
    pub fn derive_state(entries: &[FileStatus], merge_pending: bool) -> BranchState {
        if entries
            .iter()
            .any(|e| e.index_status == IndexStatus::Unmerged)
        {
            BranchState::Merge
        } else if !entries.is_empty() || merge_pending {
            BranchState::Dirty
        } else {
            BranchState::Clean
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(path: &str, status: IndexStatus) -> FileStatus {
        FileStatus::new(path, status)
    }

    #[test]
    fn test_empty_is_clean() {
        assert_eq!(StatusAggregator::derive_state(&[], false), BranchState::Clean);
    }

    #[test]
    fn test_entries_are_dirty() {
        let entries = vec![
            entry("/a.txt", IndexStatus::Added),
            entry("/b.txt", IndexStatus::Deleted),
        ];
        assert_eq!(StatusAggregator::derive_state(&entries, false), BranchState::Dirty);
    }

    #[test]
    fn test_unmerged_wins() {
        let entries = vec![
            entry("/a.txt", IndexStatus::Modified),
            entry("/b.txt", IndexStatus::Unmerged),
        ];
        assert_eq!(StatusAggregator::derive_state(&entries, true), BranchState::Merge);
    }

    #[test]
    fn test_resolved_merge_is_dirty() {
        assert_eq!(StatusAggregator::derive_state(&[], true), BranchState::Dirty);
    }

    #[test]
    fn test_compute_against_backend() {
        use crate::backend::SnapshotBackend;
        use crate::models::Signature;

        let dir = tempfile::tempdir().unwrap();
        let backend = SnapshotBackend::new("master");
        let canonical = dir.path().join("canonical");
        backend
            .init_canonical(&canonical, None, &Signature::new("T", "t@t.com"), "init")
            .unwrap();
        let wd = dir.path().join("wd");
        backend.clone_canonical(&canonical, &wd).unwrap();

        let status = StatusAggregator::compute(&backend, &wd, "b1").unwrap();
        assert_eq!(status.state, BranchState::Clean);

        std::fs::write(wd.join("x.txt"), "x").unwrap();
        let status = StatusAggregator::compute(&backend, &wd, "b1").unwrap();
        assert_eq!(status.state, BranchState::Dirty);
        assert_eq!(status.file_status, vec![entry("/x.txt", IndexStatus::Added)]);
    }
}
