//! Branch lifecycle orchestration.
//!
//! The [`BranchManager`] owns the registry of live branches and serializes
//! work per branch: every live branch has a slot holding a read/write lock.
//! Mutating operations take the write side, reads take the read side, and
//! nothing is locked across branches. Working directories live at
//! `branch_root/<project>/<user>/<name>` and are rediscovered on start.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::backend::{MergeOutcome, VersionedStorage};
use crate::catalog::{Project, ProjectCatalog, ProjectInfo, User};
use crate::conflict::{ConflictResolver, ResolvePolicy};
use crate::errors::RepoError;
use crate::models::{
    BranchKey, BranchState, BranchStatus, CommitDesc, IndexStatus, Log, ProjectId,
    ResetMode, ResourceInfo, UserId,
};
use crate::resource::ResourceStore;
use crate::status::StatusAggregator;

/// Registry entry for one live branch.
struct BranchSlot {
    working_dir: PathBuf,
    /// `false` while the clone is in flight and after delete.
    alive: RwLock<bool>,
}

impl BranchSlot {
    fn new(working_dir: PathBuf, alive: bool) -> Self {
        Self {
            working_dir,
            alive: RwLock::new(alive),
        }
    }
}

/// Orchestrates branch lifecycle, resource mutation and merging.
pub struct BranchManager {
    branch_root: PathBuf,
    catalog: Arc<dyn ProjectCatalog>,
    backend: Arc<dyn VersionedStorage>,
    branches: Mutex<HashMap<BranchKey, Arc<BranchSlot>>>,
}

impl BranchManager {
    /// Create a manager rooted at `branch_root`, re-registering every working
    /// directory already present there.
    pub fn new(
        branch_root: impl Into<PathBuf>,
        catalog: Arc<dyn ProjectCatalog>,
        backend: Arc<dyn VersionedStorage>,
    ) -> Result<Self, RepoError> {
        let manager = Self {
            branch_root: branch_root.into(),
            catalog,
            backend,
            branches: Mutex::new(HashMap::new()),
        };
        fs::create_dir_all(&manager.branch_root)?;
        let found = manager.rescan()?;
        info!(
            root = %manager.branch_root.display(),
            backend = manager.backend.name(),
            branches = found,
            "branch manager ready"
        );
        Ok(manager)
    }

    fn rescan(&self) -> Result<usize, RepoError> {
        let mut branches = self.branches.lock();
        for project in numbered_dirs(&self.branch_root)? {
            for user in numbered_dirs(&project.1)? {
                for entry in fs::read_dir(&user.1)? {
                    let entry = entry?;
                    let name = entry.file_name().to_string_lossy().to_string();
                    let dir = entry.path();
                    if validate_name(&name).is_err() || !self.backend.is_working_dir(&dir) {
                        debug!(path = %dir.display(), "skipping unrecognised directory");
                        continue;
                    }
                    let key = BranchKey::new(project.0, user.0, name);
                    branches.insert(key, Arc::new(BranchSlot::new(dir, true)));
                }
            }
        }
        Ok(branches.len())
    }

    pub fn backend(&self) -> &dyn VersionedStorage {
        self.backend.as_ref()
    }

    // -----------------------------------------------------------------------
    // Access checks and locking
    // -----------------------------------------------------------------------

    /// The project must exist and `user` must be its owner or a member.
    fn authorize(&self, project: ProjectId, user: UserId) -> Result<(Project, User), RepoError> {
        let p = self
            .catalog
            .project(project)
            .ok_or(RepoError::ProjectNotFound(project))?;
        if !p.is_member(user) {
            warn!(project, user, "rejected non-member");
            return Err(RepoError::Forbidden { project, user });
        }
        let u = self.catalog.user(user).ok_or(RepoError::UserNotFound(user))?;
        Ok((p, u))
    }

    fn working_dir(&self, key: &BranchKey) -> PathBuf {
        self.branch_root
            .join(key.project.to_string())
            .join(key.user.to_string())
            .join(&key.name)
    }

    fn slot(&self, key: &BranchKey) -> Result<Arc<BranchSlot>, RepoError> {
        self.branches
            .lock()
            .get(key)
            .cloned()
            .ok_or_else(|| RepoError::BranchNotFound(key.to_string()))
    }

    /// Run `f` with shared access to the branch working directory.
    fn read<T>(
        &self,
        key: &BranchKey,
        f: impl FnOnce(&Path, &User) -> Result<T, RepoError>,
    ) -> Result<T, RepoError> {
        let (_, user) = self.authorize(key.project, key.user)?;
        let slot = self.slot(key)?;
        let alive = slot.alive.read();
        if !*alive {
            return Err(RepoError::BranchNotFound(key.to_string()));
        }
        f(&slot.working_dir, &user)
    }

    /// Run `f` with exclusive access to the branch working directory.
    fn write<T>(
        &self,
        key: &BranchKey,
        f: impl FnOnce(&Path, &User) -> Result<T, RepoError>,
    ) -> Result<T, RepoError> {
        let (_, user) = self.authorize(key.project, key.user)?;
        let slot = self.slot(key)?;
        let alive = slot.alive.write();
        if !*alive {
            return Err(RepoError::BranchNotFound(key.to_string()));
        }
        f(&slot.working_dir, &user)
    }

    fn status_of(&self, key: &BranchKey, working_dir: &Path) -> Result<BranchStatus, RepoError> {
        StatusAggregator::compute(self.backend.as_ref(), working_dir, &key.name)
    }

    // -----------------------------------------------------------------------
    // Projects
    // -----------------------------------------------------------------------

    /// Create the canonical history of `project`, seeded with the contents of
    /// `seed`. Only the project owner may do this.
    pub fn init_project(
        &self,
        project: ProjectId,
        user: UserId,
        seed: Option<&Path>,
    ) -> Result<CommitDesc, RepoError> {
        let (p, u) = self.authorize(project, user)?;
        if p.owner != user {
            return Err(RepoError::Forbidden { project, user });
        }
        let commit = self.backend.init_canonical(
            &p.repository,
            seed,
            &u.signature(),
            "Initial commit",
        )?;
        info!(project, commit = %commit.id, "canonical history initialized");
        Ok(commit)
    }

    /// Name, owner and member count of `project`, for its members.
    pub fn project_info(&self, project: ProjectId, user: UserId) -> Result<ProjectInfo, RepoError> {
        let (p, _) = self.authorize(project, user)?;
        Ok(p.info())
    }

    /// File content of `path` at the head of the project's canonical history.
    pub fn canonical_data(
        &self,
        project: ProjectId,
        user: UserId,
        path: &str,
    ) -> Result<Vec<u8>, RepoError> {
        let (p, _) = self.authorize(project, user)?;
        if !path.starts_with('/') {
            return Err(RepoError::InvalidRequest(format!(
                "resource path '{path}' must be absolute"
            )));
        }
        Ok(self.backend.read_at(&p.repository, "HEAD", path)?)
    }

    // -----------------------------------------------------------------------
    // Branch lifecycle
    // -----------------------------------------------------------------------

    /// Clone the canonical head into a new branch.
    pub fn create_branch(&self, key: &BranchKey) -> Result<BranchStatus, RepoError> {
        let (project, _) = self.authorize(key.project, key.user)?;
        validate_name(&key.name)?;

        let working_dir = self.working_dir(key);
        let slot = Arc::new(BranchSlot::new(working_dir.clone(), false));
        let mut alive = slot.alive.write();
        {
            let mut branches = self.branches.lock();
            if branches.contains_key(key) {
                return Err(RepoError::BranchExists(key.to_string()));
            }
            branches.insert(key.clone(), Arc::clone(&slot));
        }

        let cloned = (|| -> Result<(), RepoError> {
            if working_dir.exists() {
                warn!(path = %working_dir.display(), "removing stale working directory");
                fs::remove_dir_all(&working_dir)?;
            }
            if let Some(parent) = working_dir.parent() {
                fs::create_dir_all(parent)?;
            }
            self.backend
                .clone_canonical(&project.repository, &working_dir)?;
            Ok(())
        })();

        if let Err(e) = cloned {
            warn!(branch = %key, error = %e, "branch creation failed");
            let mut branches = self.branches.lock();
            if branches.get(key).is_some_and(|s| Arc::ptr_eq(s, &slot)) {
                branches.remove(key);
            }
            let _ = fs::remove_dir_all(&working_dir);
            return Err(e);
        }

        *alive = true;
        info!(branch = %key, "branch created");
        self.status_of(key, &working_dir)
    }

    /// Discard the branch and its working directory.
    pub fn delete_branch(&self, key: &BranchKey) -> Result<(), RepoError> {
        self.authorize(key.project, key.user)?;
        let slot = self.slot(key)?;
        let mut alive = slot.alive.write();
        if !*alive {
            return Err(RepoError::BranchNotFound(key.to_string()));
        }
        fs::remove_dir_all(&slot.working_dir)?;
        *alive = false;

        let mut branches = self.branches.lock();
        if branches.get(key).is_some_and(|s| Arc::ptr_eq(s, &slot)) {
            branches.remove(key);
        }
        info!(branch = %key, "branch deleted");
        Ok(())
    }

    /// Names of the live branches of `user` in `project`, sorted.
    pub fn list_branches(&self, project: ProjectId, user: UserId) -> Result<Vec<String>, RepoError> {
        self.authorize(project, user)?;
        let slots: Vec<(String, Arc<BranchSlot>)> = self
            .branches
            .lock()
            .iter()
            .filter(|(k, _)| k.project == project && k.user == user)
            .map(|(k, s)| (k.name.clone(), Arc::clone(s)))
            .collect();
        let mut names: Vec<String> = slots
            .into_iter()
            .filter(|(_, s)| *s.alive.read())
            .map(|(name, _)| name)
            .collect();
        names.sort();
        Ok(names)
    }

    pub fn branch_status(&self, key: &BranchKey) -> Result<BranchStatus, RepoError> {
        self.read(key, |wd, _| self.status_of(key, wd))
    }

    /// Merge the canonical head into the branch.
    pub fn update_branch(&self, key: &BranchKey) -> Result<BranchStatus, RepoError> {
        self.write(key, |wd, user| {
            if self.backend.merge_pending(wd)? {
                return Err(RepoError::PreconditionFailed(
                    "a merge is in progress; resolve and commitMerge first".into(),
                ));
            }
            match self.backend.merge_canonical(wd, &user.signature())? {
                MergeOutcome::UpToDate => debug!(branch = %key, "already up to date"),
                MergeOutcome::FastForward { head } => {
                    info!(branch = %key, %head, "fast-forwarded")
                }
                MergeOutcome::Merged { commit } => {
                    info!(branch = %key, commit = %commit.id, "merged canonical history")
                }
                MergeOutcome::Pending { conflicts } => {
                    info!(branch = %key, conflicts = conflicts.len(), "merge pending")
                }
            }
            self.status_of(key, wd)
        })
    }

    /// Commit the whole working-tree delta.
    pub fn commit(&self, key: &BranchKey, message: &str) -> Result<CommitDesc, RepoError> {
        if message.trim().is_empty() {
            return Err(RepoError::InvalidRequest("commit message is empty".into()));
        }
        self.write(key, |wd, user| {
            let status = self.status_of(key, wd)?;
            if status.merge_pending {
                return Err(RepoError::PreconditionFailed(
                    "a merge is in progress; use commitMerge".into(),
                ));
            }
            if status.state == BranchState::Clean {
                return Err(RepoError::PreconditionFailed("nothing to commit".into()));
            }
            let commit = self.backend.commit(wd, message, &user.signature())?;
            info!(branch = %key, commit = %commit.id, "committed");
            Ok(commit)
        })
    }

    /// Finalize a pending merge once every conflict is resolved.
    pub fn commit_merge(&self, key: &BranchKey, message: &str) -> Result<CommitDesc, RepoError> {
        if message.trim().is_empty() {
            return Err(RepoError::InvalidRequest("commit message is empty".into()));
        }
        self.write(key, |wd, user| {
            let status = self.status_of(key, wd)?;
            if !status.merge_pending {
                return Err(RepoError::PreconditionFailed("no merge in progress".into()));
            }
            let unresolved = status.unmerged().count();
            if unresolved > 0 {
                return Err(RepoError::PreconditionFailed(format!(
                    "{unresolved} conflicted resource(s) remain unresolved"
                )));
            }
            let commit = self.backend.commit_merge(wd, message, &user.signature())?;
            info!(branch = %key, commit = %commit.id, "merge committed");
            Ok(commit)
        })
    }

    /// Fast-forward the canonical history to the branch head.
    pub fn publish(&self, key: &BranchKey) -> Result<(), RepoError> {
        self.write(key, |wd, _| {
            let status = self.status_of(key, wd)?;
            if status.state == BranchState::Merge {
                return Err(RepoError::PreconditionFailed(
                    "unresolved conflicts; resolve and commitMerge before publishing".into(),
                ));
            }
            if status.merge_pending {
                return Err(RepoError::PreconditionFailed(
                    "a merge is in progress; commitMerge before publishing".into(),
                ));
            }
            self.backend.publish(wd)?;
            info!(branch = %key, "published");
            Ok(())
        })
    }

    /// Move the branch head to `commit_id`, which must be in the branch log.
    pub fn reset(
        &self,
        key: &BranchKey,
        mode: ResetMode,
        commit_id: &str,
    ) -> Result<BranchStatus, RepoError> {
        self.write(key, |wd, _| {
            let reachable = self
                .backend
                .log(wd, usize::MAX)?
                .iter()
                .any(|c| c.id == commit_id);
            if !reachable {
                return Err(RepoError::CommitNotFound(commit_id.to_string()));
            }
            self.backend.reset(wd, mode, commit_id)?;
            info!(branch = %key, %mode, target = commit_id, "reset");
            self.status_of(key, wd)
        })
    }

    pub fn log(&self, key: &BranchKey, max_count: usize) -> Result<Log, RepoError> {
        self.read(key, |wd, _| {
            Ok(Log {
                commits: self.backend.log(wd, max_count)?,
            })
        })
    }

    pub fn resolve(
        &self,
        key: &BranchKey,
        path: &str,
        policy: ResolvePolicy,
    ) -> Result<BranchStatus, RepoError> {
        self.write(key, |wd, _| {
            ConflictResolver::resolve(self.backend.as_ref(), wd, path, policy)?;
            self.status_of(key, wd)
        })
    }

    // -----------------------------------------------------------------------
    // Resources
    // -----------------------------------------------------------------------

    fn mutate(
        &self,
        key: &BranchKey,
        f: impl FnOnce(&ResourceStore<'_>) -> Result<(), RepoError>,
    ) -> Result<BranchStatus, RepoError> {
        self.write(key, |wd, _| {
            let result = f(&ResourceStore::new(self.backend.as_ref(), wd));
            let status = self.status_of(key, wd)?;
            result.map(|_| status)
        })
    }

    pub fn mkdir(&self, key: &BranchKey, path: &str) -> Result<BranchStatus, RepoError> {
        self.mutate(key, |store| store.mkdir(path))
    }

    pub fn put_data(
        &self,
        key: &BranchKey,
        path: &str,
        data: &[u8],
    ) -> Result<BranchStatus, RepoError> {
        self.mutate(key, |store| store.put_data(path, data))
    }

    pub fn delete_resource(&self, key: &BranchKey, path: &str) -> Result<BranchStatus, RepoError> {
        self.mutate(key, |store| store.delete(path))
    }

    pub fn rename_resource(
        &self,
        key: &BranchKey,
        from: &str,
        to: &str,
    ) -> Result<BranchStatus, RepoError> {
        self.mutate(key, |store| store.rename(from, to))
    }

    /// Restore `path` to the last commit. Unmerged paths must go through
    /// [`resolve`](Self::resolve).
    pub fn revert_resource(&self, key: &BranchKey, path: &str) -> Result<BranchStatus, RepoError> {
        self.write(key, |wd, _| {
            let prefix = format!("{}/", path.trim_end_matches('/'));
            let conflicted = self.backend.status(wd)?.into_iter().any(|s| {
                s.index_status == IndexStatus::Unmerged
                    && (s.path == path || path == "/" || s.path.starts_with(&prefix))
            });
            if conflicted {
                return Err(RepoError::PreconditionFailed(format!(
                    "'{path}' has unresolved conflicts; use resolve"
                )));
            }
            let result = ResourceStore::new(self.backend.as_ref(), wd).revert(path);
            let status = self.status_of(key, wd)?;
            result.map(|_| status)
        })
    }

    pub fn get_data(
        &self,
        key: &BranchKey,
        path: &str,
        revision: &str,
    ) -> Result<Vec<u8>, RepoError> {
        self.read(key, |wd, _| {
            ResourceStore::new(self.backend.as_ref(), wd).get_data(path, revision)
        })
    }

    pub fn get_info(&self, key: &BranchKey, path: &str) -> Result<ResourceInfo, RepoError> {
        self.read(key, |wd, _| ResourceStore::new(self.backend.as_ref(), wd).get_info(path))
    }
}

/// Branch names are single path components that are not hidden.
fn validate_name(name: &str) -> Result<(), RepoError> {
    if name.is_empty()
        || name.contains('/')
        || name.contains('\\')
        || name.starts_with('.')
    {
        return Err(RepoError::InvalidRequest(format!(
            "invalid branch name '{name}'"
        )));
    }
    Ok(())
}

/// Subdirectories of `dir` whose names parse as ids.
fn numbered_dirs(dir: &Path) -> Result<Vec<(u64, PathBuf)>, RepoError> {
    let mut found = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Ok(id) = entry.file_name().to_string_lossy().parse::<u64>() {
            found.push((id, entry.path()));
        }
    }
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SnapshotBackend;
    use crate::catalog::InMemoryCatalog;
    use crate::errors::ErrorKind;

    fn manager(dir: &Path) -> BranchManager {
        let catalog = InMemoryCatalog::new();
        catalog.add_user(User::new(1, "Owner", "owner@test.com"));
        catalog.add_user(User::new(2, "Member", "member@test.com"));
        catalog.add_user(User::new(3, "Outsider", "outsider@test.com"));
        let mut project = Project::new(1, "proj1", &dir.join("canonical"), 1);
        project.members.insert(2);
        catalog.add_project(project);

        let manager = BranchManager::new(
            dir.join("branches"),
            Arc::new(catalog),
            Arc::new(SnapshotBackend::new("master")),
        )
        .unwrap();
        manager.init_project(1, 1, None).unwrap();
        manager
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("branch1").is_ok());
        for bad in ["", ".", "..", ".hidden", "a/b", "a\\b"] {
            assert!(validate_name(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn test_create_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(dir.path());
        let status = m.create_branch(&BranchKey::new(1, 1, "b2")).unwrap();
        assert_eq!(status.state, BranchState::Clean);
        m.create_branch(&BranchKey::new(1, 1, "b1")).unwrap();
        m.create_branch(&BranchKey::new(1, 2, "b1")).unwrap();
        assert_eq!(m.list_branches(1, 1).unwrap(), vec!["b1", "b2"]);
        assert_eq!(m.list_branches(1, 2).unwrap(), vec!["b1"]);

        let err = m.create_branch(&BranchKey::new(1, 1, "b1")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    }

    #[test]
    fn test_access_checks() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(dir.path());
        assert_eq!(
            m.create_branch(&BranchKey::new(9, 1, "b")).unwrap_err().kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            m.create_branch(&BranchKey::new(1, 3, "b")).unwrap_err().kind(),
            ErrorKind::Forbidden
        );
        assert_eq!(m.init_project(1, 2, None).unwrap_err().kind(), ErrorKind::Forbidden);
    }

    #[test]
    fn test_project_info_requires_membership() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(dir.path());
        let info = m.project_info(1, 1).unwrap();
        assert_eq!(info.name, "proj1");
        assert_eq!(info.members_count, 2);
        assert_eq!(m.project_info(1, 2).unwrap(), info);
        assert_eq!(m.project_info(1, 3).unwrap_err().kind(), ErrorKind::Forbidden);
        assert_eq!(m.project_info(9, 1).unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_commit_on_clean_branch_fails() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(dir.path());
        let key = BranchKey::new(1, 1, "b");
        m.create_branch(&key).unwrap();
        assert_eq!(
            m.commit(&key, "nothing").unwrap_err().kind(),
            ErrorKind::PreconditionFailed
        );
        assert_eq!(
            m.commit_merge(&key, "nothing").unwrap_err().kind(),
            ErrorKind::PreconditionFailed
        );
    }

    #[test]
    fn test_branches_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let key = BranchKey::new(1, 1, "persisted");
        {
            let m = manager(dir.path());
            m.create_branch(&key).unwrap();
            m.put_data(&key, "/a.txt", b"a").unwrap();
        }
        let catalog = InMemoryCatalog::new();
        catalog.add_user(User::new(1, "Owner", "owner@test.com"));
        catalog.add_project(Project::new(1, "proj1", &dir.path().join("canonical"), 1));
        let m = BranchManager::new(
            dir.path().join("branches"),
            Arc::new(catalog),
            Arc::new(SnapshotBackend::new("master")),
        )
        .unwrap();
        assert_eq!(m.list_branches(1, 1).unwrap(), vec!["persisted"]);
        assert_eq!(m.branch_status(&key).unwrap().state, BranchState::Dirty);
    }

    #[test]
    fn test_reset_to_unknown_commit() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(dir.path());
        let key = BranchKey::new(1, 1, "b");
        m.create_branch(&key).unwrap();
        assert_eq!(
            m.reset(&key, ResetMode::Hard, "0123456789abcdef").unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }
}
