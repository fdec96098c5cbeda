//! Git storage engine via `git2`.
//!
//! The canonical history is a bare repository; every branch working
//! directory is a clone of it with the remote `origin`. Update fetches the
//! canonical branch and merges it, publish pushes the branch head back.

use std::fs;
use std::path::Path;

use chrono::{TimeZone, Utc};
use git2::build::{CheckoutBuilder, RepoBuilder};
use git2::{
    ErrorCode, IndexAddOption, ObjectType, Oid, PushOptions, RemoteCallbacks, Repository,
    RepositoryState, ResetType, Status, StatusOptions, Tree,
};
use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use super::{repo_path, resource_path, MergeOutcome, VersionedStorage};
use crate::conflict::ResolvePolicy;
use crate::errors::BackendError;
use crate::models::{CommitDesc, FileStatus, IndexStatus, ResetMode, Signature};

const REMOTE: &str = "origin";

/// [`VersionedStorage`] over git repositories.
#[derive(Debug)]
pub struct GitBackend {
    main_branch: String,
    /// Serializes pushes to canonical histories from this process.
    publish_lock: Mutex<()>,
}

impl GitBackend {
    /// `main_branch` is the branch name used in the canonical repository and
    /// in every clone.
    pub fn new(main_branch: impl Into<String>) -> Self {
        Self {
            main_branch: main_branch.into(),
            publish_lock: Mutex::new(()),
        }
    }

    fn open(&self, working_dir: &Path) -> Result<Repository, BackendError> {
        Repository::open(working_dir).map_err(|e| BackendError::Corrupt {
            path: working_dir.display().to_string(),
            detail: e.message().to_string(),
        })
    }

    fn remote_ref(&self) -> String {
        format!("refs/remotes/{REMOTE}/{}", self.main_branch)
    }

    fn their_label(&self) -> String {
        format!("{REMOTE}/{}", self.main_branch)
    }

    fn fetch(&self, repo: &Repository) -> Result<Oid, BackendError> {
        let mut remote = repo.find_remote(REMOTE)?;
        let refspec = format!("+refs/heads/{0}:{1}", self.main_branch, self.remote_ref());
        remote.fetch(&[refspec.as_str()], None, None)?;
        let oid = repo
            .find_reference(&self.remote_ref())?
            .target()
            .ok_or_else(|| BackendError::Corrupt {
                path: repo.path().display().to_string(),
                detail: format!("{} is symbolic", self.remote_ref()),
            })?;
        debug!(canonical = %oid, "fetch completed");
        Ok(oid)
    }

    fn require_clean_state(repo: &Repository, what: &str) -> Result<(), BackendError> {
        match repo.state() {
            RepositoryState::Clean => Ok(()),
            RepositoryState::Merge => Err(BackendError::Rejected(format!(
                "cannot {what}: a merge is in progress"
            ))),
            other => Err(BackendError::Rejected(format!(
                "cannot {what}: repository is in state {other:?}"
            ))),
        }
    }
}

fn signature(author: &Signature) -> Result<git2::Signature<'static>, BackendError> {
    Ok(git2::Signature::now(&author.name, &author.email)?)
}

fn commit_desc(commit: &git2::Commit<'_>) -> CommitDesc {
    let author = commit.author();
    CommitDesc {
        id: commit.id().to_string(),
        message: commit.message().unwrap_or("").to_string(),
        author_name: author.name().unwrap_or("").to_string(),
        author_email: author.email().unwrap_or("").to_string(),
        date: Utc
            .timestamp_opt(author.when().seconds(), 0)
            .single()
            .unwrap_or_default(),
    }
}

/// Write the contents of `dir` as a tree, skipping `.git`. Empty directories
/// produce no entry.
fn write_dir_tree(repo: &Repository, dir: &Path) -> Result<Option<Oid>, BackendError> {
    let mut builder = repo.treebuilder(None)?;
    let mut entries: Vec<_> = fs::read_dir(dir)?.collect::<Result<_, _>>()?;
    entries.sort_by_key(|e| e.file_name());
    for entry in entries {
        let name = entry.file_name();
        if name == ".git" {
            continue;
        }
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            if let Some(oid) = write_dir_tree(repo, &entry.path())? {
                builder.insert(name.as_os_str(), oid, 0o040000)?;
            }
        } else if file_type.is_file() {
            let oid = repo.blob_path(&entry.path())?;
            builder.insert(name.as_os_str(), oid, 0o100644)?;
        }
    }
    if builder.len() == 0 {
        return Ok(None);
    }
    Ok(Some(builder.write()?))
}

fn empty_tree(repo: &Repository) -> Result<Tree<'_>, BackendError> {
    let oid = repo.treebuilder(None)?.write()?;
    Ok(repo.find_tree(oid)?)
}

fn entry_path(entry: &git2::IndexEntry) -> String {
    String::from_utf8_lossy(&entry.path).to_string()
}

fn stage(entry: &git2::IndexEntry) -> u16 {
    (entry.flags >> 12) & 0x3
}

/// Record one side of a conflict at index stage 1 (base), 2 (ours) or 3 (theirs).
fn add_conflict_side(
    index: &mut git2::Index,
    mut entry: git2::IndexEntry,
    stage: u16,
) -> Result<(), BackendError> {
    entry.flags = (entry.flags & !0x3000) | (stage << 12);
    index.add(&entry)?;
    Ok(())
}

fn stage_all(index: &mut git2::Index) -> Result<(), BackendError> {
    index.add_all(["*"].iter(), IndexAddOption::DEFAULT, None)?;
    index.update_all(["*"].iter(), None)?;
    Ok(())
}

fn map_status(entry: &git2::StatusEntry<'_>) -> Option<FileStatus> {
    let s = entry.status();
    let path = resource_path(entry.path().unwrap_or(""));
    if s.is_conflicted() {
        return Some(FileStatus::new(path, IndexStatus::Unmerged));
    }
    if s.intersects(Status::WT_RENAMED | Status::INDEX_RENAMED) {
        let delta = if s.is_wt_renamed() {
            entry.index_to_workdir()
        } else {
            entry.head_to_index()
        };
        if let Some(delta) = delta {
            let from = delta.old_file().path().map(|p| p.to_string_lossy().to_string());
            let to = delta.new_file().path().map(|p| p.to_string_lossy().to_string());
            if let (Some(from), Some(to)) = (from, to) {
                return Some(FileStatus::renamed(resource_path(&from), resource_path(&to)));
            }
        }
    }
    if s.intersects(Status::WT_NEW | Status::INDEX_NEW) {
        if s.is_wt_deleted() {
            return None;
        }
        return Some(FileStatus::new(path, IndexStatus::Added));
    }
    if s.intersects(Status::WT_DELETED | Status::INDEX_DELETED) {
        return Some(FileStatus::new(path, IndexStatus::Deleted));
    }
    if s.intersects(
        Status::WT_MODIFIED | Status::INDEX_MODIFIED | Status::WT_TYPECHANGE | Status::INDEX_TYPECHANGE,
    ) {
        return Some(FileStatus::new(path, IndexStatus::Modified));
    }
    None
}

impl VersionedStorage for GitBackend {
    fn name(&self) -> &'static str {
        "git"
    }

    fn metadata_dir(&self) -> &'static str {
        ".git"
    }

    #[instrument(skip(self, author, message), fields(location = %location.display()))]
    fn init_canonical(
        &self,
        location: &Path,
        seed: Option<&Path>,
        author: &Signature,
        message: &str,
    ) -> Result<CommitDesc, BackendError> {
        if Repository::open_bare(location).is_ok() {
            return Err(BackendError::Rejected(format!(
                "canonical history already exists at {}",
                location.display()
            )));
        }
        let repo = Repository::init_bare(location)?;
        let tree = match seed.map(|s| write_dir_tree(&repo, s)).transpose()?.flatten() {
            Some(oid) => repo.find_tree(oid)?,
            None => empty_tree(&repo)?,
        };
        let sig = signature(author)?;
        let refname = format!("refs/heads/{}", self.main_branch);
        let oid = repo.commit(Some(&refname), &sig, &sig, message, &tree, &[])?;
        repo.set_head(&refname)?;
        info!(sha = %oid, "canonical repository created");
        let desc = commit_desc(&repo.find_commit(oid)?);
        Ok(desc)
    }

    #[instrument(skip(self), fields(canonical = %canonical.display(), working_dir = %working_dir.display()))]
    fn clone_canonical(&self, canonical: &Path, working_dir: &Path) -> Result<(), BackendError> {
        let url = fs::canonicalize(canonical)?;
        let url = url.to_str().ok_or_else(|| BackendError::Corrupt {
            path: canonical.display().to_string(),
            detail: "path is not valid UTF-8".into(),
        })?;
        info!("cloning canonical repository");
        RepoBuilder::new()
            .branch(&self.main_branch)
            .clone(url, working_dir)?;
        info!("clone completed");
        Ok(())
    }

    fn is_working_dir(&self, dir: &Path) -> bool {
        Repository::open(dir).map(|r| !r.is_bare()).unwrap_or(false)
    }

    fn status(&self, working_dir: &Path) -> Result<Vec<FileStatus>, BackendError> {
        let repo = self.open(working_dir)?;
        let mut opts = StatusOptions::new();
        opts.include_untracked(true)
            .recurse_untracked_dirs(true)
            .include_ignored(false)
            .renames_head_to_index(true)
            .renames_index_to_workdir(true);
        let statuses = repo.statuses(Some(&mut opts))?;
        let mut entries: Vec<FileStatus> = statuses.iter().filter_map(|e| map_status(&e)).collect();
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        entries.dedup_by(|a, b| a.path == b.path);
        debug!(count = entries.len(), "computed working tree status");
        Ok(entries)
    }

    fn merge_pending(&self, working_dir: &Path) -> Result<bool, BackendError> {
        Ok(self.open(working_dir)?.state() == RepositoryState::Merge)
    }

    #[instrument(skip(self, message, author), fields(working_dir = %working_dir.display()))]
    fn commit(
        &self,
        working_dir: &Path,
        message: &str,
        author: &Signature,
    ) -> Result<CommitDesc, BackendError> {
        let repo = self.open(working_dir)?;
        Self::require_clean_state(&repo, "commit")?;
        let mut index = repo.index()?;
        stage_all(&mut index)?;
        index.write()?;
        let tree_oid = index.write_tree()?;
        let parent = repo.head()?.peel_to_commit()?;
        if parent.tree_id() == tree_oid {
            return Err(BackendError::Rejected("nothing to commit".into()));
        }
        let tree = repo.find_tree(tree_oid)?;
        let sig = signature(author)?;
        let oid = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &[&parent])?;
        info!(sha = %oid, "created commit");
        let desc = commit_desc(&repo.find_commit(oid)?);
        Ok(desc)
    }

    #[instrument(skip(self, message, author), fields(working_dir = %working_dir.display()))]
    fn commit_merge(
        &self,
        working_dir: &Path,
        message: &str,
        author: &Signature,
    ) -> Result<CommitDesc, BackendError> {
        let mut repo = self.open(working_dir)?;
        if repo.state() != RepositoryState::Merge {
            return Err(BackendError::Rejected("no merge in progress".into()));
        }
        let mut merge_heads = Vec::new();
        repo.mergehead_foreach(|oid| {
            merge_heads.push(*oid);
            true
        })?;

        let mut index = repo.index()?;
        if index.has_conflicts() {
            return Err(BackendError::Rejected(
                "conflicted paths remain unresolved".into(),
            ));
        }
        stage_all(&mut index)?;
        index.write()?;
        let tree = repo.find_tree(index.write_tree()?)?;

        let mut parents = vec![repo.head()?.peel_to_commit()?];
        for oid in merge_heads {
            parents.push(repo.find_commit(oid)?);
        }
        let parent_refs: Vec<&git2::Commit<'_>> = parents.iter().collect();

        let sig = signature(author)?;
        let oid = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parent_refs)?;
        repo.cleanup_state()?;
        info!(sha = %oid, parents = parent_refs.len(), "created merge commit");
        let desc = commit_desc(&repo.find_commit(oid)?);
        Ok(desc)
    }

    #[instrument(skip(self, author), fields(working_dir = %working_dir.display()))]
    fn merge_canonical(
        &self,
        working_dir: &Path,
        author: &Signature,
    ) -> Result<MergeOutcome, BackendError> {
        let repo = self.open(working_dir)?;
        Self::require_clean_state(&repo, "update")?;
        let their_oid = self.fetch(&repo)?;
        let theirs = repo.find_commit(their_oid)?;
        let head = repo.head()?.peel_to_commit()?;

        if head.id() == theirs.id() || repo.graph_descendant_of(head.id(), theirs.id())? {
            debug!("branch already contains canonical head");
            return Ok(MergeOutcome::UpToDate);
        }

        let dirty = !self.status(working_dir)?.is_empty();
        if !dirty && repo.graph_descendant_of(theirs.id(), head.id())? {
            repo.head()?
                .set_target(theirs.id(), "crepo: fast-forward to canonical")?;
            repo.checkout_head(Some(CheckoutBuilder::new().force()))?;
            info!(sha = %theirs.id(), "fast-forwarded to canonical head");
            return Ok(MergeOutcome::FastForward {
                head: theirs.id().to_string(),
            });
        }

        let base_tree = match repo.merge_base(head.id(), theirs.id()) {
            Ok(oid) => repo.find_commit(oid)?.tree()?,
            Err(e) if e.code() == ErrorCode::NotFound => empty_tree(&repo)?,
            Err(e) => return Err(e.into()),
        };
        let our_tree = if dirty {
            let workdir = repo.workdir().ok_or_else(|| BackendError::Corrupt {
                path: working_dir.display().to_string(),
                detail: "bare repository".into(),
            })?;
            match write_dir_tree(&repo, workdir)? {
                Some(oid) => repo.find_tree(oid)?,
                None => empty_tree(&repo)?,
            }
        } else {
            head.tree()?
        };
        let their_tree = theirs.tree()?;
        let mut merged = repo.merge_trees(&base_tree, &our_tree, &their_tree, None)?;

        if !merged.has_conflicts() && !dirty {
            let tree = repo.find_tree(merged.write_tree_to(&repo)?)?;
            let sig = signature(author)?;
            let message = format!("Merge {} into {}", self.their_label(), self.main_branch);
            let oid = repo.commit(Some("HEAD"), &sig, &sig, &message, &tree, &[&head, &theirs])?;
            repo.checkout_head(Some(CheckoutBuilder::new().force()))?;
            info!(sha = %oid, "merged canonical head");
            let commit = commit_desc(&repo.find_commit(oid)?);
            return Ok(MergeOutcome::Merged { commit });
        }

        let their_label = self.their_label();
        let mut checkout = CheckoutBuilder::new();
        checkout
            .force()
            .allow_conflicts(true)
            .conflict_style_merge(true)
            .our_label("HEAD")
            .their_label(&their_label);
        repo.checkout_index(Some(&mut merged), Some(&mut checkout))?;

        let mut conflicts = Vec::new();
        let mut index = repo.index()?;
        index.clear()?;
        for entry in merged.iter().filter(|e| stage(e) == 0) {
            index.add(&entry)?;
        }
        for conflict in merged.conflicts()? {
            let conflict = conflict?;
            if let Some(entry) = conflict
                .our
                .as_ref()
                .or(conflict.their.as_ref())
                .or(conflict.ancestor.as_ref())
            {
                conflicts.push(resource_path(&entry_path(entry)));
            }
            let sides = [conflict.ancestor, conflict.our, conflict.their];
            for (stage, entry) in (1u16..).zip(sides) {
                if let Some(entry) = entry {
                    add_conflict_side(&mut index, entry, stage)?;
                }
            }
        }
        index.write()?;

        let git_dir = repo.path();
        fs::write(git_dir.join("MERGE_HEAD"), format!("{}\n", theirs.id()))?;
        fs::write(
            git_dir.join("MERGE_MSG"),
            format!("Merge {} into {}\n", their_label, self.main_branch),
        )?;
        info!(conflicts = conflicts.len(), "merge pending");
        Ok(MergeOutcome::Pending { conflicts })
    }

    fn resolve(
        &self,
        working_dir: &Path,
        path: &str,
        policy: ResolvePolicy,
    ) -> Result<(), BackendError> {
        let repo = self.open(working_dir)?;
        let rel = repo_path(path);
        let mut index = repo.index()?;
        let mut found = None;
        for conflict in index.conflicts()? {
            let conflict = conflict?;
            let matches = [&conflict.ancestor, &conflict.our, &conflict.their]
                .iter()
                .any(|e| e.as_ref().map(|e| entry_path(e) == rel).unwrap_or(false));
            if matches {
                found = Some(conflict);
                break;
            }
        }
        let conflict = found.ok_or_else(|| BackendError::NotUnmerged(path.to_string()))?;
        let chosen = match policy {
            ResolvePolicy::Yours => conflict.our,
            ResolvePolicy::Theirs => conflict.their,
        };

        for stage in 1..=3 {
            match index.remove(Path::new(rel), stage) {
                Ok(()) => {}
                Err(e) if e.code() == ErrorCode::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        let target = working_dir.join(rel);
        match chosen {
            Some(entry) => {
                let blob = repo.find_blob(entry.id)?;
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(&target, blob.content())?;
                index.add_path(Path::new(rel))?;
            }
            None => {
                if target.exists() {
                    fs::remove_file(&target)?;
                }
            }
        }
        index.write()?;
        debug!(path, %policy, "applied resolution");
        Ok(())
    }

    #[instrument(skip(self), fields(working_dir = %working_dir.display()))]
    fn publish(&self, working_dir: &Path) -> Result<(), BackendError> {
        let repo = self.open(working_dir)?;
        Self::require_clean_state(&repo, "publish")?;
        let _guard = self.publish_lock.lock();

        let canonical = self.fetch(&repo)?;
        let head = repo.head()?.peel_to_commit()?.id();
        if head == canonical {
            debug!("canonical head already at branch head");
            return Ok(());
        }
        if !repo.graph_descendant_of(head, canonical)? {
            warn!(canonical = %canonical, branch = %head, "publish is not a fast-forward");
            return Err(BackendError::Rejected(
                "canonical history has advanced; update the branch first".into(),
            ));
        }

        info!(remote = REMOTE, branch = %self.main_branch, "pushing");
        let rejection: Mutex<Option<String>> = Mutex::new(None);
        {
            let mut remote = repo.find_remote(REMOTE)?;
            let mut callbacks = RemoteCallbacks::new();
            callbacks.push_update_reference(|refname, status| {
                if let Some(msg) = status {
                    warn!(refname, msg, "push rejected");
                    *rejection.lock() = Some(msg.to_string());
                }
                Ok(())
            });
            let mut push_opts = PushOptions::new();
            push_opts.remote_callbacks(callbacks);
            let refspec = format!("refs/heads/{0}:refs/heads/{0}", self.main_branch);
            match remote.push(&[refspec.as_str()], Some(&mut push_opts)) {
                Err(e) if e.code() == ErrorCode::NotFastForward => {
                    return Err(BackendError::Rejected(e.message().to_string()));
                }
                other => other?,
            }
        }
        if let Some(detail) = rejection.into_inner() {
            return Err(BackendError::Rejected(detail));
        }
        info!(sha = %head, "push completed");
        Ok(())
    }

    #[instrument(skip(self), fields(working_dir = %working_dir.display()))]
    fn reset(
        &self,
        working_dir: &Path,
        mode: ResetMode,
        commit_id: &str,
    ) -> Result<(), BackendError> {
        let repo = self.open(working_dir)?;
        let commit = Oid::from_str(commit_id)
            .and_then(|oid| repo.find_commit(oid))
            .map_err(|_| BackendError::RevisionNotFound(commit_id.to_string()))?;
        let kind = match mode {
            ResetMode::Soft => {
                Self::require_clean_state(&repo, "soft reset")?;
                ResetType::Soft
            }
            ResetMode::Mixed => ResetType::Mixed,
            ResetMode::Hard => ResetType::Hard,
        };
        repo.reset(commit.as_object(), kind, None)?;
        repo.cleanup_state()?;
        info!(%mode, target = commit_id, "reset branch head");
        Ok(())
    }

    fn log(&self, working_dir: &Path, max_count: usize) -> Result<Vec<CommitDesc>, BackendError> {
        let repo = self.open(working_dir)?;
        let mut revwalk = repo.revwalk()?;
        revwalk.push_head()?;
        revwalk.set_sorting(git2::Sort::TOPOLOGICAL | git2::Sort::TIME)?;
        let mut commits = Vec::new();
        for oid in revwalk.take(max_count) {
            commits.push(commit_desc(&repo.find_commit(oid?)?));
        }
        debug!(count = commits.len(), "collected commits");
        Ok(commits)
    }

    fn read_at(
        &self,
        working_dir: &Path,
        revision: &str,
        path: &str,
    ) -> Result<Vec<u8>, BackendError> {
        let repo = self.open(working_dir)?;
        let commit = repo
            .revparse_single(revision)
            .and_then(|obj| obj.peel_to_commit())
            .map_err(|_| BackendError::RevisionNotFound(revision.to_string()))?;
        let rel = repo_path(path);
        if rel.is_empty() {
            return Err(BackendError::NotAFile(path.to_string()));
        }
        let entry = commit
            .tree()?
            .get_path(Path::new(rel))
            .map_err(|_| BackendError::PathNotFound {
                revision: revision.to_string(),
                path: path.to_string(),
            })?;
        match entry.kind() {
            Some(ObjectType::Blob) => Ok(repo.find_blob(entry.id())?.content().to_vec()),
            _ => Err(BackendError::NotAFile(path.to_string())),
        }
    }

    fn restore(&self, working_dir: &Path, path: &str) -> Result<(), BackendError> {
        let repo = self.open(working_dir)?;
        let head = repo.head()?.peel_to_commit()?;
        let rel = repo_path(path);
        let spec = if rel.is_empty() { "*" } else { rel };
        repo.reset_default(Some(head.as_object()), [spec])?;
        let mut checkout = CheckoutBuilder::new();
        checkout.force();
        if !rel.is_empty() {
            checkout.path(rel);
        }
        repo.checkout_tree(head.tree()?.as_object(), Some(&mut checkout))?;
        Ok(())
    }
}
