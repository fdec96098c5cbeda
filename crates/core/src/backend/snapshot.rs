//! Self-contained snapshot storage engine.
//!
//! Every working directory (and every canonical location) carries a
//! `.snapshot/` store:
//!
//! ```text
//! .snapshot/
//!   objects/<sha256>     file contents, content-addressed
//!   commits/<id>.json    commit records (parents, message, author, tree)
//!   HEAD                 id of the current commit
//!   ORIGIN               canonical location (clones only)
//!   MERGE.json           pending merge record, present between update and commitMerge
//! ```
//!
//! A commit's tree is a flat map from repository path to blob id, so status is
//! a content comparison of the working files against that map. Canonical head
//! updates are guarded by a `HEAD.lock` file created exclusively, the way git
//! locks refs.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::fs;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

use super::{repo_path, resource_path, MergeOutcome, VersionedStorage};
use crate::conflict::merger::{MarkerLabels, Merger};
use crate::conflict::ResolvePolicy;
use crate::errors::BackendError;
use crate::models::{CommitDesc, FileStatus, IndexStatus, ResetMode, Signature};

const STORE_DIR: &str = ".snapshot";

/// Repository path -> blob id.
type Tree = BTreeMap<String, String>;

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CommitRecord {
    id: String,
    parents: Vec<String>,
    message: String,
    author_name: String,
    author_email: String,
    date: DateTime<Utc>,
    tree: Tree,
}

impl CommitRecord {
    fn new(parents: Vec<String>, message: &str, author: &Signature, tree: Tree) -> Self {
        let mut record = Self {
            id: String::new(),
            parents,
            message: message.to_string(),
            author_name: author.name.clone(),
            author_email: author.email.clone(),
            date: Utc::now(),
            tree,
        };
        let mut hasher = Sha256::new();
        for parent in &record.parents {
            hasher.update(parent.as_bytes());
            hasher.update(b"\n");
        }
        for (path, blob) in &record.tree {
            hasher.update(path.as_bytes());
            hasher.update(b"\0");
            hasher.update(blob.as_bytes());
            hasher.update(b"\n");
        }
        hasher.update(record.author_name.as_bytes());
        hasher.update(record.author_email.as_bytes());
        hasher.update(record.date.to_rfc3339().as_bytes());
        hasher.update(record.message.as_bytes());
        record.id = hex::encode(hasher.finalize());
        record
    }

    fn desc(&self) -> CommitDesc {
        CommitDesc {
            id: self.id.clone(),
            message: self.message.clone(),
            author_name: self.author_name.clone(),
            author_email: self.author_email.clone(),
            date: self.date,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PendingMerge {
    their_head: String,
    /// Unresolved paths and the blob each side had (None = deleted).
    conflicts: BTreeMap<String, ConflictSides>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ConflictSides {
    ours: Option<String>,
    theirs: Option<String>,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// The `.snapshot/` directory of one working directory or canonical location.
struct Store {
    root: PathBuf,
}

impl Store {
    fn open(dir: &Path) -> Result<Self, BackendError> {
        let root = dir.join(STORE_DIR);
        if !root.join("HEAD").is_file() {
            return Err(BackendError::Corrupt {
                path: dir.display().to_string(),
                detail: "no snapshot store".into(),
            });
        }
        Ok(Self { root })
    }

    fn create(dir: &Path) -> Result<Self, BackendError> {
        let root = dir.join(STORE_DIR);
        fs::create_dir_all(root.join("objects"))?;
        fs::create_dir_all(root.join("commits"))?;
        Ok(Self { root })
    }

    fn put_blob(&self, bytes: &[u8]) -> Result<String, BackendError> {
        let id = blob_id(bytes);
        let path = self.root.join("objects").join(&id);
        if !path.exists() {
            write_atomic(&path, bytes)?;
        }
        Ok(id)
    }

    fn blob(&self, id: &str) -> Result<Vec<u8>, BackendError> {
        fs::read(self.root.join("objects").join(id)).map_err(|e| self.corrupt(e, "blob", id))
    }

    fn put_commit(&self, record: &CommitRecord) -> Result<(), BackendError> {
        let path = self.commit_path(&record.id);
        if !path.exists() {
            write_atomic(&path, &serde_json::to_vec_pretty(record)?)?;
        }
        Ok(())
    }

    fn commit(&self, id: &str) -> Result<CommitRecord, BackendError> {
        let bytes = fs::read(self.commit_path(id)).map_err(|e| self.corrupt(e, "commit", id))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn has_commit(&self, id: &str) -> bool {
        is_commit_id(id) && self.commit_path(id).is_file()
    }

    fn commit_path(&self, id: &str) -> PathBuf {
        self.root.join("commits").join(format!("{id}.json"))
    }

    fn head(&self) -> Result<String, BackendError> {
        Ok(fs::read_to_string(self.root.join("HEAD"))?.trim().to_string())
    }

    fn set_head(&self, id: &str) -> Result<(), BackendError> {
        write_atomic(&self.root.join("HEAD"), id.as_bytes())?;
        Ok(())
    }

    fn head_commit(&self) -> Result<CommitRecord, BackendError> {
        self.commit(&self.head()?)
    }

    fn origin(&self) -> Result<PathBuf, BackendError> {
        let origin = fs::read_to_string(self.root.join("ORIGIN"))
            .map_err(|e| self.corrupt(e, "origin", "ORIGIN"))?;
        Ok(PathBuf::from(origin.trim()))
    }

    fn set_origin(&self, origin: &Path) -> Result<(), BackendError> {
        write_atomic(&self.root.join("ORIGIN"), origin.display().to_string().as_bytes())?;
        Ok(())
    }

    fn pending(&self) -> Result<Option<PendingMerge>, BackendError> {
        match fs::read(self.root.join("MERGE.json")) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set_pending(&self, pending: Option<&PendingMerge>) -> Result<(), BackendError> {
        let path = self.root.join("MERGE.json");
        match pending {
            Some(p) => write_atomic(&path, &serde_json::to_vec_pretty(p)?)?,
            None => match fs::remove_file(&path) {
                Err(e) if e.kind() != IoErrorKind::NotFound => return Err(e.into()),
                _ => {}
            },
        }
        Ok(())
    }

    /// Copy every object and commit record of `other` missing here.
    fn import_from(&self, other: &Store) -> Result<(), BackendError> {
        for kind in ["objects", "commits"] {
            for entry in fs::read_dir(other.root.join(kind))? {
                let entry = entry?;
                let name = entry.file_name();
                if name.to_string_lossy().ends_with(".tmp") {
                    continue;
                }
                let target = self.root.join(kind).join(&name);
                if !target.exists() {
                    write_atomic(&target, &fs::read(entry.path())?)?;
                }
            }
        }
        Ok(())
    }

    /// All commits reachable from `id`, `id` included.
    fn ancestors(&self, id: &str) -> Result<HashSet<String>, BackendError> {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([id.to_string()]);
        while let Some(next) = queue.pop_front() {
            if seen.insert(next.clone()) {
                queue.extend(self.commit(&next)?.parents);
            }
        }
        Ok(seen)
    }

    fn is_ancestor(&self, ancestor: &str, of: &str) -> Result<bool, BackendError> {
        Ok(self.ancestors(of)?.contains(ancestor))
    }

    /// Nearest commit reachable from both `a` and `b`.
    fn merge_base(&self, a: &str, b: &str) -> Result<Option<String>, BackendError> {
        let from_a = self.ancestors(a)?;
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([b.to_string()]);
        while let Some(next) = queue.pop_front() {
            if from_a.contains(&next) {
                return Ok(Some(next));
            }
            if seen.insert(next.clone()) {
                queue.extend(self.commit(&next)?.parents);
            }
        }
        Ok(None)
    }

    /// Resolve a branch name, `HEAD`, a full commit id or an unambiguous id
    /// prefix.
    fn resolve_revision(&self, revision: &str, branch: &str) -> Result<String, BackendError> {
        if revision == "HEAD" || revision == branch {
            return self.head();
        }
        if self.has_commit(revision) {
            return Ok(revision.to_string());
        }
        if revision.len() >= 4 && is_commit_id(revision) {
            let mut matches = Vec::new();
            for entry in fs::read_dir(self.root.join("commits"))? {
                let name = entry?.file_name().to_string_lossy().to_string();
                if let Some(id) = name.strip_suffix(".json") {
                    if id.starts_with(revision) {
                        matches.push(id.to_string());
                    }
                }
            }
            if matches.len() == 1 {
                return Ok(matches.remove(0));
            }
        }
        Err(BackendError::RevisionNotFound(revision.to_string()))
    }

    /// Take the canonical head lock. The returned guard releases it on drop.
    fn lock_head(&self) -> Result<HeadLock, BackendError> {
        let path = self.root.join("HEAD.lock");
        match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => Ok(HeadLock { path, committed: false }),
            Err(e) if e.kind() == IoErrorKind::AlreadyExists => Err(BackendError::Rejected(
                "canonical head is locked by another publish".into(),
            )),
            Err(e) => Err(e.into()),
        }
    }

    fn corrupt(&self, err: std::io::Error, what: &str, id: &str) -> BackendError {
        if err.kind() == IoErrorKind::NotFound {
            BackendError::Corrupt {
                path: self.root.display().to_string(),
                detail: format!("missing {what} {id}"),
            }
        } else {
            BackendError::Io(err)
        }
    }
}

struct HeadLock {
    path: PathBuf,
    committed: bool,
}

impl HeadLock {
    /// Write the new head through the lock file and move it into place.
    fn commit(mut self, id: &str) -> Result<(), BackendError> {
        fs::write(&self.path, id.as_bytes())?;
        fs::rename(&self.path, self.path.with_file_name("HEAD"))?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for HeadLock {
    fn drop(&mut self) {
        if !self.committed {
            let _ = fs::remove_file(&self.path);
        }
    }
}

// ---------------------------------------------------------------------------
// Working-tree helpers
// ---------------------------------------------------------------------------

fn blob_id(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let n = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!("{file_name}.{}.{n}.tmp", std::process::id()));
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)
}

/// Every regular file under `dir` except the store itself.
fn scan_files(dir: &Path) -> Result<BTreeMap<String, PathBuf>, BackendError> {
    let mut files = BTreeMap::new();
    let walker = WalkDir::new(dir)
        .min_depth(1)
        .into_iter()
        .filter_entry(|e| !(e.depth() == 1 && e.file_name() == STORE_DIR));
    for entry in walker {
        let entry = entry.map_err(|e| BackendError::Io(e.into()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(dir)
            .map_err(|_| BackendError::Corrupt {
                path: dir.display().to_string(),
                detail: format!("unexpected path {}", entry.path().display()),
            })?
            .components()
            .map(|c| c.as_os_str().to_string_lossy().to_string())
            .collect::<Vec<_>>()
            .join("/");
        files.insert(rel, entry.path().to_path_buf());
    }
    Ok(files)
}

/// Blob ids of the working tree, without storing anything.
fn hash_tree(dir: &Path) -> Result<Tree, BackendError> {
    scan_files(dir)?
        .into_iter()
        .map(|(rel, abs)| Ok((rel, blob_id(&fs::read(abs)?))))
        .collect()
}

/// Store every working file and return the resulting tree.
fn snapshot_tree(store: &Store, dir: &Path) -> Result<Tree, BackendError> {
    scan_files(dir)?
        .into_iter()
        .map(|(rel, abs)| Ok((rel, store.put_blob(&fs::read(abs)?)?)))
        .collect()
}

fn write_file(dir: &Path, rel: &str, bytes: &[u8]) -> Result<(), BackendError> {
    let path = dir.join(rel);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    if fs::read(&path).map(|existing| existing != bytes).unwrap_or(true) {
        fs::write(&path, bytes)?;
    }
    Ok(())
}

/// Remove a file and any parent directories it leaves empty.
fn remove_file(dir: &Path, rel: &str) -> Result<(), BackendError> {
    let path = dir.join(rel);
    match fs::remove_file(&path) {
        Err(e) if e.kind() != IoErrorKind::NotFound => return Err(e.into()),
        _ => {}
    }
    let mut parent = path.parent();
    while let Some(p) = parent {
        if p == dir || fs::remove_dir(p).is_err() {
            break;
        }
        parent = p.parent();
    }
    Ok(())
}

/// Bring the working tree from `from` to `to`: files only in `from` are
/// removed, files in `to` are written.
fn checkout(store: &Store, dir: &Path, from: &Tree, to: &Tree) -> Result<(), BackendError> {
    for rel in from.keys().filter(|k| !to.contains_key(*k)) {
        remove_file(dir, rel)?;
    }
    for (rel, blob) in to {
        write_file(dir, rel, &store.blob(blob)?)?;
    }
    Ok(())
}

/// Commit ids are lowercase hex; anything else never names a record.
fn is_commit_id(id: &str) -> bool {
    !id.is_empty() && id.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f'))
}

fn under(rel: &str, prefix: &str) -> bool {
    prefix.is_empty() || rel == prefix || rel.starts_with(&format!("{prefix}/"))
}

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

/// [`VersionedStorage`] over `.snapshot/` stores.
#[derive(Debug, Clone)]
pub struct SnapshotBackend {
    branch: String,
}

impl SnapshotBackend {
    /// `branch` is the revision name that aliases the branch head.
    pub fn new(branch: impl Into<String>) -> Self {
        Self {
            branch: branch.into(),
        }
    }

    fn labels(&self) -> (String, String) {
        ("HEAD".to_string(), format!("origin/{}", self.branch))
    }
}

impl VersionedStorage for SnapshotBackend {
    fn name(&self) -> &'static str {
        "snapshot"
    }

    fn metadata_dir(&self) -> &'static str {
        STORE_DIR
    }

    #[instrument(skip(self, author, message), fields(location = %location.display()))]
    fn init_canonical(
        &self,
        location: &Path,
        seed: Option<&Path>,
        author: &Signature,
        message: &str,
    ) -> Result<CommitDesc, BackendError> {
        if location.join(STORE_DIR).exists() {
            return Err(BackendError::Rejected(format!(
                "canonical history already exists at {}",
                location.display()
            )));
        }
        fs::create_dir_all(location)?;
        let store = Store::create(location)?;
        let tree = match seed {
            Some(seed) => snapshot_tree(&store, seed)?,
            None => Tree::new(),
        };
        let record = CommitRecord::new(Vec::new(), message, author, tree);
        store.put_commit(&record)?;
        store.set_head(&record.id)?;
        info!(commit = %record.id, files = record.tree.len(), "canonical history created");
        Ok(record.desc())
    }

    #[instrument(skip(self), fields(canonical = %canonical.display(), working_dir = %working_dir.display()))]
    fn clone_canonical(&self, canonical: &Path, working_dir: &Path) -> Result<(), BackendError> {
        let canon = Store::open(canonical)?;
        fs::create_dir_all(working_dir)?;
        let store = Store::create(working_dir)?;
        let head = canon.head()?;
        store.import_from(&canon)?;
        store.set_head(&head)?;
        store.set_origin(&fs::canonicalize(canonical)?)?;
        checkout(&store, working_dir, &Tree::new(), &store.commit(&head)?.tree)?;
        info!(head = %head, "clone completed");
        Ok(())
    }

    fn is_working_dir(&self, dir: &Path) -> bool {
        let root = dir.join(STORE_DIR);
        root.join("HEAD").is_file() && root.join("ORIGIN").is_file()
    }

    fn status(&self, working_dir: &Path) -> Result<Vec<FileStatus>, BackendError> {
        let store = Store::open(working_dir)?;
        let head = store.head_commit()?.tree;
        let work = hash_tree(working_dir)?;

        let mut added: Vec<&String> = Vec::new();
        let mut entries: BTreeMap<String, FileStatus> = BTreeMap::new();
        for (rel, blob) in &work {
            match head.get(rel) {
                None => added.push(rel),
                Some(h) if h != blob => {
                    entries.insert(rel.clone(), FileStatus::new(resource_path(rel), IndexStatus::Modified));
                }
                Some(_) => {}
            }
        }

        let mut paired: HashSet<&String> = HashSet::new();
        for (rel, blob) in head.iter().filter(|(k, _)| !work.contains_key(*k)) {
            let partner = added
                .iter()
                .find(|a| !paired.contains(**a) && work.get(**a) == Some(blob))
                .copied();
            match partner {
                Some(to) => {
                    paired.insert(to);
                    entries.insert(to.clone(), FileStatus::renamed(resource_path(rel), resource_path(to)));
                }
                None => {
                    entries.insert(rel.clone(), FileStatus::new(resource_path(rel), IndexStatus::Deleted));
                }
            }
        }
        for rel in added.into_iter().filter(|a| !paired.contains(*a)) {
            entries.insert(rel.clone(), FileStatus::new(resource_path(rel), IndexStatus::Added));
        }

        if let Some(pending) = store.pending()? {
            for rel in pending.conflicts.keys() {
                entries.insert(rel.clone(), FileStatus::new(resource_path(rel), IndexStatus::Unmerged));
            }
        }

        debug!(count = entries.len(), "computed working tree status");
        Ok(entries.into_values().collect())
    }

    fn merge_pending(&self, working_dir: &Path) -> Result<bool, BackendError> {
        Ok(Store::open(working_dir)?.pending()?.is_some())
    }

    #[instrument(skip(self, message, author), fields(working_dir = %working_dir.display()))]
    fn commit(
        &self,
        working_dir: &Path,
        message: &str,
        author: &Signature,
    ) -> Result<CommitDesc, BackendError> {
        let store = Store::open(working_dir)?;
        if store.pending()?.is_some() {
            return Err(BackendError::Rejected("a merge is in progress".into()));
        }
        let head = store.head_commit()?;
        let tree = snapshot_tree(&store, working_dir)?;
        if tree == head.tree {
            return Err(BackendError::Rejected("nothing to commit".into()));
        }
        let record = CommitRecord::new(vec![head.id], message, author, tree);
        store.put_commit(&record)?;
        store.set_head(&record.id)?;
        info!(commit = %record.id, "created commit");
        Ok(record.desc())
    }

    #[instrument(skip(self, message, author), fields(working_dir = %working_dir.display()))]
    fn commit_merge(
        &self,
        working_dir: &Path,
        message: &str,
        author: &Signature,
    ) -> Result<CommitDesc, BackendError> {
        let store = Store::open(working_dir)?;
        let pending = store
            .pending()?
            .ok_or_else(|| BackendError::Rejected("no merge in progress".into()))?;
        if !pending.conflicts.is_empty() {
            return Err(BackendError::Rejected(format!(
                "{} conflicted path(s) remain unresolved",
                pending.conflicts.len()
            )));
        }
        let tree = snapshot_tree(&store, working_dir)?;
        let record = CommitRecord::new(
            vec![store.head()?, pending.their_head.clone()],
            message,
            author,
            tree,
        );
        store.put_commit(&record)?;
        store.set_head(&record.id)?;
        store.set_pending(None)?;
        info!(commit = %record.id, "created merge commit");
        Ok(record.desc())
    }

    #[instrument(skip(self, author), fields(working_dir = %working_dir.display()))]
    fn merge_canonical(
        &self,
        working_dir: &Path,
        author: &Signature,
    ) -> Result<MergeOutcome, BackendError> {
        let store = Store::open(working_dir)?;
        if store.pending()?.is_some() {
            return Err(BackendError::Rejected("a merge is already in progress".into()));
        }
        let canon = Store::open(&store.origin()?)?;
        // Head before import: a published head's objects are already in canon.
        let their_head = canon.head()?;
        store.import_from(&canon)?;

        let head = store.head_commit()?;
        let theirs = store.commit(&their_head)?;
        if theirs.id == head.id || store.is_ancestor(&theirs.id, &head.id)? {
            debug!("branch already contains canonical head");
            return Ok(MergeOutcome::UpToDate);
        }

        let dirty = !self.status(working_dir)?.is_empty();
        if !dirty && store.is_ancestor(&head.id, &theirs.id)? {
            checkout(&store, working_dir, &head.tree, &theirs.tree)?;
            store.set_head(&theirs.id)?;
            info!(head = %theirs.id, "fast-forwarded to canonical head");
            return Ok(MergeOutcome::FastForward { head: theirs.id });
        }

        let base = match store.merge_base(&head.id, &theirs.id)? {
            Some(id) => store.commit(&id)?.tree,
            None => Tree::new(),
        };
        let ours = if dirty {
            snapshot_tree(&store, working_dir)?
        } else {
            head.tree.clone()
        };

        let (ours_label, theirs_label) = self.labels();
        let labels = MarkerLabels {
            ours: &ours_label,
            theirs: &theirs_label,
        };

        let paths: BTreeSet<&String> = base.keys().chain(ours.keys()).chain(theirs.tree.keys()).collect();
        let mut merged = Tree::new();
        let mut conflicts: BTreeMap<String, ConflictSides> = BTreeMap::new();
        for rel in paths {
            let b = base.get(rel);
            let o = ours.get(rel);
            let t = theirs.tree.get(rel);
            let winner = if o == t || t == b {
                o
            } else if o == b {
                t
            } else {
                match (o, t) {
                    (Some(o), Some(t)) => {
                        let base_bytes = match b {
                            Some(b) => store.blob(b)?,
                            None => Vec::new(),
                        };
                        let (ob, tb) = (store.blob(o)?, store.blob(t)?);
                        match (
                            std::str::from_utf8(&base_bytes),
                            std::str::from_utf8(&ob),
                            std::str::from_utf8(&tb),
                        ) {
                            (Ok(bs), Ok(os), Ok(ts)) => {
                                let result = Merger::three_way_merge(bs, os, ts, labels);
                                let blob = store.put_blob(result.merged_content.as_bytes())?;
                                merged.insert(rel.clone(), blob);
                                if !result.has_conflicts {
                                    continue;
                                }
                            }
                            _ => {
                                merged.insert(rel.clone(), o.clone());
                            }
                        }
                    }
                    (Some(present), None) | (None, Some(present)) => {
                        merged.insert(rel.clone(), present.clone());
                    }
                    (None, None) => {}
                }
                debug!(path = %rel, "conflict");
                conflicts.insert(
                    rel.clone(),
                    ConflictSides {
                        ours: o.cloned(),
                        theirs: t.cloned(),
                    },
                );
                continue;
            };
            if let Some(blob) = winner {
                merged.insert(rel.clone(), blob.clone());
            }
        }

        checkout(&store, working_dir, &ours, &merged)?;

        if conflicts.is_empty() && !dirty {
            let message = format!("Merge {} into {}", theirs_label, self.branch);
            let record = CommitRecord::new(vec![head.id, theirs.id], &message, author, merged);
            store.put_commit(&record)?;
            store.set_head(&record.id)?;
            info!(commit = %record.id, "merged canonical head");
            return Ok(MergeOutcome::Merged {
                commit: record.desc(),
            });
        }

        let paths: Vec<String> = conflicts.keys().map(|k| resource_path(k)).collect();
        store.set_pending(Some(&PendingMerge {
            their_head: theirs.id,
            conflicts,
        }))?;
        info!(conflicts = paths.len(), "merge pending");
        Ok(MergeOutcome::Pending { conflicts: paths })
    }

    fn resolve(
        &self,
        working_dir: &Path,
        path: &str,
        policy: ResolvePolicy,
    ) -> Result<(), BackendError> {
        let store = Store::open(working_dir)?;
        let rel = repo_path(path);
        let mut pending = store
            .pending()?
            .ok_or_else(|| BackendError::NotUnmerged(path.to_string()))?;
        let sides = pending
            .conflicts
            .remove(rel)
            .ok_or_else(|| BackendError::NotUnmerged(path.to_string()))?;

        let chosen = match policy {
            ResolvePolicy::Yours => sides.ours,
            ResolvePolicy::Theirs => sides.theirs,
        };
        match chosen {
            Some(blob) => write_file(working_dir, rel, &store.blob(&blob)?)?,
            None => remove_file(working_dir, rel)?,
        }
        store.set_pending(Some(&pending))?;
        debug!(path, %policy, remaining = pending.conflicts.len(), "applied resolution");
        Ok(())
    }

    #[instrument(skip(self), fields(working_dir = %working_dir.display()))]
    fn publish(&self, working_dir: &Path) -> Result<(), BackendError> {
        let store = Store::open(working_dir)?;
        if store.pending()?.is_some() {
            return Err(BackendError::Rejected("a merge is in progress".into()));
        }
        let canon = Store::open(&store.origin()?)?;
        let head = store.head()?;

        let lock = canon.lock_head()?;
        let canonical_head = canon.head()?;
        if canonical_head == head {
            debug!("canonical head already at branch head");
            return Ok(());
        }
        if !store.has_commit(&canonical_head) || !store.is_ancestor(&canonical_head, &head)? {
            warn!(canonical = %canonical_head, branch = %head, "publish is not a fast-forward");
            return Err(BackendError::Rejected(
                "canonical history has advanced; update the branch first".into(),
            ));
        }
        canon.import_from(&store)?;
        lock.commit(&head)?;
        info!(head = %head, "published branch head");
        Ok(())
    }

    #[instrument(skip(self), fields(working_dir = %working_dir.display()))]
    fn reset(
        &self,
        working_dir: &Path,
        mode: ResetMode,
        commit_id: &str,
    ) -> Result<(), BackendError> {
        let store = Store::open(working_dir)?;
        if !store.has_commit(commit_id) {
            return Err(BackendError::RevisionNotFound(commit_id.to_string()));
        }
        let pending = store.pending()?.is_some();
        match mode {
            ResetMode::Soft if pending => {
                return Err(BackendError::Rejected(
                    "cannot soft reset in the middle of a merge".into(),
                ));
            }
            ResetMode::Soft | ResetMode::Mixed => {}
            ResetMode::Hard => {
                let mut from = store.head_commit()?.tree;
                if pending {
                    // Files written by the merge count as tracked.
                    for (rel, id) in hash_tree(working_dir)? {
                        from.entry(rel).or_insert(id);
                    }
                }
                checkout(&store, working_dir, &from, &store.commit(commit_id)?.tree)?;
            }
        }
        store.set_head(commit_id)?;
        store.set_pending(None)?;
        info!(%mode, target = commit_id, "reset branch head");
        Ok(())
    }

    fn log(&self, working_dir: &Path, max_count: usize) -> Result<Vec<CommitDesc>, BackendError> {
        let store = Store::open(working_dir)?;
        let head = store.head_commit()?;
        let mut seen = HashSet::from([head.id.clone()]);
        let mut frontier = vec![head];
        let mut commits = Vec::new();
        while commits.len() < max_count && !frontier.is_empty() {
            let newest = frontier
                .iter()
                .enumerate()
                .max_by_key(|(_, c)| c.date)
                .map(|(i, _)| i)
                .unwrap_or(0);
            let record = frontier.swap_remove(newest);
            for parent in &record.parents {
                if seen.insert(parent.clone()) {
                    frontier.push(store.commit(parent)?);
                }
            }
            commits.push(record.desc());
        }
        Ok(commits)
    }

    fn read_at(
        &self,
        working_dir: &Path,
        revision: &str,
        path: &str,
    ) -> Result<Vec<u8>, BackendError> {
        let store = Store::open(working_dir)?;
        let id = store.resolve_revision(revision, &self.branch)?;
        let tree = store.commit(&id)?.tree;
        let rel = repo_path(path);
        if let Some(blob) = tree.get(rel) {
            return store.blob(blob);
        }
        if tree.keys().any(|k| under(k, rel)) {
            return Err(BackendError::NotAFile(path.to_string()));
        }
        Err(BackendError::PathNotFound {
            revision: revision.to_string(),
            path: path.to_string(),
        })
    }

    fn restore(&self, working_dir: &Path, path: &str) -> Result<(), BackendError> {
        let store = Store::open(working_dir)?;
        let rel = repo_path(path);
        for (k, blob) in store.head_commit()?.tree.iter().filter(|(k, _)| under(k, rel)) {
            write_file(working_dir, k, &store.blob(blob)?)?;
        }
        Ok(())
    }
}
