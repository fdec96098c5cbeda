//! Shared harness and scenarios for the branch lifecycle suites.
//!
//! Each scenario takes a [`Harness`] so the same behaviour is checked against
//! every storage backend.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;

use crepo_core::conflict::{Merger, ResolvePolicy};
use crepo_core::{
    BranchKey, BranchManager, BranchState, ErrorKind, InMemoryCatalog, Project, ResetMode,
    User, VersionedStorage,
};

pub const PROJECT: u64 = 1;
pub const OWNER: u64 = 1;
pub const MEMBER: u64 = 2;
pub const OUTSIDER: u64 = 3;

pub struct Harness {
    pub dir: TempDir,
    pub canonical: PathBuf,
    pub manager: BranchManager,
}

impl Harness {
    pub fn new(backend: Arc<dyn VersionedStorage>, canonical_name: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let seed = dir.path().join("seed");
        std::fs::create_dir_all(seed.join("content")).unwrap();
        std::fs::write(seed.join("content/file1.txt"), "file1 data\n").unwrap();
        std::fs::write(seed.join("content/file2.txt"), "file2 data\n").unwrap();
        std::fs::write(seed.join("content/test space.txt"), "test space data\n").unwrap();

        let canonical = dir.path().join(canonical_name);
        let catalog = InMemoryCatalog::new();
        catalog.add_user(User::new(OWNER, "Owner", "owner@test.com"));
        catalog.add_user(User::new(MEMBER, "Member", "member@test.com"));
        catalog.add_user(User::new(OUTSIDER, "Outsider", "outsider@test.com"));
        let mut project = Project::new(PROJECT, "proj1", &canonical, OWNER);
        project.members.insert(MEMBER);
        catalog.add_project(project);

        let manager =
            BranchManager::new(dir.path().join("branches"), Arc::new(catalog), backend).unwrap();
        manager
            .init_project(PROJECT, OWNER, Some(&seed))
            .unwrap();
        Self {
            dir,
            canonical,
            manager,
        }
    }

    pub fn branch(&self, user: u64, name: &str) -> BranchKey {
        let key = BranchKey::new(PROJECT, user, name);
        self.manager.create_branch(&key).unwrap();
        key
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn canonical_text(&self, path: &str) -> String {
        String::from_utf8(self.manager.canonical_data(PROJECT, OWNER, path).unwrap()).unwrap()
    }

    pub fn text(&self, key: &BranchKey, path: &str) -> String {
        String::from_utf8(self.manager.get_data(key, path, "").unwrap()).unwrap()
    }

    /// A member commits `content` to `path` on a fresh branch and publishes it.
    pub fn publish_from_member(&self, branch: &str, path: &str, content: &str) {
        let key = self.branch(MEMBER, branch);
        self.manager.put_data(&key, path, content.as_bytes()).unwrap();
        self.manager.commit(&key, "member change").unwrap();
        self.manager.publish(&key).unwrap();
    }
}

// ===========================================================================
// End-to-end scenarios
// ===========================================================================

pub fn put_commit_and_log(h: &Harness) {
    let key = h.branch(OWNER, "branch1");
    let status = h
        .manager
        .put_data(&key, "/content/foo/bar.txt", b"bar data")
        .unwrap();
    assert_eq!(status.state, BranchState::Dirty);
    assert_eq!(h.text(&key, "/content/foo/bar.txt"), "bar data");

    let commit = h.manager.commit(&key, "m").unwrap();
    assert_eq!(commit.author_email, "owner@test.com");
    let log = h.manager.log(&key, 1).unwrap();
    assert_eq!(log.commits.len(), 1);
    assert_eq!(log.commits[0].id, commit.id);
    assert_eq!(h.manager.branch_status(&key).unwrap().state, BranchState::Clean);
}

pub fn conflicting_update_resolved_with_theirs(h: &Harness) {
    let key = h.branch(OWNER, "branch1");
    h.manager
        .put_data(&key, "/content/file1.txt", b"new file1 data\n")
        .unwrap();
    h.manager.commit(&key, "ours").unwrap();

    h.publish_from_member("other", "/content/file1.txt", "file1 data testing\n");

    let status = h.manager.update_branch(&key).unwrap();
    assert_eq!(status.state, BranchState::Merge);
    let unmerged: Vec<_> = status.unmerged().map(|s| s.path.clone()).collect();
    assert_eq!(unmerged, vec!["/content/file1.txt".to_string()]);
    let content = h.manager.get_data(&key, "/content/file1.txt", "").unwrap();
    assert!(Merger::has_conflict_markers(&content));

    // MERGE blocks commit, publish and update.
    assert_eq!(
        h.manager.publish(&key).unwrap_err().kind(),
        ErrorKind::PreconditionFailed
    );
    assert_eq!(h.canonical_text("/content/file1.txt"), "file1 data testing\n");
    assert_eq!(
        h.manager.commit(&key, "nope").unwrap_err().kind(),
        ErrorKind::PreconditionFailed
    );
    assert_eq!(
        h.manager.commit_merge(&key, "nope").unwrap_err().kind(),
        ErrorKind::PreconditionFailed
    );
    assert_eq!(
        h.manager.update_branch(&key).unwrap_err().kind(),
        ErrorKind::PreconditionFailed
    );

    let status = h
        .manager
        .resolve(&key, "/content/file1.txt", ResolvePolicy::Theirs)
        .unwrap();
    assert_eq!(status.state, BranchState::Dirty);
    assert_eq!(h.text(&key, "/content/file1.txt"), "file1 data testing\n");

    let merge = h.manager.commit_merge(&key, "m").unwrap();
    assert_eq!(h.manager.branch_status(&key).unwrap().state, BranchState::Clean);
    assert_eq!(h.manager.log(&key, 1).unwrap().commits[0].id, merge.id);

    h.manager.publish(&key).unwrap();
    assert_eq!(h.canonical_text("/content/file1.txt"), "file1 data testing\n");
}

pub fn conflicting_update_resolved_with_yours(h: &Harness) {
    let key = h.branch(OWNER, "branch1");
    h.manager
        .put_data(&key, "/content/file1.txt", b"new file1 data\n")
        .unwrap();
    h.manager.commit(&key, "ours").unwrap();
    h.publish_from_member("other", "/content/file1.txt", "file1 data testing\n");

    h.manager.update_branch(&key).unwrap();
    assert_eq!(
        h.manager
            .resolve(&key, "/content/file2.txt", ResolvePolicy::Yours)
            .unwrap_err()
            .kind(),
        ErrorKind::PreconditionFailed
    );
    h.manager
        .resolve(&key, "/content/file1.txt", ResolvePolicy::Yours)
        .unwrap();
    let content = h.manager.get_data(&key, "/content/file1.txt", "").unwrap();
    assert!(!Merger::has_conflict_markers(&content));
    assert_eq!(content, b"new file1 data\n");

    h.manager.commit_merge(&key, "keep ours").unwrap();
    h.manager.publish(&key).unwrap();
    assert_eq!(h.canonical_text("/content/file1.txt"), "new file1 data\n");
}

pub fn delete_is_not_idempotent(h: &Harness) {
    let missing = BranchKey::new(PROJECT, OWNER, "does_not_exist");
    assert_eq!(
        h.manager.delete_branch(&missing).unwrap_err().kind(),
        ErrorKind::NotFound
    );

    let key = h.branch(OWNER, "branch1");
    h.manager.delete_branch(&key).unwrap();
    assert_eq!(h.manager.delete_branch(&key).unwrap_err().kind(), ErrorKind::NotFound);
    assert_eq!(h.manager.branch_status(&key).unwrap_err().kind(), ErrorKind::NotFound);

    // The name is free again.
    h.manager.create_branch(&key).unwrap();
}

pub fn directory_rename_lists_every_file(h: &Harness) {
    let key = h.branch(OWNER, "branch1");
    h.manager.mkdir(&key, "/dir").unwrap();
    for i in 1..=4 {
        h.manager
            .put_data(&key, &format!("/dir/file{i}.txt"), format!("file {i}\n").as_bytes())
            .unwrap();
    }
    h.manager.commit(&key, "add dir").unwrap();

    let status = h.manager.rename_resource(&key, "/dir", "/dir2").unwrap();
    assert_eq!(status.state, BranchState::Dirty);
    assert_eq!(status.file_status.len(), 4, "{:?}", status.file_status);
}

pub fn fast_forward_update(h: &Harness) {
    let key = h.branch(OWNER, "branch1");
    h.publish_from_member("other", "/content/new.txt", "new\n");

    let status = h.manager.update_branch(&key).unwrap();
    assert_eq!(status.state, BranchState::Clean);
    assert_eq!(h.text(&key, "/content/new.txt"), "new\n");
}

pub fn clean_three_way_update(h: &Harness) {
    let key = h.branch(OWNER, "branch1");
    h.manager
        .put_data(&key, "/content/file2.txt", b"file2 changed\n")
        .unwrap();
    h.manager.commit(&key, "ours").unwrap();
    h.publish_from_member("other", "/content/file1.txt", "file1 changed\n");

    let status = h.manager.update_branch(&key).unwrap();
    assert_eq!(status.state, BranchState::Clean);
    assert!(!status.merge_pending);
    assert_eq!(h.text(&key, "/content/file1.txt"), "file1 changed\n");
    assert_eq!(h.text(&key, "/content/file2.txt"), "file2 changed\n");
    h.manager.publish(&key).unwrap();
    assert_eq!(h.canonical_text("/content/file2.txt"), "file2 changed\n");
}

pub fn update_into_dirty_tree(h: &Harness) {
    let key = h.branch(OWNER, "branch1");
    h.manager
        .put_data(&key, "/content/file2.txt", b"uncommitted\n")
        .unwrap();
    h.publish_from_member("other", "/content/file1.txt", "file1 changed\n");

    let status = h.manager.update_branch(&key).unwrap();
    assert_eq!(status.state, BranchState::Dirty);
    assert!(status.merge_pending);
    assert_eq!(h.text(&key, "/content/file1.txt"), "file1 changed\n");
    assert_eq!(h.text(&key, "/content/file2.txt"), "uncommitted\n");

    h.manager.commit_merge(&key, "merge").unwrap();
    let status = h.manager.branch_status(&key).unwrap();
    assert_eq!(status.state, BranchState::Clean);
}

pub fn dirty_state_follows_renames_and_reverts(h: &Harness) {
    let key = h.branch(OWNER, "branch1");
    h.manager
        .put_data(&key, "/content/new_file.txt", b"new file data")
        .unwrap();
    let status = h
        .manager
        .rename_resource(&key, "/content/new_file.txt", "/content/new_file2.txt")
        .unwrap();
    assert_eq!(status.file_status.len(), 1, "{:?}", status.file_status);
    let status = h.manager.revert_resource(&key, "/content/new_file2.txt").unwrap();
    assert_eq!(status.state, BranchState::Clean);

    h.manager
        .put_data(&key, "/content/new_file.txt", b"new file data")
        .unwrap();
    let status = h.manager.rename_resource(&key, "/content", "/content2").unwrap();
    assert_eq!(status.state, BranchState::Dirty);
    // Three moved files plus the new one.
    assert_eq!(status.file_status.len(), 4, "{:?}", status.file_status);

    h.manager.rename_resource(&key, "/content2", "/content").unwrap();
    let status = h.manager.revert_resource(&key, "/content/new_file.txt").unwrap();
    assert_eq!(status.state, BranchState::Clean, "{:?}", status.file_status);
}

pub fn hard_reset_abandons_pending_merge(h: &Harness) {
    let key = h.branch(OWNER, "branch1");
    h.manager
        .put_data(&key, "/content/file1.txt", b"new file1 data\n")
        .unwrap();
    let ours = h.manager.commit(&key, "ours").unwrap();

    let other = h.branch(MEMBER, "other");
    h.manager
        .put_data(&other, "/content/file1.txt", b"file1 data testing\n")
        .unwrap();
    h.manager.put_data(&other, "/content/added.txt", b"added\n").unwrap();
    h.manager.commit(&other, "theirs").unwrap();
    h.manager.publish(&other).unwrap();

    let status = h.manager.update_branch(&key).unwrap();
    assert_eq!(status.state, BranchState::Merge);
    assert_eq!(h.text(&key, "/content/added.txt"), "added\n");

    let status = h.manager.reset(&key, ResetMode::Hard, &ours.id).unwrap();
    assert_eq!(status.state, BranchState::Clean, "{:?}", status.file_status);
    assert!(status.file_status.is_empty());
    assert!(!status.merge_pending);
    assert_eq!(h.text(&key, "/content/file1.txt"), "new file1 data\n");
    assert_eq!(
        h.manager
            .get_data(&key, "/content/added.txt", "")
            .unwrap_err()
            .kind(),
        ErrorKind::NotFound
    );
    assert_eq!(h.manager.log(&key, 1).unwrap().commits[0].id, ours.id);
}

// ===========================================================================
// Properties
// ===========================================================================

pub fn mkdir_is_idempotent(h: &Harness) {
    let key = h.branch(OWNER, "branch1");
    let first = h.manager.mkdir(&key, "/content/a/b").unwrap();
    let second = h.manager.mkdir(&key, "/content/a/b").unwrap();
    assert_eq!(first, second);
    h.manager.mkdir(&key, "/content/a").unwrap();
    assert_eq!(
        h.manager.get_info(&key, "/content/a").unwrap().sub_resource_names,
        vec!["b"]
    );
}

pub fn content_based_dirty_detection(h: &Harness) {
    let key = h.branch(OWNER, "branch1");
    let status = h
        .manager
        .put_data(&key, "/content/file1.txt", b"file1 data\n")
        .unwrap();
    assert_eq!(status.state, BranchState::Clean);

    let status = h
        .manager
        .put_data(&key, "/content/file1.txt", b"different\n")
        .unwrap();
    assert_eq!(status.state, BranchState::Dirty);
    let status = h
        .manager
        .put_data(&key, "/content/file1.txt", b"file1 data\n")
        .unwrap();
    assert_eq!(status.state, BranchState::Clean);
}

pub fn revert_law(h: &Harness) {
    let key = h.branch(OWNER, "branch1");
    h.manager
        .put_data(&key, "/content/test space.txt", b"edited\n")
        .unwrap();
    let status = h.manager.revert_resource(&key, "/content/test space.txt").unwrap();
    assert_eq!(status.state, BranchState::Clean);

    h.manager.delete_resource(&key, "/content").unwrap();
    let status = h.manager.revert_resource(&key, "/content").unwrap();
    assert_eq!(status.state, BranchState::Clean);
    assert_eq!(h.text(&key, "/content/file2.txt"), "file2 data\n");
}

pub fn hard_reset_bounds_log(h: &Harness) {
    let key = h.branch(OWNER, "branch1");
    h.manager.put_data(&key, "/content/v.txt", b"1").unwrap();
    let first = h.manager.commit(&key, "first").unwrap();
    h.manager.put_data(&key, "/content/v.txt", b"2").unwrap();
    let second = h.manager.commit(&key, "second").unwrap();
    h.manager.put_data(&key, "/content/v.txt", b"dirty").unwrap();

    let status = h.manager.reset(&key, ResetMode::Hard, &first.id).unwrap();
    assert_eq!(status.state, BranchState::Clean);
    let log = h.manager.log(&key, 10).unwrap();
    assert_eq!(log.commits[0].id, first.id);
    assert!(log.commits.iter().all(|c| c.id != second.id));
    assert_eq!(h.text(&key, "/content/v.txt"), "1");

    assert_eq!(
        h.manager
            .reset(&key, ResetMode::Hard, &second.id)
            .unwrap_err()
            .kind(),
        ErrorKind::NotFound
    );
}

pub fn read_errors(h: &Harness) {
    let key = h.branch(OWNER, "branch1");
    assert_eq!(
        h.manager.get_data(&key, "/content", "").unwrap_err().kind(),
        ErrorKind::InvalidRequest
    );
    assert_eq!(
        h.manager
            .get_data(&key, "/content/file1.txt", "does_not_exist")
            .unwrap_err()
            .kind(),
        ErrorKind::NotFound
    );
    assert_eq!(
        h.manager.get_data(&key, "/content/file1.txt", "master").unwrap(),
        b"file1 data\n"
    );

    h.manager.put_data(&key, "/content/file1.txt", b"edited").unwrap();
    assert_eq!(
        h.manager.get_data(&key, "/content/file1.txt", "HEAD").unwrap(),
        b"file1 data\n"
    );
    assert_eq!(
        h.manager.delete_resource(&key, "/content/file1.txt/x").unwrap_err().kind(),
        ErrorKind::InvalidRequest
    );
}

pub fn non_members_are_forbidden(h: &Harness) {
    let key = BranchKey::new(PROJECT, OUTSIDER, "branch1");
    assert_eq!(h.manager.create_branch(&key).unwrap_err().kind(), ErrorKind::Forbidden);
    assert_eq!(
        h.manager.list_branches(PROJECT, OUTSIDER).unwrap_err().kind(),
        ErrorKind::Forbidden
    );
    assert_eq!(
        h.manager
            .create_branch(&BranchKey::new(42, OWNER, "branch1"))
            .unwrap_err()
            .kind(),
        ErrorKind::NotFound
    );
}

// ===========================================================================
// Concurrency
// ===========================================================================

pub fn concurrent_writes_on_one_branch(h: &Harness) {
    let key = h.branch(OWNER, "branch1");
    std::thread::scope(|s| {
        for i in 0..8 {
            let key = &key;
            let manager = &h.manager;
            s.spawn(move || {
                manager
                    .put_data(key, &format!("/parallel/file{i}.txt"), format!("{i}").as_bytes())
                    .unwrap();
            });
        }
    });
    let status = h.manager.branch_status(&key).unwrap();
    assert_eq!(status.file_status.len(), 8);
    h.manager.commit(&key, "parallel").unwrap();
}

pub fn concurrent_creates_of_one_branch(h: &Harness) {
    let key = BranchKey::new(PROJECT, OWNER, "contested");
    let results: Vec<_> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..4)
            .map(|_| s.spawn(|| h.manager.create_branch(&key).map(|_| ())))
            .collect();
        handles.into_iter().map(|t| t.join().unwrap()).collect()
    });
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    for err in results.into_iter().filter_map(Result::err) {
        assert_eq!(err.kind(), ErrorKind::AlreadyExists, "{err}");
    }
}

pub fn independent_branches_in_parallel(h: &Harness) {
    std::thread::scope(|s| {
        for i in 0..4 {
            let manager = &h.manager;
            s.spawn(move || {
                let key = BranchKey::new(PROJECT, if i % 2 == 0 { OWNER } else { MEMBER }, format!("b{i}"));
                manager.create_branch(&key).unwrap();
                manager.put_data(&key, "/content/mine.txt", format!("{i}").as_bytes()).unwrap();
                manager.commit(&key, "mine").unwrap();
                assert_eq!(manager.get_data(&key, "/content/mine.txt", "HEAD").unwrap(), format!("{i}").as_bytes());
            });
        }
    });
    assert_eq!(h.manager.list_branches(PROJECT, OWNER).unwrap(), vec!["b0", "b2"]);
}

pub fn concurrent_publishes_admit_one(h: &Harness) {
    let a = h.branch(OWNER, "a");
    let b = h.branch(MEMBER, "b");
    h.manager.put_data(&a, "/content/a.txt", b"a").unwrap();
    h.manager.commit(&a, "a").unwrap();
    h.manager.put_data(&b, "/content/b.txt", b"b").unwrap();
    h.manager.commit(&b, "b").unwrap();

    let results: Vec<_> = std::thread::scope(|s| {
        let ta = s.spawn(|| h.manager.publish(&a));
        let tb = s.spawn(|| h.manager.publish(&b));
        vec![ta.join().unwrap(), tb.join().unwrap()]
    });
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    let err = results.into_iter().find_map(Result::err).unwrap();
    assert_eq!(err.kind(), ErrorKind::PreconditionFailed);
}

pub fn update_while_another_branch_publishes(h: &Harness) {
    const ROUNDS: usize = 30;
    let writer = h.branch(MEMBER, "writer");
    let reader = h.branch(OWNER, "reader");

    std::thread::scope(|s| {
        s.spawn(|| {
            for i in 0..ROUNDS {
                h.manager
                    .put_data(&writer, "/content/counter.txt", format!("{i}\n").as_bytes())
                    .unwrap();
                h.manager.commit(&writer, "tick").unwrap();
                h.manager.publish(&writer).unwrap();
            }
        });
        s.spawn(|| {
            for _ in 0..ROUNDS {
                let status = h.manager.update_branch(&reader).unwrap();
                assert_eq!(status.state, BranchState::Clean);
            }
        });
    });

    h.manager.update_branch(&reader).unwrap();
    assert_eq!(h.text(&reader, "/content/counter.txt"), format!("{}\n", ROUNDS - 1));
}
