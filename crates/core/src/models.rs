//! Domain model types shared by the branch manager, resource store, status
//! aggregator and storage backends.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::RepoError;

pub type ProjectId = u64;
pub type UserId = u64;

// ---------------------------------------------------------------------------
// Branch identity and state
// ---------------------------------------------------------------------------

/// Identity of a branch: one name per (project, user) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BranchKey {
    pub project: ProjectId,
    pub user: UserId,
    pub name: String,
}

impl BranchKey {
    pub fn new(project: ProjectId, user: UserId, name: impl Into<String>) -> Self {
        Self {
            project,
            user,
            name: name.into(),
        }
    }
}

impl std::fmt::Display for BranchKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.project, self.user, self.name)
    }
}

/// Derived state of a branch. Never stored, always recomputed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BranchState {
    Clean,
    Dirty,
    Merge,
}

impl std::fmt::Display for BranchState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Clean => write!(f, "CLEAN"),
            Self::Dirty => write!(f, "DIRTY"),
            Self::Merge => write!(f, "MERGE"),
        }
    }
}

/// Change classification of a single path in the working tree.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum IndexStatus {
    Added,
    Modified,
    Deleted,
    Renamed,
    Unmerged,
}

impl IndexStatus {
    /// Single-letter status code, as shown by `git status --short`.
    pub fn code(self) -> &'static str {
        match self {
            Self::Added => "A",
            Self::Modified => "M",
            Self::Deleted => "D",
            Self::Renamed => "R",
            Self::Unmerged => "U",
        }
    }
}

impl std::fmt::Display for IndexStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// One entry of a branch status listing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileStatus {
    /// Absolute resource path, e.g. `/content/file1.txt`.
    pub path: String,
    pub index_status: IndexStatus,
    /// Source path of a rename.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_path: Option<String>,
}

impl FileStatus {
    pub fn new(path: impl Into<String>, index_status: IndexStatus) -> Self {
        Self {
            path: path.into(),
            index_status,
            original_path: None,
        }
    }

    pub fn renamed(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            path: to.into(),
            index_status: IndexStatus::Renamed,
            original_path: Some(from.into()),
        }
    }
}

/// Status summary returned for a branch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BranchStatus {
    pub name: String,
    pub state: BranchState,
    pub file_status: Vec<FileStatus>,
    /// A merge has been started and not yet finalized with commitMerge.
    pub merge_pending: bool,
}

impl BranchStatus {
    pub fn unmerged(&self) -> impl Iterator<Item = &FileStatus> {
        self.file_status
            .iter()
            .filter(|s| s.index_status == IndexStatus::Unmerged)
    }
}

// ---------------------------------------------------------------------------
// Resources
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    File,
    Directory,
}

/// Description of a resource in a branch working tree.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceInfo {
    pub resource_type: ResourceType,
    pub name: String,
    pub path: String,
    /// Byte size; always 0 for directories.
    pub size: u64,
    /// Milliseconds since the Unix epoch.
    pub last_modified: i64,
    /// Immediate child names (directories only), sorted.
    #[serde(default)]
    pub sub_resource_names: Vec<String>,
}

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

/// An immutable commit description.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommitDesc {
    pub id: String,
    pub message: String,
    pub author_name: String,
    pub author_email: String,
    pub date: DateTime<Utc>,
}

/// Most-recent-first commit listing.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Log {
    pub commits: Vec<CommitDesc>,
}

/// Author identity attached to new commits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub name: String,
    pub email: String,
}

impl Signature {
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
        }
    }
}

/// How far a reset rewinds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ResetMode {
    /// Move the history pointer only.
    Soft,
    /// Move the history pointer and unstage; the working tree is kept.
    Mixed,
    /// Move the history pointer and discard working-tree changes.
    Hard,
}

impl FromStr for ResetMode {
    type Err = RepoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "soft" => Ok(Self::Soft),
            "mixed" => Ok(Self::Mixed),
            "hard" => Ok(Self::Hard),
            other => Err(RepoError::InvalidRequest(format!(
                "unknown reset mode '{other}'"
            ))),
        }
    }
}

impl std::fmt::Display for ResetMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Soft => write!(f, "soft"),
            Self::Mixed => write!(f, "mixed"),
            Self::Hard => write!(f, "hard"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_mode_parse() {
        assert_eq!("hard".parse::<ResetMode>().unwrap(), ResetMode::Hard);
        assert_eq!("SOFT".parse::<ResetMode>().unwrap(), ResetMode::Soft);
        assert!("sideways".parse::<ResetMode>().is_err());
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(IndexStatus::Unmerged.to_string(), "U");
        assert_eq!(IndexStatus::Renamed.code(), "R");
        assert_eq!(BranchState::Merge.to_string(), "MERGE");
    }

    #[test]
    fn test_branch_status_serializes_state() {
        let status = BranchStatus {
            name: "branch1".into(),
            state: BranchState::Dirty,
            file_status: vec![FileStatus::renamed("/a.txt", "/b.txt")],
            merge_pending: false,
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["state"], "DIRTY");
        assert_eq!(json["file_status"][0]["original_path"], "/a.txt");
        assert_eq!(status.unmerged().count(), 0);
    }
}
