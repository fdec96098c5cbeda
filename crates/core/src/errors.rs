//! Error types for the crepo core library.
//!
//! Each subsystem has its own error type derived with `thiserror`. Every
//! public branch or resource operation returns [`RepoError`], whose
//! [`ErrorKind`] stays recoverable by callers independently of the numeric
//! status the transport layer chooses.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{ProjectId, UserId};

// ---------------------------------------------------------------------------
// Error classification
// ---------------------------------------------------------------------------

/// Classification of a [`RepoError`], mapped by the boundary layer to its own
/// protocol codes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    Forbidden,
    InvalidRequest,
    PreconditionFailed,
    BackendFailure,
}

impl ErrorKind {
    /// HTTP-style status class for this kind.
    pub fn status_code(self) -> u16 {
        match self {
            Self::NotFound => 404,
            Self::AlreadyExists => 409,
            Self::Forbidden => 403,
            Self::InvalidRequest | Self::PreconditionFailed => 400,
            Self::BackendFailure => 500,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound => write!(f, "not_found"),
            Self::AlreadyExists => write!(f, "already_exists"),
            Self::Forbidden => write!(f, "forbidden"),
            Self::InvalidRequest => write!(f, "invalid_request"),
            Self::PreconditionFailed => write!(f, "precondition_failed"),
            Self::BackendFailure => write!(f, "backend_failure"),
        }
    }
}

/// Serializable error body handed to the transport layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorPayload {
    pub kind: ErrorKind,
    pub status: u16,
    pub message: String,
}

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Error returned by every branch and resource operation.
#[derive(Debug, Error)]
pub enum RepoError {
    #[error("project {0} not found")]
    ProjectNotFound(ProjectId),

    #[error("user {0} not found")]
    UserNotFound(UserId),

    #[error("branch '{0}' not found")]
    BranchNotFound(String),

    #[error("resource '{0}' not found")]
    ResourceNotFound(String),

    #[error("revision '{0}' not found")]
    RevisionNotFound(String),

    /// A reset target that is not reachable from the branch head.
    #[error("commit '{0}' is not in the branch history")]
    CommitNotFound(String),

    #[error("branch '{0}' already exists")]
    BranchExists(String),

    #[error("user {user} is not a member of project {project}")]
    Forbidden { project: ProjectId, user: UserId },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The operation is not valid for the branch's current state.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("storage backend failure: {0}")]
    Backend(#[source] BackendError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RepoError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ProjectNotFound(_)
            | Self::UserNotFound(_)
            | Self::BranchNotFound(_)
            | Self::ResourceNotFound(_)
            | Self::RevisionNotFound(_)
            | Self::CommitNotFound(_) => ErrorKind::NotFound,
            Self::BranchExists(_) => ErrorKind::AlreadyExists,
            Self::Forbidden { .. } => ErrorKind::Forbidden,
            Self::InvalidRequest(_) => ErrorKind::InvalidRequest,
            Self::PreconditionFailed(_) => ErrorKind::PreconditionFailed,
            Self::Backend(_) | Self::Io(_) => ErrorKind::BackendFailure,
        }
    }

    pub fn status_code(&self) -> u16 {
        self.kind().status_code()
    }

    pub fn payload(&self) -> ErrorPayload {
        ErrorPayload {
            kind: self.kind(),
            status: self.status_code(),
            message: self.to_string(),
        }
    }
}

impl From<BackendError> for RepoError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::RevisionNotFound(rev) => Self::RevisionNotFound(rev),
            BackendError::PathNotFound { path, .. } => Self::ResourceNotFound(path),
            BackendError::NotAFile(path) => {
                Self::InvalidRequest(format!("'{path}' is a directory, not a file"))
            }
            BackendError::NotUnmerged(path) => {
                Self::PreconditionFailed(format!("'{path}' is not in a conflicted state"))
            }
            BackendError::Rejected(detail) => Self::PreconditionFailed(detail),
            other => Self::Backend(other),
        }
    }
}

// ---------------------------------------------------------------------------
// Storage backend errors
// ---------------------------------------------------------------------------

/// Errors reported by a [`VersionedStorage`](crate::backend::VersionedStorage)
/// primitive.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The revision selector does not resolve to a commit.
    #[error("revision '{0}' does not resolve")]
    RevisionNotFound(String),

    /// The revision resolves but the path is absent in it.
    #[error("path '{path}' not found at revision '{revision}'")]
    PathNotFound { revision: String, path: String },

    /// A content read hit a directory.
    #[error("'{0}' is not a file")]
    NotAFile(String),

    /// Resolve was requested for a path without a pending conflict.
    #[error("'{0}' is not unmerged")]
    NotUnmerged(String),

    /// The canonical history refused the operation (e.g. non-fast-forward).
    #[error("rejected: {0}")]
    Rejected(String),

    /// Working directory or store metadata is missing or inconsistent.
    #[error("corrupt working directory '{path}': {detail}")]
    Corrupt { path: String, detail: String },

    #[error("git2 error: {0}")]
    Git(#[from] git2::Error),

    #[error("metadata encoding error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("backend I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue { field: String, detail: String },

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}
