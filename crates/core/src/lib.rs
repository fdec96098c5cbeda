//! crepo core library.
//!
//! Branch-versioning core of a collaborative content repository: per-user
//! working branches cloned from a project's canonical history, path-addressed
//! resource operations, status derivation, merge and conflict resolution, and
//! publishing back into the canonical history.

pub mod backend;
pub mod branch;
pub mod catalog;
pub mod config;
pub mod conflict;
pub mod errors;
pub mod models;
pub mod resource;
pub mod status;

// Re-exports for convenience.
pub use backend::{GitBackend, SnapshotBackend, VersionedStorage};
pub use branch::BranchManager;
pub use catalog::{InMemoryCatalog, Project, ProjectCatalog, User};
pub use config::RepoConfig;
pub use errors::{ErrorKind, RepoError};
pub use models::{BranchKey, BranchState, BranchStatus, ResetMode};
