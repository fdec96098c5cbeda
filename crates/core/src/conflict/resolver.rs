//! Conflict resolution for paths left unmerged by an update.
//!
//! [`ConflictResolver::resolve`] applies one side of a conflict to a single
//! path and leaves every other unresolved path untouched.

use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::backend::VersionedStorage;
use crate::errors::RepoError;
use crate::models::IndexStatus;

/// Which side of a conflict wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolvePolicy {
    /// Keep the branch's own content.
    Yours,
    /// Take the canonical history's content.
    Theirs,
}

impl FromStr for ResolvePolicy {
    type Err = RepoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "yours" | "ours" => Ok(Self::Yours),
            "theirs" => Ok(Self::Theirs),
            other => Err(RepoError::InvalidRequest(format!(
                "unknown resolve policy '{other}'"
            ))),
        }
    }
}

impl std::fmt::Display for ResolvePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Yours => write!(f, "yours"),
            Self::Theirs => write!(f, "theirs"),
        }
    }
}

/// Stateless conflict resolution operations.
pub struct ConflictResolver;

impl ConflictResolver {
    /// Resolve the conflict on `path` with `policy`.
    ///
    /// Fails with a precondition error when `path` is not currently unmerged.
    pub fn resolve(
        backend: &dyn VersionedStorage,
        working_dir: &Path,
        path: &str,
        policy: ResolvePolicy,
    ) -> Result<(), RepoError> {
        let unmerged = backend
            .status(working_dir)?
            .into_iter()
            .any(|s| s.path == path && s.index_status == IndexStatus::Unmerged);
        if !unmerged {
            warn!(path, "resolve requested for a path without a conflict");
            return Err(RepoError::PreconditionFailed(format!(
                "'{path}' is not in a conflicted state"
            )));
        }

        backend.resolve(working_dir, path, policy)?;
        info!(path, %policy, "conflict resolved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;

    #[test]
    fn test_parse_policy() {
        assert_eq!("yours".parse::<ResolvePolicy>().unwrap(), ResolvePolicy::Yours);
        assert_eq!("THEIRS".parse::<ResolvePolicy>().unwrap(), ResolvePolicy::Theirs);
        assert_eq!("ours".parse::<ResolvePolicy>().unwrap(), ResolvePolicy::Yours);

        let err = "mine".parse::<ResolvePolicy>().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
    }

    #[test]
    fn test_display_round_trips() {
        for policy in [ResolvePolicy::Yours, ResolvePolicy::Theirs] {
            assert_eq!(policy.to_string().parse::<ResolvePolicy>().unwrap(), policy);
        }
    }
}
