//! TOML-based configuration for crepo.
//!
//! The configuration names where branch working directories live, which
//! storage backend drives them, and (for the CLI) the users and projects the
//! in-memory catalog is seeded with.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::backend::{GitBackend, SnapshotBackend, VersionedStorage};
use crate::catalog::{InMemoryCatalog, Project, User};
use crate::errors::ConfigError;
use crate::models::{ProjectId, UserId};

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoConfig {
    /// Working-directory and backend settings.
    pub storage: StorageConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Users known to the catalog.
    #[serde(default)]
    pub users: Vec<UserConfig>,

    /// Projects known to the catalog.
    #[serde(default)]
    pub projects: Vec<ProjectConfig>,
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

/// Which versioned-storage engine backs branches.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// libgit2 repositories (bare canonical, one clone per branch).
    #[default]
    Git,
    /// Self-contained content-addressed snapshot store.
    Snapshot,
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory holding `<project>/<user>/<branch>` working directories.
    pub branch_root: PathBuf,

    /// Storage backend.
    #[serde(default)]
    pub backend: BackendKind,

    /// Branch name used inside canonical repositories and every clone.
    #[serde(default = "default_canonical_branch")]
    pub canonical_branch: String,
}

fn default_canonical_branch() -> String {
    "master".into()
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Minimum tracing level or `EnvFilter` directive.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// ---------------------------------------------------------------------------
// Catalog seed
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserConfig {
    pub id: UserId,
    pub name: String,
    pub email: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub id: ProjectId,
    pub name: String,
    /// Location of the canonical repository.
    pub repository: PathBuf,
    pub owner: UserId,
    #[serde(default)]
    pub members: Vec<UserId>,
}

// ---------------------------------------------------------------------------
// Loading & validation
// ---------------------------------------------------------------------------

impl RepoConfig {
    /// Load a [`RepoConfig`] from a TOML file at the given path.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: RepoConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        debug!("configuration parsed successfully");
        Ok(config)
    }

    /// Validate that all required fields are present and sane.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.storage.branch_root.as_os_str().is_empty() {
            return Err(invalid("storage.branch_root", "branch root must not be empty"));
        }
        if self.storage.canonical_branch.trim().is_empty() {
            return Err(invalid(
                "storage.canonical_branch",
                "canonical branch name must not be empty",
            ));
        }

        let mut user_ids = HashSet::new();
        for user in &self.users {
            if !user_ids.insert(user.id) {
                return Err(invalid("users", &format!("duplicate user id {}", user.id)));
            }
        }

        let mut project_ids = HashSet::new();
        for project in &self.projects {
            if !project_ids.insert(project.id) {
                return Err(invalid(
                    "projects",
                    &format!("duplicate project id {}", project.id),
                ));
            }
            if !user_ids.contains(&project.owner) {
                return Err(invalid(
                    "projects.owner",
                    &format!("project {} owner {} is not a declared user", project.id, project.owner),
                ));
            }
            if let Some(member) = project.members.iter().find(|m| !user_ids.contains(m)) {
                return Err(invalid(
                    "projects.members",
                    &format!("project {} member {} is not a declared user", project.id, member),
                ));
            }
        }

        Ok(())
    }

    /// Convenience: load and validate in one call.
    pub fn load_and_validate<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::load_from_file(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Build the storage backend selected by `storage.backend`.
    pub fn build_backend(&self) -> Arc<dyn VersionedStorage> {
        let branch = self.storage.canonical_branch.clone();
        match self.storage.backend {
            BackendKind::Git => Arc::new(GitBackend::new(branch)),
            BackendKind::Snapshot => Arc::new(SnapshotBackend::new(branch)),
        }
    }

    /// Build an in-memory catalog seeded with the configured users and
    /// projects.
    pub fn build_catalog(&self) -> InMemoryCatalog {
        let catalog = InMemoryCatalog::new();
        for user in &self.users {
            catalog.add_user(User::new(user.id, &user.name, &user.email));
        }
        for project in &self.projects {
            let mut p = Project::new(project.id, &project.name, &project.repository, project.owner);
            p.members.extend(project.members.iter().copied());
            catalog.add_project(p);
        }
        catalog
    }
}

fn invalid(field: &str, detail: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.into(),
        detail: detail.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ProjectCatalog;
    use std::io::Write;

    fn sample_toml() -> &'static str {
        r#"
[storage]
branch_root = "/tmp/crepo/branches"
backend = "snapshot"
canonical_branch = "master"

[logging]
level = "debug"

[[users]]
id = 1
name = "Owner"
email = "owner@foo.com"

[[users]]
id = 2
name = "Member"
email = "member@foo.com"

[[projects]]
id = 10
name = "proj1"
repository = "/tmp/crepo/canonical/proj1"
owner = 1
members = [2]
"#
    }

    #[test]
    fn test_parse_full_config() {
        let config: RepoConfig = toml::from_str(sample_toml()).expect("failed to parse toml");
        assert_eq!(config.storage.backend, BackendKind::Snapshot);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.users.len(), 2);
        assert_eq!(config.projects[0].members, vec![2]);
        config.validate().unwrap();
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("crepo.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(sample_toml().as_bytes()).unwrap();

        let config = RepoConfig::load_and_validate(&path).expect("load failed");
        assert_eq!(config.storage.branch_root, PathBuf::from("/tmp/crepo/branches"));
    }

    #[test]
    fn test_file_not_found() {
        let result = RepoConfig::load_from_file("/nonexistent/crepo.toml");
        assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
    }

    #[test]
    fn test_defaults() {
        let minimal = r#"
[storage]
branch_root = "/tmp/branches"
"#;
        let config: RepoConfig = toml::from_str(minimal).unwrap();
        assert_eq!(config.storage.backend, BackendKind::Git);
        assert_eq!(config.storage.canonical_branch, "master");
        assert_eq!(config.logging.level, "info");
        assert!(config.projects.is_empty());
    }

    #[test]
    fn test_validate_rejects_unknown_member() {
        let mut config: RepoConfig = toml::from_str(sample_toml()).unwrap();
        config.projects[0].members.push(99);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "projects.members"
        ));
    }

    #[test]
    fn test_validate_rejects_duplicate_users() {
        let mut config: RepoConfig = toml::from_str(sample_toml()).unwrap();
        config.users[1].id = 1;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "users"
        ));
    }

    #[test]
    fn test_build_catalog() {
        let config: RepoConfig = toml::from_str(sample_toml()).unwrap();
        let catalog = config.build_catalog();
        let project = catalog.project(10).unwrap();
        assert!(project.is_member(1));
        assert!(project.is_member(2));
        assert!(!project.is_member(3));
        assert_eq!(catalog.user(2).unwrap().email, "member@foo.com");
    }
}
