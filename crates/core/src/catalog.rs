//! Project and user lookup.
//!
//! Project and user persistence belongs to the embedding service; the core
//! only needs to resolve a project's canonical repository, a user's commit
//! identity, and whether the user may work on the project.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::errors::RepoError;
use crate::models::{ProjectId, Signature, UserId};

/// A project with a canonical history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Project {
    pub id: ProjectId,
    pub name: String,
    /// Location of the canonical repository.
    pub repository: PathBuf,
    pub owner: UserId,
    /// Members besides the owner.
    pub members: BTreeSet<UserId>,
}

impl Project {
    pub fn new(id: ProjectId, name: &str, repository: &Path, owner: UserId) -> Self {
        Self {
            id,
            name: name.to_string(),
            repository: repository.to_path_buf(),
            owner,
            members: BTreeSet::new(),
        }
    }

    pub fn is_member(&self, user: UserId) -> bool {
        self.owner == user || self.members.contains(&user)
    }

    pub fn info(&self) -> ProjectInfo {
        ProjectInfo {
            id: self.id,
            name: self.name.clone(),
            owner: self.owner,
            members_count: self.members.len() + 1,
        }
    }
}

/// Summary view of a project.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectInfo {
    pub id: ProjectId,
    pub name: String,
    pub owner: UserId,
    /// Owner included.
    pub members_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: UserId,
    pub name: String,
    pub email: String,
}

impl User {
    pub fn new(id: UserId, name: &str, email: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            email: email.to_string(),
        }
    }

    pub fn signature(&self) -> Signature {
        Signature::new(&self.name, &self.email)
    }
}

/// Read access to projects and users.
pub trait ProjectCatalog: Send + Sync {
    fn project(&self, id: ProjectId) -> Option<Project>;
    fn user(&self, id: UserId) -> Option<User>;
}

/// Catalog held in memory, seeded from configuration or by tests.
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    projects: RwLock<HashMap<ProjectId, Project>>,
    users: RwLock<HashMap<UserId, User>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_user(&self, user: User) {
        self.users.write().insert(user.id, user);
    }

    pub fn add_project(&self, project: Project) {
        info!(project = project.id, name = %project.name, "registering project");
        self.projects.write().insert(project.id, project);
    }

    /// Add `user` to the project's members on behalf of `actor`, who must be
    /// the owner. Adding an existing member is a no-op.
    pub fn add_member(
        &self,
        project: ProjectId,
        actor: UserId,
        user: UserId,
    ) -> Result<(), RepoError> {
        let mut projects = self.projects.write();
        let p = owned_project(&mut projects, project, actor)?;
        if !self.users.read().contains_key(&user) {
            return Err(RepoError::UserNotFound(user));
        }
        if p.owner != user && p.members.insert(user) {
            info!(project, user, "member added");
        }
        Ok(())
    }

    pub fn remove_member(
        &self,
        project: ProjectId,
        actor: UserId,
        user: UserId,
    ) -> Result<(), RepoError> {
        let mut projects = self.projects.write();
        let p = owned_project(&mut projects, project, actor)?;
        if p.owner == user {
            return Err(RepoError::InvalidRequest(
                "the project owner cannot be removed".into(),
            ));
        }
        if !p.members.remove(&user) {
            return Err(RepoError::UserNotFound(user));
        }
        info!(project, user, "member removed");
        Ok(())
    }
}

/// Membership changes are reserved to the project owner.
fn owned_project(
    projects: &mut HashMap<ProjectId, Project>,
    project: ProjectId,
    actor: UserId,
) -> Result<&mut Project, RepoError> {
    let p = projects
        .get_mut(&project)
        .ok_or(RepoError::ProjectNotFound(project))?;
    if p.owner != actor {
        warn!(project, user = actor, "membership change by non-owner rejected");
        return Err(RepoError::Forbidden {
            project,
            user: actor,
        });
    }
    Ok(p)
}

impl ProjectCatalog for InMemoryCatalog {
    fn project(&self, id: ProjectId) -> Option<Project> {
        self.projects.read().get(&id).cloned()
    }

    fn user(&self, id: UserId) -> Option<User> {
        self.users.read().get(&id).cloned()
    }
}
