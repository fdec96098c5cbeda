//! Path-addressed resource operations on a branch working tree.
//!
//! Resource paths are absolute and slash-separated (`/content/file1.txt`),
//! rooted at the working directory. The backend metadata directory is never
//! addressable.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::backend::VersionedStorage;
use crate::errors::{BackendError, RepoError};
use crate::models::{ResourceInfo, ResourceType};

/// A validated resource path.
#[derive(Debug, Clone)]
struct Located {
    /// Normalized resource path, `/` for the root.
    path: String,
    /// Slash-joined components, empty for the root.
    rel: String,
    abs: PathBuf,
}

impl Located {
    fn is_root(&self) -> bool {
        self.rel.is_empty()
    }
}

/// Resource operations scoped to one working directory.
pub struct ResourceStore<'a> {
    backend: &'a dyn VersionedStorage,
    root: &'a Path,
}

impl<'a> ResourceStore<'a> {
    pub fn new(backend: &'a dyn VersionedStorage, root: &'a Path) -> Self {
        Self { backend, root }
    }

    fn locate(&self, path: &str) -> Result<Located, RepoError> {
        if !path.starts_with('/') {
            return Err(RepoError::InvalidRequest(format!(
                "resource path '{path}' must be absolute"
            )));
        }
        let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
        for component in &components {
            if *component == "." || *component == ".." || component.contains('\\') {
                return Err(RepoError::InvalidRequest(format!(
                    "resource path '{path}' contains an invalid component"
                )));
            }
        }
        if components.first() == Some(&self.backend.metadata_dir()) {
            return Err(RepoError::InvalidRequest(format!(
                "resource path '{path}' is reserved"
            )));
        }
        let rel = components.join("/");
        let abs = components
            .iter()
            .fold(self.root.to_path_buf(), |acc, c| acc.join(c));
        Ok(Located {
            path: format!("/{rel}"),
            rel,
            abs,
        })
    }

    /// Every ancestor of `loc` inside the working tree must be a directory
    /// (or not exist yet).
    fn check_ancestors(&self, loc: &Located) -> Result<(), RepoError> {
        let mut current = loc.abs.parent();
        while let Some(dir) = current {
            if dir == self.root || !dir.starts_with(self.root) {
                break;
            }
            if dir.is_file() {
                return Err(RepoError::InvalidRequest(format!(
                    "an ancestor of '{}' is a file",
                    loc.path
                )));
            }
            current = dir.parent();
        }
        Ok(())
    }

    /// Create a directory and any missing ancestors. Existing directories are
    /// left as they are.
    pub fn mkdir(&self, path: &str) -> Result<(), RepoError> {
        let loc = self.locate(path)?;
        self.check_ancestors(&loc)?;
        if loc.abs.is_file() {
            return Err(RepoError::InvalidRequest(format!(
                "'{}' already exists as a file",
                loc.path
            )));
        }
        fs::create_dir_all(&loc.abs)?;
        debug!(path = %loc.path, "mkdir");
        Ok(())
    }

    /// Create or overwrite a file, creating missing parent directories.
    pub fn put_data(&self, path: &str, data: &[u8]) -> Result<(), RepoError> {
        let loc = self.locate(path)?;
        self.check_ancestors(&loc)?;
        if loc.is_root() || loc.abs.is_dir() {
            return Err(RepoError::InvalidRequest(format!(
                "'{}' is a directory",
                loc.path
            )));
        }
        if let Some(parent) = loc.abs.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&loc.abs, data)?;
        debug!(path = %loc.path, bytes = data.len(), "put data");
        Ok(())
    }

    /// File content in the working tree (`revision == ""`) or at a revision.
    pub fn get_data(&self, path: &str, revision: &str) -> Result<Vec<u8>, RepoError> {
        let loc = self.locate(path)?;
        if !revision.is_empty() {
            return Ok(self.backend.read_at(self.root, revision, &loc.path)?);
        }
        self.check_ancestors(&loc)?;
        if loc.is_root() || loc.abs.is_dir() {
            return Err(RepoError::InvalidRequest(format!(
                "'{}' is a directory, not a file",
                loc.path
            )));
        }
        match fs::read(&loc.abs) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(RepoError::ResourceNotFound(loc.path))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn get_info(&self, path: &str) -> Result<ResourceInfo, RepoError> {
        let loc = self.locate(path)?;
        self.check_ancestors(&loc)?;
        let metadata = match fs::metadata(&loc.abs) {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(RepoError::ResourceNotFound(loc.path));
            }
            Err(e) => return Err(e.into()),
        };
        let last_modified = metadata
            .modified()
            .map(|t| DateTime::<Utc>::from(t).timestamp_millis())
            .unwrap_or(0);
        let name = loc.rel.rsplit('/').next().unwrap_or("").to_string();

        if metadata.is_dir() {
            let mut children = Vec::new();
            for entry in fs::read_dir(&loc.abs)? {
                let child = entry?.file_name().to_string_lossy().to_string();
                if loc.is_root() && child == self.backend.metadata_dir() {
                    continue;
                }
                children.push(child);
            }
            children.sort();
            Ok(ResourceInfo {
                resource_type: ResourceType::Directory,
                name,
                path: loc.path,
                size: 0,
                last_modified,
                sub_resource_names: children,
            })
        } else {
            Ok(ResourceInfo {
                resource_type: ResourceType::File,
                name,
                path: loc.path,
                size: metadata.len(),
                last_modified,
                sub_resource_names: Vec::new(),
            })
        }
    }

    /// Remove a file or a whole directory subtree.
    pub fn delete(&self, path: &str) -> Result<(), RepoError> {
        let loc = self.locate(path)?;
        if loc.is_root() {
            return Err(RepoError::InvalidRequest(
                "the root directory cannot be deleted".into(),
            ));
        }
        self.check_ancestors(&loc)?;
        if loc.abs.is_dir() {
            fs::remove_dir_all(&loc.abs)?;
        } else if loc.abs.exists() {
            fs::remove_file(&loc.abs)?;
        } else {
            return Err(RepoError::ResourceNotFound(loc.path));
        }
        debug!(path = %loc.path, "deleted");
        Ok(())
    }

    /// Move a file or a directory subtree to a new, unused path.
    pub fn rename(&self, from: &str, to: &str) -> Result<(), RepoError> {
        let src = self.locate(from)?;
        let dst = self.locate(to)?;
        if src.is_root() || dst.is_root() {
            return Err(RepoError::InvalidRequest(
                "the root directory cannot be renamed".into(),
            ));
        }
        self.check_ancestors(&src)?;
        if !src.abs.exists() {
            return Err(RepoError::ResourceNotFound(src.path));
        }
        self.check_ancestors(&dst)?;
        if dst.abs.exists() {
            return Err(RepoError::InvalidRequest(format!(
                "'{}' already exists",
                dst.path
            )));
        }
        if dst.rel.starts_with(&format!("{}/", src.rel)) {
            return Err(RepoError::InvalidRequest(format!(
                "cannot move '{}' into itself",
                src.path
            )));
        }
        if let Some(parent) = dst.abs.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(&src.abs, &dst.abs)?;
        debug!(from = %src.path, to = %dst.path, "renamed");
        Ok(())
    }

    /// Restore `path` (or the whole tree for `/`) to the last commit,
    /// dropping uncommitted changes below it.
    pub fn revert(&self, path: &str) -> Result<(), RepoError> {
        let loc = self.locate(path)?;
        self.check_ancestors(&loc)?;

        if loc.is_root() {
            for entry in fs::read_dir(self.root)? {
                let entry = entry?;
                if entry.file_name() == self.backend.metadata_dir() {
                    continue;
                }
                if entry.file_type()?.is_dir() {
                    fs::remove_dir_all(entry.path())?;
                } else {
                    fs::remove_file(entry.path())?;
                }
            }
        } else {
            let committed = match self.backend.read_at(self.root, "HEAD", &loc.path) {
                Ok(_) | Err(BackendError::NotAFile(_)) => true,
                Err(BackendError::PathNotFound { .. }) => false,
                Err(e) => return Err(e.into()),
            };
            if loc.abs.is_dir() {
                fs::remove_dir_all(&loc.abs)?;
            } else if loc.abs.exists() {
                fs::remove_file(&loc.abs)?;
            } else if !committed {
                return Err(RepoError::ResourceNotFound(loc.path));
            }
        }

        self.backend.restore(self.root, &loc.path)?;
        debug!(path = %loc.path, "reverted");
        Ok(())
    }
}
