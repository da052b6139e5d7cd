/*!
Local filesystem location.
*/

use std::path::{Path, PathBuf};

use super::RepositoryLocation;
use crate::{BackhaulError, Result};

/// Repositories stored as directories under a local root
///
/// # Example
/// ```rust
/// use backhaul_core::storage::{LocalLocation, RepositoryLocation};
///
/// let location = LocalLocation::new("/mnt/backups");
/// assert_eq!(location.repository_url("photos"), "/mnt/backups/photos");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalLocation {
    root: PathBuf,
}

impl LocalLocation {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Fails unless the root exists as a directory
    pub fn ensure_exists(&self) -> Result<()> {
        if self.root.is_dir() {
            Ok(())
        } else {
            Err(BackhaulError::validation(format!(
                "local repository root {} does not exist",
                self.root.display()
            )))
        }
    }
}

impl RepositoryLocation for LocalLocation {
    fn repository_url(&self, repo_name: &str) -> String {
        self.root.join(repo_name).to_string_lossy().into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_local_repository_url() {
        let location = LocalLocation::new("/mnt/backups/");
        assert_eq!(location.repository_url("photos"), "/mnt/backups/photos");
        assert_eq!(location.region(), None);
    }

    #[test]
    fn test_ensure_exists() {
        let dir = TempDir::new().unwrap();
        assert!(LocalLocation::new(dir.path()).ensure_exists().is_ok());
        assert!(LocalLocation::new(dir.path().join("missing"))
            .ensure_exists()
            .is_err());
    }
}
