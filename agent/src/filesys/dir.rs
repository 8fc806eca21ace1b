//! Directory operations

use std::path::{Path, PathBuf};

use tokio::fs;

use crate::errors::AgentError;
use crate::filesys::file::File;

/// A directory wrapper with path
#[derive(Debug, Clone)]
pub struct Dir {
    path: PathBuf,
}

impl Dir {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn exists(&self) -> bool {
        fs::metadata(&self.path)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
    }

    /// Create the directory and its parents
    pub async fn create(&self) -> Result<(), AgentError> {
        fs::create_dir_all(&self.path).await?;
        Ok(())
    }

    /// Remove the directory with everything below it
    pub async fn delete(&self) -> Result<(), AgentError> {
        if self.exists().await {
            fs::remove_dir_all(&self.path).await?;
        }
        Ok(())
    }

    /// Start from an empty directory, dropping leftovers of a previous run
    pub async fn recreate(&self) -> Result<(), AgentError> {
        self.delete().await?;
        self.create().await
    }

    pub fn file(&self, name: impl AsRef<Path>) -> File {
        File::new(self.path.join(name))
    }

    pub fn subdir(&self, name: impl AsRef<Path>) -> Dir {
        Dir::new(self.path.join(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_recreate_drops_leftovers() {
        let root = tempfile::tempdir().unwrap();
        let dir = Dir::new(root.path().join("deployments").join("d-1"));
        dir.create().await.unwrap();
        dir.file("stale.txt").write_string("old").await.unwrap();

        dir.recreate().await.unwrap();
        assert!(dir.exists().await);
        assert!(!dir.file("stale.txt").exists().await);
    }
}
