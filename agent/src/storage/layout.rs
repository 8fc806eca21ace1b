//! Working directory layout

use std::path::PathBuf;

use crate::errors::AgentError;
use crate::filesys::dir::Dir;

/// Directories the agent writes below its working directory
#[derive(Debug, Clone)]
pub struct StorageLayout {
    pub base_dir: PathBuf,
}

impl StorageLayout {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Parent of every deployment working directory
    pub fn deployments_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("deployments"))
    }

    /// Parent of the trigger's repository clones
    pub fn trigger_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("trigger"))
    }

    pub async fn setup(&self) -> Result<(), AgentError> {
        self.deployments_dir().create().await?;
        self.trigger_dir().create().await?;
        Ok(())
    }
}

impl Default for StorageLayout {
    fn default() -> Self {
        Self::new(std::env::temp_dir().join("piped"))
    }
}
