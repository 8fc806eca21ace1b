//! Scripted git client used by unit tests

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use piped_model::Commit;

use crate::config::piped::PipedRepository;
use crate::errors::AgentError;
use crate::git::GitClient;

#[derive(Default)]
pub struct FakeGitClient {
    /// Head per `(remote, branch)`
    pub heads: Mutex<HashMap<(String, String), String>>,
    /// Repository contents per revision, as relative path to file contents
    pub trees: Mutex<HashMap<String, HashMap<String, String>>>,
    /// Changed files per `(from, to)`
    pub diffs: Mutex<HashMap<(String, String), Vec<String>>>,
    pub clones: Mutex<Vec<String>>,
}

impl FakeGitClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_head(&self, remote: &str, branch: &str, hash: &str) {
        self.heads
            .lock()
            .unwrap()
            .insert((remote.to_string(), branch.to_string()), hash.to_string());
    }

    pub fn add_file(&self, revision: &str, path: &str, contents: &str) {
        self.trees
            .lock()
            .unwrap()
            .entry(revision.to_string())
            .or_default()
            .insert(path.to_string(), contents.to_string());
    }

    pub fn set_diff(&self, from: &str, to: &str, files: &[&str]) {
        self.diffs.lock().unwrap().insert(
            (from.to_string(), to.to_string()),
            files.iter().map(|f| f.to_string()).collect(),
        );
    }

    pub fn clones(&self) -> Vec<String> {
        self.clones.lock().unwrap().clone()
    }
}

#[async_trait]
impl GitClient for FakeGitClient {
    async fn latest_remote_hash(&self, remote: &str, branch: &str) -> Result<String, AgentError> {
        self.heads
            .lock()
            .unwrap()
            .get(&(remote.to_string(), branch.to_string()))
            .cloned()
            .ok_or_else(|| AgentError::GitError(format!("unknown remote {}", remote)))
    }

    async fn clone_read_only(
        &self,
        _repo: &PipedRepository,
        revision: &str,
        dest: &Path,
    ) -> Result<(), AgentError> {
        let files = self
            .trees
            .lock()
            .unwrap()
            .get(revision)
            .cloned()
            .ok_or_else(|| AgentError::GitError(format!("unknown revision {}", revision)))?;
        self.clones.lock().unwrap().push(revision.to_string());

        if tokio::fs::metadata(dest).await.is_ok() {
            tokio::fs::remove_dir_all(dest).await?;
        }
        tokio::fs::create_dir_all(dest).await?;
        for (path, contents) in files {
            let target = dest.join(path);
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(target, contents).await?;
        }
        Ok(())
    }

    async fn changed_files(&self, _repo_dir: &Path, from: &str, to: &str) -> Result<Vec<String>, AgentError> {
        Ok(self
            .diffs
            .lock()
            .unwrap()
            .get(&(from.to_string(), to.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn commit(&self, _repo_dir: &Path, revision: &str) -> Result<Commit, AgentError> {
        Ok(Commit {
            hash: revision.to_string(),
            message: format!("commit {}", revision),
            author: "tester".to_string(),
            branch: String::new(),
            created_at: 0,
        })
    }
}
