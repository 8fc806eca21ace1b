//! Source control access
//!
//! The agent only needs a handful of read operations on the repositories it
//! watches. `GitCli` implements them on top of the `git` binary.

use std::path::Path;

use async_trait::async_trait;
use piped_model::Commit;
use tokio::process::Command;
use tracing::debug;

use crate::config::piped::PipedRepository;
use crate::errors::AgentError;

#[cfg(test)]
pub mod fake;

#[async_trait]
pub trait GitClient: Send + Sync {
    /// Hash of the head of `branch` on the remote
    async fn latest_remote_hash(&self, remote: &str, branch: &str) -> Result<String, AgentError>;

    /// Check out `revision` of the repository into `dest`, replacing its contents.
    async fn clone_read_only(
        &self,
        repo: &PipedRepository,
        revision: &str,
        dest: &Path,
    ) -> Result<(), AgentError>;

    /// Paths relative to the repository root that differ between two commits
    async fn changed_files(&self, repo_dir: &Path, from: &str, to: &str) -> Result<Vec<String>, AgentError>;

    async fn commit(&self, repo_dir: &Path, revision: &str) -> Result<Commit, AgentError>;
}

/// `GitClient` backed by the `git` command line
#[derive(Debug, Clone)]
pub struct GitCli {
    binary: String,
}

impl Default for GitCli {
    fn default() -> Self {
        Self {
            binary: "git".to_string(),
        }
    }
}

impl GitCli {
    pub fn new(binary: impl Into<String>) -> Self {
        Self { binary: binary.into() }
    }

    async fn run(&self, cwd: Option<&Path>, args: &[&str]) -> Result<String, AgentError> {
        debug!("{} {}", self.binary, args.join(" "));
        let mut command = Command::new(&self.binary);
        command.args(args).env("GIT_TERMINAL_PROMPT", "0");
        if let Some(cwd) = cwd {
            command.current_dir(cwd);
        }

        let output = command
            .output()
            .await
            .map_err(|e| AgentError::GitError(format!("failed to run git {}: {}", args[0], e)))?;
        if !output.status.success() {
            return Err(AgentError::GitError(format!(
                "git {} failed: {}",
                args[0],
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[async_trait]
impl GitClient for GitCli {
    async fn latest_remote_hash(&self, remote: &str, branch: &str) -> Result<String, AgentError> {
        let reference = format!("refs/heads/{}", branch);
        let output = self.run(None, &["ls-remote", remote, &reference]).await?;
        output
            .split_whitespace()
            .next()
            .map(|hash| hash.to_string())
            .ok_or_else(|| AgentError::GitError(format!("branch {} was not found on {}", branch, remote)))
    }

    async fn clone_read_only(
        &self,
        repo: &PipedRepository,
        revision: &str,
        dest: &Path,
    ) -> Result<(), AgentError> {
        if tokio::fs::metadata(dest).await.is_ok() {
            tokio::fs::remove_dir_all(dest).await?;
        }
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let dest_str = dest.to_string_lossy();
        self.run(
            None,
            &["clone", "--quiet", "--branch", &repo.branch, &repo.remote, &dest_str],
        )
        .await?;
        self.run(Some(dest), &["checkout", "--quiet", "--detach", revision])
            .await?;
        Ok(())
    }

    async fn changed_files(&self, repo_dir: &Path, from: &str, to: &str) -> Result<Vec<String>, AgentError> {
        let output = self.run(Some(repo_dir), &["diff", "--name-only", from, to]).await?;
        Ok(output
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn commit(&self, repo_dir: &Path, revision: &str) -> Result<Commit, AgentError> {
        let output = self
            .run(
                Some(repo_dir),
                &["log", "-1", "--format=%H%x00%an%x00%ct%x00%s", revision],
            )
            .await?;
        parse_commit(output.trim_end())
    }
}

fn parse_commit(line: &str) -> Result<Commit, AgentError> {
    let mut parts = line.splitn(4, '\0');
    let (Some(hash), Some(author), Some(time), Some(message)) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(AgentError::GitError(format!("unexpected git log output: {:?}", line)));
    };
    Ok(Commit {
        hash: hash.to_string(),
        message: message.to_string(),
        author: author.to_string(),
        branch: String::new(),
        created_at: time.parse().unwrap_or_default(),
    })
}
