//! In-memory control plane and git remote shared by the integration tests

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use piped_model::{
    Application, Command, CommandStatus, Commit, Deployment, DeploymentStatus, LogBlock, StageStatus,
};

use piped::config::piped::PipedRepository;
use piped::errors::AgentError;
use piped::git::GitClient;
use piped::http::pipedservice::PipedService;

/// Keeps deployments the way the control plane would and applies reports to them
#[derive(Default)]
pub struct ControlPlane {
    pub applications: Mutex<Vec<Application>>,
    pub deployments: Mutex<Vec<Deployment>>,
    pub stage_reports: Mutex<Vec<(String, StageStatus)>>,
    pub log_blocks: Mutex<Vec<LogBlock>>,
    pub completed_log_flushes: Mutex<Vec<String>>,
}

impl ControlPlane {
    pub fn deployment_of(&self, application_id: &str) -> Option<Deployment> {
        self.deployments
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|d| d.application_id == application_id)
            .cloned()
    }

    fn update<F: FnOnce(&mut Deployment)>(&self, deployment_id: &str, f: F) -> Result<(), AgentError> {
        let mut deployments = self.deployments.lock().unwrap();
        let deployment = deployments
            .iter_mut()
            .find(|d| d.id == deployment_id)
            .ok_or_else(|| AgentError::NotFound(deployment_id.to_string()))?;
        f(deployment);
        Ok(())
    }
}

#[async_trait]
impl PipedService for ControlPlane {
    async fn list_applications(&self) -> Result<Vec<Application>, AgentError> {
        Ok(self.applications.lock().unwrap().clone())
    }

    async fn list_not_completed_deployments(&self) -> Result<Vec<Deployment>, AgentError> {
        Ok(self
            .deployments
            .lock()
            .unwrap()
            .iter()
            .filter(|d| !d.is_completed())
            .cloned()
            .collect())
    }

    async fn get_application_most_recent_deployment(
        &self,
        application_id: &str,
    ) -> Result<Option<Deployment>, AgentError> {
        Ok(self.deployment_of(application_id))
    }

    async fn create_deployment(&self, deployment: &Deployment) -> Result<(), AgentError> {
        self.deployments.lock().unwrap().push(deployment.clone());
        Ok(())
    }

    async fn save_deployment_metadata(
        &self,
        deployment_id: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<(), AgentError> {
        self.update(deployment_id, |d| d.metadata.extend(metadata.clone()))
    }

    async fn save_stage_metadata(
        &self,
        deployment_id: &str,
        stage_id: &str,
        metadata: &str,
    ) -> Result<(), AgentError> {
        self.update(deployment_id, |d| {
            if let Some(stage) = d.stages.iter_mut().find(|s| s.id == stage_id) {
                stage.metadata = metadata.to_string();
            }
        })
    }

    async fn report_deployment_status_changed(
        &self,
        deployment_id: &str,
        status: DeploymentStatus,
        reason: &str,
    ) -> Result<(), AgentError> {
        self.update(deployment_id, |d| {
            d.status = status;
            d.status_reason = reason.to_string();
        })
    }

    async fn report_stage_status_changed(
        &self,
        deployment_id: &str,
        stage_id: &str,
        status: StageStatus,
        reason: &str,
    ) -> Result<(), AgentError> {
        self.stage_reports
            .lock()
            .unwrap()
            .push((stage_id.to_string(), status));
        self.update(deployment_id, |d| {
            if let Some(stage) = d.stages.iter_mut().find(|s| s.id == stage_id) {
                stage.status = status;
                stage.status_reason = reason.to_string();
            }
        })
    }

    async fn report_stage_logs(
        &self,
        _deployment_id: &str,
        _stage_id: &str,
        blocks: &[LogBlock],
    ) -> Result<(), AgentError> {
        self.log_blocks.lock().unwrap().extend_from_slice(blocks);
        Ok(())
    }

    async fn report_stage_logs_from_last_checkpoint(
        &self,
        _deployment_id: &str,
        stage_id: &str,
        blocks: &[LogBlock],
        completed: bool,
    ) -> Result<(), AgentError> {
        self.log_blocks.lock().unwrap().extend_from_slice(blocks);
        if completed {
            self.completed_log_flushes.lock().unwrap().push(stage_id.to_string());
        }
        Ok(())
    }

    async fn report_deployment_completed(
        &self,
        deployment_id: &str,
        status: DeploymentStatus,
        reason: &str,
        stage_statuses: &HashMap<String, StageStatus>,
    ) -> Result<(), AgentError> {
        self.update(deployment_id, |d| {
            d.status = status;
            d.status_reason = reason.to_string();
            for stage in d.stages.iter_mut() {
                if let Some(status) = stage_statuses.get(&stage.id) {
                    stage.status = *status;
                }
            }
        })
    }

    async fn get_commands(&self) -> Result<Vec<Command>, AgentError> {
        Ok(Vec::new())
    }

    async fn report_command_handled(
        &self,
        _command_id: &str,
        _status: CommandStatus,
        _metadata: &HashMap<String, String>,
    ) -> Result<(), AgentError> {
        Ok(())
    }
}

/// A remote whose history is a list of file trees
#[derive(Default)]
pub struct Remote {
    pub head: Mutex<String>,
    pub trees: Mutex<HashMap<String, HashMap<String, String>>>,
}

impl Remote {
    pub fn commit(&self, hash: &str, files: &[(&str, &str)]) {
        let tree = files.iter().map(|(p, c)| (p.to_string(), c.to_string())).collect();
        self.trees.lock().unwrap().insert(hash.to_string(), tree);
        *self.head.lock().unwrap() = hash.to_string();
    }
}

#[async_trait]
impl GitClient for Remote {
    async fn latest_remote_hash(&self, _remote: &str, _branch: &str) -> Result<String, AgentError> {
        Ok(self.head.lock().unwrap().clone())
    }

    async fn clone_read_only(
        &self,
        _repo: &PipedRepository,
        revision: &str,
        dest: &Path,
    ) -> Result<(), AgentError> {
        let tree = self
            .trees
            .lock()
            .unwrap()
            .get(revision)
            .cloned()
            .ok_or_else(|| AgentError::GitError(format!("unknown revision {}", revision)))?;
        if dest.exists() {
            std::fs::remove_dir_all(dest)?;
        }
        for (path, contents) in tree {
            let target = dest.join(path);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(target, contents)?;
        }
        Ok(())
    }

    async fn changed_files(&self, _repo_dir: &Path, from: &str, to: &str) -> Result<Vec<String>, AgentError> {
        let trees = self.trees.lock().unwrap();
        let empty = HashMap::new();
        let before = trees.get(from).unwrap_or(&empty);
        let after = trees.get(to).unwrap_or(&empty);
        let mut changed: Vec<String> = after
            .iter()
            .filter(|(path, contents)| before.get(*path) != Some(*contents))
            .map(|(path, _)| path.clone())
            .chain(before.keys().filter(|p| !after.contains_key(*p)).cloned())
            .collect();
        changed.sort();
        Ok(changed)
    }

    async fn commit(&self, _repo_dir: &Path, revision: &str) -> Result<Commit, AgentError> {
        Ok(Commit {
            hash: revision.to_string(),
            message: format!("commit {}", revision),
            author: "tester".to_string(),
            ..Default::default()
        })
    }
}
