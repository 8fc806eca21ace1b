//! In-memory control plane used by unit tests

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use piped_model::{
    Application, Command, CommandStatus, Deployment, DeploymentStatus, LogBlock, StageStatus,
};

use crate::errors::AgentError;
use crate::http::pipedservice::PipedService;

#[derive(Debug, Clone, PartialEq)]
pub enum LogCall {
    Incremental {
        stage_id: String,
        indexes: Vec<u64>,
    },
    Checkpoint {
        stage_id: String,
        indexes: Vec<u64>,
        completed: bool,
    },
}

#[derive(Default)]
pub struct FakePipedService {
    pub applications: Mutex<Vec<Application>>,
    pub not_completed: Mutex<Vec<Deployment>>,
    pub most_recent: Mutex<HashMap<String, Deployment>>,
    pub created: Mutex<Vec<Deployment>>,
    pub deployment_metadata: Mutex<HashMap<String, HashMap<String, String>>>,
    pub stage_metadata: Mutex<HashMap<(String, String), String>>,
    pub deployment_statuses: Mutex<Vec<(String, DeploymentStatus)>>,
    pub stage_statuses: Mutex<Vec<(String, String, StageStatus)>>,
    pub log_calls: Mutex<Vec<LogCall>>,
    pub completed: Mutex<Vec<(String, DeploymentStatus, String)>>,
    pub commands: Mutex<Vec<Command>>,
    pub handled_commands: Mutex<Vec<(String, CommandStatus)>>,
    pub fail_logs: AtomicBool,
    pub fail_list: AtomicBool,
    pub fail_reports: AtomicBool,
}

impl FakePipedService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_not_completed(&self, deployments: Vec<Deployment>) {
        *self.not_completed.lock().unwrap() = deployments;
    }

    pub fn log_calls(&self) -> Vec<LogCall> {
        self.log_calls.lock().unwrap().clone()
    }

    pub fn stage_statuses_of(&self, stage_id: &str) -> Vec<StageStatus> {
        self.stage_statuses
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, s, _)| s == stage_id)
            .map(|(_, _, status)| *status)
            .collect()
    }

    pub fn completed_deployments(&self) -> Vec<(String, DeploymentStatus, String)> {
        self.completed.lock().unwrap().clone()
    }
}

fn rpc_failure(name: &str) -> AgentError {
    AgentError::RpcError(format!("{} is unavailable", name))
}

#[async_trait]
impl PipedService for FakePipedService {
    async fn list_applications(&self) -> Result<Vec<Application>, AgentError> {
        if self.fail_list.load(Ordering::SeqCst) {
            return Err(rpc_failure("ListApplications"));
        }
        Ok(self.applications.lock().unwrap().clone())
    }

    async fn list_not_completed_deployments(&self) -> Result<Vec<Deployment>, AgentError> {
        if self.fail_list.load(Ordering::SeqCst) {
            return Err(rpc_failure("ListNotCompletedDeployments"));
        }
        Ok(self.not_completed.lock().unwrap().clone())
    }

    async fn get_application_most_recent_deployment(
        &self,
        application_id: &str,
    ) -> Result<Option<Deployment>, AgentError> {
        Ok(self.most_recent.lock().unwrap().get(application_id).cloned())
    }

    async fn create_deployment(&self, deployment: &Deployment) -> Result<(), AgentError> {
        self.created.lock().unwrap().push(deployment.clone());
        Ok(())
    }

    async fn save_deployment_metadata(
        &self,
        deployment_id: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<(), AgentError> {
        self.deployment_metadata
            .lock()
            .unwrap()
            .entry(deployment_id.to_string())
            .or_default()
            .extend(metadata.clone());
        Ok(())
    }

    async fn save_stage_metadata(
        &self,
        deployment_id: &str,
        stage_id: &str,
        metadata: &str,
    ) -> Result<(), AgentError> {
        self.stage_metadata
            .lock()
            .unwrap()
            .insert((deployment_id.to_string(), stage_id.to_string()), metadata.to_string());
        Ok(())
    }

    async fn report_deployment_status_changed(
        &self,
        deployment_id: &str,
        status: DeploymentStatus,
        _reason: &str,
    ) -> Result<(), AgentError> {
        if self.fail_reports.load(Ordering::SeqCst) {
            return Err(rpc_failure("ReportDeploymentStatusChanged"));
        }
        self.deployment_statuses
            .lock()
            .unwrap()
            .push((deployment_id.to_string(), status));
        Ok(())
    }

    async fn report_stage_status_changed(
        &self,
        deployment_id: &str,
        stage_id: &str,
        status: StageStatus,
        _reason: &str,
    ) -> Result<(), AgentError> {
        if self.fail_reports.load(Ordering::SeqCst) {
            return Err(rpc_failure("ReportStageStatusChanged"));
        }
        self.stage_statuses.lock().unwrap().push((
            deployment_id.to_string(),
            stage_id.to_string(),
            status,
        ));
        Ok(())
    }

    async fn report_stage_logs(
        &self,
        _deployment_id: &str,
        stage_id: &str,
        blocks: &[LogBlock],
    ) -> Result<(), AgentError> {
        if self.fail_logs.load(Ordering::SeqCst) {
            return Err(rpc_failure("ReportStageLogs"));
        }
        self.log_calls.lock().unwrap().push(LogCall::Incremental {
            stage_id: stage_id.to_string(),
            indexes: blocks.iter().map(|b| b.index).collect(),
        });
        Ok(())
    }

    async fn report_stage_logs_from_last_checkpoint(
        &self,
        _deployment_id: &str,
        stage_id: &str,
        blocks: &[LogBlock],
        completed: bool,
    ) -> Result<(), AgentError> {
        if self.fail_logs.load(Ordering::SeqCst) {
            return Err(rpc_failure("ReportStageLogsFromLastCheckpoint"));
        }
        self.log_calls.lock().unwrap().push(LogCall::Checkpoint {
            stage_id: stage_id.to_string(),
            indexes: blocks.iter().map(|b| b.index).collect(),
            completed,
        });
        Ok(())
    }

    async fn report_deployment_completed(
        &self,
        deployment_id: &str,
        status: DeploymentStatus,
        reason: &str,
        _stage_statuses: &HashMap<String, StageStatus>,
    ) -> Result<(), AgentError> {
        if self.fail_reports.load(Ordering::SeqCst) {
            return Err(rpc_failure("ReportDeploymentCompleted"));
        }
        self.completed.lock().unwrap().push((
            deployment_id.to_string(),
            status,
            reason.to_string(),
        ));
        Ok(())
    }

    async fn get_commands(&self) -> Result<Vec<Command>, AgentError> {
        Ok(self.commands.lock().unwrap().clone())
    }

    async fn report_command_handled(
        &self,
        command_id: &str,
        status: CommandStatus,
        _metadata: &HashMap<String, String>,
    ) -> Result<(), AgentError> {
        self.commands.lock().unwrap().retain(|c| c.id != command_id);
        self.handled_commands
            .lock()
            .unwrap()
            .push((command_id.to_string(), status));
        Ok(())
    }
}
