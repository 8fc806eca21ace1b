//! Control plane RPC surface consumed by the piped

use std::collections::HashMap;

use async_trait::async_trait;
use piped_model::{
    Application, Command, CommandStatus, Deployment, DeploymentStatus, LogBlock, StageStatus,
};
use serde::{Deserialize, Serialize};

use crate::errors::AgentError;
use crate::http::client::HttpClient;

/// Calls the piped makes to the control plane
#[async_trait]
pub trait PipedService: Send + Sync {
    /// Applications assigned to this piped
    async fn list_applications(&self) -> Result<Vec<Application>, AgentError>;

    /// Deployments of this piped that are not in a terminal status
    async fn list_not_completed_deployments(&self) -> Result<Vec<Deployment>, AgentError>;

    /// Latest deployment of an application, `None` when it never deployed
    async fn get_application_most_recent_deployment(
        &self,
        application_id: &str,
    ) -> Result<Option<Deployment>, AgentError>;

    async fn create_deployment(&self, deployment: &Deployment) -> Result<(), AgentError>;

    async fn save_deployment_metadata(
        &self,
        deployment_id: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<(), AgentError>;

    async fn save_stage_metadata(
        &self,
        deployment_id: &str,
        stage_id: &str,
        metadata: &str,
    ) -> Result<(), AgentError>;

    async fn report_deployment_status_changed(
        &self,
        deployment_id: &str,
        status: DeploymentStatus,
        reason: &str,
    ) -> Result<(), AgentError>;

    async fn report_stage_status_changed(
        &self,
        deployment_id: &str,
        stage_id: &str,
        status: StageStatus,
        reason: &str,
    ) -> Result<(), AgentError>;

    /// Incremental log shipping
    async fn report_stage_logs(
        &self,
        deployment_id: &str,
        stage_id: &str,
        blocks: &[LogBlock],
    ) -> Result<(), AgentError>;

    /// Replace everything after the last checkpoint with `blocks`
    async fn report_stage_logs_from_last_checkpoint(
        &self,
        deployment_id: &str,
        stage_id: &str,
        blocks: &[LogBlock],
        completed: bool,
    ) -> Result<(), AgentError>;

    async fn report_deployment_completed(
        &self,
        deployment_id: &str,
        status: DeploymentStatus,
        reason: &str,
        stage_statuses: &HashMap<String, StageStatus>,
    ) -> Result<(), AgentError>;

    /// Commands addressed to this piped that were not handled yet
    async fn get_commands(&self) -> Result<Vec<Command>, AgentError>;

    async fn report_command_handled(
        &self,
        command_id: &str,
        status: CommandStatus,
        metadata: &HashMap<String, String>,
    ) -> Result<(), AgentError>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PipedRequest<'a> {
    piped_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct ListApplicationsResponse {
    #[serde(default)]
    applications: Vec<Application>,
}

#[derive(Debug, Deserialize)]
struct ListDeploymentsResponse {
    #[serde(default)]
    deployments: Vec<Deployment>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MostRecentDeploymentRequest<'a> {
    application_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct MostRecentDeploymentResponse {
    #[serde(default)]
    deployment: Option<Deployment>,
}

#[derive(Debug, Serialize)]
struct CreateDeploymentRequest<'a> {
    deployment: &'a Deployment,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SaveDeploymentMetadataRequest<'a> {
    deployment_id: &'a str,
    metadata: &'a HashMap<String, String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SaveStageMetadataRequest<'a> {
    deployment_id: &'a str,
    stage_id: &'a str,
    json_metadata: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DeploymentStatusRequest<'a> {
    deployment_id: &'a str,
    status: DeploymentStatus,
    status_reason: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StageStatusRequest<'a> {
    deployment_id: &'a str,
    stage_id: &'a str,
    status: StageStatus,
    status_reason: &'a str,
    completed_at: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StageLogsRequest<'a> {
    deployment_id: &'a str,
    stage_id: &'a str,
    blocks: &'a [LogBlock],
    #[serde(skip_serializing_if = "Option::is_none")]
    completed: Option<bool>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DeploymentCompletedRequest<'a> {
    deployment_id: &'a str,
    status: DeploymentStatus,
    status_reason: &'a str,
    stage_statuses: &'a HashMap<String, StageStatus>,
    completed_at: i64,
}

#[derive(Debug, Deserialize)]
struct GetCommandsResponse {
    #[serde(default)]
    commands: Vec<Command>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CommandHandledRequest<'a> {
    command_id: &'a str,
    status: CommandStatus,
    metadata: &'a HashMap<String, String>,
    handled_at: i64,
}

#[async_trait]
impl PipedService for HttpClient {
    async fn list_applications(&self) -> Result<Vec<Application>, AgentError> {
        let request = PipedRequest { piped_id: self.piped_id() };
        let response: ListApplicationsResponse =
            self.post("/pipedservice/ListApplications", &request).await?;
        Ok(response.applications)
    }

    async fn list_not_completed_deployments(&self) -> Result<Vec<Deployment>, AgentError> {
        let request = PipedRequest { piped_id: self.piped_id() };
        let response: ListDeploymentsResponse = self
            .post("/pipedservice/ListNotCompletedDeployments", &request)
            .await?;
        Ok(response.deployments)
    }

    async fn get_application_most_recent_deployment(
        &self,
        application_id: &str,
    ) -> Result<Option<Deployment>, AgentError> {
        let request = MostRecentDeploymentRequest { application_id };
        let response: MostRecentDeploymentResponse = self
            .post("/pipedservice/GetApplicationMostRecentDeployment", &request)
            .await?;
        Ok(response.deployment)
    }

    async fn create_deployment(&self, deployment: &Deployment) -> Result<(), AgentError> {
        let request = CreateDeploymentRequest { deployment };
        let _: serde_json::Value = self.post("/pipedservice/CreateDeployment", &request).await?;
        Ok(())
    }

    async fn save_deployment_metadata(
        &self,
        deployment_id: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<(), AgentError> {
        let request = SaveDeploymentMetadataRequest { deployment_id, metadata };
        let _: serde_json::Value = self
            .post("/pipedservice/SaveDeploymentMetadata", &request)
            .await?;
        Ok(())
    }

    async fn save_stage_metadata(
        &self,
        deployment_id: &str,
        stage_id: &str,
        metadata: &str,
    ) -> Result<(), AgentError> {
        let request = SaveStageMetadataRequest {
            deployment_id,
            stage_id,
            json_metadata: metadata,
        };
        let _: serde_json::Value = self.post("/pipedservice/SaveStageMetadata", &request).await?;
        Ok(())
    }

    async fn report_deployment_status_changed(
        &self,
        deployment_id: &str,
        status: DeploymentStatus,
        reason: &str,
    ) -> Result<(), AgentError> {
        let request = DeploymentStatusRequest {
            deployment_id,
            status,
            status_reason: reason,
        };
        let _: serde_json::Value = self
            .post("/pipedservice/ReportDeploymentStatusChanged", &request)
            .await?;
        Ok(())
    }

    async fn report_stage_status_changed(
        &self,
        deployment_id: &str,
        stage_id: &str,
        status: StageStatus,
        reason: &str,
    ) -> Result<(), AgentError> {
        let request = StageStatusRequest {
            deployment_id,
            stage_id,
            status,
            status_reason: reason,
            completed_at: if status.is_completed() { crate::utils::now_unix() } else { 0 },
        };
        let _: serde_json::Value = self
            .post("/pipedservice/ReportStageStatusChanged", &request)
            .await?;
        Ok(())
    }

    async fn report_stage_logs(
        &self,
        deployment_id: &str,
        stage_id: &str,
        blocks: &[LogBlock],
    ) -> Result<(), AgentError> {
        let request = StageLogsRequest {
            deployment_id,
            stage_id,
            blocks,
            completed: None,
        };
        let _: serde_json::Value = self.post("/pipedservice/ReportStageLogs", &request).await?;
        Ok(())
    }

    async fn report_stage_logs_from_last_checkpoint(
        &self,
        deployment_id: &str,
        stage_id: &str,
        blocks: &[LogBlock],
        completed: bool,
    ) -> Result<(), AgentError> {
        let request = StageLogsRequest {
            deployment_id,
            stage_id,
            blocks,
            completed: Some(completed),
        };
        let _: serde_json::Value = self
            .post("/pipedservice/ReportStageLogsFromLastCheckpoint", &request)
            .await?;
        Ok(())
    }

    async fn report_deployment_completed(
        &self,
        deployment_id: &str,
        status: DeploymentStatus,
        reason: &str,
        stage_statuses: &HashMap<String, StageStatus>,
    ) -> Result<(), AgentError> {
        let request = DeploymentCompletedRequest {
            deployment_id,
            status,
            status_reason: reason,
            stage_statuses,
            completed_at: crate::utils::now_unix(),
        };
        let _: serde_json::Value = self
            .post("/pipedservice/ReportDeploymentCompleted", &request)
            .await?;
        Ok(())
    }

    async fn get_commands(&self) -> Result<Vec<Command>, AgentError> {
        let request = PipedRequest { piped_id: self.piped_id() };
        let response: GetCommandsResponse = self.post("/pipedservice/GetCommands", &request).await?;
        Ok(response.commands)
    }

    async fn report_command_handled(
        &self,
        command_id: &str,
        status: CommandStatus,
        metadata: &HashMap<String, String>,
    ) -> Result<(), AgentError> {
        let request = CommandHandledRequest {
            command_id,
            status,
            metadata,
            handled_at: crate::utils::now_unix(),
        };
        let _: serde_json::Value = self
            .post("/pipedservice/ReportCommandHandled", &request)
            .await?;
        Ok(())
    }
}
