//! Build the deployment record sent to the control plane

use piped_model::{
    Application, ApplicationKind, Commit, Deployment, DeploymentStatus, DeploymentTrigger, PipelineStage,
    StageStatus,
};

use crate::config::application::ApplicationSpec;
use crate::errors::AgentError;
use crate::executor::{customsync, waitapproval, DEPLOYMENT_NOTIFICATION_KEY};
use crate::utils::generate_uuid;

/// Stages used when the application does not declare a pipeline
pub fn default_pipeline(kind: ApplicationKind) -> &'static [&'static str] {
    match kind {
        ApplicationKind::Kubernetes => &["K8S_PRIMARY_ROLLOUT"],
        ApplicationKind::Terraform => &["TERRAFORM_PLAN", waitapproval::STAGE_NAME, "TERRAFORM_APPLY"],
        ApplicationKind::Ecs => &["ECS_SYNC"],
        ApplicationKind::Lambda => &["LAMBDA_SYNC"],
        ApplicationKind::Cloudrun => &["CLOUDRUN_SYNC"],
        ApplicationKind::Custom => &[customsync::STAGE_NAME],
    }
}

pub fn build_deployment(
    app: &Application,
    spec: &ApplicationSpec,
    commit: Commit,
    commander: &str,
    now: i64,
) -> Result<Deployment, AgentError> {
    let stages = build_stages(app.kind, spec, now);

    let mut metadata = std::collections::HashMap::new();
    if let Some(notification) = spec.notification.as_ref().filter(|n| !n.mentions.is_empty()) {
        metadata.insert(
            DEPLOYMENT_NOTIFICATION_KEY.to_string(),
            serde_json::to_string(notification)?,
        );
    }

    Ok(Deployment {
        id: generate_uuid(),
        application_id: app.id.clone(),
        application_name: app.name.clone(),
        project_id: app.project_id.clone(),
        piped_id: app.piped_id.clone(),
        kind: Some(app.kind),
        git_path: app.git_path.clone(),
        labels: app.labels.clone(),
        trigger: DeploymentTrigger {
            commit,
            commander: commander.to_string(),
            timestamp: now,
        },
        stages,
        status: DeploymentStatus::Pending,
        status_reason: "The deployment is waiting to be planned".to_string(),
        metadata,
        created_at: now,
        updated_at: now,
        completed_at: 0,
    })
}

fn build_stages(kind: ApplicationKind, spec: &ApplicationSpec, now: i64) -> Vec<PipelineStage> {
    let configured = spec.stages();
    if !configured.is_empty() {
        return configured
            .iter()
            .enumerate()
            .map(|(i, stage)| PipelineStage {
                id: stage.id.clone().unwrap_or_else(|| stage_id(i)),
                name: stage.name.clone(),
                desc: stage.desc.clone(),
                index: i as u32,
                timeout_seconds: stage.timeout.map(|t| t.as_secs()).unwrap_or_default(),
                config: stage.with.clone(),
                status: StageStatus::NotStarted,
                created_at: now,
                updated_at: now,
                ..Default::default()
            })
            .collect();
    }

    default_pipeline(kind)
        .iter()
        .enumerate()
        .map(|(i, name)| PipelineStage {
            id: stage_id(i),
            name: name.to_string(),
            index: i as u32,
            status: StageStatus::NotStarted,
            created_at: now,
            updated_at: now,
            ..Default::default()
        })
        .collect()
}

fn stage_id(index: usize) -> String {
    format!("stage-{}", index)
}
