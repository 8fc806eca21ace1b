//! Deployment models

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::application::{ApplicationGitPath, ApplicationKind};

/// Overall status of a deployment
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentStatus {
    #[default]
    NotStarted,
    Pending,
    Planned,
    Running,
    RollingBack,
    Success,
    Failure,
    Cancelled,
}

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::NotStarted => "NOT_STARTED",
            DeploymentStatus::Pending => "PENDING",
            DeploymentStatus::Planned => "PLANNED",
            DeploymentStatus::Running => "RUNNING",
            DeploymentStatus::RollingBack => "ROLLING_BACK",
            DeploymentStatus::Success => "SUCCESS",
            DeploymentStatus::Failure => "FAILURE",
            DeploymentStatus::Cancelled => "CANCELLED",
        }
    }

    /// Whether the status is terminal
    pub fn is_completed(&self) -> bool {
        matches!(
            self,
            DeploymentStatus::Success | DeploymentStatus::Failure | DeploymentStatus::Cancelled
        )
    }

    fn rank(&self) -> u8 {
        match self {
            DeploymentStatus::NotStarted => 0,
            DeploymentStatus::Pending => 1,
            DeploymentStatus::Planned => 2,
            DeploymentStatus::Running => 3,
            DeploymentStatus::RollingBack => 4,
            DeploymentStatus::Success | DeploymentStatus::Failure | DeploymentStatus::Cancelled => 5,
        }
    }

    /// Whether moving from `self` to `next` keeps the status monotonic.
    ///
    /// Terminal statuses never change and non-terminal ones never move
    /// backwards.
    pub fn can_update_to(&self, next: DeploymentStatus) -> bool {
        if self.is_completed() {
            return false;
        }
        next.rank() >= self.rank()
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a single pipeline stage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageStatus {
    #[default]
    NotStarted,
    Running,
    Success,
    Failure,
    Cancelled,
    Skipped,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::NotStarted => "NOT_STARTED",
            StageStatus::Running => "RUNNING",
            StageStatus::Success => "SUCCESS",
            StageStatus::Failure => "FAILURE",
            StageStatus::Cancelled => "CANCELLED",
            StageStatus::Skipped => "SKIPPED",
        }
    }

    /// Whether the status is terminal
    pub fn is_completed(&self) -> bool {
        matches!(
            self,
            StageStatus::Success | StageStatus::Failure | StageStatus::Cancelled | StageStatus::Skipped
        )
    }

    /// Success and skipped both let the pipeline advance.
    pub fn is_successful(&self) -> bool {
        matches!(self, StageStatus::Success | StageStatus::Skipped)
    }

    /// Whether moving from `self` to `next` keeps the status monotonic.
    pub fn can_update_to(&self, next: StageStatus) -> bool {
        match (self, next) {
            (current, _) if current.is_completed() => false,
            (StageStatus::Running, StageStatus::NotStarted) => false,
            _ => true,
        }
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One step of a deployment pipeline
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStage {
    /// Unique within the deployment
    pub id: String,

    /// Stage kind, e.g. `WAIT` or `K8S_PRIMARY_ROLLOUT`
    pub name: String,

    #[serde(default)]
    pub desc: String,

    pub index: u32,

    /// Set on stages that only run when the deployment rolls back
    #[serde(default)]
    pub rollback: bool,

    /// Stage timeout in seconds, zero means the agent default
    #[serde(default)]
    pub timeout_seconds: u64,

    /// Stage options as declared under `with`
    #[serde(default)]
    pub config: serde_json::Value,

    #[serde(default)]
    pub status: StageStatus,

    #[serde(default)]
    pub status_reason: String,

    /// JSON encoded string map owned by the stage executor
    #[serde(default)]
    pub metadata: String,

    #[serde(default)]
    pub created_at: i64,

    #[serde(default)]
    pub updated_at: i64,
}

/// A source control commit
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Commit {
    pub hash: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub branch: String,
    #[serde(default)]
    pub created_at: i64,
}

/// What caused a deployment
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentTrigger {
    pub commit: Commit,

    /// Account that triggered it manually, empty for commit triggers
    #[serde(default)]
    pub commander: String,

    #[serde(default)]
    pub timestamp: i64,
}

/// One rollout attempt of an application at a given commit
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deployment {
    pub id: String,
    pub application_id: String,
    #[serde(default)]
    pub application_name: String,
    pub project_id: String,
    pub piped_id: String,
    pub kind: Option<ApplicationKind>,
    pub git_path: ApplicationGitPath,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    pub trigger: DeploymentTrigger,
    #[serde(default)]
    pub stages: Vec<PipelineStage>,
    #[serde(default)]
    pub status: DeploymentStatus,
    #[serde(default)]
    pub status_reason: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: i64,
    #[serde(default)]
    pub completed_at: i64,
}

impl Deployment {
    pub fn is_completed(&self) -> bool {
        self.status.is_completed()
    }

    pub fn commit_hash(&self) -> &str {
        &self.trigger.commit.hash
    }

    /// Commander for manual triggers, commit author otherwise
    pub fn triggered_by(&self) -> &str {
        if self.trigger.commander.is_empty() {
            &self.trigger.commit.author
        } else {
            &self.trigger.commander
        }
    }

    /// Position of the lowest index stage that still has to run, rollback
    /// stages excluded.
    pub fn next_stage(&self) -> Option<usize> {
        self.stages
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.rollback && !s.status.is_completed())
            .min_by_key(|(_, s)| s.index)
            .map(|(i, _)| i)
    }

    /// Current status of every stage keyed by stage id
    pub fn stage_statuses(&self) -> HashMap<String, StageStatus> {
        self.stages.iter().map(|s| (s.id.clone(), s.status)).collect()
    }
}
