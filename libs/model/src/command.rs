//! Commands issued by users through the control plane

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandKind {
    CancelDeployment,
    ApproveStage,
    SyncApplication,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandStatus {
    #[default]
    NotHandledYet,
    Succeeded,
    Failed,
}

/// A human initiated action waiting to be handled by a piped
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    pub id: String,
    pub piped_id: String,
    #[serde(default)]
    pub application_id: String,
    #[serde(default)]
    pub deployment_id: String,
    #[serde(default)]
    pub stage_id: String,
    /// Account that issued the command
    #[serde(default)]
    pub commander: String,
    pub kind: CommandKind,
    #[serde(default)]
    pub status: CommandStatus,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub created_at: i64,
}
