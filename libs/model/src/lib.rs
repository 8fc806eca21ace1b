//! Data model shared between the piped agent and the control plane.
//!
//! Every type here is a plain serde DTO. JSON field names are camelCase and
//! enum values are SCREAMING_SNAKE_CASE.

pub mod application;
pub mod command;
pub mod deployment;
pub mod logblock;
pub mod notification;

pub use application::{Application, ApplicationGitPath, ApplicationKind};
pub use command::{Command, CommandKind, CommandStatus};
pub use deployment::{Commit, Deployment, DeploymentStatus, DeploymentTrigger, PipelineStage, StageStatus};
pub use logblock::{LogBlock, LogSeverity};
pub use notification::{
    HasAppName, HasLabels, NotificationEvent, NotificationEventGroup, NotificationEventMetadata,
    NotificationEventType,
};
