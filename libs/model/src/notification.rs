//! Notification events

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::application::Application;
use crate::deployment::Deployment;

/// Lifecycle event kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationEventType {
    DeploymentTriggered,
    DeploymentPlanned,
    DeploymentWaitApproval,
    DeploymentApproved,
    DeploymentRollingBack,
    DeploymentSucceeded,
    DeploymentFailed,
    DeploymentCancelled,
    DeploymentTriggerFailed,
    ApplicationSynced,
    ApplicationOutOfSync,
    PipedStarted,
    PipedStopped,
}

impl NotificationEventType {
    pub const ALL: [NotificationEventType; 13] = [
        NotificationEventType::DeploymentTriggered,
        NotificationEventType::DeploymentPlanned,
        NotificationEventType::DeploymentWaitApproval,
        NotificationEventType::DeploymentApproved,
        NotificationEventType::DeploymentRollingBack,
        NotificationEventType::DeploymentSucceeded,
        NotificationEventType::DeploymentFailed,
        NotificationEventType::DeploymentCancelled,
        NotificationEventType::DeploymentTriggerFailed,
        NotificationEventType::ApplicationSynced,
        NotificationEventType::ApplicationOutOfSync,
        NotificationEventType::PipedStarted,
        NotificationEventType::PipedStopped,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationEventType::DeploymentTriggered => "DEPLOYMENT_TRIGGERED",
            NotificationEventType::DeploymentPlanned => "DEPLOYMENT_PLANNED",
            NotificationEventType::DeploymentWaitApproval => "DEPLOYMENT_WAIT_APPROVAL",
            NotificationEventType::DeploymentApproved => "DEPLOYMENT_APPROVED",
            NotificationEventType::DeploymentRollingBack => "DEPLOYMENT_ROLLING_BACK",
            NotificationEventType::DeploymentSucceeded => "DEPLOYMENT_SUCCEEDED",
            NotificationEventType::DeploymentFailed => "DEPLOYMENT_FAILED",
            NotificationEventType::DeploymentCancelled => "DEPLOYMENT_CANCELLED",
            NotificationEventType::DeploymentTriggerFailed => "DEPLOYMENT_TRIGGER_FAILED",
            NotificationEventType::ApplicationSynced => "APPLICATION_SYNCED",
            NotificationEventType::ApplicationOutOfSync => "APPLICATION_OUT_OF_SYNC",
            NotificationEventType::PipedStarted => "PIPED_STARTED",
            NotificationEventType::PipedStopped => "PIPED_STOPPED",
        }
    }

    pub fn group(&self) -> NotificationEventGroup {
        match self {
            NotificationEventType::ApplicationSynced | NotificationEventType::ApplicationOutOfSync => {
                NotificationEventGroup::Application
            }
            NotificationEventType::PipedStarted | NotificationEventType::PipedStopped => {
                NotificationEventGroup::Piped
            }
            _ => NotificationEventGroup::Deployment,
        }
    }
}

impl fmt::Display for NotificationEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Accepts `DEPLOYMENT_TRIGGERED`, `EVENT_DEPLOYMENT_TRIGGERED` and any casing of them.
impl FromStr for NotificationEventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_uppercase();
        let name = upper.strip_prefix("EVENT_").unwrap_or(&upper);
        Self::ALL
            .iter()
            .find(|t| t.as_str() == name)
            .copied()
            .ok_or_else(|| format!("unknown notification event: {}", s))
    }
}

/// Coarse grouping of event kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationEventGroup {
    Deployment,
    Application,
    Piped,
}

impl NotificationEventGroup {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationEventGroup::Deployment => "DEPLOYMENT",
            NotificationEventGroup::Application => "APPLICATION",
            NotificationEventGroup::Piped => "PIPED",
        }
    }
}

impl FromStr for NotificationEventGroup {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_uppercase();
        match upper.strip_prefix("EVENT_").unwrap_or(&upper) {
            "DEPLOYMENT" => Ok(NotificationEventGroup::Deployment),
            "APPLICATION" => Ok(NotificationEventGroup::Application),
            "PIPED" => Ok(NotificationEventGroup::Piped),
            _ => Err(format!("unknown notification group: {}", s)),
        }
    }
}

/// Payload exposing the name of the application it is about
pub trait HasAppName {
    fn app_name(&self) -> &str;
}

/// Payload exposing the labels of the application it is about
pub trait HasLabels {
    fn labels(&self) -> &HashMap<String, String>;
}

/// Payload of deployment scoped events
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentEventData {
    pub deployment: Deployment,
    #[serde(default)]
    pub summary: String,
    /// Failure reason, or the account that cancelled or approved
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub mentioned_accounts: Vec<String>,
    #[serde(default)]
    pub mentioned_groups: Vec<String>,
}

impl HasAppName for DeploymentEventData {
    fn app_name(&self) -> &str {
        &self.deployment.application_name
    }
}

impl HasLabels for DeploymentEventData {
    fn labels(&self) -> &HashMap<String, String> {
        &self.deployment.labels
    }
}

/// Payload of a trigger that could not create a deployment
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerFailedEventData {
    pub application: Application,
    pub commit_hash: String,
    #[serde(default)]
    pub commit_message: String,
    pub reason: String,
    #[serde(default)]
    pub mentioned_accounts: Vec<String>,
    #[serde(default)]
    pub mentioned_groups: Vec<String>,
}

impl HasAppName for TriggerFailedEventData {
    fn app_name(&self) -> &str {
        &self.application.name
    }
}

impl HasLabels for TriggerFailedEventData {
    fn labels(&self) -> &HashMap<String, String> {
        &self.application.labels
    }
}

/// Payload of application scoped events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationEventData {
    pub application: Application,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub mentioned_accounts: Vec<String>,
    #[serde(default)]
    pub mentioned_groups: Vec<String>,
}

impl HasAppName for ApplicationEventData {
    fn app_name(&self) -> &str {
        &self.application.name
    }
}

impl HasLabels for ApplicationEventData {
    fn labels(&self) -> &HashMap<String, String> {
        &self.application.labels
    }
}

/// Payload of piped lifecycle events
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipedEventData {
    pub id: String,
    pub version: String,
    #[serde(default)]
    pub project_id: String,
}

/// Typed payload of a notification event
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum NotificationEventMetadata {
    Deployment(DeploymentEventData),
    TriggerFailed(TriggerFailedEventData),
    Application(ApplicationEventData),
    Piped(PipedEventData),
}

impl NotificationEventMetadata {
    pub fn as_app_named(&self) -> Option<&dyn HasAppName> {
        match self {
            NotificationEventMetadata::Deployment(d) => Some(d),
            NotificationEventMetadata::TriggerFailed(d) => Some(d),
            NotificationEventMetadata::Application(d) => Some(d),
            NotificationEventMetadata::Piped(_) => None,
        }
    }

    pub fn as_labeled(&self) -> Option<&dyn HasLabels> {
        match self {
            NotificationEventMetadata::Deployment(d) => Some(d),
            NotificationEventMetadata::TriggerFailed(d) => Some(d),
            NotificationEventMetadata::Application(d) => Some(d),
            NotificationEventMetadata::Piped(_) => None,
        }
    }

    pub fn mentioned_accounts(&self) -> &[String] {
        match self {
            NotificationEventMetadata::Deployment(d) => &d.mentioned_accounts,
            NotificationEventMetadata::TriggerFailed(d) => &d.mentioned_accounts,
            NotificationEventMetadata::Application(d) => &d.mentioned_accounts,
            NotificationEventMetadata::Piped(_) => &[],
        }
    }

    pub fn mentioned_groups(&self) -> &[String] {
        match self {
            NotificationEventMetadata::Deployment(d) => &d.mentioned_groups,
            NotificationEventMetadata::TriggerFailed(d) => &d.mentioned_groups,
            NotificationEventMetadata::Application(d) => &d.mentioned_groups,
            NotificationEventMetadata::Piped(_) => &[],
        }
    }
}

/// A lifecycle event routed to notification receivers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationEvent {
    #[serde(rename = "type")]
    pub event_type: NotificationEventType,
    pub metadata: NotificationEventMetadata,
}

impl NotificationEvent {
    pub fn new(event_type: NotificationEventType, metadata: NotificationEventMetadata) -> Self {
        Self { event_type, metadata }
    }

    pub fn group(&self) -> NotificationEventGroup {
        self.event_type.group()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_parsing() {
        assert_eq!(
            "DEPLOYMENT_TRIGGERED".parse::<NotificationEventType>().unwrap(),
            NotificationEventType::DeploymentTriggered
        );
        assert_eq!(
            "event_piped_started".parse::<NotificationEventType>().unwrap(),
            NotificationEventType::PipedStarted
        );
        assert!("DEPLOYMENT_EXPLODED".parse::<NotificationEventType>().is_err());
    }

    #[test]
    fn test_event_groups() {
        assert_eq!(
            NotificationEventType::DeploymentTriggerFailed.group(),
            NotificationEventGroup::Deployment
        );
        assert_eq!(NotificationEventType::ApplicationSynced.group(), NotificationEventGroup::Application);
        assert_eq!(NotificationEventType::PipedStopped.group(), NotificationEventGroup::Piped);
    }

    #[test]
    fn test_piped_metadata_has_no_capabilities() {
        let metadata = NotificationEventMetadata::Piped(PipedEventData::default());
        assert!(metadata.as_app_named().is_none());
        assert!(metadata.as_labeled().is_none());
        assert!(metadata.mentioned_accounts().is_empty());
    }
}
