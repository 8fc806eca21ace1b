//! Application configuration kept next to the application in its repository

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use piped_model::{ApplicationKind, NotificationEventType};
use serde::{Deserialize, Serialize};

use crate::config::API_VERSION;
use crate::errors::AgentError;
use crate::filesys::file::File;

/// Wildcard accepted in `notification.mentions[].event`
pub const ALL_EVENTS: &str = "*";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationConfig {
    pub api_version: String,
    pub kind: String,
    pub spec: ApplicationSpec,
}

impl ApplicationConfig {
    /// Load the configuration file of an application from a checked out repository.
    pub async fn load(repo_dir: &Path, relative_path: &str) -> Result<ApplicationConfig, AgentError> {
        let file = File::new(repo_dir.join(relative_path));
        if !file.exists().await {
            return Err(AgentError::NotFound(format!(
                "application config file {} was not found",
                relative_path
            )));
        }
        Self::parse(&file.read_string().await?)
    }

    pub fn parse(contents: &str) -> Result<ApplicationConfig, AgentError> {
        let config: ApplicationConfig = serde_yaml::from_str(contents)?;
        if config.api_version != API_VERSION {
            return Err(AgentError::ConfigError(format!(
                "unsupported apiVersion {}, expected {}",
                config.api_version, API_VERSION
            )));
        }
        if config.application_kind().is_none() {
            return Err(AgentError::ConfigError(format!(
                "unsupported application kind {}",
                config.kind
            )));
        }
        config.spec.validate()?;
        Ok(config)
    }

    pub fn application_kind(&self) -> Option<ApplicationKind> {
        match self.kind.as_str() {
            "KubernetesApp" => Some(ApplicationKind::Kubernetes),
            "TerraformApp" => Some(ApplicationKind::Terraform),
            "ECSApp" => Some(ApplicationKind::Ecs),
            "CloudRunApp" => Some(ApplicationKind::Cloudrun),
            "LambdaApp" => Some(ApplicationKind::Lambda),
            "Application" => Some(ApplicationKind::Custom),
            _ => None,
        }
    }

    /// Fail unless the file declares the kind the control plane registered.
    pub fn ensure_kind(&self, expected: ApplicationKind) -> Result<(), AgentError> {
        match self.application_kind() {
            Some(kind) if kind == expected => Ok(()),
            _ => Err(AgentError::ConfigError(format!(
                "invalid application kind in the config file, got: {}, expected: {}",
                self.kind, expected
            ))),
        }
    }
}

fn default_app_timeout() -> Duration {
    Duration::from_secs(6 * 60 * 60)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSpec {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub description: String,
    /// Deadline of the whole deployment
    #[serde(default = "default_app_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    #[serde(default)]
    pub pipeline: Option<PipelineConfig>,
    #[serde(default)]
    pub planner: PlannerConfig,
    #[serde(default)]
    pub trigger: TriggerConfig,
    #[serde(default)]
    pub encryption: Option<EncryptionConfig>,
    #[serde(default)]
    pub attachment: Option<AttachmentConfig>,
    #[serde(default)]
    pub post_sync: Option<PostSyncConfig>,
    #[serde(default)]
    pub notification: Option<DeploymentNotification>,
    #[serde(default)]
    pub drift_detection: Option<DriftDetection>,
}

impl ApplicationSpec {
    pub fn validate(&self) -> Result<(), AgentError> {
        if let Some(pipeline) = &self.pipeline {
            let mut ids = HashSet::new();
            for stage in &pipeline.stages {
                if stage.name.is_empty() {
                    return Err(AgentError::ConfigError("stage name must be set".to_string()));
                }
                if let Some(id) = &stage.id {
                    if !ids.insert(id.as_str()) {
                        return Err(AgentError::ConfigError(format!("duplicated stage id {}", id)));
                    }
                }
                if matches!(stage.timeout, Some(t) if t.is_zero()) {
                    return Err(AgentError::ConfigError(format!(
                        "stage {} has a zero timeout",
                        stage.name
                    )));
                }
            }
        }
        if let Some(notification) = &self.notification {
            for mention in &notification.mentions {
                mention.validate()?;
            }
        }
        Ok(())
    }

    pub fn stages(&self) -> &[StageConfig] {
        self.pipeline.as_ref().map(|p| p.stages.as_slice()).unwrap_or(&[])
    }

    /// Slack accounts mentioned for the event, sorted and deduplicated.
    pub fn mentioned_accounts(&self, event: NotificationEventType) -> Vec<String> {
        self.notification
            .as_ref()
            .map(|n| n.find_accounts(event))
            .unwrap_or_default()
    }

    pub fn mentioned_groups(&self, event: NotificationEventType) -> Vec<String> {
        self.notification
            .as_ref()
            .map(|n| n.find_groups(event))
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineConfig {
    #[serde(default)]
    pub stages: Vec<StageConfig>,
}

/// One stage as declared by the user
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageConfig {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub desc: String,
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,
    /// Options interpreted by the stage executor
    #[serde(default)]
    pub with: serde_json::Value,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannerConfig {
    #[serde(default)]
    pub always_use_pipeline: bool,
    /// Run a rollback stage when the deployment fails
    #[serde(default = "default_true")]
    pub auto_rollback: bool,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            always_use_pipeline: false,
            auto_rollback: true,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerConfig {
    #[serde(default)]
    pub on_commit: OnCommit,
    #[serde(default)]
    pub on_command: OnCommand,
    #[serde(default)]
    pub on_out_of_sync: OnOutOfSync,
    #[serde(default)]
    pub on_chain: OnChain,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnCommit {
    #[serde(default)]
    pub disabled: bool,
    /// Extra paths whose changes trigger the application
    #[serde(default)]
    pub paths: Vec<String>,
    /// Paths whose changes never trigger the application
    #[serde(default)]
    pub ignores: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnCommand {
    #[serde(default)]
    pub disabled: bool,
}

fn default_min_window() -> Duration {
    Duration::from_secs(5 * 60)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnOutOfSync {
    #[serde(default = "default_true")]
    pub disabled: bool,
    #[serde(default = "default_min_window", with = "humantime_serde")]
    pub min_window: Duration,
}

impl Default for OnOutOfSync {
    fn default() -> Self {
        Self {
            disabled: true,
            min_window: default_min_window(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnChain {
    #[serde(default = "default_true")]
    pub disabled: bool,
}

impl Default for OnChain {
    fn default() -> Self {
        Self { disabled: true }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptionConfig {
    #[serde(default)]
    pub encrypted_secrets: HashMap<String, String>,
    #[serde(default)]
    pub decryption_targets: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentConfig {
    #[serde(default)]
    pub sources: HashMap<String, String>,
    #[serde(default)]
    pub targets: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostSyncConfig {
    #[serde(default)]
    pub chain: Option<DeploymentChain>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentChain {
    #[serde(default)]
    pub applications: Vec<ChainApplicationMatcher>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainApplicationMatcher {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriftDetection {
    #[serde(default)]
    pub ignore_fields: Vec<String>,
}

/// Who to mention when notifying about this application
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentNotification {
    #[serde(default)]
    pub mentions: Vec<NotificationMention>,
}

impl DeploymentNotification {
    pub fn find_accounts(&self, event: NotificationEventType) -> Vec<String> {
        self.collect(event, |m| &m.slack)
    }

    pub fn find_groups(&self, event: NotificationEventType) -> Vec<String> {
        self.collect(event, |m| &m.slack_groups)
    }

    fn collect<F>(&self, event: NotificationEventType, field: F) -> Vec<String>
    where
        F: Fn(&NotificationMention) -> &Vec<String>,
    {
        let found: BTreeSet<String> = self
            .mentions
            .iter()
            .filter(|m| m.matches(event))
            .flat_map(|m| field(m).iter().cloned())
            .collect();
        found.into_iter().collect()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationMention {
    /// Event name without the `EVENT_` prefix, or `*`
    pub event: String,
    #[serde(default)]
    pub slack: Vec<String>,
    #[serde(default)]
    pub slack_groups: Vec<String>,
}

impl NotificationMention {
    fn validate(&self) -> Result<(), AgentError> {
        if self.event == ALL_EVENTS {
            return Ok(());
        }
        self.event
            .parse::<NotificationEventType>()
            .map(|_| ())
            .map_err(AgentError::ConfigError)
    }

    fn matches(&self, event: NotificationEventType) -> bool {
        self.event == ALL_EVENTS || self.event.parse::<NotificationEventType>() == Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KUBERNETES_APP: &str = r#"
apiVersion: pipecd.dev/v1beta1
kind: KubernetesApp
spec:
  name: canary
  labels:
    env: dev
  pipeline:
    stages:
      - name: K8S_CANARY_ROLLOUT
        with:
          replicas: 10%
      - name: WAIT
        timeout: 10m
        with:
          duration: 1m
      - name: K8S_PRIMARY_ROLLOUT
  trigger:
    onCommit:
      paths:
        - shared/
  notification:
    mentions:
      - event: DEPLOYMENT_TRIGGERED
        slack:
          - alice
      - event: "*"
        slack:
          - bob
        slackGroups:
          - S123
"#;

    #[test]
    fn test_parse_application_config() {
        let config = ApplicationConfig::parse(KUBERNETES_APP).unwrap();
        assert_eq!(config.application_kind(), Some(ApplicationKind::Kubernetes));
        assert!(config.ensure_kind(ApplicationKind::Kubernetes).is_ok());
        assert!(config.ensure_kind(ApplicationKind::Terraform).is_err());

        let spec = &config.spec;
        assert_eq!(spec.stages().len(), 3);
        assert_eq!(spec.stages()[1].timeout, Some(Duration::from_secs(600)));
        assert_eq!(spec.stages()[1].with["duration"], "1m");
        assert!(spec.planner.auto_rollback);
        assert!(spec.trigger.on_out_of_sync.disabled);
        assert_eq!(spec.trigger.on_commit.paths, vec!["shared/".to_string()]);
        assert_eq!(spec.timeout, Duration::from_secs(6 * 60 * 60));
    }

    #[test]
    fn test_mentions() {
        let config = ApplicationConfig::parse(KUBERNETES_APP).unwrap();
        assert_eq!(
            config.spec.mentioned_accounts(NotificationEventType::DeploymentTriggered),
            vec!["alice".to_string(), "bob".to_string()]
        );
        assert_eq!(
            config.spec.mentioned_accounts(NotificationEventType::DeploymentFailed),
            vec!["bob".to_string()]
        );
        assert_eq!(
            config.spec.mentioned_groups(NotificationEventType::DeploymentFailed),
            vec!["S123".to_string()]
        );
    }

    #[test]
    fn test_unknown_kind() {
        let config = KUBERNETES_APP.replace("KubernetesApp", "MainframeApp");
        assert!(ApplicationConfig::parse(&config).is_err());
    }

    #[test]
    fn test_duplicated_stage_id() {
        let config = r#"
apiVersion: pipecd.dev/v1beta1
kind: Application
spec:
  pipeline:
    stages:
      - id: same
        name: WAIT
      - id: same
        name: WAIT
"#;
        assert!(ApplicationConfig::parse(config).is_err());
    }
}
