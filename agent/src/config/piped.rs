//! Piped configuration

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::Engine;
use piped_model::{NotificationEventGroup, NotificationEventType};
use secrecy::SecretString;
use serde::Deserialize;

use crate::config::{API_VERSION, PIPED_KIND};
use crate::errors::AgentError;
use crate::filesys::file::File;

/// Default header carrying the webhook signature
pub const DEFAULT_SIGNATURE_KEY: &str = "Pipecd-Signature";

/// Top level document of a piped configuration file
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipedConfig {
    pub api_version: String,
    pub kind: String,
    pub spec: PipedSpec,
}

impl PipedConfig {
    /// Read, parse and validate a piped configuration file.
    pub async fn load(path: &Path) -> Result<PipedSpec, AgentError> {
        let contents = File::new(path).read_string().await?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<PipedSpec, AgentError> {
        let config: PipedConfig = serde_yaml::from_str(contents)?;
        if config.api_version != API_VERSION {
            return Err(AgentError::ConfigError(format!(
                "unsupported apiVersion {}, expected {}",
                config.api_version, API_VERSION
            )));
        }
        if config.kind != PIPED_KIND {
            return Err(AgentError::ConfigError(format!(
                "unexpected kind {}, expected {}",
                config.kind, PIPED_KIND
            )));
        }
        config.spec.validate()?;
        Ok(config.spec)
    }
}

fn default_sync_interval() -> Duration {
    Duration::from_secs(60)
}

/// Runtime settings of one piped
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipedSpec {
    #[serde(rename = "projectID")]
    pub project_id: String,

    #[serde(rename = "pipedID")]
    pub piped_id: String,

    /// Path to a file holding the piped key
    #[serde(default)]
    pub piped_key_file: Option<PathBuf>,

    /// Base64 encoded piped key
    #[serde(default)]
    pub piped_key_data: Option<String>,

    /// Control plane address, `host:port` or a full URL
    pub api_address: String,

    /// Web console address used to build links in notifications
    #[serde(default)]
    pub web_address: String,

    #[serde(default = "default_sync_interval", with = "humantime_serde")]
    pub sync_interval: Duration,

    /// Root of deployment and trigger scratch directories
    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    #[serde(default)]
    pub repositories: Vec<PipedRepository>,

    #[serde(default)]
    pub notifications: Notifications,

    #[serde(default)]
    pub analysis_providers: Vec<AnalysisProvider>,

    #[serde(default)]
    pub platform_providers: Vec<PlatformProvider>,

    #[serde(default)]
    pub secret_management: Option<SecretManagement>,
}

impl PipedSpec {
    pub fn validate(&self) -> Result<(), AgentError> {
        if self.project_id.is_empty() {
            return Err(AgentError::ConfigError("projectID must be set".to_string()));
        }
        if self.piped_id.is_empty() {
            return Err(AgentError::ConfigError("pipedID must be set".to_string()));
        }
        match (&self.piped_key_file, &self.piped_key_data) {
            (Some(_), Some(_)) => {
                return Err(AgentError::ConfigError(
                    "only one of pipedKeyFile or pipedKeyData can be set".to_string(),
                ))
            }
            (None, None) => {
                return Err(AgentError::ConfigError(
                    "either pipedKeyFile or pipedKeyData must be set".to_string(),
                ))
            }
            _ => {}
        }
        if self.api_address.is_empty() {
            return Err(AgentError::ConfigError("apiAddress must be set".to_string()));
        }
        url::Url::parse(&self.api_url())
            .map_err(|e| AgentError::ConfigError(format!("invalid apiAddress: {}", e)))?;
        if self.sync_interval.is_zero() {
            return Err(AgentError::ConfigError("syncInterval must be positive".to_string()));
        }

        let mut repo_ids = HashSet::new();
        for repo in &self.repositories {
            if repo.repo_id.is_empty() || repo.remote.is_empty() {
                return Err(AgentError::ConfigError(
                    "repository must have repoId and remote".to_string(),
                ));
            }
            if !repo_ids.insert(repo.repo_id.as_str()) {
                return Err(AgentError::ConfigError(format!(
                    "duplicated repository {}",
                    repo.repo_id
                )));
            }
        }

        let mut provider_names = HashSet::new();
        for provider in &self.analysis_providers {
            if !provider_names.insert(provider.name.as_str()) {
                return Err(AgentError::ConfigError(format!(
                    "duplicated analysis provider {}",
                    provider.name
                )));
            }
        }

        self.notifications.validate()
    }

    /// Control plane base URL with a scheme
    pub fn api_url(&self) -> String {
        if self.api_address.contains("://") {
            self.api_address.clone()
        } else {
            format!("https://{}", self.api_address)
        }
    }

    /// Load the piped key from its file or inline base64 data.
    pub async fn load_piped_key(&self) -> Result<SecretString, AgentError> {
        if let Some(path) = &self.piped_key_file {
            let key = File::new(path).read_string().await?;
            return Ok(SecretString::from(key.trim().to_string()));
        }
        if let Some(data) = &self.piped_key_data {
            return decode_base64(data, "pipedKeyData").map(SecretString::from);
        }
        Err(AgentError::ConfigError("piped key is not configured".to_string()))
    }

    pub fn repository(&self, repo_id: &str) -> Option<&PipedRepository> {
        self.repositories.iter().find(|r| r.repo_id == repo_id)
    }

    pub fn analysis_provider(&self, name: &str) -> Option<&AnalysisProvider> {
        self.analysis_providers.iter().find(|p| p.name == name)
    }
}

fn decode_base64(data: &str, field: &str) -> Result<String, AgentError> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(data.trim())
        .map_err(|e| AgentError::ConfigError(format!("invalid base64 in {}: {}", field, e)))?;
    let decoded = String::from_utf8(bytes)
        .map_err(|e| AgentError::ConfigError(format!("invalid utf-8 in {}: {}", field, e)))?;
    Ok(decoded.trim().to_string())
}

/// A git repository watched by the piped
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipedRepository {
    #[serde(rename = "repoId")]
    pub repo_id: String,
    pub remote: String,
    #[serde(default = "default_branch")]
    pub branch: String,
}

fn default_branch() -> String {
    "main".to_string()
}

/// Notification routes and receivers
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notifications {
    #[serde(default)]
    pub routes: Vec<NotificationRoute>,
    #[serde(default)]
    pub receivers: Vec<NotificationReceiver>,
}

impl Notifications {
    pub fn validate(&self) -> Result<(), AgentError> {
        let mut names = HashSet::new();
        for receiver in &self.receivers {
            if receiver.name.is_empty() {
                return Err(AgentError::ConfigError("receiver name must be set".to_string()));
            }
            if !names.insert(receiver.name.as_str()) {
                return Err(AgentError::ConfigError(format!(
                    "duplicated receiver {}",
                    receiver.name
                )));
            }
            receiver.validate()?;
        }

        for route in &self.routes {
            if !names.contains(route.receiver.as_str()) {
                return Err(AgentError::ConfigError(format!(
                    "route {} refers to unknown receiver {}",
                    route.name, route.receiver
                )));
            }
            route.validate()?;
        }
        Ok(())
    }

    pub fn receiver(&self, name: &str) -> Option<&NotificationReceiver> {
        self.receivers.iter().find(|r| r.name == name)
    }
}

/// Binds event filters to a receiver
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRoute {
    pub name: String,
    pub receiver: String,
    #[serde(default)]
    pub events: Vec<String>,
    #[serde(default)]
    pub ignore_events: Vec<String>,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub ignore_groups: Vec<String>,
    #[serde(default)]
    pub apps: Vec<String>,
    #[serde(default)]
    pub ignore_apps: Vec<String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub ignore_labels: HashMap<String, String>,
}

impl NotificationRoute {
    fn validate(&self) -> Result<(), AgentError> {
        for event in self.events.iter().chain(&self.ignore_events) {
            event
                .parse::<NotificationEventType>()
                .map_err(|e| AgentError::ConfigError(format!("route {}: {}", self.name, e)))?;
        }
        for group in self.groups.iter().chain(&self.ignore_groups) {
            group
                .parse::<NotificationEventGroup>()
                .map_err(|e| AgentError::ConfigError(format!("route {}: {}", self.name, e)))?;
        }
        Ok(())
    }
}

/// A named sink for notification events
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationReceiver {
    pub name: String,
    #[serde(default)]
    pub slack: Option<SlackReceiver>,
    #[serde(default)]
    pub webhook: Option<WebhookReceiver>,
}

impl NotificationReceiver {
    fn validate(&self) -> Result<(), AgentError> {
        match (&self.slack, &self.webhook) {
            (Some(slack), None) => slack.validate(),
            (None, Some(webhook)) => webhook.validate(),
            _ => Err(AgentError::ConfigError(format!(
                "receiver {} must have exactly one of slack or webhook",
                self.name
            ))),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlackReceiver {
    #[serde(default, rename = "hookURL")]
    pub hook_url: String,
    #[serde(default)]
    pub oauth_token: String,
    /// Base64 encoded OAuth token
    #[serde(default)]
    pub oauth_token_data: String,
    #[serde(default)]
    pub oauth_token_file: String,
    #[serde(default, rename = "channelID")]
    pub channel_id: String,
    #[serde(default)]
    pub mentioned_accounts: Vec<String>,
    #[serde(default)]
    pub mentioned_groups: Vec<String>,
}

impl SlackReceiver {
    pub fn validate(&self) -> Result<(), AgentError> {
        let tokens = [&self.oauth_token, &self.oauth_token_data, &self.oauth_token_file]
            .iter()
            .filter(|t| !t.is_empty())
            .count();

        if !self.hook_url.is_empty() {
            if tokens > 0 || !self.channel_id.is_empty() {
                return Err(AgentError::ConfigError(
                    "only one of sending via hook URL or API should be used".to_string(),
                ));
            }
            return Ok(());
        }
        if self.channel_id.is_empty() || tokens == 0 {
            return Err(AgentError::ConfigError(
                "missing channelID or OAuth token configuration".to_string(),
            ));
        }
        if tokens > 1 {
            return Err(AgentError::ConfigError(
                "only one of oauthToken, oauthTokenData and oauthTokenFile should be set".to_string(),
            ));
        }
        Ok(())
    }

    /// OAuth token when the receiver posts through the API, `None` for hook URLs.
    pub async fn load_oauth_token(&self) -> Result<Option<SecretString>, AgentError> {
        if !self.oauth_token.is_empty() {
            return Ok(Some(SecretString::from(self.oauth_token.clone())));
        }
        if !self.oauth_token_data.is_empty() {
            return decode_base64(&self.oauth_token_data, "oauthTokenData")
                .map(|t| Some(SecretString::from(t)));
        }
        if !self.oauth_token_file.is_empty() {
            let token = File::new(&self.oauth_token_file).read_string().await?;
            return Ok(Some(SecretString::from(token.trim().to_string())));
        }
        Ok(None)
    }

    /// Accounts without a leading `@`
    pub fn formatted_accounts(&self) -> Vec<String> {
        self.mentioned_accounts
            .iter()
            .map(|a| a.trim_start_matches('@').to_string())
            .collect()
    }

    /// Groups in `<!subteam^ID>` form
    pub fn formatted_groups(&self) -> Vec<String> {
        self.mentioned_groups.iter().map(|g| format_slack_group(g)).collect()
    }
}

pub fn format_slack_group(group: &str) -> String {
    if group.contains("!subteam^") {
        group.to_string()
    } else {
        format!("<!subteam^{}>", group)
    }
}

fn default_signature_key() -> String {
    DEFAULT_SIGNATURE_KEY.to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookReceiver {
    pub url: String,
    #[serde(default = "default_signature_key")]
    pub signature_key: String,
    #[serde(default)]
    pub signature_value: String,
    #[serde(default)]
    pub signature_value_file: String,
}

impl WebhookReceiver {
    pub fn validate(&self) -> Result<(), AgentError> {
        url::Url::parse(&self.url)
            .map_err(|e| AgentError::ConfigError(format!("invalid webhook url: {}", e)))?;
        if !self.signature_value.is_empty() && !self.signature_value_file.is_empty() {
            return Err(AgentError::ConfigError(
                "only either signatureValue or signatureValueFile can be set".to_string(),
            ));
        }
        Ok(())
    }

    pub async fn load_signature_value(&self) -> Result<String, AgentError> {
        if !self.signature_value.is_empty() && !self.signature_value_file.is_empty() {
            return Err(AgentError::ConfigError(
                "only either signatureValue or signatureValueFile can be set".to_string(),
            ));
        }
        if !self.signature_value.is_empty() {
            return Ok(self.signature_value.clone());
        }
        if !self.signature_value_file.is_empty() {
            let value = File::new(&self.signature_value_file).read_string().await?;
            return Ok(value.trim_end().to_string());
        }
        Ok(String::new())
    }
}

/// Source of metrics or logs for ANALYSIS stages
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisProvider {
    pub name: String,
    #[serde(rename = "type")]
    pub provider_type: String,
    #[serde(default)]
    pub config: serde_json::Value,
}

/// Cloud platform an executor plugin deploys to
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformProvider {
    pub name: String,
    #[serde(rename = "type")]
    pub provider_type: String,
    #[serde(default)]
    pub config: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretManagement {
    #[serde(rename = "type")]
    pub management_type: String,
    #[serde(default)]
    pub key_pair: Option<KeyPair>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyPair {
    pub private_key_file: PathBuf,
    pub public_key_file: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    const CONFIG: &str = r#"
apiVersion: pipecd.dev/v1beta1
kind: Piped
spec:
  projectID: quickstart
  pipedID: piped-1
  pipedKeyData: c2VjcmV0LWtleQ==
  apiAddress: control-plane.example.com:443
  syncInterval: 30s
  repositories:
    - repoId: examples
      remote: https://github.com/pipe-cd/examples.git
      branch: master
  notifications:
    routes:
      - name: dev-slack
        receiver: dev-slack-channel
        events:
          - DEPLOYMENT_TRIGGERED
        labels:
          env: dev
    receivers:
      - name: dev-slack-channel
        slack:
          hookURL: https://hooks.slack.com/services/dev
      - name: integration
        webhook:
          url: https://example.com/hook
          signatureValue: secret
  analysisProviders:
    - name: prometheus-dev
      type: PROMETHEUS
      config:
        address: https://prometheus.dev
"#;

    #[tokio::test]
    async fn test_parse_piped_config() {
        let spec = PipedConfig::parse(CONFIG).unwrap();
        assert_eq!(spec.project_id, "quickstart");
        assert_eq!(spec.sync_interval, Duration::from_secs(30));
        assert_eq!(spec.api_url(), "https://control-plane.example.com:443");
        assert_eq!(spec.repository("examples").unwrap().branch, "master");
        assert_eq!(spec.notifications.routes[0].labels["env"], "dev");
        assert_eq!(
            spec.notifications.receiver("integration").unwrap().webhook.as_ref().unwrap().signature_key,
            DEFAULT_SIGNATURE_KEY
        );
        assert!(spec.analysis_provider("prometheus-dev").is_some());

        let key = spec.load_piped_key().await.unwrap();
        assert_eq!(key.expose_secret(), "secret-key");
    }

    #[test]
    fn test_route_to_unknown_receiver() {
        let config = CONFIG.replace("receiver: dev-slack-channel", "receiver: nowhere");
        assert!(matches!(PipedConfig::parse(&config), Err(AgentError::ConfigError(_))));
    }

    #[test]
    fn test_both_piped_keys() {
        let config = CONFIG.replace(
            "pipedKeyData: c2VjcmV0LWtleQ==",
            "pipedKeyData: c2VjcmV0LWtleQ==\n  pipedKeyFile: /etc/piped/key",
        );
        assert!(PipedConfig::parse(&config).is_err());
    }

    #[test]
    fn test_slack_receiver_validation() {
        let hook = SlackReceiver {
            hook_url: "https://hooks.slack.com/x".to_string(),
            ..Default::default()
        };
        assert!(hook.validate().is_ok());

        let conflicting = SlackReceiver {
            channel_id: "C123".to_string(),
            ..hook.clone()
        };
        assert!(conflicting.validate().is_err());

        let api = SlackReceiver {
            oauth_token_data: "dG9rZW4=".to_string(),
            channel_id: "C123".to_string(),
            ..Default::default()
        };
        assert!(api.validate().is_ok());

        let two_tokens = SlackReceiver {
            oauth_token: "token".to_string(),
            ..api.clone()
        };
        assert!(two_tokens.validate().is_err());

        let no_channel = SlackReceiver {
            oauth_token: "token".to_string(),
            ..Default::default()
        };
        assert!(no_channel.validate().is_err());
    }

    #[tokio::test]
    async fn test_slack_token_sources() {
        let api = SlackReceiver {
            oauth_token_data: "dG9rZW4=".to_string(),
            channel_id: "C123".to_string(),
            ..Default::default()
        };
        let token = api.load_oauth_token().await.unwrap().unwrap();
        assert_eq!(token.expose_secret(), "token");

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token");
        std::fs::write(&path, "file-token\n").unwrap();
        let from_file = SlackReceiver {
            oauth_token_file: path.display().to_string(),
            channel_id: "C123".to_string(),
            ..Default::default()
        };
        let token = from_file.load_oauth_token().await.unwrap().unwrap();
        assert_eq!(token.expose_secret(), "file-token");
    }

    #[test]
    fn test_format_slack_group() {
        assert_eq!(format_slack_group("S123"), "<!subteam^S123>");
        assert_eq!(format_slack_group("<!subteam^S123>"), "<!subteam^S123>");
    }
}
