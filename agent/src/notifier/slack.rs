//! Slack receiver

use std::time::Duration;

use async_trait::async_trait;
use piped_model::notification::{DeploymentEventData, PipedEventData, TriggerFailedEventData};
use piped_model::{NotificationEvent, NotificationEventMetadata, NotificationEventType};
use reqwest::{header, Client};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use tracing::{error, info};

use crate::config::piped::{format_slack_group, SlackReceiver};
use crate::errors::AgentError;
use crate::notifier::{EventQueue, Sender};

const USERNAME: &str = "PipeCD";
const INFO_COLOR: &str = "#222429";
const SUCCESS_COLOR: &str = "#629650";
const ERROR_COLOR: &str = "#9C3C31";
const WARN_COLOR: &str = "#C1A337";

const QUEUE_CAPACITY: usize = 100;
const DEFAULT_API_URL: &str = "https://slack.com/api/chat.postMessage";

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SlackMessage {
    pub username: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<SlackAttachment>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SlackAttachment {
    pub title: String,
    pub title_link: String,
    pub text: String,
    pub fields: Vec<SlackField>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub color: String,
    #[serde(rename = "mrkdwn_in")]
    pub markdown_in: Vec<String>,
    pub ts: i64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SlackField {
    pub title: String,
    pub value: String,
    pub short: bool,
}

fn field(title: &str, value: impl Into<String>) -> SlackField {
    SlackField {
        title: title.to_string(),
        value: value.into(),
        short: true,
    }
}

fn slack_link(title: &str, url: &str) -> String {
    format!("<{}|{}>", url, title)
}

fn slack_date(unix: i64) -> String {
    format!("<!date^{}^{{date_num}} {{time_secs}}|date>", unix)
}

fn truncate(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((end, _)) => format!("{}...", &text[..end]),
        None => text.to_string(),
    }
}

fn accounts_text(accounts: &[String]) -> String {
    accounts
        .iter()
        .map(|a| format!("<@{}>", a.trim_start_matches('@')))
        .collect::<Vec<_>>()
        .join(" ")
}

fn groups_text(groups: &[String]) -> String {
    groups
        .iter()
        .map(|g| format_slack_group(g.trim_start_matches('@')))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Sends events to a Slack incoming webhook or to `chat.postMessage`
pub struct SlackSender {
    name: String,
    config: SlackReceiver,
    web_url: String,
    oauth_token: Option<SecretString>,
    api_url: String,
    client: Client,
    queue: EventQueue,
}

impl SlackSender {
    pub async fn new(name: &str, config: &SlackReceiver, web_url: &str) -> Result<Self, AgentError> {
        let oauth_token = config.load_oauth_token().await?;
        let client = Client::builder().timeout(Duration::from_secs(5)).build()?;
        Ok(Self {
            name: name.to_string(),
            config: config.clone(),
            web_url: web_url.trim_end_matches('/').to_string(),
            oauth_token,
            api_url: DEFAULT_API_URL.to_string(),
            client,
            queue: EventQueue::new(QUEUE_CAPACITY),
        })
    }

    /// Point API deliveries somewhere other than slack.com
    pub fn with_api_url(mut self, api_url: &str) -> Self {
        self.api_url = api_url.to_string();
        self
    }

    /// Render an event. Events without a Slack rendering yield `None`.
    pub fn build_message(&self, event: &NotificationEvent, now: i64) -> Option<SlackMessage> {
        let accounts = self.merged(event.metadata.mentioned_accounts(), &self.config.mentioned_accounts);
        let groups = self.merged(event.metadata.mentioned_groups(), &self.config.mentioned_groups);
        let (accounts, groups) = (accounts_text(&accounts), groups_text(&groups));

        let (title, link, text, color, fields) = match (&event.event_type, &event.metadata) {
            (event_type, NotificationEventMetadata::Deployment(md)) => {
                let app = &md.deployment.application_name;
                let (title, text, color) = match event_type {
                    NotificationEventType::DeploymentTriggered => {
                        (format!("Triggered a new deployment for {:?}", app), String::new(), INFO_COLOR)
                    }
                    NotificationEventType::DeploymentPlanned => (
                        format!("Deployment for {:?} was planned", app),
                        md.summary.clone(),
                        INFO_COLOR,
                    ),
                    NotificationEventType::DeploymentWaitApproval => (
                        format!("Deployment for {:?} is waiting for an approval", app),
                        String::new(),
                        INFO_COLOR,
                    ),
                    NotificationEventType::DeploymentApproved => (
                        format!("Deployment for {:?} was approved", app),
                        format!("Approved by {}", md.reason),
                        INFO_COLOR,
                    ),
                    NotificationEventType::DeploymentRollingBack => (
                        format!("Deployment for {:?} is rolling back", app),
                        md.reason.clone(),
                        WARN_COLOR,
                    ),
                    NotificationEventType::DeploymentSucceeded => (
                        format!("Deployment for {:?} was completed successfully", app),
                        String::new(),
                        SUCCESS_COLOR,
                    ),
                    NotificationEventType::DeploymentFailed => (
                        format!("Deployment for {:?} was failed", app),
                        md.reason.clone(),
                        ERROR_COLOR,
                    ),
                    NotificationEventType::DeploymentCancelled => (
                        format!("Deployment for {:?} was cancelled", app),
                        format!("Cancelled by {}", md.reason),
                        WARN_COLOR,
                    ),
                    _ => return None,
                };
                let (link, fields) = self.deployment_fields(md, accounts, groups);
                (title, link, text, color, fields)
            }
            (NotificationEventType::DeploymentTriggerFailed, NotificationEventMetadata::TriggerFailed(md)) => {
                let (link, fields) = self.trigger_failed_fields(md, accounts, groups);
                (
                    format!("Failed to trigger a new deployment for {}", md.application.name),
                    link,
                    md.reason.clone(),
                    INFO_COLOR,
                    fields,
                )
            }
            (NotificationEventType::PipedStarted, NotificationEventMetadata::Piped(md)) => {
                let (link, fields) = self.piped_fields(md, accounts, groups);
                ("A piped has been started".to_string(), link, String::new(), INFO_COLOR, fields)
            }
            (NotificationEventType::PipedStopped, NotificationEventMetadata::Piped(md)) => {
                let (link, fields) = self.piped_fields(md, accounts, groups);
                ("A piped has been stopped".to_string(), link, String::new(), INFO_COLOR, fields)
            }
            _ => return None,
        };

        Some(SlackMessage {
            username: USERNAME.to_string(),
            channel: None,
            attachments: vec![SlackAttachment {
                title,
                title_link: link,
                text,
                fields,
                color: color.to_string(),
                markdown_in: vec!["text".to_string()],
                ts: now,
            }],
        })
    }

    fn merged(&self, from_event: &[String], from_receiver: &[String]) -> Vec<String> {
        from_event.iter().chain(from_receiver).cloned().collect()
    }

    fn deployment_fields(
        &self,
        md: &DeploymentEventData,
        accounts: String,
        groups: String,
    ) -> (String, Vec<SlackField>) {
        let d = &md.deployment;
        let link = format!("{}/deployments/{}?project={}", self.web_url, d.id, d.project_id);
        let app_link = format!(
            "{}/applications/{}?project={}",
            self.web_url, d.application_id, d.project_id
        );
        let kind = d.kind.map(|k| k.as_str().to_lowercase()).unwrap_or_default();
        let fields = vec![
            field("Project", truncate(&d.project_id, 8)),
            field("Application", slack_link(&d.application_name, &app_link)),
            field("Kind", kind),
            field("Deployment", slack_link(&truncate(&d.id, 8), &link)),
            field("Triggered By", d.triggered_by()),
            field("Mention To Users", accounts),
            field("Mention To Groups", groups),
            field("Started At", slack_date(d.created_at)),
        ];
        (link, fields)
    }

    fn trigger_failed_fields(
        &self,
        md: &TriggerFailedEventData,
        accounts: String,
        groups: String,
    ) -> (String, Vec<SlackField>) {
        let app = &md.application;
        let link = format!("{}/applications/{}?project={}", self.web_url, app.id, app.project_id);
        let mut fields = vec![
            field("Project", truncate(&app.project_id, 8)),
            field("Application", slack_link(&app.name, &link)),
            field("Kind", app.kind.as_str().to_lowercase()),
            field("Mention To Users", accounts),
            field("Mention To Groups", groups),
        ];
        if !md.commit_hash.is_empty() {
            fields.push(field("Commit", truncate(&md.commit_hash, 8)));
        }
        (link, fields)
    }

    fn piped_fields(&self, md: &PipedEventData, accounts: String, groups: String) -> (String, Vec<SlackField>) {
        let link = format!("{}/settings/piped?project={}", self.web_url, md.project_id);
        let fields = vec![
            field("Version", md.version.clone()),
            field("Project", truncate(&md.project_id, 8)),
            field("Id", md.id.clone()),
            field("Mention To Users", accounts),
            field("Mention To Groups", groups),
        ];
        (link, fields)
    }

    async fn post(&self, message: &SlackMessage) -> Result<(), AgentError> {
        let request = if !self.config.hook_url.is_empty() {
            self.client.post(&self.config.hook_url).json(message)
        } else if let Some(token) = &self.oauth_token {
            let message = SlackMessage {
                channel: Some(self.config.channel_id.clone()),
                ..message.clone()
            };
            self.client
                .post(&self.api_url)
                .header(header::AUTHORIZATION, format!("Bearer {}", token.expose_secret()))
                .json(&message)
        } else {
            return Ok(());
        };

        let response = request.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AgentError::NotificationError(format!(
                "{} from Slack: {}",
                status,
                body.trim()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Sender for SlackSender {
    fn name(&self) -> &str {
        &self.name
    }

    fn queue(&self) -> &EventQueue {
        &self.queue
    }

    async fn send(&self, event: &NotificationEvent) {
        let Some(message) = self.build_message(event, chrono::Utc::now().timestamp()) else {
            info!(receiver = %self.name, "ignore event {}", event.event_type);
            return;
        };
        if let Err(e) = self.post(&message).await {
            error!(receiver = %self.name, "unable to send notification to slack: {}", e);
        }
    }
}
