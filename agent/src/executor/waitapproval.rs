//! WAIT_APPROVAL stage: block until enough people approve through the console

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use piped_model::notification::DeploymentEventData;
use piped_model::{
    Command, CommandStatus, NotificationEvent, NotificationEventMetadata, NotificationEventType, StageStatus,
};
use serde::Deserialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::error;

use super::{Executor, Input};
use crate::utils::format_duration;

pub const STAGE_NAME: &str = "WAIT_APPROVAL";

const APPROVED_BY_KEY: &str = "ApprovedBy";
const MIN_APPROVER_NUM_KEY: &str = "MinApproverNum";
const CURRENT_APPROVERS_KEY: &str = "CurrentApprovers";

const CHECK_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitApprovalStageOptions {
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Accounts allowed to approve, anyone when empty
    #[serde(default)]
    pub approvers: Vec<String>,

    #[serde(default = "default_min_approver_num")]
    pub min_approver_num: usize,
}

fn default_timeout() -> Duration {
    Duration::from_secs(6 * 3600)
}

fn default_min_approver_num() -> usize {
    1
}

impl Default for WaitApprovalStageOptions {
    fn default() -> Self {
        Self {
            timeout: default_timeout(),
            approvers: Vec::new(),
            min_approver_num: default_min_approver_num(),
        }
    }
}

pub struct WaitApprovalExecutor {
    input: Input,
}

impl WaitApprovalExecutor {
    pub fn new(input: Input) -> Self {
        Self { input }
    }

    fn current_approvers(&self) -> Vec<String> {
        self.input
            .metadata_store
            .stage_get(&self.input.stage.id, CURRENT_APPROVERS_KEY)
            .map(|v| v.split(',').filter(|a| !a.is_empty()).map(str::to_string).collect())
            .unwrap_or_default()
    }

    /// Walk pending approvals. Returns the approver list once enough were collected.
    async fn check_approvals(&self, options: &WaitApprovalStageOptions) -> Option<String> {
        let lp = &self.input.log_persister;
        let commands = self
            .input
            .command_store
            .list_stage_commands(&self.input.deployment.id, &self.input.stage.id);

        for command in commands {
            let commander = command.commander.clone();
            if !options.approvers.is_empty() && !options.approvers.contains(&commander) {
                lp.errorf(format_args!("{} is not allowed to approve this stage", commander));
                self.report_handled(&command, CommandStatus::Failed).await;
                continue;
            }

            let mut approvers = self.current_approvers();
            if approvers.contains(&commander) {
                let needed = options.min_approver_num.saturating_sub(approvers.len());
                lp.errorf(format_args!(
                    "{} has already approved. {} more approvals are needed",
                    commander, needed
                ));
                self.report_handled(&command, CommandStatus::Succeeded).await;
                continue;
            }

            approvers.push(commander.clone());
            let joined = approvers.join(",");
            let needed = options.min_approver_num.saturating_sub(approvers.len());
            let mut metadata = HashMap::from([(CURRENT_APPROVERS_KEY.to_string(), joined.clone())]);
            if needed == 0 {
                metadata.insert(APPROVED_BY_KEY.to_string(), joined.clone());
            }
            if let Err(e) = self
                .input
                .metadata_store
                .stage_put_multi(&self.input.stage.id, metadata)
                .await
            {
                lp.errorf(format_args!("Unable to save approver information: {}", e));
                return None;
            }
            self.report_handled(&command, CommandStatus::Succeeded).await;
            lp.infof(format_args!("Got an approval from {}", commander));

            if needed == 0 {
                return Some(joined);
            }
            lp.infof(format_args!("{} more approvals are needed", needed));
        }
        None
    }

    async fn report_handled(&self, command: &Command, status: CommandStatus) {
        if let Err(e) = self
            .input
            .command_store
            .report_handled(command, status, HashMap::new())
            .await
        {
            error!(command_id = %command.id, "failed to report handled command: {}", e);
        }
    }

    fn notify(&self, event_type: NotificationEventType, reason: &str) {
        let (accounts, groups) = self.input.mentions(event_type);
        self.input.notifier.notify(NotificationEvent::new(
            event_type,
            NotificationEventMetadata::Deployment(DeploymentEventData {
                deployment: self.input.deployment.clone(),
                summary: String::new(),
                reason: reason.to_string(),
                mentioned_accounts: accounts,
                mentioned_groups: groups,
            }),
        ));
    }
}

#[async_trait]
impl Executor for WaitApprovalExecutor {
    async fn execute(&mut self, cancel: CancellationToken) -> StageStatus {
        let lp = self.input.log_persister.clone();
        let options: WaitApprovalStageOptions = match self.input.stage_options() {
            Ok(options) => options,
            Err(e) => {
                lp.error(e.to_string());
                return StageStatus::Failure;
            }
        };

        if let Err(e) = self
            .input
            .metadata_store
            .stage_put(
                &self.input.stage.id,
                MIN_APPROVER_NUM_KEY,
                &options.min_approver_num.to_string(),
            )
            .await
        {
            lp.errorf(format_args!("Unable to save the number of required approvers: {}", e));
        }

        self.notify(NotificationEventType::DeploymentWaitApproval, "");
        lp.info("Waiting for an approval...");

        let timer = tokio::time::sleep(options.timeout);
        tokio::pin!(timer);
        let mut ticker = tokio::time::interval_at(Instant::now() + CHECK_INTERVAL, CHECK_INTERVAL);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    lp.info("Waiting for approval was cancelled");
                    return StageStatus::Cancelled;
                }
                _ = &mut timer => {
                    lp.errorf(format_args!("Timed out {}", format_duration(options.timeout)));
                    return StageStatus::Failure;
                }
                _ = ticker.tick() => {
                    if let Some(approvers) = self.check_approvals(&options).await {
                        self.notify(NotificationEventType::DeploymentApproved, &approvers);
                        return StageStatus::Success;
                    }
                }
            }
        }
    }
}
