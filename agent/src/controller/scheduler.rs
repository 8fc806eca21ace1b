//! Per-deployment pipeline driver
//!
//! A scheduler owns one deployment from the moment the controller picks it up
//! until its final status is reported. Stages run one at a time in index
//! order. When the agent shuts down mid-stage nothing terminal is reported so
//! the next agent resumes the deployment where this one stopped.

use std::collections::HashMap;
use std::convert::Infallible;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use piped_model::notification::DeploymentEventData;
use piped_model::{
    CommandStatus, Deployment, DeploymentStatus, NotificationEvent, NotificationEventMetadata,
    NotificationEventType, PipelineStage, StageStatus,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::commandstore::CommandStore;
use crate::config::application::{ApplicationConfig, ApplicationSpec};
use crate::config::piped::PipedSpec;
use crate::errors::AgentError;
use crate::executor::{self, rollback, Input, Registry};
use crate::filesys::dir::Dir;
use crate::git::GitClient;
use crate::http::pipedservice::PipedService;
use crate::logpersister::Persister;
use crate::metadatastore::MetadataStore;
use crate::notifier::Notifier;
use crate::utils::{calc_exp_backoff, format_duration, now_unix, CooldownOptions};

/// Scheduler options
#[derive(Debug, Clone)]
pub struct Options {
    /// Applied to stages that do not declare a timeout
    pub default_stage_timeout: Duration,

    /// How often the command store is checked for a cancel command
    pub cancel_check_interval: Duration,

    /// How long a finished stage waits for its logs to be delivered
    pub log_complete_timeout: Duration,

    /// Attempts per status report before giving up
    pub report_attempts: u32,

    /// Backoff between report attempts
    pub report_cooldown: CooldownOptions,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            default_stage_timeout: Duration::from_secs(6 * 3600),
            cancel_check_interval: Duration::from_secs(5),
            log_complete_timeout: Duration::from_secs(30),
            report_attempts: 10,
            report_cooldown: CooldownOptions::default(),
        }
    }
}

/// Long-lived collaborators every scheduler of a controller shares
#[derive(Clone)]
pub struct Components {
    pub api: Arc<dyn PipedService>,
    pub git: Arc<dyn GitClient>,
    pub registry: Arc<Registry>,
    pub log_persister: Arc<Persister>,
    pub command_store: Arc<CommandStore>,
    pub notifier: Arc<Notifier>,
    pub piped: Arc<PipedSpec>,
}

/// What preparation produced for the stages to use
struct Prepared {
    application: Arc<ApplicationSpec>,
    repo_dir: PathBuf,
    app_dir: PathBuf,
}

enum StageOutcome {
    Finished(StageStatus),
    /// The agent is shutting down; the stage stays non-terminal.
    Interrupted,
}

enum PipelineOutcome {
    Completed(DeploymentStatus, String),
    Interrupted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stop {
    Shutdown,
    CancelCommand,
    Timeout,
}

pub struct Scheduler {
    deployment: Deployment,
    working_dir: Dir,
    components: Components,
    options: Options,
    done: AtomicBool,
    /// Account that sent the cancel command, once one arrived
    canceller: Mutex<Option<String>>,
}

impl Scheduler {
    pub fn new(deployment: Deployment, working_dir: Dir, components: Components, options: Options) -> Self {
        Self {
            deployment,
            working_dir,
            components,
            options,
            done: AtomicBool::new(false),
            canceller: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.deployment.id
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    pub async fn run(&self, cancel: CancellationToken) -> Result<(), AgentError> {
        let span = info_span!(
            "scheduler",
            deployment_id = %self.deployment.id,
            application_id = %self.deployment.application_id
        );
        let result = self.run_deployment(cancel).instrument(span).await;
        self.done.store(true, Ordering::SeqCst);
        result
    }

    async fn run_deployment(&self, cancel: CancellationToken) -> Result<(), AgentError> {
        if self.deployment.is_completed() {
            debug!("deployment is already completed");
            return Ok(());
        }
        info!("Scheduler starting...");

        let mut state = self.deployment.clone();
        let metadata_store = Arc::new(MetadataStore::new(self.components.api.clone(), &state));

        let prepared = match self.prepare(&state).await {
            Ok(prepared) => prepared,
            Err(e) => {
                error!("failed to prepare the deployment: {}", e);
                let reason = format!("Failed to prepare the deployment: {}", e);
                self.finalize(&mut state, DeploymentStatus::Failure, &reason, &metadata_store, &cancel)
                    .await;
                self.cleanup().await;
                return Ok(());
            }
        };

        self.report_progress(&mut state, &metadata_store, &cancel).await;

        let cancel_requested = CancellationToken::new();
        let outcome = tokio::select! {
            outcome = self.run_pipeline(&mut state, &prepared, &metadata_store, &cancel, &cancel_requested) => outcome,
            never = self.watch_cancel_command(&cancel_requested) => match never {},
        };

        match outcome {
            PipelineOutcome::Interrupted => {
                info!("Scheduler stopped by shutdown, the deployment resumes on the next start");
            }
            PipelineOutcome::Completed(status, reason) => {
                self.finalize(&mut state, status, &reason, &metadata_store, &cancel).await;
                self.cleanup().await;
                info!("Scheduler finished with {}", status);
            }
        }
        Ok(())
    }

    /// Check out the deployed commit and load the application configuration.
    async fn prepare(&self, state: &Deployment) -> Result<Prepared, AgentError> {
        let repo = self
            .components
            .piped
            .repository(&state.git_path.repo_id)
            .ok_or_else(|| {
                AgentError::ConfigError(format!(
                    "repository {} is not configured in this piped",
                    state.git_path.repo_id
                ))
            })?;

        let repo_dir = self.working_dir.subdir("repo");
        self.components
            .git
            .clone_read_only(repo, state.commit_hash(), repo_dir.path())
            .await?;

        let config = ApplicationConfig::load(repo_dir.path(), &state.git_path.config_file_path()).await?;
        if let Some(kind) = state.kind {
            config.ensure_kind(kind)?;
        }

        let app_dir = repo_dir.path().join(state.git_path.path.trim_matches('/'));
        Ok(Prepared {
            application: Arc::new(config.spec),
            repo_dir: repo_dir.path().to_path_buf(),
            app_dir,
        })
    }

    /// Move a fresh deployment through PLANNED to RUNNING.
    async fn report_progress(
        &self,
        state: &mut Deployment,
        metadata_store: &MetadataStore,
        cancel: &CancellationToken,
    ) {
        if matches!(state.status, DeploymentStatus::NotStarted | DeploymentStatus::Pending) {
            self.report_deployment_status(state, DeploymentStatus::Planned, "", cancel).await;
            let summary = format!(
                "Deployment of {} was planned with {} stages",
                state.application_name,
                state.stages.iter().filter(|s| !s.rollback).count()
            );
            self.notify(state, NotificationEventType::DeploymentPlanned, &summary, "", metadata_store);
        }
        if state.status == DeploymentStatus::Planned {
            self.report_deployment_status(state, DeploymentStatus::Running, "", cancel).await;
        }
    }

    async fn run_pipeline(
        &self,
        state: &mut Deployment,
        prepared: &Prepared,
        metadata_store: &Arc<MetadataStore>,
        cancel: &CancellationToken,
        cancel_requested: &CancellationToken,
    ) -> PipelineOutcome {
        let (status, reason) = if state.status == DeploymentStatus::RollingBack {
            // Restarted while rolling back: the pipeline already failed.
            (DeploymentStatus::Failure, state.status_reason.clone())
        } else {
            loop {
                if cancel_requested.is_cancelled() {
                    break (DeploymentStatus::Cancelled, self.cancelled_reason());
                }
                if cancel.is_cancelled() {
                    return PipelineOutcome::Interrupted;
                }
                let Some(idx) = state.next_stage() else {
                    break (DeploymentStatus::Success, "All stages finished successfully".to_string());
                };

                let outcome = self
                    .execute_stage(state, idx, prepared, metadata_store, cancel, cancel_requested)
                    .await;
                let stage = &state.stages[idx];
                match outcome {
                    StageOutcome::Interrupted => return PipelineOutcome::Interrupted,
                    StageOutcome::Finished(s) if s.is_successful() => continue,
                    StageOutcome::Finished(StageStatus::Cancelled) => {
                        break (DeploymentStatus::Cancelled, self.cancelled_reason())
                    }
                    StageOutcome::Finished(_) => {
                        break (
                            DeploymentStatus::Failure,
                            format!("Stage {} ({}) failed", stage.name, stage.id),
                        )
                    }
                }
            }
        };

        if status == DeploymentStatus::Failure && prepared.application.planner.auto_rollback {
            let rollback_status = self
                .roll_back(state, &reason, prepared, metadata_store, cancel)
                .await;
            if let StageOutcome::Interrupted = rollback_status {
                return PipelineOutcome::Interrupted;
            }
        }
        PipelineOutcome::Completed(status, reason)
    }

    async fn roll_back(
        &self,
        state: &mut Deployment,
        reason: &str,
        prepared: &Prepared,
        metadata_store: &Arc<MetadataStore>,
        cancel: &CancellationToken,
    ) -> StageOutcome {
        let idx = match state.stages.iter().position(|s| s.rollback) {
            Some(idx) => idx,
            None => {
                let index = state.stages.iter().map(|s| s.index + 1).max().unwrap_or_default();
                state.stages.push(PipelineStage {
                    id: "rollback".to_string(),
                    name: rollback::STAGE_NAME.to_string(),
                    desc: "Rollback the deployment".to_string(),
                    index,
                    rollback: true,
                    created_at: now_unix(),
                    updated_at: now_unix(),
                    ..Default::default()
                });
                state.stages.len() - 1
            }
        };
        if state.stages[idx].status.is_completed() {
            return StageOutcome::Finished(state.stages[idx].status);
        }

        if state.status != DeploymentStatus::RollingBack {
            self.report_deployment_status(state, DeploymentStatus::RollingBack, reason, cancel)
                .await;
            self.notify(
                state,
                NotificationEventType::DeploymentRollingBack,
                "Rolling back the deployment",
                reason,
                metadata_store,
            );
        }

        // Cancel commands do not interrupt a rollback.
        let never_cancelled = CancellationToken::new();
        let outcome = self
            .execute_stage(state, idx, prepared, metadata_store, cancel, &never_cancelled)
            .await;
        if let StageOutcome::Finished(status) = outcome {
            if !status.is_successful() {
                warn!("rollback stage finished with {}", status);
            }
        }
        outcome
    }

    async fn execute_stage(
        &self,
        state: &mut Deployment,
        idx: usize,
        prepared: &Prepared,
        metadata_store: &Arc<MetadataStore>,
        cancel: &CancellationToken,
        cancel_requested: &CancellationToken,
    ) -> StageOutcome {
        let stage_id = state.stages[idx].id.clone();
        let stage_name = state.stages[idx].name.clone();
        let lp = self.components.log_persister.stage_persister(&state.id, &stage_id);

        if state.stages[idx].status == StageStatus::NotStarted {
            self.report_stage_status(state, idx, StageStatus::Running, "", cancel).await;
        }
        info!(stage_id = %stage_id, stage_name = %stage_name, "executing stage");

        let span = info_span!("stage", stage_id = %stage_id, stage_name = %stage_name);
        let input = Input {
            stage: state.stages[idx].clone(),
            deployment: state.clone(),
            application: prepared.application.clone(),
            piped: self.components.piped.clone(),
            working_dir: self.working_dir.path().to_path_buf(),
            repo_dir: prepared.repo_dir.clone(),
            app_dir: prepared.app_dir.clone(),
            log_persister: lp.clone(),
            metadata_store: metadata_store.clone(),
            command_store: self.components.command_store.clone(),
            notifier: self.components.notifier.clone(),
            span: span.clone(),
        };
        let timeout = match state.stages[idx].timeout_seconds {
            0 => self.options.default_stage_timeout,
            secs => Duration::from_secs(secs),
        };

        let mut executor = self.components.registry.executor(input);
        let stage_cancel = CancellationToken::new();
        let mut stop = None;
        let returned = {
            let execution = executor.execute(stage_cancel.clone()).instrument(span);
            tokio::pin!(execution);
            let deadline = tokio::time::sleep(timeout);
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    status = &mut execution => break status,
                    _ = cancel.cancelled(), if stop.is_none() => {
                        stop = Some(Stop::Shutdown);
                        stage_cancel.cancel();
                    }
                    _ = cancel_requested.cancelled(), if stop.is_none() => {
                        stop = Some(Stop::CancelCommand);
                        stage_cancel.cancel();
                    }
                    _ = &mut deadline, if stop.is_none() => {
                        stop = Some(Stop::Timeout);
                        stage_cancel.cancel();
                    }
                }
            }
        };

        let (status, reason) = match stop {
            Some(Stop::Shutdown) => {
                info!(stage_id = %stage_id, "stage interrupted by shutdown");
                return StageOutcome::Interrupted;
            }
            Some(Stop::Timeout) => {
                lp.errorf(format_args!("Stage timed out after {}", format_duration(timeout)));
                (StageStatus::Failure, format!("Timed out after {}", format_duration(timeout)))
            }
            Some(Stop::CancelCommand) => (StageStatus::Cancelled, self.cancelled_reason()),
            None if returned.is_completed() => (returned, String::new()),
            None => {
                lp.errorf(format_args!("Stage finished with unexpected status {}", returned));
                (StageStatus::Failure, format!("Unexpected status {}", returned))
            }
        };

        self.report_stage_status(state, idx, status, &reason, cancel).await;
        if let Err(e) = lp.complete(self.options.log_complete_timeout).await {
            warn!(stage_id = %stage_id, "stage logs were not fully delivered: {}", e);
        }
        StageOutcome::Finished(status)
    }

    /// Poll for a cancel command and trip `cancel_requested` when one arrives.
    async fn watch_cancel_command(&self, cancel_requested: &CancellationToken) -> Infallible {
        let interval = self.options.cancel_check_interval;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        loop {
            ticker.tick().await;
            let commands = self
                .components
                .command_store
                .list_deployment_commands(&self.deployment.id);
            let Some(command) = commands.into_iter().next() else {
                continue;
            };

            info!(commander = %command.commander, "received a cancel command");
            *self.canceller.lock().unwrap_or_else(|e| e.into_inner()) = Some(command.commander.clone());
            if let Err(e) = self
                .components
                .command_store
                .report_handled(&command, CommandStatus::Succeeded, HashMap::new())
                .await
            {
                warn!(command_id = %command.id, "failed to report handled command: {}", e);
            }
            cancel_requested.cancel();
            break;
        }
        futures::future::pending().await
    }

    fn cancelled_reason(&self) -> String {
        match self.canceller.lock().unwrap_or_else(|e| e.into_inner()).as_deref() {
            Some(commander) => format!("Cancelled by {}", commander),
            None => "Cancelled".to_string(),
        }
    }

    async fn finalize(
        &self,
        state: &mut Deployment,
        status: DeploymentStatus,
        reason: &str,
        metadata_store: &MetadataStore,
        cancel: &CancellationToken,
    ) {
        let stage_statuses = state.stage_statuses();
        let api = &self.components.api;
        let deployment_id = state.id.as_str();
        let stage_statuses = &stage_statuses;
        let reported = self
            .with_retry("report deployment completed", cancel, move || {
                api.report_deployment_completed(deployment_id, status, reason, stage_statuses)
            })
            .await;
        if let Err(e) = reported {
            error!("failed to report the deployment completion: {}", e);
        }

        state.status = status;
        state.status_reason = reason.to_string();
        state.completed_at = now_unix();

        let (event_type, event_reason) = match status {
            DeploymentStatus::Success => (NotificationEventType::DeploymentSucceeded, String::new()),
            DeploymentStatus::Cancelled => (
                NotificationEventType::DeploymentCancelled,
                self.canceller
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .clone()
                    .unwrap_or_default(),
            ),
            _ => (NotificationEventType::DeploymentFailed, reason.to_string()),
        };
        self.notify(state, event_type, reason, &event_reason, metadata_store);
    }

    async fn cleanup(&self) {
        if let Err(e) = self.working_dir.delete().await {
            warn!("failed to remove the working directory: {}", e);
        }
    }

    async fn report_deployment_status(
        &self,
        state: &mut Deployment,
        status: DeploymentStatus,
        reason: &str,
        cancel: &CancellationToken,
    ) {
        if !state.status.can_update_to(status) {
            return;
        }
        let api = &self.components.api;
        let deployment_id = state.id.as_str();
        let reported = self
            .with_retry("report deployment status", cancel, move || {
                api.report_deployment_status_changed(deployment_id, status, reason)
            })
            .await;
        if let Err(e) = reported {
            warn!("failed to report deployment status {}: {}", status, e);
        }
        state.status = status;
        state.status_reason = reason.to_string();
    }

    async fn report_stage_status(
        &self,
        state: &mut Deployment,
        idx: usize,
        status: StageStatus,
        reason: &str,
        cancel: &CancellationToken,
    ) {
        let current = state.stages[idx].status;
        if current != status && !current.can_update_to(status) {
            return;
        }
        let api = &self.components.api;
        let deployment_id = state.id.as_str();
        let stage_id = state.stages[idx].id.as_str();
        let reported = self
            .with_retry("report stage status", cancel, move || {
                api.report_stage_status_changed(deployment_id, stage_id, status, reason)
            })
            .await;
        if let Err(e) = reported {
            warn!(stage_id = %stage_id, "failed to report stage status {}: {}", status, e);
        }

        let stage = &mut state.stages[idx];
        stage.status = status;
        stage.status_reason = reason.to_string();
        stage.updated_at = now_unix();
    }

    /// Retry `call` with backoff. Shutdown stops the retries.
    async fn with_retry<F, Fut>(
        &self,
        what: &str,
        cancel: &CancellationToken,
        mut call: F,
    ) -> Result<(), AgentError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), AgentError>>,
    {
        let mut attempt = 0;
        loop {
            match call().await {
                Ok(()) => return Ok(()),
                Err(e) if attempt + 1 >= self.options.report_attempts => return Err(e),
                Err(e) => {
                    let delay = calc_exp_backoff(&self.options.report_cooldown, attempt);
                    warn!("failed to {} (attempt {}): {}, retrying in {:?}", what, attempt + 1, e, delay);
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            warn!("stopped retrying to {} on shutdown", what);
                            return Err(e);
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
            }
        }
    }

    fn notify(
        &self,
        state: &Deployment,
        event_type: NotificationEventType,
        summary: &str,
        reason: &str,
        metadata_store: &MetadataStore,
    ) {
        let (accounts, groups) = executor::mentions(metadata_store, event_type);
        self.components.notifier.notify(NotificationEvent::new(
            event_type,
            NotificationEventMetadata::Deployment(DeploymentEventData {
                deployment: state.clone(),
                summary: summary.to_string(),
                reason: reason.to_string(),
                mentioned_accounts: accounts,
                mentioned_groups: groups,
            }),
        ));
    }
}
