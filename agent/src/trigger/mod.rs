//! Deployment trigger
//!
//! Watches the repositories of the applications assigned to this piped and
//! creates a deployment whenever a new commit touches an application.

pub mod deployment;
pub mod determiner;

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use piped_model::notification::{DeploymentEventData, TriggerFailedEventData};
use piped_model::{Application, NotificationEvent, NotificationEventMetadata, NotificationEventType};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::commit::TriggeredCommitCache;
use crate::config::application::ApplicationConfig;
use crate::config::piped::{PipedRepository, PipedSpec};
use crate::errors::AgentError;
use crate::filesys::dir::Dir;
use crate::git::GitClient;
use crate::http::pipedservice::PipedService;
use crate::notifier::Notifier;
use crate::utils::now_unix;

/// Trigger options
#[derive(Debug, Clone)]
pub struct Options {
    /// How often repositories are checked for new commits
    pub sync_interval: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_secs(60),
        }
    }
}

pub struct Trigger {
    api: Arc<dyn PipedService>,
    git: Arc<dyn GitClient>,
    piped: Arc<PipedSpec>,
    notifier: Arc<Notifier>,
    cache: TriggeredCommitCache,
    /// Parent of the per-repository checkouts
    working_dir: Dir,
    options: Options,
}

impl Trigger {
    pub fn new(
        api: Arc<dyn PipedService>,
        git: Arc<dyn GitClient>,
        piped: Arc<PipedSpec>,
        notifier: Arc<Notifier>,
        working_dir: Dir,
        options: Options,
    ) -> Self {
        Self {
            api,
            git,
            piped,
            notifier,
            cache: TriggeredCommitCache::new(),
            working_dir,
            options,
        }
    }

    pub async fn run(&self, cancel: CancellationToken) -> Result<(), AgentError> {
        info!("Deployment trigger starting...");
        let mut ticker = tokio::time::interval(self.options.sync_interval);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.check(&cancel).await,
            }
        }

        if let Err(e) = self.working_dir.delete().await {
            warn!("failed to remove trigger checkouts: {}", e);
        }
        info!("Deployment trigger stopped");
        Ok(())
    }

    /// One pass over every repository that has applications assigned.
    pub(crate) async fn check(&self, cancel: &CancellationToken) {
        let applications = match self.api.list_applications().await {
            Ok(applications) => applications,
            Err(e) => {
                warn!("failed to list applications: {}", e);
                return;
            }
        };

        let assigned: HashSet<&str> = applications.iter().map(|a| a.id.as_str()).collect();
        self.cache.retain(&assigned);

        let mut groups: BTreeMap<&str, Vec<&Application>> = BTreeMap::new();
        for app in applications.iter().filter(|a| !a.disabled) {
            groups.entry(app.git_path.repo_id.as_str()).or_default().push(app);
        }

        for (repo_id, apps) in groups {
            if cancel.is_cancelled() {
                return;
            }
            let Some(repo) = self.piped.repository(repo_id) else {
                warn!(repo_id = %repo_id, "repository is not configured in this piped, skipping its applications");
                continue;
            };
            if let Err(e) = self.check_repository(repo, &apps).await {
                warn!(repo_id = %repo_id, "failed to check repository: {}", e);
            }
        }
    }

    async fn check_repository(&self, repo: &PipedRepository, apps: &[&Application]) -> Result<(), AgentError> {
        let head = self.git.latest_remote_hash(&repo.remote, &repo.branch).await?;

        let mut candidates = Vec::with_capacity(apps.len());
        for app in apps {
            match self.last_triggered(&app.id).await {
                Ok(last) if last.as_deref() == Some(head.as_str()) => {
                    debug!(application_id = %app.id, "no new commit to deploy at {}", head);
                }
                Ok(last) => candidates.push((*app, last)),
                Err(e) => warn!(application_id = %app.id, "failed to get the last triggered commit: {}", e),
            }
        }
        if candidates.is_empty() {
            return Ok(());
        }

        let repo_dir = self.working_dir.subdir(&repo.repo_id);
        self.git.clone_read_only(repo, &head, repo_dir.path()).await?;

        for (app, last) in candidates {
            if let Err(e) = self.check_application(app, repo_dir.path(), &head, last.as_deref()).await {
                error!(application_id = %app.id, "failed to trigger a deployment: {}", e);
                self.notify_trigger_failed(app, &head, &e.to_string());
            }
        }
        Ok(())
    }

    /// Hash of the last commit deployed for the application, if any.
    async fn last_triggered(&self, application_id: &str) -> Result<Option<String>, AgentError> {
        if let Some(hash) = self.cache.get(application_id) {
            return Ok(Some(hash));
        }
        let hash = self
            .api
            .get_application_most_recent_deployment(application_id)
            .await?
            .map(|d| d.commit_hash().to_string())
            .filter(|h| !h.is_empty());
        if let Some(hash) = &hash {
            self.cache.put(application_id, hash);
        }
        Ok(hash)
    }

    async fn check_application(
        &self,
        app: &Application,
        repo_dir: &Path,
        head: &str,
        last: Option<&str>,
    ) -> Result<(), AgentError> {
        let config = ApplicationConfig::load(repo_dir, &app.git_path.config_file_path()).await?;
        config.ensure_kind(app.kind)?;

        let on_commit = &config.spec.trigger.on_commit;
        if on_commit.disabled {
            info!(application_id = %app.id, "commit trigger is disabled, skipping {}", head);
            self.cache.put(&app.id, head);
            return Ok(());
        }

        if let Some(last) = last {
            let changed = self.git.changed_files(repo_dir, last, head).await?;
            if !determiner::is_touched(&app.git_path.path, &on_commit.paths, &on_commit.ignores, &changed)? {
                info!(application_id = %app.id, "application was not touched by commits since {}", last);
                self.cache.put(&app.id, head);
                return Ok(());
            }
        }

        let commit = self.git.commit(repo_dir, head).await?;
        let deployment = deployment::build_deployment(app, &config.spec, commit, "", now_unix())?;
        info!(
            application_id = %app.id,
            deployment_id = %deployment.id,
            "triggering deployment at commit {}", head
        );
        self.api.create_deployment(&deployment).await?;
        self.cache.put(&app.id, head);

        let event = NotificationEventType::DeploymentTriggered;
        let (accounts, groups) = config
            .spec
            .notification
            .as_ref()
            .map(|n| (n.find_accounts(event), n.find_groups(event)))
            .unwrap_or_default();
        self.notifier.notify(NotificationEvent::new(
            event,
            NotificationEventMetadata::Deployment(DeploymentEventData {
                summary: format!("New deployment for {} was triggered", app.name),
                deployment,
                reason: String::new(),
                mentioned_accounts: accounts,
                mentioned_groups: groups,
            }),
        ));
        Ok(())
    }

    fn notify_trigger_failed(&self, app: &Application, head: &str, reason: &str) {
        self.notifier.notify(NotificationEvent::new(
            NotificationEventType::DeploymentTriggerFailed,
            NotificationEventMetadata::TriggerFailed(TriggerFailedEventData {
                application: app.clone(),
                commit_hash: head.to_string(),
                commit_message: String::new(),
                reason: reason.to_string(),
                mentioned_accounts: Vec::new(),
                mentioned_groups: Vec::new(),
            }),
        ));
    }
}
