//! Application state management

use std::sync::Arc;

use tracing::info;

use crate::app::options::AppOptions;
use crate::commandstore::CommandStore;
use crate::config::piped::{PipedConfig, PipedSpec};
use crate::controller::{self, Controller};
use crate::errors::AgentError;
use crate::executor::Registry;
use crate::git::{GitCli, GitClient};
use crate::http::client::HttpClient;
use crate::http::pipedservice::PipedService;
use crate::logpersister::Persister;
use crate::notifier::Notifier;
use crate::storage::layout::StorageLayout;
use crate::trigger::{self, Trigger};

/// Every long-running component of the piped, wired together
pub struct AppState {
    /// Parsed and validated piped configuration
    pub piped: Arc<PipedSpec>,

    pub layout: StorageLayout,

    pub notifier: Arc<Notifier>,

    pub command_store: Arc<CommandStore>,

    pub trigger: Arc<Trigger>,

    pub controller: Arc<Controller>,
}

impl AppState {
    pub async fn init(agent_version: &str, options: &AppOptions) -> Result<Self, AgentError> {
        let piped = Arc::new(PipedConfig::load(&options.config_file).await?);
        info!(
            project_id = %piped.project_id,
            piped_id = %piped.piped_id,
            "Loaded piped configuration from {}",
            options.config_file.display()
        );

        let layout = piped
            .working_dir
            .as_ref()
            .map(StorageLayout::new)
            .unwrap_or_default();
        layout.setup().await?;

        let piped_key = piped.load_piped_key().await?;
        let api: Arc<dyn PipedService> = Arc::new(
            HttpClient::new(&piped.api_url(), &piped.project_id, &piped.piped_id, piped_key).await?,
        );
        let git: Arc<dyn GitClient> = Arc::new(GitCli::new(&options.git_binary));

        let notifier = Arc::new(Notifier::new(&piped, agent_version, options.notifier.clone()).await?);
        let command_store = Arc::new(CommandStore::new(api.clone(), options.command_store.clone()));
        let log_persister = Arc::new(Persister::new(api.clone(), options.log_persister.clone()));

        let components = controller::Components {
            api: api.clone(),
            git: git.clone(),
            registry: Arc::new(Registry::default_registry()),
            log_persister,
            command_store: command_store.clone(),
            notifier: notifier.clone(),
            piped: piped.clone(),
        };
        let controller = Arc::new(Controller::new(
            components,
            layout.deployments_dir(),
            options.controller.clone(),
        ));

        let trigger = Arc::new(Trigger::new(
            api,
            git,
            piped.clone(),
            notifier.clone(),
            layout.trigger_dir(),
            trigger::Options {
                sync_interval: piped.sync_interval,
            },
        ));

        Ok(Self {
            piped,
            layout,
            notifier,
            command_store,
            trigger,
            controller,
        })
    }
}
