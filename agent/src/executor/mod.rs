//! Stage executors
//!
//! A scheduler hands every stage to the executor registered under the
//! stage name. Executors report their outcome as a `StageStatus` and never
//! return errors: whatever goes wrong is written to the stage log.

pub mod analysis;
pub mod customsync;
pub mod registry;
pub mod rollback;
pub mod wait;
pub mod waitapproval;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use piped_model::{Deployment, NotificationEventType, PipelineStage, StageStatus};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::commandstore::CommandStore;
use crate::config::application::{ApplicationSpec, DeploymentNotification};
use crate::config::piped::PipedSpec;
use crate::errors::AgentError;
use crate::logpersister::StageLogPersister;
use crate::metadatastore::MetadataStore;
use crate::notifier::Notifier;

pub use registry::Registry;

/// Deployment metadata key holding the mention settings of the application
pub const DEPLOYMENT_NOTIFICATION_KEY: &str = "DeploymentNotification";

#[async_trait]
pub trait Executor: Send {
    /// Run the stage until it finishes or `cancel` fires.
    async fn execute(&mut self, cancel: CancellationToken) -> StageStatus;
}

/// Everything a stage executor may read or write
#[derive(Clone)]
pub struct Input {
    pub stage: PipelineStage,
    pub deployment: Deployment,
    pub application: Arc<ApplicationSpec>,
    pub piped: Arc<PipedSpec>,
    pub working_dir: PathBuf,
    pub repo_dir: PathBuf,
    pub app_dir: PathBuf,
    pub log_persister: Arc<StageLogPersister>,
    pub metadata_store: Arc<MetadataStore>,
    pub command_store: Arc<CommandStore>,
    pub notifier: Arc<Notifier>,
    pub span: tracing::Span,
}

impl Input {
    /// Decode the `with` options of the stage. A missing block decodes as the default.
    pub fn stage_options<T: DeserializeOwned + Default>(&self) -> Result<T, AgentError> {
        if self.stage.config.is_null() {
            return Ok(T::default());
        }
        serde_json::from_value(self.stage.config.clone()).map_err(|e| {
            AgentError::ExecutorError(format!(
                "invalid options for stage {}: {}",
                self.stage.name, e
            ))
        })
    }

    /// Slack accounts and groups to mention for an event of this deployment
    pub fn mentions(&self, event: NotificationEventType) -> (Vec<String>, Vec<String>) {
        mentions(&self.metadata_store, event)
    }
}

pub fn mentions(store: &MetadataStore, event: NotificationEventType) -> (Vec<String>, Vec<String>) {
    let Some(raw) = store.deployment_get(DEPLOYMENT_NOTIFICATION_KEY) else {
        return (Vec::new(), Vec::new());
    };
    match serde_json::from_str::<DeploymentNotification>(&raw) {
        Ok(notification) => (notification.find_accounts(event), notification.find_groups(event)),
        Err(e) => {
            warn!("could not read mention settings from deployment metadata: {}", e);
            (Vec::new(), Vec::new())
        }
    }
}
