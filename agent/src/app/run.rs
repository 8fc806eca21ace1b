//! Main application run loop

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::app::options::AppOptions;
use crate::app::state::AppState;
use crate::errors::AgentError;

/// Run the piped until `shutdown_signal` resolves
pub async fn run(
    agent_version: String,
    options: AppOptions,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<(), AgentError> {
    info!("Initializing piped {}...", agent_version);

    let app_state = match AppState::init(&agent_version, &options).await {
        Ok(state) => Arc::new(state),
        Err(e) => {
            error!("Failed to start piped: {}", e);
            return Err(e);
        }
    };

    let mut shutdown_manager = ShutdownManager::new(options.shutdown_deadline());
    shutdown_manager.start(&app_state);

    shutdown_signal.await;
    info!("Shutdown signal received, shutting down...");
    shutdown_manager.shutdown().await
}

// ================================= SHUTDOWN ===================================== //

type WorkerHandle = JoinHandle<Result<(), AgentError>>;

/// Owns the component tasks and stops them in dependency order
struct ShutdownManager {
    deadline: Duration,
    /// Cancels every component except the notifier
    root: CancellationToken,
    /// Cancelled last so stop events still go out
    notifier_cancel: CancellationToken,
    trigger_handle: Option<WorkerHandle>,
    command_store_handle: Option<WorkerHandle>,
    controller_handle: Option<WorkerHandle>,
    notifier_handle: Option<WorkerHandle>,
}

impl ShutdownManager {
    fn new(deadline: Duration) -> Self {
        Self {
            deadline,
            root: CancellationToken::new(),
            notifier_cancel: CancellationToken::new(),
            trigger_handle: None,
            command_store_handle: None,
            controller_handle: None,
            notifier_handle: None,
        }
    }

    fn start(&mut self, state: &Arc<AppState>) {
        let notifier = state.notifier.clone();
        let cancel = self.notifier_cancel.clone();
        self.notifier_handle = Some(tokio::spawn(async move { notifier.run(cancel).await }));

        let command_store = state.command_store.clone();
        let cancel = self.root.clone();
        self.command_store_handle = Some(tokio::spawn(async move { command_store.run(cancel).await }));

        let controller = state.controller.clone();
        let cancel = self.root.clone();
        self.controller_handle = Some(tokio::spawn(async move { controller.run(cancel).await }));

        let trigger = state.trigger.clone();
        let cancel = self.root.clone();
        self.trigger_handle = Some(tokio::spawn(async move { trigger.run(cancel).await }));

        info!("Piped started");
    }

    async fn shutdown(&mut self) -> Result<(), AgentError> {
        self.root.cancel();

        match tokio::time::timeout(self.deadline, self.shutdown_impl()).await {
            Ok(result) => result,
            Err(_) => {
                error!("Shutdown timed out after {:?}, forcing shutdown...", self.deadline);
                Err(AgentError::ShutdownError(format!(
                    "components did not stop within {:?}",
                    self.deadline
                )))
            }
        }
    }

    async fn shutdown_impl(&mut self) -> Result<(), AgentError> {
        info!("Shutting down piped...");

        // 1. Trigger
        if let Some(handle) = self.trigger_handle.take() {
            handle.await.map_err(|e| AgentError::ShutdownError(e.to_string()))??;
        }

        // 2. Command store
        if let Some(handle) = self.command_store_handle.take() {
            handle.await.map_err(|e| AgentError::ShutdownError(e.to_string()))??;
        }

        // 3. Controller, which stops its log persister last
        if let Some(handle) = self.controller_handle.take() {
            handle.await.map_err(|e| AgentError::ShutdownError(e.to_string()))??;
        }

        // 4. Notifier
        self.notifier_cancel.cancel();
        if let Some(handle) = self.notifier_handle.take() {
            handle.await.map_err(|e| AgentError::ShutdownError(e.to_string()))??;
        }

        info!("Shutdown complete");
        Ok(())
    }
}
