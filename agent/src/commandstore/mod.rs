//! Local view of the commands waiting for this piped
//!
//! The store polls `GetCommands` and hands out the commands relevant to a
//! deployment or stage. Handled commands are dropped locally as soon as
//! they are reported so they are never handled twice.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use piped_model::{Command, CommandKind, CommandStatus};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::AgentError;
use crate::http::pipedservice::PipedService;

/// Command store options
#[derive(Debug, Clone)]
pub struct Options {
    /// How often the inbox is polled
    pub sync_interval: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Default)]
struct Inbox {
    commands: Vec<Command>,
    /// Reported ids the control plane may still list
    handled: HashSet<String>,
}

pub struct CommandStore {
    api: Arc<dyn PipedService>,
    inbox: Mutex<Inbox>,
    options: Options,
}

impl CommandStore {
    pub fn new(api: Arc<dyn PipedService>, options: Options) -> Self {
        Self {
            api,
            inbox: Mutex::new(Inbox::default()),
            options,
        }
    }

    pub async fn run(&self, cancel: CancellationToken) -> Result<(), AgentError> {
        info!("Command store starting...");
        let mut ticker = tokio::time::interval(self.options.sync_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Command store stopped");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.sync().await {
                        warn!("failed to fetch commands: {}", e);
                    }
                }
            }
        }
    }

    /// Replace the local view with the control plane's unhandled commands.
    pub async fn sync(&self) -> Result<(), AgentError> {
        let fetched = self.api.get_commands().await?;

        let mut inbox = self.inbox.lock().unwrap_or_else(|e| e.into_inner());
        let listed: HashSet<&str> = fetched.iter().map(|c| c.id.as_str()).collect();
        inbox.handled.retain(|id| listed.contains(id.as_str()));

        let handled = &inbox.handled;
        let pending: Vec<Command> = fetched
            .iter()
            .filter(|c| c.status == CommandStatus::NotHandledYet && !handled.contains(&c.id))
            .cloned()
            .collect();
        debug!("{} commands waiting to be handled", pending.len());
        inbox.commands = pending;
        Ok(())
    }

    /// Cancel commands addressed to a deployment
    pub fn list_deployment_commands(&self, deployment_id: &str) -> Vec<Command> {
        self.filter(|c| c.kind == CommandKind::CancelDeployment && c.deployment_id == deployment_id)
    }

    /// Approval commands addressed to one stage
    pub fn list_stage_commands(&self, deployment_id: &str, stage_id: &str) -> Vec<Command> {
        self.filter(|c| {
            c.kind == CommandKind::ApproveStage
                && c.deployment_id == deployment_id
                && c.stage_id == stage_id
        })
    }

    pub async fn report_handled(
        &self,
        command: &Command,
        status: CommandStatus,
        metadata: HashMap<String, String>,
    ) -> Result<(), AgentError> {
        {
            let mut inbox = self.inbox.lock().unwrap_or_else(|e| e.into_inner());
            inbox.handled.insert(command.id.clone());
            inbox.commands.retain(|c| c.id != command.id);
        }

        self.api
            .report_command_handled(&command.id, status, &metadata)
            .await
    }

    fn filter(&self, predicate: impl Fn(&Command) -> bool) -> Vec<Command> {
        let inbox = self.inbox.lock().unwrap_or_else(|e| e.into_inner());
        inbox.commands.iter().filter(|c| predicate(c)).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::fake::FakePipedService;

    fn command(id: &str, kind: CommandKind, deployment_id: &str, stage_id: &str) -> Command {
        Command {
            id: id.to_string(),
            piped_id: "piped-1".to_string(),
            application_id: "app-1".to_string(),
            deployment_id: deployment_id.to_string(),
            stage_id: stage_id.to_string(),
            commander: "alice".to_string(),
            kind,
            status: CommandStatus::NotHandledYet,
            metadata: HashMap::new(),
            created_at: 0,
        }
    }

    #[tokio::test]
    async fn test_filters_by_target() {
        let api = Arc::new(FakePipedService::new());
        *api.commands.lock().unwrap() = vec![
            command("c1", CommandKind::CancelDeployment, "d1", ""),
            command("c2", CommandKind::ApproveStage, "d1", "stage-1"),
            command("c3", CommandKind::ApproveStage, "d1", "stage-2"),
            command("c4", CommandKind::CancelDeployment, "d2", ""),
        ];
        let store = CommandStore::new(api, Options::default());
        store.sync().await.unwrap();

        let cancels: Vec<_> = store.list_deployment_commands("d1").into_iter().map(|c| c.id).collect();
        assert_eq!(cancels, vec!["c1"]);
        let approvals: Vec<_> = store
            .list_stage_commands("d1", "stage-2")
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(approvals, vec!["c3"]);
    }

    #[tokio::test]
    async fn test_handled_commands_are_not_returned_again() {
        let api = Arc::new(FakePipedService::new());
        let cancel = command("c1", CommandKind::CancelDeployment, "d1", "");
        *api.commands.lock().unwrap() = vec![cancel.clone()];
        let store = CommandStore::new(api.clone(), Options::default());
        store.sync().await.unwrap();

        store
            .report_handled(&cancel, CommandStatus::Succeeded, HashMap::new())
            .await
            .unwrap();
        assert!(store.list_deployment_commands("d1").is_empty());

        // The control plane may still list it until its own state catches up.
        *api.commands.lock().unwrap() = vec![cancel];
        store.sync().await.unwrap();
        assert!(store.list_deployment_commands("d1").is_empty());
        assert_eq!(
            api.handled_commands.lock().unwrap().clone(),
            vec![("c1".to_string(), CommandStatus::Succeeded)]
        );
    }

    #[tokio::test]
    async fn test_handled_ids_are_pruned_once_unlisted() {
        let api = Arc::new(FakePipedService::new());
        let cancel = command("c1", CommandKind::CancelDeployment, "d1", "");
        *api.commands.lock().unwrap() = vec![cancel.clone()];
        let store = CommandStore::new(api.clone(), Options::default());
        store.sync().await.unwrap();
        store
            .report_handled(&cancel, CommandStatus::Succeeded, HashMap::new())
            .await
            .unwrap();
        assert_eq!(store.inbox.lock().unwrap().handled.len(), 1);

        api.commands.lock().unwrap().clear();
        store.sync().await.unwrap();
        assert!(store.inbox.lock().unwrap().handled.is_empty());
    }

    #[test]
    fn test_default_sync_interval() {
        assert_eq!(Options::default().sync_interval, Duration::from_secs(5));
    }
}
