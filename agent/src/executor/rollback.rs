//! ROLLBACK stage, appended by the scheduler when a deployment fails

use async_trait::async_trait;
use piped_model::StageStatus;
use tokio_util::sync::CancellationToken;

use super::customsync::{self, run_script, CustomSyncOptions};
use super::{Executor, Input};

pub const STAGE_NAME: &str = "ROLLBACK";

pub struct RollbackExecutor {
    input: Input,
}

impl RollbackExecutor {
    pub fn new(input: Input) -> Self {
        Self { input }
    }

    /// `onRollback` scripts of the custom sync stages that started, latest first
    fn rollback_scripts(&self) -> Vec<(String, CustomSyncOptions)> {
        let mut scripts: Vec<(String, CustomSyncOptions)> = self
            .input
            .deployment
            .stages
            .iter()
            .filter(|s| s.name == customsync::STAGE_NAME && !s.rollback && s.status != StageStatus::NotStarted)
            .filter_map(|s| {
                let options: CustomSyncOptions = serde_json::from_value(s.config.clone()).ok()?;
                match options.on_rollback.as_deref() {
                    Some(script) if !script.trim().is_empty() => Some((s.id.clone(), options)),
                    _ => None,
                }
            })
            .collect();
        scripts.reverse();
        scripts
    }
}

#[async_trait]
impl Executor for RollbackExecutor {
    async fn execute(&mut self, cancel: CancellationToken) -> StageStatus {
        let lp = self.input.log_persister.clone();
        let scripts = self.rollback_scripts();
        if scripts.is_empty() {
            lp.info("Nothing to roll back on this piped");
            return StageStatus::Success;
        }

        lp.infof(format_args!(
            "Rolling back {} to its previous state",
            self.input.deployment.application_name
        ));
        for (stage_id, options) in scripts {
            let Some(script) = options.on_rollback.as_deref() else {
                continue;
            };
            lp.infof(format_args!("Running the rollback script of stage {}", stage_id));
            let status = run_script(&lp, &self.input.app_dir, script, &options.env, cancel.clone()).await;
            if status != StageStatus::Success {
                return status;
            }
        }
        lp.success("Rollback finished");
        StageStatus::Success
    }
}
