//! CUSTOM_SYNC stage: run a user supplied shell script in the application directory

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use piped_model::StageStatus;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::{Executor, Input};
use crate::logpersister::StageLogPersister;

pub const STAGE_NAME: &str = "CUSTOM_SYNC";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomSyncOptions {
    #[serde(default)]
    pub run: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Script the ROLLBACK stage runs to undo `run`
    #[serde(default)]
    pub on_rollback: Option<String>,
}

pub struct CustomSyncExecutor {
    input: Input,
}

impl CustomSyncExecutor {
    pub fn new(input: Input) -> Self {
        Self { input }
    }
}

#[async_trait]
impl Executor for CustomSyncExecutor {
    async fn execute(&mut self, cancel: CancellationToken) -> StageStatus {
        let lp = self.input.log_persister.clone();
        let options: CustomSyncOptions = match self.input.stage_options() {
            Ok(options) => options,
            Err(e) => {
                lp.error(e.to_string());
                return StageStatus::Failure;
            }
        };
        if options.run.trim().is_empty() {
            lp.error("CUSTOM_SYNC stage requires a script in `run`");
            return StageStatus::Failure;
        }

        lp.infof(format_args!(
            "Running custom sync for {} at commit {}",
            self.input.deployment.application_name,
            self.input.deployment.commit_hash()
        ));
        run_script(&lp, &self.input.app_dir, &options.run, &options.env, cancel).await
    }
}

/// Run `script` with `bash -c`, copying every output line to the stage log.
pub(crate) async fn run_script(
    lp: &StageLogPersister,
    dir: &Path,
    script: &str,
    env: &HashMap<String, String>,
    cancel: CancellationToken,
) -> StageStatus {
    let mut child = match Command::new("bash")
        .arg("-c")
        .arg(script)
        .current_dir(dir)
        .envs(env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            lp.errorf(format_args!("Failed to start the script: {}", e));
            return StageStatus::Failure;
        }
    };
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let exited = tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        status = async {
            tokio::join!(copy_lines(stdout, lp), copy_lines(stderr, lp));
            child.wait().await
        } => Some(status),
    };

    match exited {
        None => {
            if let Err(e) = child.kill().await {
                tracing::warn!("failed to kill cancelled script: {}", e);
            }
            lp.info("Script cancelled");
            StageStatus::Cancelled
        }
        Some(Ok(status)) if status.success() => {
            lp.success("Script finished successfully");
            StageStatus::Success
        }
        Some(Ok(status)) => {
            lp.errorf(format_args!("Script failed: {}", status));
            StageStatus::Failure
        }
        Some(Err(e)) => {
            lp.errorf(format_args!("Failed to wait for the script: {}", e));
            StageStatus::Failure
        }
    }
}

async fn copy_lines<R: AsyncRead + Unpin>(reader: Option<R>, lp: &StageLogPersister) {
    let Some(reader) = reader else {
        return;
    };
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        lp.info(line);
    }
}
