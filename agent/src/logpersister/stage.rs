//! Log buffer of a single stage

use std::fmt;
use std::sync::RwLock;
use std::time::Duration;

use piped_model::{LogBlock, LogSeverity};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::error;

use crate::errors::AgentError;
use crate::http::pipedservice::PipedService;
use crate::utils::now_unix;

#[derive(Debug)]
struct State {
    blocks: Vec<LogBlock>,
    next_index: u64,
    last_created_at: i64,
    /// Number of buffered blocks already delivered incrementally
    sent_index: usize,
    completed: bool,
    completed_at: Option<Instant>,
    done: bool,
    checkpoint_sent: Instant,
}

/// Collects the log blocks of one stage until they reach the control plane
#[derive(Debug)]
pub struct StageLogPersister {
    deployment_id: String,
    stage_id: String,
    state: RwLock<State>,
    done_tx: watch::Sender<bool>,
}

impl StageLogPersister {
    pub(crate) fn new(deployment_id: &str, stage_id: &str) -> Self {
        let (done_tx, _) = watch::channel(false);
        Self {
            deployment_id: deployment_id.to_string(),
            stage_id: stage_id.to_string(),
            state: RwLock::new(State {
                blocks: Vec::new(),
                next_index: 0,
                last_created_at: 0,
                sent_index: 0,
                completed: false,
                completed_at: None,
                done: false,
                checkpoint_sent: Instant::now(),
            }),
            done_tx,
        }
    }

    pub fn deployment_id(&self) -> &str {
        &self.deployment_id
    }

    pub fn stage_id(&self) -> &str {
        &self.stage_id
    }

    pub fn info(&self, log: impl Into<String>) {
        self.append(log.into(), LogSeverity::Info);
    }

    pub fn infof(&self, args: fmt::Arguments<'_>) {
        self.append(args.to_string(), LogSeverity::Info);
    }

    pub fn success(&self, log: impl Into<String>) {
        self.append(log.into(), LogSeverity::Success);
    }

    pub fn successf(&self, args: fmt::Arguments<'_>) {
        self.append(args.to_string(), LogSeverity::Success);
    }

    pub fn error(&self, log: impl Into<String>) {
        self.append(log.into(), LogSeverity::Error);
    }

    pub fn errorf(&self, args: fmt::Arguments<'_>) {
        self.append(args.to_string(), LogSeverity::Error);
    }

    fn append(&self, log: String, severity: LogSeverity) {
        if severity == LogSeverity::Error {
            error!(
                deployment_id = %self.deployment_id,
                stage_id = %self.stage_id,
                "{}", log
            );
        }

        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let created_at = now_unix().max(state.last_created_at);
        let block = LogBlock {
            index: state.next_index,
            log,
            severity,
            created_at,
        };
        state.next_index += 1;
        state.last_created_at = created_at;
        state.blocks.push(block);
    }

    /// Mark the stage completed and wait for the final checkpoint to be delivered.
    pub async fn complete(&self, timeout: Duration) -> Result<(), AgentError> {
        let mut done_rx = self.done_tx.subscribe();
        {
            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
            if !state.completed {
                state.completed = true;
                state.completed_at = Some(Instant::now());
            }
        }

        let waited = tokio::time::timeout(timeout, done_rx.wait_for(|done| *done))
            .await
            .map(|r| r.map(|_| ()));
        match waited {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(AgentError::Internal("log persister was dropped".to_string())),
            Err(_) => Err(AgentError::Timeout(format!(
                "logs of stage {} were not delivered within {:?}",
                self.stage_id, timeout
            ))),
        }
    }

    pub fn is_done(&self) -> bool {
        self.state.read().unwrap_or_else(|e| e.into_inner()).done
    }

    pub fn is_completed(&self) -> bool {
        self.state.read().unwrap_or_else(|e| e.into_inner()).completed
    }

    #[cfg(test)]
    pub(crate) fn logs(&self) -> Vec<String> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.blocks.iter().map(|b| b.log.clone()).collect()
    }

    pub(crate) fn is_stale(&self, now: Instant, stale_period: Duration) -> bool {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        if state.done {
            return true;
        }
        match (state.completed, state.completed_at) {
            (true, Some(at)) => now.saturating_duration_since(at) > stale_period,
            _ => false,
        }
    }

    /// Ship buffered logs, as a checkpoint when completed or when the
    /// checkpoint interval has passed, incrementally otherwise.
    pub(crate) async fn flush(
        &self,
        api: &dyn PipedService,
        checkpoint_interval: Duration,
    ) -> Result<(), AgentError> {
        let checkpoint = {
            let state = self.state.read().unwrap_or_else(|e| e.into_inner());
            state.completed
                || Instant::now().saturating_duration_since(state.checkpoint_sent) >= checkpoint_interval
        };
        if checkpoint {
            self.flush_from_last_checkpoint(api).await
        } else {
            self.flush_new_logs(api).await
        }
    }

    async fn flush_new_logs(&self, api: &dyn PipedService) -> Result<(), AgentError> {
        let (from, blocks) = {
            let state = self.state.read().unwrap_or_else(|e| e.into_inner());
            (state.sent_index, state.blocks[state.sent_index..].to_vec())
        };
        if blocks.is_empty() {
            return Ok(());
        }

        api.report_stage_logs(&self.deployment_id, &self.stage_id, &blocks)
            .await?;

        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.sent_index = from + blocks.len();
        Ok(())
    }

    pub(crate) async fn flush_from_last_checkpoint(&self, api: &dyn PipedService) -> Result<(), AgentError> {
        let (blocks, completed) = {
            let state = self.state.read().unwrap_or_else(|e| e.into_inner());
            (state.blocks.clone(), state.completed)
        };

        api.report_stage_logs_from_last_checkpoint(&self.deployment_id, &self.stage_id, &blocks, completed)
            .await?;

        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        // Blocks appended during the RPC stay for the next flush.
        state.blocks.drain(..blocks.len());
        state.sent_index = 0;
        state.checkpoint_sent = Instant::now();
        if completed {
            state.done = true;
            drop(state);
            self.done_tx.send_replace(true);
        }
        Ok(())
    }
}

/// Process output written to a stage log lands as INFO blocks.
impl std::io::Write for &StageLogPersister {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let text = String::from_utf8_lossy(buf);
        self.info(text.trim_end_matches('\n'));
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
