//! Stage log shipping
//!
//! Every running stage gets a `StageLogPersister` buffer. A background loop
//! ships new blocks every flush interval and periodically sends the whole
//! buffer as a checkpoint. The checkpoint sent after the stage completes is
//! the transcript the control plane keeps.

pub mod stage;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::AgentError;
use crate::http::pipedservice::PipedService;

pub use stage::StageLogPersister;

/// Log persister options
#[derive(Debug, Clone)]
pub struct Options {
    /// How often buffered logs are shipped
    pub flush_interval: Duration,

    /// How often the whole buffer is sent as a checkpoint
    pub checkpoint_flush_interval: Duration,

    /// How long a completed stage is kept when its final checkpoint keeps failing
    pub stale_period: Duration,

    /// Time allowed for the final checkpoints at shutdown
    pub grace_period: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(5),
            checkpoint_flush_interval: Duration::from_secs(120),
            stale_period: Duration::from_secs(60),
            grace_period: Duration::from_secs(30),
        }
    }
}

type StageKey = (String, String);

pub struct Persister {
    api: Arc<dyn PipedService>,
    stages: Mutex<HashMap<StageKey, Arc<StageLogPersister>>>,
    options: Options,
}

impl Persister {
    pub fn new(api: Arc<dyn PipedService>, options: Options) -> Self {
        Self {
            api,
            stages: Mutex::new(HashMap::new()),
            options,
        }
    }

    /// Buffer for a stage, created on first use.
    pub fn stage_persister(&self, deployment_id: &str, stage_id: &str) -> Arc<StageLogPersister> {
        let mut stages = self.stages.lock().unwrap_or_else(|e| e.into_inner());
        let key = (deployment_id.to_string(), stage_id.to_string());
        match stages.get(&key) {
            Some(existing) if !existing.is_done() => existing.clone(),
            _ => {
                let persister = Arc::new(StageLogPersister::new(deployment_id, stage_id));
                stages.insert(key, persister.clone());
                persister
            }
        }
    }

    pub fn len(&self) -> usize {
        self.stages.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn run(&self, cancel: CancellationToken) -> Result<(), AgentError> {
        info!("Log persister starting...");
        let mut ticker = tokio::time::interval_at(
            Instant::now() + self.options.flush_interval,
            self.options.flush_interval,
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.flush_all().await,
            }
        }

        self.shutdown().await;
        info!("Log persister stopped");
        Ok(())
    }

    fn snapshot(&self) -> Vec<(StageKey, Arc<StageLogPersister>)> {
        let stages = self.stages.lock().unwrap_or_else(|e| e.into_inner());
        stages.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    async fn flush_all(&self) {
        let now = Instant::now();
        let mut stale = Vec::new();

        for (key, stage) in self.snapshot() {
            if stage.is_stale(now, self.options.stale_period) {
                stale.push((key, stage));
                continue;
            }
            if let Err(e) = stage
                .flush(self.api.as_ref(), self.options.checkpoint_flush_interval)
                .await
            {
                warn!(
                    deployment_id = %key.0,
                    stage_id = %key.1,
                    "failed to flush stage logs: {}", e
                );
            }
        }

        if stale.is_empty() {
            return;
        }
        let mut stages = self.stages.lock().unwrap_or_else(|e| e.into_inner());
        for (key, stage) in stale {
            // Only drop the entry if it was not replaced in the meantime.
            if stages.get(&key).is_some_and(|current| Arc::ptr_eq(current, &stage)) {
                debug!(deployment_id = %key.0, stage_id = %key.1, "removing stale stage logs");
                stages.remove(&key);
            }
        }
    }

    /// Send one last checkpoint for every stage still holding logs.
    async fn shutdown(&self) {
        let now = Instant::now();
        let live: Vec<_> = self
            .snapshot()
            .into_iter()
            .filter(|(_, stage)| !stage.is_stale(now, self.options.stale_period))
            .collect();
        if live.is_empty() {
            return;
        }
        info!("flushing logs of {} stages before stopping", live.len());

        let mut tasks = tokio::task::JoinSet::new();
        for (_, stage) in live {
            let api = self.api.clone();
            tasks.spawn(async move {
                if let Err(e) = stage.flush_from_last_checkpoint(api.as_ref()).await {
                    warn!(
                        deployment_id = %stage.deployment_id(),
                        stage_id = %stage.stage_id(),
                        "failed to send final log checkpoint: {}", e
                    );
                }
            });
        }

        let drained = tokio::time::timeout(self.options.grace_period, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("grace period expired before all stage logs were flushed");
            tasks.abort_all();
        }
    }
}
