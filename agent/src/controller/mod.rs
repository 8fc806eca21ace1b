//! Deployment controller
//!
//! Keeps one scheduler running for every deployment the control plane
//! assigned to this piped and still considers in progress.

pub mod scheduler;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::errors::AgentError;
use crate::filesys::dir::Dir;

pub use scheduler::{Components, Scheduler};

/// Controller options
#[derive(Debug, Clone)]
pub struct Options {
    /// How often the scheduler pool is reconciled with the control plane
    pub reconcile_interval: Duration,

    /// How long shutdown waits for in-flight schedulers
    pub grace_period: Duration,

    pub scheduler: scheduler::Options,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            reconcile_interval: Duration::from_secs(30),
            grace_period: Duration::from_secs(30),
            scheduler: scheduler::Options::default(),
        }
    }
}

pub struct Controller {
    components: Components,
    /// Parent of the per-deployment working directories
    deployments_dir: Dir,
    schedulers: Mutex<HashMap<String, Arc<Scheduler>>>,
    /// Finished deployments the control plane may still list as running
    done_ids: Mutex<HashSet<String>>,
    tracker: TaskTracker,
    options: Options,
}

impl Controller {
    pub fn new(components: Components, deployments_dir: Dir, options: Options) -> Self {
        Self {
            components,
            deployments_dir,
            schedulers: Mutex::new(HashMap::new()),
            done_ids: Mutex::new(HashSet::new()),
            tracker: TaskTracker::new(),
            options,
        }
    }

    pub async fn run(&self, cancel: CancellationToken) -> Result<(), AgentError> {
        info!("Deployment controller starting...");

        // The persister outlives the schedulers so interrupted stages still
        // ship their last logs.
        let persister_cancel = CancellationToken::new();
        let persister = {
            let persister = self.components.log_persister.clone();
            let token = persister_cancel.clone();
            tokio::spawn(async move { persister.run(token).await })
        };

        let mut ticker = tokio::time::interval(self.options.reconcile_interval);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.reconcile(&cancel).await,
            }
        }

        info!("Deployment controller shutting down...");
        self.tracker.close();
        if tokio::time::timeout(self.options.grace_period, self.tracker.wait())
            .await
            .is_err()
        {
            warn!(
                "{} schedulers did not stop within {:?}",
                self.tracker.len(),
                self.options.grace_period
            );
        }

        persister_cancel.cancel();
        match persister.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("log persister stopped with error: {}", e),
            Err(e) => error!("log persister task failed: {}", e),
        }
        info!("Deployment controller stopped");
        Ok(())
    }

    /// Drop finished schedulers and start one for every new deployment.
    pub(crate) async fn reconcile(&self, cancel: &CancellationToken) {
        {
            let mut schedulers = self.schedulers.lock().unwrap_or_else(|e| e.into_inner());
            let mut done_ids = self.done_ids.lock().unwrap_or_else(|e| e.into_inner());
            schedulers.retain(|id, s| {
                if s.is_done() {
                    done_ids.insert(id.clone());
                    return false;
                }
                true
            });
        }

        let deployments = match self.components.api.list_not_completed_deployments().await {
            Ok(deployments) => deployments,
            Err(e) => {
                warn!("failed to list not completed deployments: {}", e);
                return;
            }
        };

        // A finished id is forgotten once the control plane stops listing it.
        let done_ids = {
            let listed: HashSet<&str> = deployments.iter().map(|d| d.id.as_str()).collect();
            let mut done_ids = self.done_ids.lock().unwrap_or_else(|e| e.into_inner());
            done_ids.retain(|id| listed.contains(id.as_str()));
            done_ids.clone()
        };

        for deployment in deployments {
            if cancel.is_cancelled() {
                return;
            }
            if deployment.is_completed()
                || done_ids.contains(&deployment.id)
                || self.contains(&deployment.id)
            {
                continue;
            }

            let working_dir = self.deployments_dir.subdir(&deployment.id);
            if let Err(e) = working_dir.recreate().await {
                error!(deployment_id = %deployment.id, "failed to create working directory: {}", e);
                continue;
            }

            let deployment_id = deployment.id.clone();
            let scheduler = Arc::new(Scheduler::new(
                deployment,
                working_dir,
                self.components.clone(),
                self.options.scheduler.clone(),
            ));
            self.schedulers
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(deployment_id.clone(), scheduler.clone());

            debug!(deployment_id = %deployment_id, "spawning scheduler");
            let token = cancel.clone();
            self.tracker.spawn(async move {
                if let Err(e) = scheduler.run(token).await {
                    error!(deployment_id = %deployment_id, "scheduler failed: {}", e);
                }
            });
        }
    }

    fn contains(&self, deployment_id: &str) -> bool {
        self.schedulers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(deployment_id)
    }

    /// Deployments that currently have a scheduler, sorted
    pub fn scheduler_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .schedulers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }
}
