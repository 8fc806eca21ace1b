//! Deployment and stage metadata
//!
//! Reads are served from memory. Writes go to the control plane first and
//! are serialised per key, so two executors updating the same key never
//! interleave their RPCs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use piped_model::Deployment;
use tracing::warn;

use crate::errors::AgentError;
use crate::http::pipedservice::PipedService;

pub struct MetadataStore {
    api: Arc<dyn PipedService>,
    deployment_id: String,
    deployment: RwLock<HashMap<String, String>>,
    stages: RwLock<HashMap<String, HashMap<String, String>>>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl MetadataStore {
    /// Start from the metadata checkpointed in the deployment snapshot.
    pub fn new(api: Arc<dyn PipedService>, deployment: &Deployment) -> Self {
        let mut stages = HashMap::new();
        for stage in &deployment.stages {
            if stage.metadata.is_empty() {
                continue;
            }
            match serde_json::from_str::<HashMap<String, String>>(&stage.metadata) {
                Ok(metadata) => {
                    stages.insert(stage.id.clone(), metadata);
                }
                Err(e) => warn!(
                    deployment_id = %deployment.id,
                    stage_id = %stage.id,
                    "ignoring unreadable stage metadata: {}", e
                ),
            }
        }

        Self {
            api,
            deployment_id: deployment.id.clone(),
            deployment: RwLock::new(deployment.metadata.clone()),
            stages: RwLock::new(stages),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn deployment_get(&self, key: &str) -> Option<String> {
        let metadata = self.deployment.read().unwrap_or_else(|e| e.into_inner());
        metadata.get(key).cloned()
    }

    pub async fn deployment_put(&self, key: &str, value: &str) -> Result<(), AgentError> {
        self.deployment_put_multi(HashMap::from([(key.to_string(), value.to_string())]))
            .await
    }

    pub async fn deployment_put_multi(&self, values: HashMap<String, String>) -> Result<(), AgentError> {
        // Locks are taken in key order so concurrent multi-key writes cannot deadlock.
        let mut keys: Vec<&String> = values.keys().collect();
        keys.sort();
        let locks: Vec<_> = keys
            .iter()
            .map(|k| self.lock_for(&format!("deployment/{}", k)))
            .collect();
        let mut _guards = Vec::with_capacity(locks.len());
        for lock in &locks {
            _guards.push(lock.lock().await);
        }

        self.api
            .save_deployment_metadata(&self.deployment_id, &values)
            .await?;
        self.deployment
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .extend(values);
        Ok(())
    }

    pub fn stage_get(&self, stage_id: &str, key: &str) -> Option<String> {
        let stages = self.stages.read().unwrap_or_else(|e| e.into_inner());
        stages.get(stage_id).and_then(|m| m.get(key)).cloned()
    }

    /// Every metadata entry of a stage
    pub fn stage(&self, stage_id: &str) -> HashMap<String, String> {
        let stages = self.stages.read().unwrap_or_else(|e| e.into_inner());
        stages.get(stage_id).cloned().unwrap_or_default()
    }

    pub async fn stage_put(&self, stage_id: &str, key: &str, value: &str) -> Result<(), AgentError> {
        self.stage_put_multi(stage_id, HashMap::from([(key.to_string(), value.to_string())]))
            .await
    }

    /// Merge entries into a stage's metadata and persist the whole blob.
    pub async fn stage_put_multi(
        &self,
        stage_id: &str,
        values: HashMap<String, String>,
    ) -> Result<(), AgentError> {
        let lock = self.lock_for(&format!("stage/{}", stage_id));
        let _guard = lock.lock().await;

        let mut merged = self.stage(stage_id);
        merged.extend(values);
        let blob = serde_json::to_string(&merged)?;

        self.api
            .save_stage_metadata(&self.deployment_id, stage_id, &blob)
            .await?;
        self.stages
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(stage_id.to_string(), merged);
        Ok(())
    }

    fn lock_for(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(name.to_string()).or_default().clone()
    }
}
