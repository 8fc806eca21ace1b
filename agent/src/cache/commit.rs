//! Last triggered commit per application

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

/// Commit hash of the most recent deployment triggered for each application
#[derive(Debug, Default)]
pub struct TriggeredCommitCache {
    entries: RwLock<HashMap<String, String>>,
}

impl TriggeredCommitCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, application_id: &str) -> Option<String> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.get(application_id).cloned()
    }

    pub fn put(&self, application_id: &str, hash: &str) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.insert(application_id.to_string(), hash.to_string());
    }

    pub fn remove(&self, application_id: &str) -> Option<String> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.remove(application_id)
    }

    /// Forget applications that are no longer assigned to this piped
    pub fn retain(&self, application_ids: &HashSet<&str>) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.retain(|id, _| application_ids.contains(id.as_str()));
    }

    pub fn len(&self) -> usize {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
