//! Route matching for notification events

use std::collections::{HashMap, HashSet};

use piped_model::{NotificationEvent, NotificationEventGroup, NotificationEventType};

use crate::config::piped::NotificationRoute;

/// Compiled filters of one notification route
#[derive(Debug, Clone, Default)]
pub struct Matcher {
    events: HashSet<NotificationEventType>,
    ignore_events: HashSet<NotificationEventType>,
    groups: HashSet<NotificationEventGroup>,
    ignore_groups: HashSet<NotificationEventGroup>,
    apps: HashSet<String>,
    ignore_apps: HashSet<String>,
    labels: HashMap<String, String>,
    ignore_labels: HashMap<String, String>,
}

impl Matcher {
    /// Build from a route. Event and group names that do not parse are
    /// rejected by config validation, so they are skipped here.
    pub fn new(route: &NotificationRoute) -> Self {
        Self {
            events: route.events.iter().filter_map(|e| e.parse().ok()).collect(),
            ignore_events: route.ignore_events.iter().filter_map(|e| e.parse().ok()).collect(),
            groups: route.groups.iter().filter_map(|g| g.parse().ok()).collect(),
            ignore_groups: route.ignore_groups.iter().filter_map(|g| g.parse().ok()).collect(),
            apps: route.apps.iter().cloned().collect(),
            ignore_apps: route.ignore_apps.iter().cloned().collect(),
            labels: route.labels.clone(),
            ignore_labels: route.ignore_labels.clone(),
        }
    }

    pub fn matches(&self, event: &NotificationEvent) -> bool {
        if self.ignore_events.contains(&event.event_type) {
            return false;
        }
        if self.ignore_groups.contains(&event.group()) {
            return false;
        }

        let app_name = event.metadata.as_app_named().map(|m| m.app_name());
        let labels = event.metadata.as_labeled().map(|m| m.labels());

        if let Some(name) = app_name {
            if self.ignore_apps.contains(name) {
                return false;
            }
        }
        if let Some(labels) = labels {
            let ignored = self
                .ignore_labels
                .iter()
                .any(|(k, v)| labels.get(k) == Some(v));
            if ignored {
                return false;
            }
        }

        if !self.events.is_empty() && !self.events.contains(&event.event_type) {
            return false;
        }
        if !self.groups.is_empty() && !self.groups.contains(&event.group()) {
            return false;
        }
        if let Some(name) = app_name {
            if !self.apps.is_empty() && !name.is_empty() && !self.apps.contains(name) {
                return false;
            }
        }
        if let Some(labels) = labels {
            if !self.labels.is_empty() {
                let all_present = self.labels.iter().all(|(k, v)| labels.get(k) == Some(v));
                if !all_present {
                    return false;
                }
            }
        }
        true
    }
}
