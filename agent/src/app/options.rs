//! Application configuration options

use std::path::PathBuf;
use std::time::Duration;

use crate::{commandstore, controller, logpersister, notifier};

/// Main application options
#[derive(Debug, Clone)]
pub struct AppOptions {
    /// Piped configuration file
    pub config_file: PathBuf,

    /// Git binary used for clones and diffs
    pub git_binary: String,

    /// Lifecycle configuration
    pub lifecycle: LifecycleOptions,

    /// Deployment controller and scheduler options
    pub controller: controller::Options,

    /// Stage log shipping options
    pub log_persister: logpersister::Options,

    /// Command inbox options
    pub command_store: commandstore::Options,

    /// Notification delivery options
    pub notifier: notifier::Options,
}

impl Default for AppOptions {
    fn default() -> Self {
        Self {
            config_file: PathBuf::from("piped-config.yaml"),
            git_binary: "git".to_string(),
            lifecycle: LifecycleOptions::default(),
            controller: controller::Options::default(),
            log_persister: logpersister::Options::default(),
            command_store: commandstore::Options::default(),
            notifier: notifier::Options::default(),
        }
    }
}

impl AppOptions {
    /// Upper bound for the whole shutdown sequence: every component grace
    /// period in the order they stop, plus the lifecycle margin.
    pub fn shutdown_deadline(&self) -> Duration {
        self.controller.grace_period
            + self.log_persister.grace_period
            + self.notifier.close_grace_period
            + self.lifecycle.shutdown_margin
    }
}

/// Lifecycle options for the agent
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// Slack added on top of the component grace periods at shutdown
    pub shutdown_margin: Duration,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            shutdown_margin: Duration::from_secs(10),
        }
    }
}
