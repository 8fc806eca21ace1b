//! Application models

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// File name used when an application does not declare its own.
pub const DEFAULT_CONFIG_FILENAME: &str = "app.pipecd.yaml";

/// Rollout kind of an application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApplicationKind {
    Kubernetes,
    Terraform,
    Ecs,
    Cloudrun,
    Lambda,
    Custom,
}

impl ApplicationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApplicationKind::Kubernetes => "KUBERNETES",
            ApplicationKind::Terraform => "TERRAFORM",
            ApplicationKind::Ecs => "ECS",
            ApplicationKind::Cloudrun => "CLOUDRUN",
            ApplicationKind::Lambda => "LAMBDA",
            ApplicationKind::Custom => "CUSTOM",
        }
    }
}

impl fmt::Display for ApplicationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the application configuration lives inside a repository
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationGitPath {
    /// Repository id as declared in the piped configuration
    pub repo_id: String,

    /// Branch to follow
    #[serde(default)]
    pub branch: String,

    /// Application directory relative to the repository root
    pub path: String,

    /// Configuration file name inside `path`
    #[serde(default)]
    pub config_filename: Option<String>,
}

impl ApplicationGitPath {
    /// Configuration file name, falling back to the canonical one.
    pub fn config_filename(&self) -> &str {
        match self.config_filename.as_deref() {
            Some(name) if !name.is_empty() => name,
            _ => DEFAULT_CONFIG_FILENAME,
        }
    }

    /// Path of the configuration file relative to the repository root.
    pub fn config_file_path(&self) -> String {
        let dir = self.path.trim_matches('/');
        if dir.is_empty() || dir == "." {
            self.config_filename().to_string()
        } else {
            format!("{}/{}", dir, self.config_filename())
        }
    }
}

/// An application assigned to a piped
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Application {
    pub id: String,
    pub name: String,
    pub project_id: String,
    pub piped_id: String,
    pub kind: ApplicationKind,
    pub git_path: ApplicationGitPath,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub disabled: bool,
}
