//! HTTP client implementation

use std::time::Duration;

use reqwest::{header, Client};
use secrecy::{ExposeSecret, SecretString};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, error};

use crate::errors::AgentError;

/// Header identifying the calling piped
pub const PIPED_ID_HEADER: &str = "X-Piped-Id";

/// Header identifying the project of the calling piped
pub const PROJECT_ID_HEADER: &str = "X-Project-Id";

/// HTTP client for control plane communication
pub struct HttpClient {
    client: Client,
    base_url: String,
    project_id: String,
    piped_id: String,
    piped_key: SecretString,
}

impl HttpClient {
    /// Create a new HTTP client authenticated with the piped key
    pub async fn new(
        base_url: &str,
        project_id: &str,
        piped_id: &str,
        piped_key: SecretString,
    ) -> Result<Self, AgentError> {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            project_id: project_id.to_string(),
            piped_id: piped_id.to_string(),
            piped_key,
        })
    }

    /// Get the base URL
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn piped_id(&self) -> &str {
        &self.piped_id
    }

    /// Make a POST request
    pub async fn post<T: DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, AgentError> {
        let url = format!("{}{}", self.base_url, path);
        debug!("POST {}", url);

        let response = self
            .client
            .post(&url)
            .header(
                header::AUTHORIZATION,
                format!("Bearer {}", self.piped_key.expose_secret()),
            )
            .header(PIPED_ID_HEADER, &self.piped_id)
            .header(PROJECT_ID_HEADER, &self.project_id)
            .json(body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!("HTTP POST {} failed: {} - {}", path, status, body);
            return Err(AgentError::RpcError(format!("{}: {}", status, body)));
        }

        let body = response.json().await?;
        Ok(body)
    }
}
