//! ANALYSIS stage
//!
//! Runs every configured analyzer on its own interval for the stage
//! duration. An analyzer that fails more often than its failure limit fails
//! the whole stage; surviving the duration is a success.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::try_join_all;
use piped_model::StageStatus;
use serde::Deserialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{Executor, Input};
use crate::errors::AgentError;
use crate::logpersister::StageLogPersister;
use crate::metadatastore::MetadataStore;
use crate::utils::format_duration;

pub const STAGE_NAME: &str = "ANALYSIS";

/// Stage metadata key holding the number of queries run per provider type
const QUERY_COUNT_KEY: &str = "qc";

const HTTP_PROVIDER_TYPE: &str = "HTTP";
const PROMETHEUS_PROVIDER_TYPE: &str = "PROMETHEUS";

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisStageOptions {
    #[serde(default, with = "humantime_serde")]
    pub duration: Option<Duration>,
    #[serde(default)]
    pub https: Vec<HttpAnalysis>,
    #[serde(default)]
    pub metrics: Vec<MetricsAnalysis>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpAnalysis {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default = "default_expected_code")]
    pub expected_code: u16,
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    #[serde(default)]
    pub failure_limit: u32,
    #[serde(default = "default_query_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsAnalysis {
    /// Name of an analysis provider declared in the piped config
    pub provider: String,
    pub query: String,
    #[serde(default)]
    pub expected: ExpectedRange,
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    #[serde(default)]
    pub failure_limit: u32,
    #[serde(default = "default_query_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

/// Inclusive bounds a metric value must stay within
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct ExpectedRange {
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl ExpectedRange {
    pub fn contains(&self, value: f64) -> bool {
        self.min.is_none_or(|min| value >= min) && self.max.is_none_or(|max| value <= max)
    }
}

impl std::fmt::Display for ExpectedRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.min, self.max) {
            (Some(min), Some(max)) => write!(f, "{} <= value <= {}", min, max),
            (Some(min), None) => write!(f, "{} <= value", min),
            (None, Some(max)) => write!(f, "value <= {}", max),
            (None, None) => write!(f, "any value"),
        }
    }
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_expected_code() -> u16 {
    200
}

fn default_query_timeout() -> Duration {
    Duration::from_secs(30)
}

#[async_trait]
trait Query: Send + Sync {
    /// Ok when the result is acceptable, Err with the reason otherwise.
    async fn run(&self) -> Result<(), AgentError>;
}

struct HttpQuery {
    client: reqwest::Client,
    config: HttpAnalysis,
}

#[async_trait]
impl Query for HttpQuery {
    async fn run(&self) -> Result<(), AgentError> {
        let method = reqwest::Method::from_bytes(self.config.method.to_uppercase().as_bytes())
            .map_err(|e| AgentError::ConfigError(format!("invalid method {}: {}", self.config.method, e)))?;
        let mut request = self
            .client
            .request(method, &self.config.url)
            .timeout(self.config.timeout);
        for (name, value) in &self.config.headers {
            request = request.header(name, value);
        }

        let status = request.send().await?.status();
        if status.as_u16() != self.config.expected_code {
            return Err(AgentError::ExecutorError(format!(
                "unexpected status code {}, expected {}",
                status.as_u16(),
                self.config.expected_code
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct PrometheusProviderConfig {
    address: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PrometheusResponse {
    status: String,
    #[serde(default)]
    error: String,
    #[serde(default)]
    data: Option<PrometheusData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PrometheusData {
    result_type: String,
    result: serde_json::Value,
}

struct PrometheusQuery {
    client: reqwest::Client,
    address: String,
    config: MetricsAnalysis,
}

impl PrometheusQuery {
    /// Sample values of an instant query result
    fn values(data: &PrometheusData) -> Result<Vec<f64>, AgentError> {
        let samples: Vec<&serde_json::Value> = match data.result_type.as_str() {
            "vector" => data
                .result
                .as_array()
                .map(|series| series.iter().filter_map(|s| s.get("value")).collect())
                .unwrap_or_default(),
            "scalar" => vec![&data.result],
            other => {
                return Err(AgentError::ExecutorError(format!(
                    "unsupported result type {}",
                    other
                )))
            }
        };

        samples
            .into_iter()
            .map(|sample| {
                sample
                    .get(1)
                    .and_then(|v| v.as_str())
                    .and_then(|v| v.parse::<f64>().ok())
                    .ok_or_else(|| AgentError::ExecutorError(format!("malformed sample {}", sample)))
            })
            .collect()
    }
}

#[async_trait]
impl Query for PrometheusQuery {
    async fn run(&self) -> Result<(), AgentError> {
        let url = format!("{}/api/v1/query", self.address.trim_end_matches('/'));
        let response: PrometheusResponse = self
            .client
            .get(&url)
            .query(&[("query", self.config.query.as_str())])
            .timeout(self.config.timeout)
            .send()
            .await?
            .json()
            .await?;
        if response.status != "success" {
            return Err(AgentError::ExecutorError(format!("query failed: {}", response.error)));
        }

        let data = response
            .data
            .ok_or_else(|| AgentError::ExecutorError("query returned no data".to_string()))?;
        let values = Self::values(&data)?;
        if values.is_empty() {
            return Err(AgentError::ExecutorError("query returned no data points".to_string()));
        }
        if let Some(outlier) = values.iter().find(|v| !self.config.expected.contains(**v)) {
            return Err(AgentError::ExecutorError(format!(
                "found a data point ({}) outside the expected range ({})",
                outlier, self.config.expected
            )));
        }
        Ok(())
    }
}

struct Analyzer {
    id: String,
    provider_type: &'static str,
    interval: Duration,
    failure_limit: u32,
    query: Box<dyn Query>,
}

/// Query counts per provider type, checkpointed to stage metadata
struct QueryCounts {
    counts: Mutex<HashMap<String, u64>>,
}

impl QueryCounts {
    fn restore(store: &MetadataStore, stage_id: &str) -> Self {
        let counts = store
            .stage_get(stage_id, QUERY_COUNT_KEY)
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();
        Self {
            counts: Mutex::new(counts),
        }
    }

    async fn increment(&self, provider_type: &str, store: &MetadataStore, stage_id: &str) -> Result<(), AgentError> {
        let blob = {
            let mut counts = self.counts.lock().unwrap_or_else(|e| e.into_inner());
            *counts.entry(provider_type.to_string()).or_default() += 1;
            serde_json::to_string(&*counts)?
        };
        store.stage_put(stage_id, QUERY_COUNT_KEY, &blob).await
    }
}

pub struct AnalysisExecutor {
    input: Input,
}

impl AnalysisExecutor {
    pub fn new(input: Input) -> Self {
        Self { input }
    }

    fn analyzers(&self, options: &AnalysisStageOptions) -> Vec<Analyzer> {
        let lp = &self.input.log_persister;
        let client = reqwest::Client::new();
        let mut analyzers = Vec::new();

        for (i, http) in options.https.iter().enumerate() {
            analyzers.push(Analyzer {
                id: format!("http-{}", i),
                provider_type: HTTP_PROVIDER_TYPE,
                interval: http.interval,
                failure_limit: http.failure_limit,
                query: Box::new(HttpQuery {
                    client: client.clone(),
                    config: http.clone(),
                }),
            });
        }

        for (i, metrics) in options.metrics.iter().enumerate() {
            let Some(provider) = self.input.piped.analysis_provider(&metrics.provider) else {
                lp.errorf(format_args!("Unknown analysis provider {}", metrics.provider));
                continue;
            };
            if !provider.provider_type.eq_ignore_ascii_case(PROMETHEUS_PROVIDER_TYPE) {
                lp.errorf(format_args!(
                    "Analysis provider {} has unsupported type {}, skipping it",
                    provider.name, provider.provider_type
                ));
                continue;
            }
            let config: PrometheusProviderConfig = match serde_json::from_value(provider.config.clone()) {
                Ok(config) => config,
                Err(e) => {
                    lp.errorf(format_args!("Invalid config of analysis provider {}: {}", provider.name, e));
                    continue;
                }
            };
            analyzers.push(Analyzer {
                id: format!("{}-{}", provider.name, i),
                provider_type: PROMETHEUS_PROVIDER_TYPE,
                interval: metrics.interval,
                failure_limit: metrics.failure_limit,
                query: Box::new(PrometheusQuery {
                    client: client.clone(),
                    address: config.address,
                    config: metrics.clone(),
                }),
            });
        }
        analyzers
    }

    /// Query until the failure limit is exceeded. Only returns on failure.
    async fn run_analyzer(&self, analyzer: &Analyzer, counts: &QueryCounts) -> Result<(), String> {
        let lp: &StageLogPersister = &self.input.log_persister;
        let stage_id = &self.input.stage.id;
        lp.infof(format_args!(
            "[{}] Start analysis every {}",
            analyzer.id,
            format_duration(analyzer.interval)
        ));

        let mut ticker = tokio::time::interval_at(Instant::now() + analyzer.interval, analyzer.interval);
        let mut failures = 0u32;
        loop {
            ticker.tick().await;
            let result = analyzer.query.run().await;
            if let Err(e) = counts
                .increment(analyzer.provider_type, &self.input.metadata_store, stage_id)
                .await
            {
                tracing::warn!(stage_id = %stage_id, "failed to save analysis query count: {}", e);
            }

            match result {
                Ok(()) => lp.infof(format_args!("[{}] The query result is a success", analyzer.id)),
                Err(e) => {
                    failures += 1;
                    if failures > analyzer.failure_limit {
                        return Err(format!(
                            "[{}] analysis failed because the failure number exceeded the failure limit ({}): {}",
                            analyzer.id, analyzer.failure_limit, e
                        ));
                    }
                    lp.errorf(format_args!(
                        "[{}] The query result is a failure: {}. This analysis fails after {} more failures",
                        analyzer.id,
                        e,
                        analyzer.failure_limit + 1 - failures
                    ));
                }
            }
        }
    }
}

#[async_trait]
impl Executor for AnalysisExecutor {
    async fn execute(&mut self, cancel: CancellationToken) -> StageStatus {
        let lp = self.input.log_persister.clone();
        let options: AnalysisStageOptions = match self.input.stage_options() {
            Ok(options) => options,
            Err(e) => {
                lp.error(e.to_string());
                return StageStatus::Failure;
            }
        };
        let duration = match options.duration {
            Some(d) if !d.is_zero() => d,
            _ => {
                lp.error("ANALYSIS stage requires a positive duration");
                return StageStatus::Failure;
            }
        };
        if let Some(bad) = options
            .https
            .iter()
            .map(|h| h.interval)
            .chain(options.metrics.iter().map(|m| m.interval))
            .find(|i| i.is_zero())
        {
            lp.errorf(format_args!("Analysis interval must be positive, got {}", format_duration(bad)));
            return StageStatus::Failure;
        }

        let analyzers = self.analyzers(&options);
        let counts = QueryCounts::restore(&self.input.metadata_store, &self.input.stage.id);
        lp.infof(format_args!(
            "Running {} analyses for {}",
            analyzers.len(),
            format_duration(duration)
        ));

        // Analyzers only return on failure; with none configured the stage just waits.
        let all = async {
            try_join_all(analyzers.iter().map(|a| self.run_analyzer(a, &counts))).await?;
            futures::future::pending::<Result<(), String>>().await
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                lp.info("Analysis cancelled");
                StageStatus::Cancelled
            }
            Err(reason) = all => {
                lp.errorf(format_args!("An analysis failed: {}", reason));
                StageStatus::Failure
            }
            _ = tokio::time::sleep(duration) => {
                lp.success("All analyses were successful");
                StageStatus::Success
            }
        }
    }
}
