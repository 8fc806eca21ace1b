//! WAIT stage: sleep for a fixed duration, surviving agent restarts

use std::time::Duration;

use async_trait::async_trait;
use piped_model::StageStatus;
use serde::Deserialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{Executor, Input};
use crate::utils::{format_duration, now_unix};

pub const STAGE_NAME: &str = "WAIT";

/// Stage metadata key holding the unix second the wait began
const START_TIME_KEY: &str = "startTime";

const PROGRESS_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Default, Deserialize)]
pub struct WaitStageOptions {
    #[serde(default, with = "humantime_serde")]
    pub duration: Option<Duration>,
}

pub struct WaitExecutor {
    input: Input,
}

impl WaitExecutor {
    pub fn new(input: Input) -> Self {
        Self { input }
    }

    /// Start time saved by an earlier run of this stage, or now.
    async fn start_time(&self) -> i64 {
        let stage_id = &self.input.stage.id;
        let saved = self
            .input
            .metadata_store
            .stage_get(stage_id, START_TIME_KEY)
            .and_then(|v| v.parse::<i64>().ok());
        if let Some(start) = saved {
            return start;
        }

        let now = now_unix();
        if let Err(e) = self
            .input
            .metadata_store
            .stage_put(stage_id, START_TIME_KEY, &now.to_string())
            .await
        {
            self.input
                .log_persister
                .errorf(format_args!("Unable to save the start time of the wait: {}", e));
        }
        now
    }
}

#[async_trait]
impl Executor for WaitExecutor {
    async fn execute(&mut self, cancel: CancellationToken) -> StageStatus {
        let lp = self.input.log_persister.clone();
        let options: WaitStageOptions = match self.input.stage_options() {
            Ok(options) => options,
            Err(e) => {
                lp.error(e.to_string());
                return StageStatus::Failure;
            }
        };
        let duration = match options.duration {
            Some(d) if !d.is_zero() => d,
            _ => {
                lp.error("WAIT stage requires a positive duration");
                return StageStatus::Failure;
            }
        };

        let start = self.start_time().await;
        let already = Duration::from_secs(now_unix().saturating_sub(start).max(0) as u64);
        if already >= duration {
            lp.infof(format_args!(
                "Already waited for {} since {}",
                format_duration(duration),
                format_unix(start)
            ));
            return StageStatus::Success;
        }

        let remaining = duration - already;
        lp.infof(format_args!(
            "Waiting for {} ({} left)...",
            format_duration(duration),
            format_duration(remaining)
        ));

        let began = Instant::now();
        let timer = tokio::time::sleep(remaining);
        tokio::pin!(timer);
        let mut progress = tokio::time::interval_at(began + PROGRESS_INTERVAL, PROGRESS_INTERVAL);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    lp.info("Wait cancelled");
                    return StageStatus::Cancelled;
                }
                _ = &mut timer => {
                    lp.successf(format_args!("Waited for {}", format_duration(duration)));
                    return StageStatus::Success;
                }
                _ = progress.tick() => {
                    let elapsed = Duration::from_secs((already + began.elapsed()).as_secs());
                    lp.infof(format_args!(
                        "Waiting... {} elapsed, {} left",
                        format_duration(elapsed),
                        format_duration(duration.saturating_sub(elapsed))
                    ));
                }
            }
        }
    }
}

fn format_unix(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use serde_json::json;

    use super::*;
    use crate::executor::testing::{harness, stage};

    #[tokio::test(start_paused = true)]
    async fn test_waits_full_duration() {
        let h = harness(stage(STAGE_NAME, json!({"duration": "1m"})));
        let lp = h.input.log_persister.clone();
        let store = h.input.metadata_store.clone();
        let mut executor = WaitExecutor::new(h.input);
        let handle = tokio::spawn(async move { executor.execute(CancellationToken::new()).await });

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert!(!handle.is_finished());
        let progress = lp.logs().iter().filter(|l| l.starts_with("Waiting...")).count();
        assert_eq!(progress, 5);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(handle.await.unwrap(), StageStatus::Success);
        assert_eq!(lp.logs().last().map(String::as_str), Some("Waited for 1m0s"));
        assert!(store.stage_get("stage-0", START_TIME_KEY).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resumes_from_saved_start_time() {
        let mut resumed = stage(STAGE_NAME, json!({"duration": "1m"}));
        let start = now_unix() - 40;
        resumed.metadata = serde_json::to_string(&HashMap::from([(START_TIME_KEY, start.to_string())])).unwrap();
        let h = harness(resumed);
        let lp = h.input.log_persister.clone();
        let mut executor = WaitExecutor::new(h.input);
        let handle = tokio::spawn(async move { executor.execute(CancellationToken::new()).await });

        // Only the remaining ~20s are waited.
        tokio::time::sleep(Duration::from_secs(18)).await;
        assert!(!handle.is_finished());
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(handle.await.unwrap(), StageStatus::Success);
        assert!(lp.logs()[0].starts_with("Waiting for 1m0s"));
        // The saved start time is kept, not overwritten.
        assert!(h.api.stage_metadata.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_already_waited() {
        let mut done = stage(STAGE_NAME, json!({"duration": "30s"}));
        let start = now_unix() - 45;
        done.metadata = serde_json::to_string(&HashMap::from([(START_TIME_KEY, start.to_string())])).unwrap();
        let h = harness(done);
        let lp = h.input.log_persister.clone();

        let status = WaitExecutor::new(h.input).execute(CancellationToken::new()).await;
        assert_eq!(status, StageStatus::Success);
        assert!(lp.logs()[0].starts_with("Already waited for 30s since "));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled() {
        let h = harness(stage(STAGE_NAME, json!({"duration": "1h"})));
        let lp = h.input.log_persister.clone();
        let cancel = CancellationToken::new();
        let mut executor = WaitExecutor::new(h.input);
        let handle = {
            let cancel = cancel.clone();
            tokio::spawn(async move { executor.execute(cancel).await })
        };

        tokio::time::sleep(Duration::from_secs(15)).await;
        cancel.cancel();
        assert_eq!(handle.await.unwrap(), StageStatus::Cancelled);
        assert_eq!(lp.logs().last().map(String::as_str), Some("Wait cancelled"));
    }

    #[tokio::test]
    async fn test_invalid_duration() {
        for config in [json!({"duration": "0s"}), json!({"duration": "soon"}), json!({})] {
            let h = harness(stage(STAGE_NAME, config));
            let status = WaitExecutor::new(h.input).execute(CancellationToken::new()).await;
            assert_eq!(status, StageStatus::Failure);
        }
    }
}
