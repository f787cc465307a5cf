//! Refresh jobs the engine registers with the scheduler.

use crate::api::{RunApi, RunFilters};
use crate::hub::{EngineUpdate, UpdateSender};
use crate::resolver::{ArtifactRequest, ArtifactResolver, Resolution, ResolutionError};
use crate::scheduler::RefreshJob;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use telemetry_core::{ArtifactKey, FailureKind};
use telemetry_trend::aggregate;
use tokio::task::JoinHandle;
use tracing::debug;

pub const RUN_LIST_JOB: &str = "runs";

/// Fetches one run-list snapshot and republishes the aggregated statuses.
pub struct RunListJob {
    api: Arc<dyn RunApi>,
    filters: RunFilters,
    timeout: Duration,
}

impl RunListJob {
    pub fn new(api: Arc<dyn RunApi>, filters: RunFilters, timeout: Duration) -> Self {
        Self {
            api,
            filters,
            timeout,
        }
    }
}

#[async_trait]
impl RefreshJob for RunListJob {
    fn key(&self) -> String {
        RUN_LIST_JOB.to_string()
    }

    async fn run(&self) -> Vec<EngineUpdate> {
        match tokio::time::timeout(self.timeout, self.api.list_runs(&self.filters)).await {
            Ok(Ok(runs)) => {
                let statuses = aggregate(&runs);
                debug!(runs = runs.len(), locales = statuses.len(), "run list aggregated");
                vec![EngineUpdate::LocaleStatuses(statuses)]
            }
            Ok(Err(err)) => vec![EngineUpdate::Notice {
                kind: err.failure_kind(),
                detail: Some(format!("run list refresh failed: {err}")),
            }],
            Err(_) => vec![EngineUpdate::Notice {
                kind: FailureKind::TransientNetwork,
                detail: Some(format!("run list refresh timed out after {:?}", self.timeout)),
            }],
        }
    }
}

/// Keeps one artifact view current. Every poll goes back to the service;
/// the cache only answers when the service cannot.
pub struct ArtifactJob {
    resolver: ArtifactResolver,
    request: ArtifactRequest,
}

impl ArtifactJob {
    pub fn new(resolver: ArtifactResolver, request: ArtifactRequest) -> Self {
        Self { resolver, request }
    }

    pub fn key_for(key: &ArtifactKey) -> String {
        format!("artifact:{key}")
    }
}

#[async_trait]
impl RefreshJob for ArtifactJob {
    fn key(&self) -> String {
        Self::key_for(&self.request.key())
    }

    async fn run(&self) -> Vec<EngineUpdate> {
        let request = self.request.clone().revalidated();
        let result = self.resolver.resolve_request(request).await;
        artifact_updates(self.request.key(), result)
    }
}

/// View updates for one finished resolution. Errors leave the last
/// published artifact in place and only raise a notice.
pub fn artifact_updates(
    key: ArtifactKey,
    result: Result<Resolution, ResolutionError>,
) -> Vec<EngineUpdate> {
    match result {
        Ok(resolution) => {
            let mut updates = Vec::with_capacity(2);
            if resolution == (Resolution::NotAvailable { stale_engine: true }) {
                updates.push(EngineUpdate::Notice {
                    kind: FailureKind::StaleEngineMismatch,
                    detail: Some(format!("no current-engine artifact for {key}")),
                });
            }
            updates.push(EngineUpdate::Artifact { key, resolution });
            updates
        }
        Err(err) => vec![EngineUpdate::Notice {
            kind: err.failure_kind(),
            detail: Some(format!("artifact {key}: {err}")),
        }],
    }
}

/// Resolve once in the background and publish the outcome.
pub fn spawn_artifact_refresh(
    resolver: ArtifactResolver,
    updates: UpdateSender,
    request: ArtifactRequest,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let key = request.key();
        let result = resolver.resolve_request(request).await;
        for update in artifact_updates(key, result) {
            if !updates.send(update).await {
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ApiError;
    use crate::cache::ArtifactCache;
    use crate::testing::FakeApi;
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use telemetry_core::{Classification, LocaleId, Run, RunId, RunStatus, Scenario, ScenarioMetrics};

    fn completed(id: &str, locale: &str, day: u32, clearance: f64) -> Run {
        Run {
            run_id: RunId(id.into()),
            locale: LocaleId(locale.into()),
            status: RunStatus::Completed,
            created_at: Utc.with_ymd_and_hms(2024, 5, day, 10, 0, 0).unwrap(),
            completed_at: Some(Utc.with_ymd_and_hms(2024, 5, day, 11, 0, 0).unwrap()),
            scenarios: vec![Scenario {
                scenario_id: format!("{id}-s1"),
                name: None,
                metrics: Some(ScenarioMetrics {
                    clearance_time: Some(clearance),
                    fairness_index: Some(0.8),
                    robustness: Some(0.75),
                    ..Default::default()
                }),
            }],
        }
    }

    #[tokio::test]
    async fn run_list_job_publishes_aggregated_statuses() {
        let api = Arc::new(FakeApi::default());
        api.set_runs(vec![
            completed("r-1", "Camden", 1, 140.0),
            completed("r-2", "Camden", 2, 160.0),
        ]);
        let job = RunListJob::new(api.clone(), RunFilters::default(), Duration::from_secs(10));
        let updates = job.run().await;
        let [EngineUpdate::LocaleStatuses(statuses)] = updates.as_slice() else {
            panic!("expected one status update, got {updates:?}");
        };
        assert_eq!(statuses.len(), 1);
        assert_eq!(
            statuses[0].metrics.clearance.classification,
            Classification::Amber
        );
    }

    #[tokio::test]
    async fn run_list_failure_only_raises_a_notice() {
        let api = Arc::new(FakeApi::default());
        api.fail_runs(ApiError::Transport("connection refused".into()));
        let job = RunListJob::new(api, RunFilters::default(), Duration::from_secs(10));
        let updates = job.run().await;
        assert!(matches!(
            updates.as_slice(),
            [EngineUpdate::Notice {
                kind: FailureKind::TransientNetwork,
                ..
            }]
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn run_list_timeout_is_transient() {
        let api = Arc::new(FakeApi::default());
        api.set_list_delay(Duration::from_secs(60));
        let job = RunListJob::new(api, RunFilters::default(), Duration::from_secs(10));
        assert!(matches!(
            job.run().await.as_slice(),
            [EngineUpdate::Notice {
                kind: FailureKind::TransientNetwork,
                ..
            }]
        ));
    }

    #[tokio::test]
    async fn artifact_job_flags_engine_mismatch() {
        let api = Arc::new(FakeApi::default());
        let camden = LocaleId("Camden".into());
        api.set_artifact(&camden, Ok(Some(json!({"engine_tag": "legacy-v1", "payload": {}}))));
        let resolver = ArtifactResolver::new(
            api,
            Arc::new(ArtifactCache::new()),
            "behavioral-v2",
            Duration::from_secs(300),
        );
        let job = ArtifactJob::new(resolver, ArtifactRequest::new(camden, None));
        assert_eq!(job.key(), "artifact:camden/latest");
        let updates = job.run().await;
        assert_eq!(updates.len(), 2);
        assert!(matches!(
            updates[0],
            EngineUpdate::Notice {
                kind: FailureKind::StaleEngineMismatch,
                ..
            }
        ));
        assert!(matches!(
            &updates[1],
            EngineUpdate::Artifact {
                resolution: Resolution::NotAvailable { stale_engine: true },
                ..
            }
        ));
    }
}
