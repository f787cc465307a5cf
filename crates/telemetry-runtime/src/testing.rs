//! Scriptable in-memory run service for tests.

use crate::api::{ApiError, ArtifactQuery, EventStream, RunApi, RunFilters, RunIntent};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use telemetry_core::{LocaleId, Run, RunId};
use telemetry_progress::ProgressEvent;

/// Scripted progress stream: events spaced by `gap`, then either end or
/// go silent forever.
#[derive(Clone, Debug, Default)]
pub struct StreamScript {
    pub events: Vec<Result<ProgressEvent, ApiError>>,
    pub gap: Duration,
    pub hang: bool,
}

#[derive(Default)]
pub struct FakeApi {
    runs: Mutex<Vec<Run>>,
    runs_error: Mutex<Option<ApiError>>,
    list_delay: Mutex<Duration>,
    list_calls: AtomicUsize,
    artifacts: Mutex<HashMap<String, Result<Option<serde_json::Value>, ApiError>>>,
    artifact_delay: Mutex<Duration>,
    artifact_calls: AtomicUsize,
    last_query: Mutex<Option<ArtifactQuery>>,
    streams: Mutex<VecDeque<StreamScript>>,
    start_calls: AtomicUsize,
}

impl FakeApi {
    pub fn set_runs(&self, runs: Vec<Run>) {
        *self.runs.lock().unwrap() = runs;
        *self.runs_error.lock().unwrap() = None;
    }

    pub fn fail_runs(&self, err: ApiError) {
        *self.runs_error.lock().unwrap() = Some(err);
    }

    pub fn set_list_delay(&self, delay: Duration) {
        *self.list_delay.lock().unwrap() = delay;
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn set_artifact(&self, locale: &LocaleId, body: Result<Option<serde_json::Value>, ApiError>) {
        self.artifacts.lock().unwrap().insert(locale.key(), body);
    }

    pub fn set_artifact_delay(&self, delay: Duration) {
        *self.artifact_delay.lock().unwrap() = delay;
    }

    pub fn artifact_calls(&self) -> usize {
        self.artifact_calls.load(Ordering::SeqCst)
    }

    pub fn last_artifact_query(&self) -> Option<ArtifactQuery> {
        self.last_query.lock().unwrap().clone()
    }

    pub fn push_stream(&self, script: StreamScript) {
        self.streams.lock().unwrap().push_back(script);
    }

    pub fn start_calls(&self) -> usize {
        self.start_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RunApi for FakeApi {
    async fn list_runs(&self, _filters: &RunFilters) -> Result<Vec<Run>, ApiError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.list_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = self.runs_error.lock().unwrap().clone() {
            return Err(err);
        }
        Ok(self.runs.lock().unwrap().clone())
    }

    async fn get_run(&self, run_id: &RunId) -> Result<Run, ApiError> {
        self.runs
            .lock()
            .unwrap()
            .iter()
            .find(|run| &run.run_id == run_id)
            .cloned()
            .ok_or(ApiError::Status(404))
    }

    async fn get_artifact(
        &self,
        locale: &LocaleId,
        query: &ArtifactQuery,
    ) -> Result<Option<serde_json::Value>, ApiError> {
        self.artifact_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_query.lock().unwrap() = Some(query.clone());
        let delay = *self.artifact_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.artifacts
            .lock()
            .unwrap()
            .get(&locale.key())
            .cloned()
            .unwrap_or(Ok(None))
    }

    async fn list_locales(&self) -> Result<Vec<LocaleId>, ApiError> {
        let mut locales: Vec<LocaleId> = self
            .runs
            .lock()
            .unwrap()
            .iter()
            .map(|run| run.locale.clone())
            .collect();
        locales.sort();
        locales.dedup();
        Ok(locales)
    }

    async fn start_run(&self, _intent: &RunIntent) -> Result<EventStream, ApiError> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        let script = self
            .streams
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| ApiError::Transport("no stream scripted".into()))?;
        let gap = script.gap;
        let events = futures::stream::iter(script.events).then(move |event| async move {
            if !gap.is_zero() {
                tokio::time::sleep(gap).await;
            }
            event
        });
        let tail = if script.hang {
            futures::stream::pending().boxed()
        } else {
            futures::stream::empty().boxed()
        };
        Ok(events.chain(tail).boxed())
    }
}
