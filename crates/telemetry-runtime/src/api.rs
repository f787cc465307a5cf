//! Consumed run service contract.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use telemetry_core::{FailureKind, LocaleId, Run, RunId, RunStatus};
use telemetry_progress::ProgressEvent;
use thiserror::Error;
use tracing::warn;

#[derive(Clone, Debug, Error, PartialEq)]
pub enum ApiError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("service returned status {0}")]
    Status(u16),
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl ApiError {
    /// Whether retrying the same request later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ApiError::Transport(_) | ApiError::Timeout(_) => true,
            ApiError::Status(code) => *code >= 500 || *code == 429,
            ApiError::Malformed(_) => false,
        }
    }

    pub fn failure_kind(&self) -> FailureKind {
        match self {
            ApiError::Malformed(_) => FailureKind::MalformedPayload,
            ApiError::Status(_) if !self.is_transient() => FailureKind::ServiceRejected,
            _ => FailureKind::TransientNetwork,
        }
    }
}

/// Query for the run listing.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct RunFilters {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<RunStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ArtifactQuery {
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub force_refresh: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<RunId>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Single-scenario evaluation.
    #[default]
    Quick,
    /// Full planning: generation, simulation, ranking and explanation.
    Full,
}

/// What the operator asked the service to do.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunIntent {
    pub locale: LocaleId,
    pub prompt: String,
    #[serde(default)]
    pub mode: RunMode,
}

pub type EventStream = BoxStream<'static, Result<ProgressEvent, ApiError>>;

/// The run service as seen by the engine.
#[async_trait]
pub trait RunApi: Send + Sync {
    async fn list_runs(&self, filters: &RunFilters) -> Result<Vec<Run>, ApiError>;

    async fn get_run(&self, run_id: &RunId) -> Result<Run, ApiError>;

    /// Raw artifact body for a locale, `None` when the service has none.
    /// May trigger server-side computation and take long.
    async fn get_artifact(
        &self,
        locale: &LocaleId,
        query: &ArtifactQuery,
    ) -> Result<Option<serde_json::Value>, ApiError>;

    async fn list_locales(&self) -> Result<Vec<LocaleId>, ApiError>;

    /// Start a run and subscribe to its progress stream.
    async fn start_run(&self, intent: &RunIntent) -> Result<EventStream, ApiError>;
}

/// Decode run records one at a time; a bad record is logged and skipped so
/// it cannot blank out the rest of the listing.
pub fn decode_runs(records: Vec<serde_json::Value>) -> Vec<Run> {
    records
        .into_iter()
        .enumerate()
        .filter_map(|(idx, raw)| match serde_json::from_value::<Run>(raw) {
            Ok(run) => Some(run),
            Err(err) => {
                warn!(index = idx, error = %err, "skipping malformed run record");
                None
            }
        })
        .collect()
}
