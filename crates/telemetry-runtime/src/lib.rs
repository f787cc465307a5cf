#![deny(warnings)]

//! Runtime of the telemetry engine: the run service seam, artifact
//! resolution, background polling, live progress tracking and the update
//! hub that serializes every view change.

pub mod api;
pub mod cache;
pub mod config;
pub mod engine;
pub mod http;
pub mod hub;
pub mod jobs;
pub mod resolver;
pub mod scheduler;
pub mod tracker;

#[cfg(test)]
pub(crate) mod testing;

pub use api::{ApiError, ArtifactQuery, EventStream, RunApi, RunFilters, RunIntent, RunMode};
pub use cache::ArtifactCache;
pub use config::{ConfigError, EngineConfig};
pub use engine::{EngineError, TelemetryEngine};
pub use http::HttpRunApi;
pub use hub::{EngineUpdate, HubViews, StateHub, UpdateSender};
pub use resolver::{ArtifactRequest, ArtifactResolver, Resolution, ResolutionError, TierOutcome};
pub use scheduler::{PollingScheduler, RefreshJob, SchedulerHandle};
pub use tracker::{CompletionHook, ProgressTracker, RunTimeouts};
