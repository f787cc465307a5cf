//! The assembled telemetry engine.

use crate::api::{ApiError, RunApi, RunFilters, RunIntent};
use crate::cache::ArtifactCache;
use crate::config::{ConfigError, EngineConfig};
use crate::http::HttpRunApi;
use crate::hub::{EngineUpdate, HubViews, StateHub, UpdateSender};
use crate::jobs::{artifact_updates, spawn_artifact_refresh, ArtifactJob, RunListJob};
use crate::resolver::{ArtifactRequest, ArtifactResolver, Resolution, ResolutionError};
use crate::scheduler::{PollingScheduler, SchedulerHandle};
use crate::tracker::{CompletionHook, ProgressTracker, RunTimeouts};
use std::sync::Arc;
use telemetry_core::{
    ArtifactKey, LocaleId, LocaleStatus, Notice, ProgressState, RunId, RunStatus, TrackedLocation,
};
use telemetry_trend::{tracked_view, TrackedLocale};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Api(#[from] ApiError),
}

/// Refreshes the run list and the locale's latest artifact once a tracked
/// run completes.
struct RefreshOnCompletion {
    scheduler: SchedulerHandle,
    resolver: ArtifactResolver,
    updates: UpdateSender,
}

impl CompletionHook for RefreshOnCompletion {
    fn run_completed(&self, locale: &LocaleId, run_id: Option<&RunId>) {
        info!(locale = %locale, run_id = ?run_id, "run completed; refreshing");
        self.scheduler.trigger_now();
        spawn_artifact_refresh(
            self.resolver.clone(),
            self.updates.clone(),
            ArtifactRequest::new(locale.clone(), None).forced(),
        );
    }
}

pub struct TelemetryEngine {
    config: EngineConfig,
    api: Arc<dyn RunApi>,
    resolver: ArtifactResolver,
    hub: StateHub,
    scheduler: PollingScheduler,
    tracker: ProgressTracker,
    tracked: Vec<TrackedLocation>,
}

impl TelemetryEngine {
    /// Assemble the engine. Must be called inside a tokio runtime; nothing
    /// polls until [`TelemetryEngine::start`].
    pub fn new(config: EngineConfig, api: Arc<dyn RunApi>) -> Result<Self, EngineError> {
        config.validate()?;
        let hub = StateHub::spawn(config.update_queue_depth);
        let resolver = ArtifactResolver::new(
            Arc::clone(&api),
            Arc::new(ArtifactCache::new()),
            config.engine_tag.clone(),
            config.compute_timeout(),
        );
        let scheduler = PollingScheduler::new(config.poll_interval(), hub.sender());
        scheduler.add_job(Arc::new(RunListJob::new(
            Arc::clone(&api),
            RunFilters::default(),
            config.status_timeout(),
        )));
        let hook = RefreshOnCompletion {
            scheduler: scheduler.handle(),
            resolver: resolver.clone(),
            updates: hub.sender(),
        };
        let tracker = ProgressTracker::new(
            Arc::clone(&api),
            hub.sender(),
            RunTimeouts::from_config(&config),
        )
        .with_hook(Arc::new(hook));
        Ok(Self {
            config,
            api,
            resolver,
            hub,
            scheduler,
            tracker,
            tracked: Vec::new(),
        })
    }

    /// Engine talking to the run service over HTTP.
    pub fn connect(config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        let api = Arc::new(HttpRunApi::new(&config)?);
        Self::new(config, api)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn start(&mut self) {
        self.scheduler.start();
        info!(base_url = %self.config.base_url, engine_tag = %self.config.engine_tag, "telemetry engine started");
    }

    pub fn views(&self) -> HubViews {
        self.hub.views()
    }

    pub fn locale_statuses(&self) -> Arc<Vec<LocaleStatus>> {
        self.hub.views().locales.borrow().clone()
    }

    pub fn progress(&self) -> ProgressState {
        self.hub.views().progress.borrow().clone()
    }

    pub fn notices(&self) -> Arc<Vec<Notice>> {
        self.hub.views().notices.borrow().clone()
    }

    pub async fn dismiss_notice(&self, id: u64) {
        self.hub.sender().send(EngineUpdate::DismissNotice(id)).await;
    }

    /// Refresh every background view now.
    pub fn refresh_now(&self) -> usize {
        self.scheduler.trigger_now()
    }

    /// Resolve an artifact on demand and publish the outcome.
    pub async fn resolve_artifact(
        &self,
        locale: &LocaleId,
        run_id: Option<RunId>,
    ) -> Result<Resolution, ResolutionError> {
        let request = ArtifactRequest::new(locale.clone(), run_id);
        let key = request.key();
        let result = self.resolver.resolve_request(request).await;
        let updates = self.hub.sender();
        for update in artifact_updates(key, result.clone()) {
            updates.send(update).await;
        }
        result
    }

    /// Keep an artifact view current on every poll.
    pub fn watch_artifact(&self, locale: &LocaleId, run_id: Option<RunId>) {
        let request = ArtifactRequest::new(locale.clone(), run_id);
        self.scheduler
            .add_job(Arc::new(ArtifactJob::new(self.resolver.clone(), request)));
    }

    /// Stop refreshing an artifact and drop it from the artifact view.
    pub async fn unwatch_artifact(&self, locale: &LocaleId, run_id: Option<RunId>) -> bool {
        let key = ArtifactKey::new(locale, run_id.clone());
        let removed = self.scheduler.remove_job(&ArtifactJob::key_for(&key));
        self.forget_artifact(locale, run_id).await;
        removed
    }

    /// Drop an artifact the caller no longer displays from the view.
    pub async fn forget_artifact(&self, locale: &LocaleId, run_id: Option<RunId>) {
        let key = ArtifactKey::new(locale, run_id);
        self.hub
            .sender()
            .send(EngineUpdate::ForgetArtifact(key))
            .await;
    }

    /// Start a run; any run already being tracked is cancelled first.
    pub fn start_run(&self, intent: RunIntent) -> u64 {
        self.tracker.start_run(intent)
    }

    pub async fn cancel_run(&self) -> bool {
        self.tracker.cancel().await
    }

    /// Ask the service for a run's real status, e.g. after a progress
    /// timeout. Refreshes the views but never touches the progress state.
    pub async fn recheck_run(&self, run_id: &RunId) -> Result<RunStatus, ApiError> {
        let timeout = self.config.status_timeout();
        let run = tokio::time::timeout(timeout, self.api.get_run(run_id))
            .await
            .map_err(|_| ApiError::Timeout(timeout))??;
        info!(run_id = %run_id, status = ?run.status, "run re-checked");
        self.scheduler.trigger_now();
        if run.status == RunStatus::Completed {
            spawn_artifact_refresh(
                self.resolver.clone(),
                self.hub.sender(),
                ArtifactRequest::new(run.locale.clone(), None).forced(),
            );
        }
        Ok(run.status)
    }

    pub async fn list_locales(&self) -> Result<Vec<LocaleId>, ApiError> {
        let timeout = self.config.status_timeout();
        tokio::time::timeout(timeout, self.api.list_locales())
            .await
            .map_err(|_| ApiError::Timeout(timeout))?
    }

    /// Replace the operator's tracked locations, e.g. after loading them
    /// from the store.
    pub fn set_tracked(&mut self, tracked: Vec<TrackedLocation>) {
        self.tracked = tracked;
    }

    pub fn tracked_view(&self) -> Vec<TrackedLocale> {
        tracked_view(&self.locale_statuses(), &self.tracked)
    }

    /// Stop polling and close the update queue. A tracked run is abandoned.
    pub fn shutdown(mut self) {
        self.scheduler.teardown();
        self.hub.shutdown();
        info!("telemetry engine shut down");
    }
}
