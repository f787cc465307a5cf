//! Drives the progress state machine from a live run stream.

use crate::api::{RunApi, RunIntent, RunMode};
use crate::config::EngineConfig;
use crate::hub::{EngineUpdate, UpdateSender};
use chrono::Utc;
use futures::StreamExt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use telemetry_core::{FailureKind, LocaleId, ProgressPhase, ProgressState, RunId};
use telemetry_progress::{ProgressStateMachine, Transition};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Called once when a tracked run reaches `Completed`.
pub trait CompletionHook: Send + Sync {
    fn run_completed(&self, locale: &LocaleId, run_id: Option<&RunId>);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RunTimeouts {
    pub quick: Duration,
    pub full: Duration,
}

impl RunTimeouts {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            quick: config.run_timeout(RunMode::Quick),
            full: config.run_timeout(RunMode::Full),
        }
    }

    pub fn for_mode(&self, mode: RunMode) -> Duration {
        match mode {
            RunMode::Quick => self.quick,
            RunMode::Full => self.full,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Tracks at most one run at a time. Starting a run cancels the previous
/// one; its late updates carry a stale session and are dropped by the hub.
pub struct ProgressTracker {
    api: Arc<dyn RunApi>,
    updates: UpdateSender,
    timeouts: RunTimeouts,
    hook: Option<Arc<dyn CompletionHook>>,
    active: Mutex<Option<JoinHandle<()>>>,
}

impl ProgressTracker {
    pub fn new(api: Arc<dyn RunApi>, updates: UpdateSender, timeouts: RunTimeouts) -> Self {
        Self {
            api,
            updates,
            timeouts,
            hook: None,
            active: Mutex::new(None),
        }
    }

    pub fn with_hook(mut self, hook: Arc<dyn CompletionHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Start a run and track it. Returns the session id of the new tracking.
    pub fn start_run(&self, intent: RunIntent) -> u64 {
        self.abort_active();
        let session = self.updates.begin_session();
        let timeout = self.timeouts.for_mode(intent.mode);
        info!(locale = %intent.locale, mode = ?intent.mode, session, "starting run");
        let task = tokio::spawn(track(
            Arc::clone(&self.api),
            intent,
            timeout,
            self.updates.clone(),
            session,
            self.hook.clone(),
        ));
        *lock(&self.active) = Some(task);
        session
    }

    /// Stop tracking and reset the progress view to `Idle`.
    pub async fn cancel(&self) -> bool {
        let had_run = self.abort_active();
        let session = self.updates.begin_session();
        self.updates
            .send(EngineUpdate::Progress {
                session,
                state: ProgressState::default(),
            })
            .await;
        if had_run {
            info!(session, "run tracking cancelled");
        }
        had_run
    }

    pub fn is_tracking(&self) -> bool {
        lock(&self.active)
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    fn abort_active(&self) -> bool {
        match lock(&self.active).take() {
            Some(task) => {
                let live = !task.is_finished();
                task.abort();
                live
            }
            None => false,
        }
    }
}

impl Drop for ProgressTracker {
    fn drop(&mut self) {
        self.abort_active();
    }
}

async fn publish(updates: &UpdateSender, session: u64, machine: &ProgressStateMachine) {
    updates
        .send(EngineUpdate::Progress {
            session,
            state: machine.state().clone(),
        })
        .await;
}

async fn track(
    api: Arc<dyn RunApi>,
    intent: RunIntent,
    timeout: Duration,
    updates: UpdateSender,
    session: u64,
    hook: Option<Arc<dyn CompletionHook>>,
) {
    let mut machine = ProgressStateMachine::new(timeout);
    machine.begin(None, timeout, Utc::now());
    publish(&updates, session, &machine).await;

    let mut stream = match tokio::time::timeout(timeout, api.start_run(&intent)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(err)) => {
            warn!(locale = %intent.locale, error = %err, "run could not be started");
            machine.fail(Utc::now());
            publish(&updates, session, &machine).await;
            updates
                .notice(err.failure_kind(), Some(format!("starting run failed: {err}")))
                .await;
            return;
        }
        Err(_) => {
            machine.expire();
            publish(&updates, session, &machine).await;
            updates
                .notice(FailureKind::Timeout, Some("run service did not accept the run".into()))
                .await;
            return;
        }
    };

    while machine.is_live() {
        match tokio::time::timeout(machine.timeout(), stream.next()).await {
            Ok(Some(Ok(event))) => {
                if let Transition::Advanced { .. } = machine.apply(&event, Utc::now()) {
                    publish(&updates, session, &machine).await;
                }
            }
            Ok(Some(Err(err))) => {
                warn!(error = %err, "progress stream failed");
                machine.fail(Utc::now());
                publish(&updates, session, &machine).await;
                updates
                    .notice(FailureKind::StreamTerminatedUnexpectedly, Some(err.to_string()))
                    .await;
            }
            Ok(None) => {
                warn!(phase = ?machine.state().phase, "progress stream closed before a terminal status");
                machine.fail(Utc::now());
                publish(&updates, session, &machine).await;
                updates
                    .notice(FailureKind::StreamTerminatedUnexpectedly, None)
                    .await;
            }
            Err(_) => {
                machine.expire();
                publish(&updates, session, &machine).await;
                updates
                    .notice(
                        FailureKind::Timeout,
                        Some(format!("no progress for {:?}", machine.timeout())),
                    )
                    .await;
            }
        }
    }

    let state = machine.state();
    if state.phase == ProgressPhase::Completed {
        if let Some(hook) = hook {
            hook.run_completed(&intent.locale, state.run_id.as_ref());
        }
    }
}
