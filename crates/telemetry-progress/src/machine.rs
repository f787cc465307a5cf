//! Monotonic progress state machine for one active run.

use crate::{classify, ProgressEvent, StreamStatus};
use chrono::{DateTime, Utc};
use std::time::Duration;
use telemetry_core::{ProgressPhase, ProgressState, RunId};
use tracing::{debug, info, warn};

/// Why an event left the state untouched.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IgnoreReason {
    /// No run has been started.
    NoActiveRun,
    /// The event names a different run.
    ForeignRun,
    /// The run already reached a terminal phase.
    Terminal,
}

/// Outcome of feeding one event to the machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    /// The phase moved forward (or into a failure phase).
    Advanced {
        from: ProgressPhase,
        to: ProgressPhase,
    },
    /// The event was accepted as a liveness signal but the phase stays.
    Held(ProgressPhase),
    /// The event was discarded.
    Ignored(IgnoreReason),
}

/// Folds progress events into a [`ProgressState`] that only moves forward.
///
/// Each run gets a silence ceiling: when no event arrives within it while the
/// run is not terminal, the machine moves to `TimedOut`, which is distinct
/// from `Failed` because the job may still be running server-side.
#[derive(Debug, Clone)]
pub struct ProgressStateMachine {
    state: ProgressState,
    timeout: Duration,
    armed: bool,
}

impl ProgressStateMachine {
    pub fn new(timeout: Duration) -> Self {
        Self {
            state: ProgressState::default(),
            timeout,
            armed: false,
        }
    }

    pub fn state(&self) -> &ProgressState {
        &self.state
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Whether a run is being tracked and has not reached a terminal phase.
    pub fn is_live(&self) -> bool {
        self.armed && !self.state.phase.is_terminal()
    }

    /// Reset to `Idle` for a new run. The run id may be unknown until the
    /// service's `started` event names it.
    pub fn begin(&mut self, run_id: Option<RunId>, timeout: Duration, now: DateTime<Utc>) {
        self.state = ProgressState {
            phase: ProgressPhase::Idle,
            run_id,
            percent: 0,
            last_event_at: Some(now),
        };
        self.timeout = timeout;
        self.armed = true;
    }

    /// Apply one streamed event.
    pub fn apply(&mut self, event: &ProgressEvent, now: DateTime<Utc>) -> Transition {
        if !self.armed {
            return Transition::Ignored(IgnoreReason::NoActiveRun);
        }
        if self.state.phase.is_terminal() {
            debug!(phase = ?self.state.phase, "event after terminal phase ignored");
            return Transition::Ignored(IgnoreReason::Terminal);
        }
        match (&self.state.run_id, &event.run_id) {
            (Some(ours), Some(theirs)) if ours != theirs => {
                debug!(ours = %ours, theirs = %theirs, "event for another run ignored");
                return Transition::Ignored(IgnoreReason::ForeignRun);
            }
            (None, Some(theirs)) => self.state.run_id = Some(theirs.clone()),
            _ => {}
        }
        self.state.last_event_at = Some(now);

        let from = self.state.phase;
        let hinted = match classify(event).phase() {
            Some(next) => self.enter(next),
            None => Transition::Held(from),
        };
        // A terminal status wins even when the text matched an earlier phase.
        let terminal = match event.status {
            Some(StreamStatus::Completed) => ProgressPhase::Completed,
            Some(StreamStatus::Failed) => ProgressPhase::Failed,
            _ => return hinted,
        };
        if self.state.phase.is_terminal() {
            return hinted;
        }
        match self.enter(terminal) {
            Transition::Advanced { to, .. } => Transition::Advanced { from, to },
            _ => hinted,
        }
    }

    /// The stream broke before a terminal status arrived.
    pub fn fail(&mut self, now: DateTime<Utc>) -> Transition {
        if !self.is_live() {
            return self.not_live();
        }
        self.state.last_event_at = Some(now);
        self.enter(ProgressPhase::Failed)
    }

    /// Force `TimedOut`; the caller already knows the ceiling elapsed.
    pub fn expire(&mut self) -> Transition {
        if !self.is_live() {
            return self.not_live();
        }
        warn!(run_id = ?self.state.run_id, timeout = ?self.timeout, "no progress within ceiling");
        self.enter(ProgressPhase::TimedOut)
    }

    /// Move to `TimedOut` if the silence ceiling elapsed by `now`.
    pub fn check_timeout(&mut self, now: DateTime<Utc>) -> bool {
        if !self.is_live() {
            return false;
        }
        let Some(last) = self.state.last_event_at else {
            return false;
        };
        match (now - last).to_std() {
            Ok(elapsed) if elapsed >= self.timeout => {
                self.expire();
                true
            }
            _ => false,
        }
    }

    /// When the run times out if nothing else arrives.
    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        if !self.is_live() {
            return None;
        }
        let last = self.state.last_event_at?;
        Some(last + chrono::Duration::from_std(self.timeout).ok()?)
    }

    fn not_live(&self) -> Transition {
        if self.armed {
            Transition::Ignored(IgnoreReason::Terminal)
        } else {
            Transition::Ignored(IgnoreReason::NoActiveRun)
        }
    }

    fn enter(&mut self, next: ProgressPhase) -> Transition {
        let from = self.state.phase;
        if !from.can_advance_to(next) {
            debug!(from = ?from, refused = ?next, "phase regression refused");
            return Transition::Held(from);
        }
        if from == next {
            return Transition::Held(from);
        }
        self.state.phase = next;
        if let Some(p) = next.percent() {
            self.state.percent = self.state.percent.max(p);
        }
        info!(run_id = ?self.state.run_id, from = ?from, to = ?next, percent = self.state.percent, "progress phase changed");
        Transition::Advanced { from, to: next }
    }
}
