//! Heuristic mapping from a progress event to the phase it suggests.
//!
//! Rules are checked in a fixed priority order and the first match wins, so
//! a message that fits several vocabularies still has one answer. The hint
//! is advisory: the state machine decides whether it may be applied.

use crate::{ProgressEvent, StreamStatus};
use once_cell::sync::Lazy;
use regex::Regex;
use telemetry_core::ProgressPhase;

/// Phase suggested by one event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PhaseHint {
    Started,
    Planning,
    Simulating,
    Ranking,
    Explaining,
    Completed,
    Failed,
    /// Nothing recognizable; the event only proves the stream is alive.
    Unrecognized,
}

impl PhaseHint {
    pub fn phase(self) -> Option<ProgressPhase> {
        match self {
            PhaseHint::Started => Some(ProgressPhase::Started),
            PhaseHint::Planning => Some(ProgressPhase::Planning),
            PhaseHint::Simulating => Some(ProgressPhase::Simulating),
            PhaseHint::Ranking => Some(ProgressPhase::Ranking),
            PhaseHint::Explaining => Some(ProgressPhase::Explaining),
            PhaseHint::Completed => Some(ProgressPhase::Completed),
            PhaseHint::Failed => Some(ProgressPhase::Failed),
            PhaseHint::Unrecognized => None,
        }
    }
}

// "scenario" only counts as planning when it is being produced; a bare
// "ranking scenarios" belongs to the ranking rule.
static PLANNING: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\bplan(s|ning|ner)?\b|\b(generat|creat|build|draft|prepar|design)\w*\s+(\w+\s+){0,2}scenarios?\b|\bscenarios?\s+(generation|planning|design|creation)\b",
    )
    .expect("planning vocabulary is a valid regex")
});

static SIMULATING: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bsimulat\w*\b|\brunning\b").expect("simulation vocabulary is a valid regex")
});

static RANKING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\brank\w*\b").expect("ranking vocabulary is a valid regex"));

/// Classify one event. Pure; never looks at the current phase.
pub fn classify(event: &ProgressEvent) -> PhaseHint {
    let msg = event.message.as_str();
    if event.status == Some(StreamStatus::Started) {
        PhaseHint::Started
    } else if PLANNING.is_match(msg) {
        PhaseHint::Planning
    } else if SIMULATING.is_match(msg) {
        PhaseHint::Simulating
    } else if event.ranking || RANKING.is_match(msg) {
        PhaseHint::Ranking
    } else if event.answer {
        PhaseHint::Explaining
    } else if event.status == Some(StreamStatus::Completed) {
        PhaseHint::Completed
    } else if event.status == Some(StreamStatus::Failed) {
        PhaseHint::Failed
    } else {
        PhaseHint::Unrecognized
    }
}
