#![deny(warnings)]

//! Live progress of an active run.
//!
//! The run service reports progress as a text-framed event stream of mostly
//! free-text messages. [`frames`] decodes the wire format into
//! [`ProgressEvent`]s, [`classify`] maps each event onto a best-effort
//! [`PhaseHint`], and [`machine::ProgressStateMachine`] folds hints into a
//! strictly forward-moving [`telemetry_core::ProgressState`].

pub mod classify;
pub mod frames;
pub mod machine;

pub use classify::{classify, PhaseHint};
pub use frames::{FrameDecoder, FrameError};
pub use machine::{IgnoreReason, ProgressStateMachine, Transition};

use serde::{Deserialize, Serialize};
use telemetry_core::RunId;

/// Structured status carried by some progress events.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamStatus {
    Started,
    Running,
    Completed,
    Failed,
}

impl StreamStatus {
    /// Lenient parse of the status vocabulary the service uses.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "started" | "start" | "accepted" => Some(StreamStatus::Started),
            "running" | "in_progress" | "progress" => Some(StreamStatus::Running),
            "completed" | "complete" | "done" | "success" => Some(StreamStatus::Completed),
            "failed" | "failure" | "error" => Some(StreamStatus::Failed),
            _ => None,
        }
    }
}

/// One decoded progress event.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// Event kind named by the preceding `event:` line.
    pub kind: Option<String>,
    /// Human-readable progress text; may be empty.
    pub message: String,
    pub status: Option<StreamStatus>,
    pub run_id: Option<RunId>,
    /// The event carries ranking results.
    pub ranking: bool,
    /// The event carries an answer or explanation.
    pub answer: bool,
}

const MESSAGE_KEYS: [&str; 4] = ["message", "stage", "detail", "step"];
const RANKING_KEYS: [&str; 3] = ["ranking", "rankings", "ranked_scenarios"];
const ANSWER_KEYS: [&str; 2] = ["answer", "explanation"];

impl ProgressEvent {
    pub fn message(text: impl Into<String>) -> Self {
        Self {
            message: text.into(),
            ..Default::default()
        }
    }

    pub fn status(status: StreamStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn for_run(mut self, run_id: RunId) -> Self {
        self.run_id = Some(run_id);
        self
    }

    /// Build an event from a `data:` payload and the current event kind.
    ///
    /// Objects contribute `run_id`, `status`, a message field and ranking or
    /// answer signals; a bare JSON string is taken as the message. When the
    /// payload has no status, the event kind may supply one ("error").
    pub fn from_payload(kind: Option<&str>, payload: &serde_json::Value) -> Result<Self, FrameError> {
        let mut event = ProgressEvent {
            kind: kind.map(str::to_string),
            ..Default::default()
        };
        match payload {
            serde_json::Value::String(text) => event.message = text.clone(),
            serde_json::Value::Object(map) => {
                let present = |key: &str| map.get(key).is_some_and(|v| !v.is_null());
                event.run_id = map
                    .get("run_id")
                    .and_then(|v| v.as_str())
                    .map(|s| RunId(s.to_string()));
                event.status = map
                    .get("status")
                    .and_then(|v| v.as_str())
                    .and_then(StreamStatus::parse);
                event.message = MESSAGE_KEYS
                    .iter()
                    .find_map(|key| map.get(*key).and_then(|v| v.as_str()))
                    .unwrap_or_default()
                    .to_string();
                event.ranking = RANKING_KEYS.iter().any(|key| present(*key));
                event.answer = ANSWER_KEYS.iter().any(|key| present(*key));
            }
            _ => return Err(FrameError::UnsupportedPayload),
        }
        if let Some(kind) = kind {
            let kind = kind.trim().to_ascii_lowercase();
            if event.status.is_none() {
                event.status = StreamStatus::parse(&kind);
            }
            event.ranking |= kind == "ranking";
            event.answer |= kind == "answer" || kind == "explanation";
        }
        Ok(event)
    }
}
