#![deny(warnings)]

//! Core data model for evacuation run telemetry.
//!
//! This crate defines the serializable records exchanged with the run service
//! (runs, scenarios, artifacts), the fixed metric thresholds, the progress
//! phases of an active run, and validation helpers that guard the invariants
//! the aggregation and resolution layers rely on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Relative change a metric must exceed before its trend counts as moving.
pub const TREND_DEADBAND: f64 = 0.05;

/// Maximum number of completed runs kept per locale in a status row.
pub const RECENT_RUNS_LIMIT: usize = 3;

/// Identifier of one simulation run, as issued by the run service.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RunId(pub String);

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Named place (city, borough) a run targets, e.g. "Westminster".
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LocaleId(pub String);

impl LocaleId {
    /// Case-insensitive grouping key ("Westminster" and " westminster" collide).
    pub fn key(&self) -> String {
        self.0.trim().to_lowercase()
    }

    /// URL-safe form of the locale name, matching [`slugify`].
    pub fn slug(&self) -> String {
        slugify(&self.0)
    }
}

impl fmt::Display for LocaleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle of a run. Moves from `Running` to a terminal state exactly once.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Accepted but not yet scheduled.
    Pending,
    /// Simulation in progress.
    Running,
    /// Finished with results.
    Completed,
    /// Finished without usable results.
    Failed,
}

impl RunStatus {
    /// Whether the run will never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }

    /// Whether the run is still pending or running.
    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }
}

/// Metrics snapshot attached to a scenario once the simulation computed it.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ScenarioMetrics {
    /// Time until the last evacuee is clear, in minutes.
    #[serde(default)]
    pub clearance_time: Option<f64>,
    /// Fairness of clearance across districts, in [0, 1].
    #[serde(default)]
    pub fairness_index: Option<f64>,
    /// Share of perturbed replays that still clear, in [0, 1].
    #[serde(default)]
    pub robustness: Option<f64>,
    /// Any further metrics the engine reports; carried but not governed.
    #[serde(flatten)]
    pub extras: BTreeMap<String, serde_json::Value>,
}

impl ScenarioMetrics {
    /// Value of a governed metric, if reported.
    pub fn get(&self, metric: GovernedMetric) -> Option<f64> {
        match metric {
            GovernedMetric::ClearanceTime => self.clearance_time,
            GovernedMetric::FairnessIndex => self.fairness_index,
            GovernedMetric::Robustness => self.robustness,
        }
    }
}

/// One scenario evaluated by a run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    pub scenario_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub metrics: Option<ScenarioMetrics>,
}

/// A run record, immutable once its status is terminal.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub run_id: RunId,
    pub locale: LocaleId,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub scenarios: Vec<Scenario>,
}

impl Run {
    /// Headline metrics: the first scenario that carries a snapshot.
    pub fn metrics(&self) -> Option<&ScenarioMetrics> {
        self.scenarios.iter().find_map(|s| s.metrics.as_ref())
    }

    /// Headline value of one governed metric.
    pub fn metric(&self, metric: GovernedMetric) -> Option<f64> {
        self.metrics().and_then(|m| m.get(metric))
    }
}

/// The three metrics every locale row is classified on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GovernedMetric {
    ClearanceTime,
    FairnessIndex,
    Robustness,
}

impl GovernedMetric {
    pub const ALL: [GovernedMetric; 3] = [
        GovernedMetric::ClearanceTime,
        GovernedMetric::FairnessIndex,
        GovernedMetric::Robustness,
    ];

    /// Wire name of the metric.
    pub fn name(self) -> &'static str {
        match self {
            GovernedMetric::ClearanceTime => "clearance_time",
            GovernedMetric::FairnessIndex => "fairness_index",
            GovernedMetric::Robustness => "robustness",
        }
    }

    /// The fixed threshold rule for this metric.
    pub fn threshold(self) -> &'static MetricThreshold {
        match self {
            GovernedMetric::ClearanceTime => &CLEARANCE_THRESHOLD,
            GovernedMetric::FairnessIndex => &FAIRNESS_THRESHOLD,
            GovernedMetric::Robustness => &ROBUSTNESS_THRESHOLD,
        }
    }
}

/// Which direction of a metric counts as better.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Polarity {
    LowerIsBetter,
    HigherIsBetter,
}

/// Traffic-light rule for one metric. Bounds are strict: a value equal to a
/// bound falls into the next worse band.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct MetricThreshold {
    pub metric: GovernedMetric,
    pub polarity: Polarity,
    pub green_bound: f64,
    pub red_bound: f64,
}

/// Clearance time in minutes: under 150 is green, under 180 amber.
pub const CLEARANCE_THRESHOLD: MetricThreshold = MetricThreshold {
    metric: GovernedMetric::ClearanceTime,
    polarity: Polarity::LowerIsBetter,
    green_bound: 150.0,
    red_bound: 180.0,
};

/// Fairness index: above 0.8 is green, above 0.6 amber.
pub const FAIRNESS_THRESHOLD: MetricThreshold = MetricThreshold {
    metric: GovernedMetric::FairnessIndex,
    polarity: Polarity::HigherIsBetter,
    green_bound: 0.8,
    red_bound: 0.6,
};

/// Robustness: above 0.7 is green, above 0.5 amber.
pub const ROBUSTNESS_THRESHOLD: MetricThreshold = MetricThreshold {
    metric: GovernedMetric::Robustness,
    polarity: Polarity::HigherIsBetter,
    green_bound: 0.7,
    red_bound: 0.5,
};

/// Traffic-light label of a metric value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Green,
    Amber,
    Red,
    /// No real value to classify.
    Grey,
}

/// Direction of a metric versus the previous completed run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Improving,
    Declining,
    Stable,
    /// No usable previous value.
    None,
}

/// Derived status of one metric. Always produced together from the value
/// that classifies it; never edited in place.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetricStatus {
    pub value: Option<f64>,
    pub classification: Classification,
    pub trend: Trend,
    pub previous_value: Option<f64>,
}

/// Status of the three governed metrics for one locale.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct LocaleMetrics {
    pub clearance: MetricStatus,
    pub fairness: MetricStatus,
    pub robustness: MetricStatus,
}

impl LocaleMetrics {
    pub fn get(&self, metric: GovernedMetric) -> &MetricStatus {
        match metric {
            GovernedMetric::ClearanceTime => &self.clearance,
            GovernedMetric::FairnessIndex => &self.fairness,
            GovernedMetric::Robustness => &self.robustness,
        }
    }
}

/// One row of the locale board, recomputed wholesale on every pass.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LocaleStatus {
    pub locale: LocaleId,
    pub metrics: LocaleMetrics,
    /// Completed runs, newest first, at most [`RECENT_RUNS_LIMIT`].
    pub recent_runs: Vec<Run>,
    /// Runs in this locale that are still pending or running.
    pub active_count: usize,
}

/// Cache address of an artifact: a locale and optionally a specific run.
///
/// The locale is stored by its case-insensitive key so that lookups for
/// "Camden" and "camden" share one entry.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactKey {
    pub locale: LocaleId,
    pub run_id: Option<RunId>,
}

impl ArtifactKey {
    pub fn new(locale: &LocaleId, run_id: Option<RunId>) -> Self {
        Self {
            locale: LocaleId(locale.key()),
            run_id,
        }
    }

    /// Whether both keys address the same locale.
    pub fn same_locale(&self, other: &ArtifactKey) -> bool {
        self.locale == other.locale
    }
}

impl fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.run_id {
            Some(run) => write!(f, "{}/{}", self.locale, run),
            None => write!(f, "{}/latest", self.locale),
        }
    }
}

/// Where a served artifact came from in the resolution cascade.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceTier {
    /// In-memory cache for the exact key.
    Cache,
    /// Live response from the authoritative computation service.
    Authoritative,
    /// Cached record of a related key in the same locale.
    Related,
}

/// Visualization/metrics payload plus the provenance needed to trust it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub engine_tag: String,
    pub payload: serde_json::Value,
    pub fetched_at: DateTime<Utc>,
    pub source_tier: SourceTier,
}

impl ArtifactRecord {
    /// Only records produced by the expected engine may be served.
    pub fn is_valid(&self, expected_tag: &str) -> bool {
        self.engine_tag == expected_tag
    }

    pub fn with_tier(mut self, tier: SourceTier) -> Self {
        self.source_tier = tier;
        self
    }
}

/// Discrete stage of an active run as shown by the progress indicator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProgressPhase {
    Idle,
    Started,
    Planning,
    Simulating,
    Ranking,
    Explaining,
    Completed,
    Failed,
    TimedOut,
}

impl ProgressPhase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ProgressPhase::Completed | ProgressPhase::Failed | ProgressPhase::TimedOut
        )
    }

    /// Position in the forward ordering. `Failed` and `TimedOut` sit outside
    /// it because they are reachable from anywhere.
    pub fn rank(self) -> Option<u8> {
        match self {
            ProgressPhase::Idle => Some(0),
            ProgressPhase::Started => Some(1),
            ProgressPhase::Planning => Some(2),
            ProgressPhase::Simulating => Some(3),
            ProgressPhase::Ranking => Some(4),
            ProgressPhase::Explaining => Some(5),
            ProgressPhase::Completed => Some(6),
            ProgressPhase::Failed | ProgressPhase::TimedOut => None,
        }
    }

    /// Whether moving from `self` to `next` respects the forward ordering.
    pub fn can_advance_to(self, next: ProgressPhase) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self.rank(), next.rank()) {
            (_, None) => true,
            (Some(cur), Some(nxt)) => nxt >= cur,
            (None, Some(_)) => false,
        }
    }

    /// Display percentage reached on entering this phase. `None` for the
    /// phases that keep whatever percentage was last shown.
    pub fn percent(self) -> Option<u8> {
        match self {
            ProgressPhase::Idle => Some(0),
            ProgressPhase::Started => Some(5),
            ProgressPhase::Planning => Some(20),
            ProgressPhase::Simulating => Some(45),
            ProgressPhase::Ranking => Some(70),
            ProgressPhase::Explaining => Some(85),
            ProgressPhase::Completed => Some(100),
            ProgressPhase::Failed | ProgressPhase::TimedOut => None,
        }
    }
}

/// Progress of the single active run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProgressState {
    pub phase: ProgressPhase,
    pub run_id: Option<RunId>,
    pub percent: u8,
    pub last_event_at: Option<DateTime<Utc>>,
}

impl Default for ProgressState {
    fn default() -> Self {
        Self {
            phase: ProgressPhase::Idle,
            run_id: None,
            percent: 0,
            last_event_at: None,
        }
    }
}

/// A locale the operator chose to follow, persisted on the client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedLocation {
    pub id: i64,
    pub name: String,
    pub slug: String,
    pub date_added: DateTime<Utc>,
}

/// User-facing failure categories.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Network hiccup; the next background refresh retries on its own.
    TransientNetwork,
    /// Every source only had results from a non-authoritative engine.
    StaleEngineMismatch,
    /// A payload could not be decoded; treated as absent data.
    MalformedPayload,
    /// The service refused the request outright (a non-retryable 4xx).
    ServiceRejected,
    /// The progress stream ended before a terminal status.
    StreamTerminatedUnexpectedly,
    /// No progress arrived within the ceiling; the job may still be running.
    Timeout,
}

impl FailureKind {
    /// Whether the UI should offer a retry or re-check control.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            FailureKind::TransientNetwork
                | FailureKind::StreamTerminatedUnexpectedly
                | FailureKind::Timeout
        )
    }

    pub fn user_message(self) -> &'static str {
        match self {
            FailureKind::TransientNetwork => {
                "Could not reach the simulation service. Data will refresh automatically."
            }
            FailureKind::StaleEngineMismatch => {
                "No results from the current simulation engine are available yet."
            }
            FailureKind::MalformedPayload => "Some results could not be read and were skipped.",
            FailureKind::ServiceRejected => {
                "The simulation service refused the request. Check access and settings."
            }
            FailureKind::StreamTerminatedUnexpectedly => {
                "The connection to the running simulation was lost. Try again."
            }
            FailureKind::Timeout => {
                "No progress received for a while. The simulation may still be running; check its status."
            }
        }
    }
}

/// Dismissible banner describing a surfaced failure.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    pub id: u64,
    pub kind: FailureKind,
    pub message: String,
}

/// Lowercase ASCII slug: alphanumerics kept, every other run collapsed to
/// one dash, no leading or trailing dash.
pub fn slugify(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut pending_dash = false;
    for ch in name.trim().chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.push(ch.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    out
}

/// Validation errors for run records.
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    /// Run identifier is blank.
    #[error("run id is empty")]
    EmptyRunId,
    /// Locale name is blank.
    #[error("run {0} has an empty locale")]
    EmptyLocale(String),
    /// Completion timestamp precedes creation.
    #[error("run {0} completed before it was created")]
    CompletedBeforeCreated(String),
    /// Metric value is NaN or infinite.
    #[error("metric {0} is not finite")]
    NonFinite(&'static str),
    /// Metric value is negative.
    #[error("metric {metric} is negative: {value}")]
    NegativeMetric { metric: &'static str, value: f64 },
}

/// Validate the governed metrics of one snapshot.
pub fn validate_metrics(m: &ScenarioMetrics) -> Result<(), ValidationError> {
    for metric in GovernedMetric::ALL {
        if let Some(value) = m.get(metric) {
            if !value.is_finite() {
                return Err(ValidationError::NonFinite(metric.name()));
            }
            if value < 0.0 {
                return Err(ValidationError::NegativeMetric {
                    metric: metric.name(),
                    value,
                });
            }
        }
    }
    Ok(())
}

/// Validate a run record, including every scenario's metrics.
pub fn validate_run(run: &Run) -> Result<(), ValidationError> {
    if run.run_id.0.trim().is_empty() {
        return Err(ValidationError::EmptyRunId);
    }
    if run.locale.key().is_empty() {
        return Err(ValidationError::EmptyLocale(run.run_id.0.clone()));
    }
    if let Some(done) = run.completed_at {
        if done < run.created_at {
            return Err(ValidationError::CompletedBeforeCreated(run.run_id.0.clone()));
        }
    }
    for scenario in &run.scenarios {
        if let Some(m) = &scenario.metrics {
            validate_metrics(m)?;
        }
    }
    Ok(())
}
