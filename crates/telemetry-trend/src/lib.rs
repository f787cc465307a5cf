#![deny(warnings)]

//! Locale status aggregation: threshold classification and trend detection.
//!
//! Everything here is a pure function of its input:
//! - Traffic-light classification of a metric value against its fixed rule
//! - Trend of a metric versus the previous completed run (5% deadband)
//! - Grouping of a run snapshot into per-locale status rows
//! - Joining status rows with the persisted list of tracked locations

use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use telemetry_core::{
    validate_run, Classification, GovernedMetric, LocaleMetrics, LocaleStatus, MetricStatus,
    MetricThreshold, Polarity, Run, RunStatus, TrackedLocation, Trend, RECENT_RUNS_LIMIT,
    TREND_DEADBAND,
};
use tracing::{debug, warn};

/// A value worth classifying: reported, finite and non-zero.
fn real_value(value: Option<f64>) -> Option<f64> {
    value.filter(|v| v.is_finite() && *v != 0.0)
}

/// Classify a metric value. Bounds are strict, so a value sitting exactly on
/// a bound lands in the worse band. Missing or zero values are grey.
///
/// Example:
/// assert_eq!(classify(Some(150.0), &CLEARANCE_THRESHOLD), Classification::Amber);
pub fn classify(value: Option<f64>, threshold: &MetricThreshold) -> Classification {
    let Some(v) = real_value(value) else {
        return Classification::Grey;
    };
    match threshold.polarity {
        Polarity::LowerIsBetter => {
            if v < threshold.green_bound {
                Classification::Green
            } else if v < threshold.red_bound {
                Classification::Amber
            } else {
                Classification::Red
            }
        }
        Polarity::HigherIsBetter => {
            if v > threshold.green_bound {
                Classification::Green
            } else if v > threshold.red_bound {
                Classification::Amber
            } else {
                Classification::Red
            }
        }
    }
}

/// Polarity-adjusted relative change: positive always means "got better".
///
/// Returns `None` when either side is missing or zero.
pub fn relative_change(current: Option<f64>, previous: Option<f64>, polarity: Polarity) -> Option<f64> {
    let current = real_value(current)?;
    let previous = real_value(previous)?;
    let change = match polarity {
        Polarity::LowerIsBetter => (previous - current) / previous,
        Polarity::HigherIsBetter => (current - previous) / previous,
    };
    change.is_finite().then_some(change)
}

/// Map a polarity-adjusted change onto a trend. Exactly ±0.05 is stable.
pub fn trend_from_change(change: f64) -> Trend {
    if change > TREND_DEADBAND {
        Trend::Improving
    } else if change < -TREND_DEADBAND {
        Trend::Declining
    } else {
        Trend::Stable
    }
}

/// Trend of a metric between two completed runs.
pub fn trend(current: Option<f64>, previous: Option<f64>, polarity: Polarity) -> Trend {
    match relative_change(current, previous, polarity) {
        Some(change) => trend_from_change(change),
        None => Trend::None,
    }
}

/// Build the full status of one metric from the values that drive it.
pub fn metric_status(
    current: Option<f64>,
    previous: Option<f64>,
    threshold: &MetricThreshold,
) -> MetricStatus {
    MetricStatus {
        value: current,
        classification: classify(current, threshold),
        trend: trend(current, previous, threshold.polarity),
        previous_value: previous,
    }
}

fn newest_first(a: &&Run, b: &&Run) -> Ordering {
    b.created_at
        .cmp(&a.created_at)
        .then_with(|| a.run_id.cmp(&b.run_id))
}

fn status_for(metric: GovernedMetric, current: Option<&Run>, previous: Option<&Run>) -> MetricStatus {
    metric_status(
        current.and_then(|r| r.metric(metric)),
        previous.and_then(|r| r.metric(metric)),
        metric.threshold(),
    )
}

/// Status row of one locale plus the timestamp it is ordered by.
fn locale_status(runs: &[&Run]) -> Option<(DateTime<Utc>, LocaleStatus)> {
    let mut completed: Vec<&Run> = runs
        .iter()
        .copied()
        .filter(|r| r.status == RunStatus::Completed)
        .collect();
    let mut active: Vec<&Run> = runs.iter().copied().filter(|r| r.status.is_active()).collect();
    if completed.is_empty() && active.is_empty() {
        return None;
    }
    completed.sort_by(newest_first);
    active.sort_by(newest_first);

    let current = completed.first().copied();
    let previous = completed.get(1).copied();
    let metrics = LocaleMetrics {
        clearance: status_for(GovernedMetric::ClearanceTime, current, previous),
        fairness: status_for(GovernedMetric::FairnessIndex, current, previous),
        robustness: status_for(GovernedMetric::Robustness, current, previous),
    };

    let activity = current.or_else(|| active.first().copied())?.created_at;
    // Display name follows the newest record regardless of status.
    let mut all: Vec<&Run> = runs.to_vec();
    all.sort_by(newest_first);
    let locale = all.first()?.locale.clone();

    let status = LocaleStatus {
        locale,
        metrics,
        recent_runs: completed
            .iter()
            .take(RECENT_RUNS_LIMIT)
            .map(|r| (*r).clone())
            .collect(),
        active_count: active.len(),
    };
    Some((activity, status))
}

/// Aggregate one snapshot of run records into locale status rows.
///
/// - Runs are grouped by case-insensitive locale key.
/// - Locales with neither completed nor active runs are dropped.
/// - Malformed records are skipped without affecting the other rows.
/// - Rows are ordered by their newest completed run (or newest active run
///   when nothing completed yet), newest first.
pub fn aggregate(all_runs: &[Run]) -> Vec<LocaleStatus> {
    let mut groups: BTreeMap<String, Vec<&Run>> = BTreeMap::new();
    for run in all_runs {
        if let Err(err) = validate_run(run) {
            warn!(run_id = %run.run_id, error = %err, "skipping malformed run record");
            continue;
        }
        groups.entry(run.locale.key()).or_default().push(run);
    }

    let mut rows: Vec<(DateTime<Utc>, String, LocaleStatus)> = groups
        .into_iter()
        .filter_map(|(key, runs)| match locale_status(&runs) {
            Some((activity, status)) => Some((activity, key, status)),
            None => {
                debug!(locale = %key, "no completed or active runs; locale omitted");
                None
            }
        })
        .collect();
    rows.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
    rows.into_iter().map(|(_, _, status)| status).collect()
}

/// A tracked location with its computed status, if any run exists for it.
#[derive(Clone, Debug, PartialEq)]
pub struct TrackedLocale {
    pub location: TrackedLocation,
    pub status: Option<LocaleStatus>,
}

/// Join the persisted tracked list with computed statuses, keeping the
/// tracked order. Locations without runs yet appear with no status.
pub fn tracked_view(statuses: &[LocaleStatus], tracked: &[TrackedLocation]) -> Vec<TrackedLocale> {
    tracked
        .iter()
        .map(|location| {
            let name_key = location.name.trim().to_lowercase();
            let status = statuses
                .iter()
                .find(|s| s.locale.key() == name_key || s.locale.slug() == location.slug)
                .cloned();
            TrackedLocale {
                location: location.clone(),
                status,
            }
        })
        .collect()
}
