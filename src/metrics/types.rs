use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::history::UserId;

/// Which family of metric produced a result set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Threshold,
    Survival,
    RevertRate,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Threshold => "threshold",
            MetricKind::Survival => "survival",
            MetricKind::RevertRate => "revert_rate",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-user revert counts over the evaluated period.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RevertValue {
    pub revisions: u64,
    pub reverted: u64,
    pub rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricValue {
    /// Threshold or survival attainment.
    Attained(bool),
    Revert(RevertValue),
}

/// Why a user's metric could not be computed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UndefinedReason {
    NoRegistration,
    NoRevisions,
    LookupFailed(String),
    WorkerFailed(String),
    TimedOut,
}

impl UndefinedReason {
    pub fn label(&self) -> &'static str {
        match self {
            UndefinedReason::NoRegistration => "no_registration",
            UndefinedReason::NoRevisions => "no_revisions",
            UndefinedReason::LookupFailed(_) => "lookup_failed",
            UndefinedReason::WorkerFailed(_) => "worker_failed",
            UndefinedReason::TimedOut => "timed_out",
        }
    }
}

/// Result of evaluating one metric for one user.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Value(MetricValue),
    Undefined(UndefinedReason),
}

impl Outcome {
    pub fn attained(value: bool) -> Self {
        Outcome::Value(MetricValue::Attained(value))
    }

    pub fn undefined(reason: UndefinedReason) -> Self {
        Outcome::Undefined(reason)
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Outcome::Undefined(_))
    }
}

/// Every user of one cohort mapped to their outcome for one metric.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CohortResultSet {
    pub metric: MetricKind,
    pub results: BTreeMap<UserId, Outcome>,
}

impl CohortResultSet {
    pub fn new(metric: MetricKind) -> Self {
        Self {
            metric,
            results: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn get(&self, user_id: &str) -> Option<&Outcome> {
        self.results.get(user_id)
    }
}

/// Summary of an attainment metric (threshold, survival) over a cohort.
/// Undefined users are excluded from `proportion` and counted separately.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AttainmentSummary {
    pub total: u64,
    pub met: u64,
    pub not_met: u64,
    pub undefined: u64,
    /// `met / (met + not_met)`; `None` when every user is undefined.
    pub proportion: Option<f64>,
    pub undefined_reasons: BTreeMap<String, u64>,
}

/// Summary of revert rates over a cohort.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RevertSummary {
    pub total: u64,
    /// Users with a defined rate.
    pub editors: u64,
    pub undefined: u64,
    pub undefined_fraction: f64,
    /// Unweighted mean of per-user rates.
    pub mean_rate: Option<f64>,
    pub total_revisions: u64,
    pub total_reverted: u64,
    /// `total_reverted / total_revisions`.
    pub weighted_rate: Option<f64>,
    /// Editors with at least one reverted revision.
    pub reverted_editors: u64,
    pub undefined_reasons: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AggregateSummary {
    Attainment(AttainmentSummary),
    Revert(RevertSummary),
}

impl AggregateSummary {
    pub fn total(&self) -> u64 {
        match self {
            AggregateSummary::Attainment(s) => s.total,
            AggregateSummary::Revert(s) => s.total,
        }
    }

    pub fn undefined(&self) -> u64 {
        match self {
            AggregateSummary::Attainment(s) => s.undefined,
            AggregateSummary::Revert(s) => s.undefined,
        }
    }

    pub fn undefined_reasons(&self) -> &BTreeMap<String, u64> {
        match self {
            AggregateSummary::Attainment(s) => &s.undefined_reasons,
            AggregateSummary::Revert(s) => &s.undefined_reasons,
        }
    }
}
