use std::collections::BTreeMap;

use super::{
    AggregateSummary, AttainmentSummary, CohortResultSet, MetricKind, MetricValue, Outcome,
    RevertSummary,
};

/// Label used when an outcome's value does not belong to the set's metric kind.
const UNEXPECTED_VALUE: &str = "unexpected_value";

/// Reduce a cohort result set to summary statistics.
///
/// Pure: the same set always yields the same summary. Undefined outcomes are
/// kept out of every rate and reported as a count broken down by reason.
pub fn aggregate(set: &CohortResultSet) -> AggregateSummary {
    match set.metric {
        MetricKind::Threshold | MetricKind::Survival => {
            AggregateSummary::Attainment(aggregate_attainment(set))
        }
        MetricKind::RevertRate => AggregateSummary::Revert(aggregate_revert(set)),
    }
}

fn aggregate_attainment(set: &CohortResultSet) -> AttainmentSummary {
    let mut summary = AttainmentSummary {
        total: set.len() as u64,
        ..Default::default()
    };

    for outcome in set.results.values() {
        match outcome {
            Outcome::Value(MetricValue::Attained(true)) => summary.met += 1,
            Outcome::Value(MetricValue::Attained(false)) => summary.not_met += 1,
            Outcome::Value(_) => record_undefined(&mut summary.undefined_reasons, UNEXPECTED_VALUE),
            Outcome::Undefined(reason) => {
                record_undefined(&mut summary.undefined_reasons, reason.label())
            }
        }
    }
    summary.undefined = summary.undefined_reasons.values().sum();

    let defined = summary.met + summary.not_met;
    if defined > 0 {
        summary.proportion = Some(summary.met as f64 / defined as f64);
    }
    summary
}

fn aggregate_revert(set: &CohortResultSet) -> RevertSummary {
    let mut summary = RevertSummary {
        total: set.len() as u64,
        ..Default::default()
    };
    let mut rate_sum = 0.0;

    for outcome in set.results.values() {
        match outcome {
            Outcome::Value(MetricValue::Revert(v)) => {
                summary.editors += 1;
                rate_sum += v.rate;
                summary.total_revisions += v.revisions;
                summary.total_reverted += v.reverted;
                if v.reverted > 0 {
                    summary.reverted_editors += 1;
                }
            }
            Outcome::Value(_) => record_undefined(&mut summary.undefined_reasons, UNEXPECTED_VALUE),
            Outcome::Undefined(reason) => {
                record_undefined(&mut summary.undefined_reasons, reason.label())
            }
        }
    }
    summary.undefined = summary.undefined_reasons.values().sum();

    if summary.total > 0 {
        summary.undefined_fraction = summary.undefined as f64 / summary.total as f64;
    }
    if summary.editors > 0 {
        summary.mean_rate = Some(rate_sum / summary.editors as f64);
    }
    if summary.total_revisions > 0 {
        summary.weighted_rate =
            Some(summary.total_reverted as f64 / summary.total_revisions as f64);
    }
    summary
}

fn record_undefined(reasons: &mut BTreeMap<String, u64>, label: &str) {
    *reasons.entry(label.to_string()).or_insert(0) += 1;
}
