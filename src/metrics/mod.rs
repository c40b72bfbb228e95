pub mod aggregate;
pub mod revert;
pub mod threshold;
pub mod types;

pub use aggregate::aggregate;
pub use types::*;

use std::fmt;
use std::sync::Arc;

use chrono::{NaiveDateTime, TimeDelta};

use crate::date_util::DateWindow;
use crate::error::{Error, Result};
use crate::history::HistorySource;

/// Revisions scanned on each side of a user's revision when looking for reverts.
pub const DEFAULT_REVERT_SPAN: usize = 15;

/// Minutes after registration inside which a threshold is measured (one day).
pub const DEFAULT_WINDOW_MINUTES: i64 = 1440;

/// At least `min_count` revisions within `window_minutes` of registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThresholdConfig {
    pub window_minutes: i64,
    pub min_count: u32,
    /// Empty means every namespace counts.
    pub namespaces: Vec<i32>,
}

/// At least one revision later than `window_minutes` after registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SurvivalConfig {
    pub window_minutes: i64,
    pub namespaces: Vec<i32>,
}

/// Fraction of a user's revisions reverted by someone else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevertRateConfig {
    pub look_back: usize,
    pub look_ahead: usize,
    /// Only revisions inside this window are evaluated.
    pub period: Option<DateWindow>,
    pub namespaces: Vec<i32>,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            window_minutes: DEFAULT_WINDOW_MINUTES,
            min_count: 1,
            namespaces: Vec::new(),
        }
    }
}

impl Default for SurvivalConfig {
    fn default() -> Self {
        Self {
            window_minutes: DEFAULT_WINDOW_MINUTES,
            namespaces: Vec::new(),
        }
    }
}

impl Default for RevertRateConfig {
    fn default() -> Self {
        Self {
            look_back: DEFAULT_REVERT_SPAN,
            look_ahead: DEFAULT_REVERT_SPAN,
            period: None,
            namespaces: Vec::new(),
        }
    }
}

/// An immutable metric parameter set, reusable across any number of users.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetricConfig {
    Threshold(ThresholdConfig),
    Survival(SurvivalConfig),
    RevertRate(RevertRateConfig),
}

impl MetricConfig {
    pub fn kind(&self) -> MetricKind {
        match self {
            MetricConfig::Threshold(_) => MetricKind::Threshold,
            MetricConfig::Survival(_) => MetricKind::Survival,
            MetricConfig::RevertRate(_) => MetricKind::RevertRate,
        }
    }

    /// Reject parameter sets that cannot produce meaningful results.
    pub fn validate(&self) -> Result<()> {
        match self {
            MetricConfig::Threshold(c) => {
                validate_window("threshold", c.window_minutes)?;
                if c.min_count == 0 {
                    return Err(Error::Config(
                        "threshold count must be positive".into(),
                    ));
                }
            }
            MetricConfig::Survival(c) => validate_window("survival", c.window_minutes)?,
            MetricConfig::RevertRate(c) => {
                if c.look_back == 0 || c.look_ahead == 0 {
                    return Err(Error::Config(
                        "revert look-back and look-ahead spans must be positive".into(),
                    ));
                }
            }
        }
        Ok(())
    }
}

impl fmt::Display for MetricConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricConfig::Threshold(c) => {
                write!(f, "threshold(t={}, n={}", c.window_minutes, c.min_count)?;
                fmt_namespaces(f, &c.namespaces)?;
                f.write_str(")")
            }
            MetricConfig::Survival(c) => {
                write!(f, "survival(t={}", c.window_minutes)?;
                fmt_namespaces(f, &c.namespaces)?;
                f.write_str(")")
            }
            MetricConfig::RevertRate(c) => {
                write!(f, "revert_rate(back={}, ahead={}", c.look_back, c.look_ahead)?;
                fmt_namespaces(f, &c.namespaces)?;
                f.write_str(")")
            }
        }
    }
}

fn validate_window(metric: &str, minutes: i64) -> Result<()> {
    if minutes <= 0 {
        return Err(Error::Config(format!(
            "{metric} window must be positive, got {minutes} minutes"
        )));
    }
    let too_wide = TimeDelta::try_minutes(minutes)
        .and_then(|window| NaiveDateTime::MIN.checked_add_signed(window))
        .is_none();
    if too_wide {
        return Err(Error::Config(format!(
            "{metric} window of {minutes} minutes is out of range"
        )));
    }
    Ok(())
}

/// End of a window of `minutes` opened at `from`.
pub(crate) fn window_end(from: NaiveDateTime, minutes: i64) -> Result<NaiveDateTime> {
    TimeDelta::try_minutes(minutes)
        .and_then(|window| from.checked_add_signed(window))
        .ok_or_else(|| {
            Error::Config(format!(
                "a {minutes}-minute window from {from} overflows the calendar"
            ))
        })
}

fn fmt_namespaces(f: &mut fmt::Formatter<'_>, namespaces: &[i32]) -> fmt::Result {
    if namespaces.is_empty() {
        return Ok(());
    }
    let list: Vec<String> = namespaces.iter().map(|n| n.to_string()).collect();
    write!(f, ", ns={}", list.join("|"))
}

/// Evaluate one metric for one user.
///
/// Never fails: a history lookup error degrades this user's outcome to
/// [`UndefinedReason::LookupFailed`] so the rest of the cohort is unaffected.
/// `inner_pool_size` caps concurrent per-revision lookups for revert rates.
pub async fn evaluate<H: HistorySource>(
    history: &Arc<H>,
    config: &MetricConfig,
    user_id: &str,
    inner_pool_size: usize,
) -> Outcome {
    let result = match config {
        MetricConfig::Threshold(c) => threshold::evaluate_threshold(history.as_ref(), c, user_id).await,
        MetricConfig::Survival(c) => threshold::evaluate_survival(history.as_ref(), c, user_id).await,
        MetricConfig::RevertRate(c) => {
            revert::evaluate_revert_rate(history, c, user_id, inner_pool_size).await
        }
    };
    match result {
        Ok(outcome) => outcome,
        Err(e) => {
            log::warn!("{} lookup failed for user {user_id}: {e}", config.kind());
            Outcome::undefined(UndefinedReason::LookupFailed(e.to_string()))
        }
    }
}
