use std::sync::Arc;

use chrono::{NaiveDateTime, TimeDelta};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use super::compiler::{Column, ColumnType, SeriesTable};
use crate::date_util::DateWindow;
use crate::dispatch::{dispatch, DispatchOptions, DispatchProgress};
use crate::error::{Error, Result};
use crate::history::{HistorySource, RegistrationIndex};
use crate::metrics::{
    aggregate, AggregateSummary, CohortResultSet, MetricConfig, MetricKind, RevertRateConfig,
};

const TIMESTAMP_COLUMN_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// A metric evaluated over fixed-length intervals of registration time.
#[derive(Debug, Clone)]
pub struct IntervalQuery {
    /// Start of the first interval.
    pub start: NaiveDateTime,
    /// Exclusive end of the range; the last interval is cut short here.
    pub end: NaiveDateTime,
    pub interval_hours: i64,
    pub metric: MetricConfig,
    /// Intervals evaluated at once. Each runs its own bounded dispatch.
    pub max_concurrent_intervals: usize,
}

/// One data point: the summary for users registered inside `[start, end]`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IntervalRow {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub summary: AggregateSummary,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IntervalTable {
    pub metric: MetricKind,
    /// Ordered by interval start.
    pub rows: Vec<IntervalRow>,
}

/// Split `[start, end)` into consecutive `interval_hours` windows. Windows
/// are inclusive at both ends and one second apart, so no registration
/// falls into two of them. The range must hold at least one full interval.
pub fn interval_windows(
    start: NaiveDateTime,
    end: NaiveDateTime,
    interval_hours: i64,
) -> Result<Vec<DateWindow>> {
    let step = TimeDelta::try_hours(interval_hours)
        .filter(|step| *step > TimeDelta::zero())
        .ok_or_else(|| {
            Error::Config(format!(
                "interval must be a positive number of hours, got {interval_hours}"
            ))
        })?;
    if end - start < step {
        return Err(Error::Config(format!(
            "{start} to {end} is shorter than one {interval_hours}-hour interval"
        )));
    }

    let second = TimeDelta::seconds(1);
    let mut windows = Vec::new();
    let mut from = start;
    while from < end {
        let until = from.checked_add_signed(step).map_or(end, |next| next.min(end));
        let last = until - second;
        if last < from {
            break;
        }
        windows.push(DateWindow::new(from, last)?);
        from = until;
    }
    Ok(windows)
}

/// Evaluate `query.metric` once per interval over the users who registered
/// in it, and aggregate each interval into one row.
///
/// Revert rates only count revisions made inside the interval. An interval
/// with no registrations yields an empty summary rather than an error.
pub async fn build_interval_series<H>(
    history: Arc<H>,
    query: &IntervalQuery,
    options: &DispatchOptions,
    progress: Arc<dyn DispatchProgress>,
) -> Result<IntervalTable>
where
    H: HistorySource + RegistrationIndex,
{
    query.metric.validate()?;
    options.validate()?;
    if query.max_concurrent_intervals == 0 {
        return Err(Error::Config(
            "at least one interval must run at a time".into(),
        ));
    }
    let windows = interval_windows(query.start, query.end, query.interval_hours)?;
    log::info!(
        "building {} series over {} intervals of {}h ({} at a time)",
        query.metric,
        windows.len(),
        query.interval_hours,
        query.max_concurrent_intervals
    );

    let permits = Arc::new(Semaphore::new(query.max_concurrent_intervals));
    let mut intervals = JoinSet::new();
    for window in windows {
        let permit = Arc::clone(&permits)
            .acquire_owned()
            .await
            .map_err(|e| Error::Other(format!("interval pool closed: {e}")))?;
        let history = Arc::clone(&history);
        let metric = scoped_metric(&query.metric, window);
        let options = options.clone();
        let progress = Arc::clone(&progress);
        intervals.spawn(async move {
            let _permit = permit;
            evaluate_interval(history, window, metric, options, progress).await
        });
    }

    let mut rows = Vec::new();
    while let Some(joined) = intervals.join_next().await {
        match joined {
            Ok(Ok(row)) => rows.push(row),
            Ok(Err(e)) => return Err(e),
            Err(e) => return Err(Error::Other(format!("interval task failed: {e}"))),
        }
    }
    rows.sort_by_key(|row| row.start);

    Ok(IntervalTable {
        metric: query.metric.kind(),
        rows,
    })
}

fn scoped_metric(metric: &MetricConfig, window: DateWindow) -> MetricConfig {
    match metric {
        MetricConfig::RevertRate(c) => MetricConfig::RevertRate(RevertRateConfig {
            period: Some(window),
            ..c.clone()
        }),
        other => other.clone(),
    }
}

async fn evaluate_interval<H>(
    history: Arc<H>,
    window: DateWindow,
    metric: MetricConfig,
    options: DispatchOptions,
    progress: Arc<dyn DispatchProgress>,
) -> Result<IntervalRow>
where
    H: HistorySource + RegistrationIndex,
{
    let users = history.registered_between(&window).await?;
    log::debug!(
        "interval {} .. {}: {} new users",
        window.start,
        window.end,
        users.len()
    );
    let set = if users.is_empty() {
        CohortResultSet::new(metric.kind())
    } else {
        dispatch(history, &users, &metric, &options, progress).await?
    };

    Ok(IntervalRow {
        start: window.start,
        end: window.end,
        summary: aggregate(&set),
    })
}

impl SeriesTable for IntervalTable {
    fn key_column(&self) -> Column {
        Column::new("timestamp", ColumnType::Timestamp)
    }

    fn value_columns(&self) -> Vec<Column> {
        match self.metric {
            MetricKind::Threshold | MetricKind::Survival => vec![
                Column::new("registrations", ColumnType::Int),
                Column::new("met", ColumnType::Int),
                Column::new("proportion", ColumnType::Float),
            ],
            MetricKind::RevertRate => vec![
                Column::new("total_revisions", ColumnType::Int),
                Column::new("weighted_rate", ColumnType::Float),
                Column::new("editors", ColumnType::Int),
                Column::new("reverted_editors", ColumnType::Int),
            ],
        }
    }

    fn row_count(&self) -> usize {
        self.rows.len()
    }

    fn csv_records(&self) -> Vec<Vec<String>> {
        self.rows
            .iter()
            .map(|row| {
                let mut record = vec![row.start.format(TIMESTAMP_COLUMN_FORMAT).to_string()];
                match &row.summary {
                    AggregateSummary::Attainment(s) => record.extend([
                        s.total.to_string(),
                        s.met.to_string(),
                        optional(s.proportion),
                    ]),
                    AggregateSummary::Revert(s) => record.extend([
                        s.total_revisions.to_string(),
                        optional(s.weighted_rate),
                        s.editors.to_string(),
                        s.reverted_editors.to_string(),
                    ]),
                }
                record
            })
            .collect()
    }

    fn rows_json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(&self.rows)?)
    }
}

fn optional(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}
