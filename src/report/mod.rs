pub mod render;

pub use render::{render_csv, render_json, render_text};

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Semaphore;

use crate::cohort::CohortSource;
use crate::dispatch::{self, DispatchOptions, DispatchProgress};
use crate::error::Result;
use crate::history::HistorySource;
use crate::metrics::{aggregate, AggregateSummary, MetricConfig};

/// One (label, cohort, metric) triple to evaluate.
#[derive(Debug, Clone)]
pub struct ReportJob {
    pub label: String,
    pub cohort: String,
    pub metric: MetricConfig,
}

impl ReportJob {
    pub fn new(label: impl Into<String>, cohort: impl Into<String>, metric: MetricConfig) -> Self {
        Self {
            label: label.into(),
            cohort: cohort.into(),
            metric,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    Completed(AggregateSummary),
    Failed { error: String },
}

/// The structured result of one job. Rendering happens separately.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportEntry {
    pub label: String,
    pub cohort: String,
    /// Human-readable metric parameters, e.g. `threshold(t=1440, n=1)`.
    pub metric: String,
    pub outcome: JobOutcome,
}

impl ReportEntry {
    pub fn summary(&self) -> Option<&AggregateSummary> {
        match &self.outcome {
            JobOutcome::Completed(summary) => Some(summary),
            JobOutcome::Failed { .. } => None,
        }
    }
}

/// Runs report jobs against an injected history store and cohort registry.
pub struct ReportDriver<H, C> {
    history: Arc<H>,
    cohorts: Arc<C>,
    options: DispatchOptions,
    max_concurrent_jobs: usize,
}

impl<H: HistorySource, C: CohortSource> ReportDriver<H, C> {
    pub fn new(history: Arc<H>, cohorts: Arc<C>, options: DispatchOptions) -> Self {
        Self {
            history,
            cohorts,
            options,
            max_concurrent_jobs: 1,
        }
    }

    /// Allow up to `n` jobs to dispatch at once (minimum 1).
    pub fn with_max_concurrent_jobs(mut self, n: usize) -> Self {
        self.max_concurrent_jobs = n.max(1);
        self
    }

    /// Evaluate every job. Entries come back in job order; a job that fails
    /// is reported against its label and does not stop the others.
    pub async fn run(
        &self,
        jobs: Vec<ReportJob>,
        progress: Arc<dyn DispatchProgress>,
    ) -> Vec<ReportEntry> {
        log::info!(
            "running {} report jobs ({} at a time)",
            jobs.len(),
            self.max_concurrent_jobs
        );
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent_jobs));

        let mut handles = Vec::with_capacity(jobs.len());
        for job in jobs {
            let header = (job.label.clone(), job.cohort.clone(), job.metric.to_string());
            let permit = match Arc::clone(&semaphore).acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    handles.push((header, Err(e.to_string())));
                    continue;
                }
            };
            let history = Arc::clone(&self.history);
            let cohorts = Arc::clone(&self.cohorts);
            let options = self.options.clone();
            let progress = Arc::clone(&progress);
            let handle = tokio::spawn(async move {
                let _permit = permit;
                run_job(history, cohorts, &job, &options, progress).await
            });
            handles.push((header, Ok(handle)));
        }

        let mut entries = Vec::with_capacity(handles.len());
        for ((label, cohort, metric), handle) in handles {
            let outcome = match handle {
                Ok(handle) => match handle.await {
                    Ok(Ok(summary)) => JobOutcome::Completed(summary),
                    Ok(Err(e)) => {
                        log::warn!("report job '{label}' failed: {e}");
                        JobOutcome::Failed {
                            error: e.to_string(),
                        }
                    }
                    Err(e) => {
                        log::error!("report job '{label}' panicked: {e}");
                        JobOutcome::Failed {
                            error: e.to_string(),
                        }
                    }
                },
                Err(error) => JobOutcome::Failed { error },
            };
            entries.push(ReportEntry {
                label,
                cohort,
                metric,
                outcome,
            });
        }
        entries
    }
}

async fn run_job<H: HistorySource, C: CohortSource>(
    history: Arc<H>,
    cohorts: Arc<C>,
    job: &ReportJob,
    options: &DispatchOptions,
    progress: Arc<dyn DispatchProgress>,
) -> Result<AggregateSummary> {
    job.metric.validate()?;
    let users = cohorts.users(&job.cohort).await?;
    log::debug!(
        "job '{}': cohort '{}' has {} users",
        job.label,
        job.cohort,
        users.len()
    );
    let set = dispatch::dispatch(history, &users, &job.metric, options, progress).await?;
    Ok(aggregate(&set))
}
