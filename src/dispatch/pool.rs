use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use super::{DispatchOptions, DispatchProgress};
use crate::error::{Error, Result};
use crate::history::{HistorySource, UserId};
use crate::metrics::{self, CohortResultSet, MetricConfig, Outcome, UndefinedReason};

/// Evaluate `metric` for every user in `user_ids` on a bounded worker pool.
///
/// Users are split into at most `outer_pool_size` contiguous partitions before
/// any task starts, so each user's result is written by exactly one worker.
/// Every worker is awaited before returning. A worker that panics marks each
/// user it owned as [`UndefinedReason::WorkerFailed`]; the others finish
/// normally. Parameter and cohort problems are rejected before any spawn.
pub async fn dispatch<H: HistorySource>(
    history: Arc<H>,
    user_ids: &[UserId],
    metric: &MetricConfig,
    options: &DispatchOptions,
    progress: Arc<dyn DispatchProgress>,
) -> Result<CohortResultSet> {
    metric.validate()?;
    options.validate()?;
    if user_ids.is_empty() {
        return Err(Error::Config("cohort is empty".into()));
    }

    let total = user_ids.len();
    let partitions = partition(user_ids, options.outer_pool_size);
    log::info!(
        "dispatching {metric} over {total} users with {} workers (inner pool {})",
        partitions.len(),
        options.inner_pool_size
    );

    let (ticks, forwarder) = if options.log_progress {
        let (tx, rx) = mpsc::unbounded_channel();
        let forwarder = tokio::spawn(forward_progress(rx, progress, total));
        (Some(tx), Some(forwarder))
    } else {
        (None, None)
    };

    let shared_metric = Arc::new(metric.clone());
    let mut workers = Vec::with_capacity(partitions.len());
    for (index, owned) in partitions.into_iter().enumerate() {
        let handle = tokio::spawn(run_worker(
            index,
            Arc::clone(&history),
            Arc::clone(&shared_metric),
            owned.clone(),
            options.inner_pool_size,
            options.entity_timeout,
            ticks.clone(),
        ));
        workers.push((owned, handle));
    }
    // Workers hold the remaining senders; the forwarder ends once they finish.
    drop(ticks);

    let mut set = CohortResultSet::new(metric.kind());
    for (index, (owned, handle)) in workers.into_iter().enumerate() {
        match handle.await {
            Ok(results) => set.results.extend(results),
            Err(e) => {
                log::error!(
                    "worker {index} failed, marking its {} users undefined: {e}",
                    owned.len()
                );
                let reason = UndefinedReason::WorkerFailed(e.to_string());
                for user_id in owned {
                    set.results
                        .insert(user_id, Outcome::undefined(reason.clone()));
                }
            }
        }
    }

    if let Some(forwarder) = forwarder {
        if let Err(e) = forwarder.await {
            log::warn!("progress reporting stopped early: {e}");
        }
    }

    let undefined = set.results.values().filter(|o| o.is_undefined()).count();
    log::info!("dispatch complete: {total} users, {undefined} undefined");
    Ok(set)
}

/// Split users into `min(workers, len)` contiguous runs whose sizes differ by
/// at most one.
pub fn partition(user_ids: &[UserId], workers: usize) -> Vec<Vec<UserId>> {
    let workers = workers.min(user_ids.len()).max(1);
    let base = user_ids.len() / workers;
    let extra = user_ids.len() % workers;

    let mut partitions = Vec::with_capacity(workers);
    let mut start = 0;
    for i in 0..workers {
        let size = base + usize::from(i < extra);
        partitions.push(user_ids[start..start + size].to_vec());
        start += size;
    }
    partitions
}

async fn run_worker<H: HistorySource>(
    index: usize,
    history: Arc<H>,
    metric: Arc<MetricConfig>,
    owned: Vec<UserId>,
    inner_pool_size: usize,
    entity_timeout: Option<Duration>,
    ticks: Option<mpsc::UnboundedSender<()>>,
) -> Vec<(UserId, Outcome)> {
    let mut results = Vec::with_capacity(owned.len());
    for user_id in owned {
        let evaluation = metrics::evaluate(&history, &metric, &user_id, inner_pool_size);
        let outcome = match entity_timeout {
            Some(limit) => match tokio::time::timeout(limit, evaluation).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    log::warn!("user {user_id} timed out after {limit:?}");
                    Outcome::undefined(UndefinedReason::TimedOut)
                }
            },
            None => evaluation.await,
        };
        results.push((user_id, outcome));
        if let Some(ticks) = &ticks {
            // The receiver only disappears if progress reporting panicked.
            let _ = ticks.send(());
        }
    }
    log::debug!("worker {index} finished {} users", results.len());
    results
}

async fn forward_progress(
    mut ticks: mpsc::UnboundedReceiver<()>,
    progress: Arc<dyn DispatchProgress>,
    total: usize,
) {
    let mut done = 0;
    while ticks.recv().await.is_some() {
        done += 1;
        progress.on_entity_complete(done, total);
    }
}
