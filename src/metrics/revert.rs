use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use super::{MetricValue, Outcome, RevertRateConfig, RevertValue, UndefinedReason};
use crate::error::{Error, Result};
use crate::history::{Direction, HistorySource, Revision, RevisionFilter};

/// Compute the share of a user's revisions that were reverted.
///
/// Each revision's page neighborhood is fetched in its own task. At most
/// `inner_pool_size` of those tasks exist at once: a permit is taken before
/// spawning, so pending lookups never pile up in the task queue.
pub async fn evaluate_revert_rate<H: HistorySource>(
    history: &Arc<H>,
    config: &RevertRateConfig,
    user_id: &str,
    inner_pool_size: usize,
) -> Result<Outcome> {
    let filter = RevisionFilter {
        namespaces: config.namespaces.clone(),
        from: config.period.map(|w| w.start),
        to: config.period.map(|w| w.end),
    };
    let revisions = history.revisions(user_id, &filter).await?;
    if revisions.is_empty() {
        return Ok(Outcome::undefined(UndefinedReason::NoRevisions));
    }

    let permits = Arc::new(Semaphore::new(inner_pool_size.max(1)));
    let mut lookups = JoinSet::new();
    let total = revisions.len() as u64;

    for rev in revisions {
        let permit = Arc::clone(&permits)
            .acquire_owned()
            .await
            .map_err(|e| Error::Other(format!("revision pool closed: {e}")))?;
        let history = Arc::clone(history);
        let (look_back, look_ahead) = (config.look_back, config.look_ahead);
        lookups.spawn(async move {
            let _permit = permit;
            is_reverted(history.as_ref(), &rev, look_back, look_ahead).await
        });
    }

    let mut reverted = 0u64;
    while let Some(joined) = lookups.join_next().await {
        match joined {
            Ok(Ok(true)) => reverted += 1,
            Ok(Ok(false)) => {}
            Ok(Err(e)) => return Err(e),
            Err(e) => {
                return Err(Error::Other(format!("revision lookup task failed: {e}")));
            }
        }
    }

    log::trace!("revert_rate: user {user_id} had {reverted}/{total} revisions reverted");

    Ok(Outcome::Value(MetricValue::Revert(RevertValue {
        revisions: total,
        reverted,
        rate: reverted as f64 / total as f64,
    })))
}

/// A revision counts as reverted when a later revision by another user
/// restores page content seen before it.
pub async fn is_reverted<H: HistorySource>(
    history: &H,
    rev: &Revision,
    look_back: usize,
    look_ahead: usize,
) -> Result<bool> {
    let before = history
        .page_neighbors(rev.page_id, rev.rev_id, look_back, Direction::Before)
        .await?;
    let after = history
        .page_neighbors(rev.page_id, rev.rev_id, look_ahead, Direction::After)
        .await?;

    let prior_states: HashSet<&str> = before.iter().map(|r| r.sha1.as_str()).collect();
    Ok(after.iter().any(|later| {
        later.user_id != rev.user_id
            && later.sha1 != rev.sha1
            && prior_states.contains(later.sha1.as_str())
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::MemoryHistory;
    use chrono::{NaiveDate, NaiveDateTime};

    fn ts(minute: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2013, 1, 1)
            .unwrap()
            .and_hms_opt(0, minute, 0)
            .unwrap()
    }

    fn rev(rev_id: i64, page_id: i64, user: &str, sha1: &str) -> Revision {
        Revision {
            rev_id,
            page_id,
            namespace: 0,
            user_id: user.into(),
            user_text: user.to_uppercase(),
            timestamp: ts(rev_id as u32),
            sha1: sha1.into(),
        }
    }

    /// Page 1: u1's edit (rev 2) is undone by u2 (rev 3 restores "a").
    /// Page 2: u1's edit (rev 5) survives.
    /// Page 3: u1 undoes their own edit, which does not count.
    fn history() -> MemoryHistory {
        MemoryHistory::new()
            .with_revision(rev(1, 1, "u0", "a"))
            .with_revision(rev(2, 1, "u1", "b"))
            .with_revision(rev(3, 1, "u2", "a"))
            .with_revision(rev(4, 2, "u0", "c"))
            .with_revision(rev(5, 2, "u1", "d"))
            .with_revision(rev(6, 2, "u2", "e"))
            .with_revision(rev(7, 3, "u0", "f"))
            .with_revision(rev(8, 3, "u1", "g"))
            .with_revision(rev(9, 3, "u1", "f"))
    }

    #[tokio::test]
    async fn test_is_reverted() {
        let h = history();
        assert!(is_reverted(&h, &rev(2, 1, "u1", "b"), 15, 15).await.unwrap());
        assert!(!is_reverted(&h, &rev(5, 2, "u1", "d"), 15, 15).await.unwrap());
        assert!(!is_reverted(&h, &rev(8, 3, "u1", "g"), 15, 15).await.unwrap());
    }

    #[tokio::test]
    async fn test_revert_rate_counts_reverted_share() {
        let h = Arc::new(history());
        let outcome = evaluate_revert_rate(&h, &RevertRateConfig::default(), "u1", 2)
            .await
            .unwrap();
        // revs 2, 5, 8, 9 authored by u1; only rev 2 reverted by someone else
        assert_eq!(
            outcome,
            Outcome::Value(MetricValue::Revert(RevertValue {
                revisions: 4,
                reverted: 1,
                rate: 0.25,
            }))
        );
    }

    #[tokio::test]
    async fn test_zero_revisions_is_undefined_not_zero() {
        let h = Arc::new(history());
        let outcome = evaluate_revert_rate(&h, &RevertRateConfig::default(), "nobody", 4)
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::undefined(UndefinedReason::NoRevisions));
    }

    #[tokio::test]
    async fn test_look_back_span_limits_detection() {
        // The restored state "a" sits two revisions back; a span of one misses it.
        let h = Arc::new(
            MemoryHistory::new()
                .with_revision(rev(1, 1, "u0", "a"))
                .with_revision(rev(2, 1, "u3", "x"))
                .with_revision(rev(3, 1, "u1", "b"))
                .with_revision(rev(4, 1, "u2", "a")),
        );
        let narrow = RevertRateConfig {
            look_back: 1,
            ..Default::default()
        };
        let outcome = evaluate_revert_rate(&h, &narrow, "u1", 1).await.unwrap();
        assert!(matches!(
            outcome,
            Outcome::Value(MetricValue::Revert(RevertValue { reverted: 0, .. }))
        ));

        let wide = RevertRateConfig::default();
        let outcome = evaluate_revert_rate(&h, &wide, "u1", 1).await.unwrap();
        assert!(matches!(
            outcome,
            Outcome::Value(MetricValue::Revert(RevertValue { reverted: 1, .. }))
        ));
    }

    #[tokio::test]
    async fn test_page_lookup_failure_propagates() {
        let h = Arc::new(history().with_failing_page(2));
        let result = evaluate_revert_rate(&h, &RevertRateConfig::default(), "u1", 3).await;
        assert!(result.is_err());
    }
}
