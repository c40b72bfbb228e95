use chrono::TimeDelta;

use super::{window_end, Outcome, SurvivalConfig, ThresholdConfig, UndefinedReason};
use crate::error::Result;
use crate::history::{HistorySource, RevisionFilter};

/// Did the user make at least `min_count` revisions within `window_minutes`
/// of registering? Undefined when no registration event exists.
pub async fn evaluate_threshold<H: HistorySource>(
    history: &H,
    config: &ThresholdConfig,
    user_id: &str,
) -> Result<Outcome> {
    let Some(registered) = history.registration(user_id).await? else {
        return Ok(Outcome::undefined(UndefinedReason::NoRegistration));
    };

    let filter = RevisionFilter {
        namespaces: config.namespaces.clone(),
        from: Some(registered),
        to: Some(window_end(registered, config.window_minutes)?),
    };
    let count = history.revisions(user_id, &filter).await?.len() as u64;
    log::trace!("threshold: user {user_id} made {count} revisions in window");

    Ok(Outcome::attained(count >= u64::from(config.min_count)))
}

/// Was the user still active after `window_minutes` from registration?
/// Counts revisions strictly after the window closes.
pub async fn evaluate_survival<H: HistorySource>(
    history: &H,
    config: &SurvivalConfig,
    user_id: &str,
) -> Result<Outcome> {
    let Some(registered) = history.registration(user_id).await? else {
        return Ok(Outcome::undefined(UndefinedReason::NoRegistration));
    };

    let cutoff = window_end(registered, config.window_minutes)?;
    let filter = RevisionFilter {
        namespaces: config.namespaces.clone(),
        // a cutoff at the end of the calendar leaves nothing after it
        from: Some(cutoff.checked_add_signed(TimeDelta::seconds(1)).unwrap_or(cutoff)),
        to: None,
    };
    let count = history.revisions(user_id, &filter).await?.len();

    Ok(Outcome::attained(count > 0))
}
