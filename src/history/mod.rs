pub mod memory;

pub use memory::MemoryHistory;

use std::future::Future;

use chrono::NaiveDateTime;
use serde::Serialize;

use crate::date_util::DateWindow;
use crate::error::Result;

/// Opaque user key. Cohorts are sequences of these.
pub type UserId = String;

/// One revision in the history store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Revision {
    pub rev_id: i64,
    pub page_id: i64,
    pub namespace: i32,
    pub user_id: UserId,
    pub user_text: String,
    pub timestamp: NaiveDateTime,
    /// Content hash; two revisions with equal hashes have identical text.
    pub sha1: String,
}

/// Restricts which of a user's revisions a lookup returns.
/// Both bounds are inclusive; an empty namespace list matches every namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RevisionFilter {
    pub namespaces: Vec<i32>,
    pub from: Option<NaiveDateTime>,
    pub to: Option<NaiveDateTime>,
}

impl RevisionFilter {
    pub fn matches(&self, rev: &Revision) -> bool {
        if !self.namespaces.is_empty() && !self.namespaces.contains(&rev.namespace) {
            return false;
        }
        if self.from.is_some_and(|from| rev.timestamp < from) {
            return false;
        }
        if self.to.is_some_and(|to| rev.timestamp > to) {
            return false;
        }
        true
    }
}

/// Which side of a revision a page-neighborhood lookup scans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Before,
    After,
}

/// Read-only access to per-user event history.
///
/// Implementations are shared across every dispatch worker behind an `Arc`,
/// so all lookups take `&self` and return `Send` futures.
pub trait HistorySource: Send + Sync + 'static {
    /// Registration timestamp of the user, `None` if no registration event exists.
    fn registration(
        &self,
        user_id: &str,
    ) -> impl Future<Output = Result<Option<NaiveDateTime>>> + Send;

    /// The user's revisions matching `filter`, ordered by revision id.
    fn revisions(
        &self,
        user_id: &str,
        filter: &RevisionFilter,
    ) -> impl Future<Output = Result<Vec<Revision>>> + Send;

    /// Up to `limit` revisions of `page_id` nearest to `rev_id` on the given
    /// side (excluding `rev_id` itself), ordered by revision id ascending.
    fn page_neighbors(
        &self,
        page_id: i64,
        rev_id: i64,
        limit: usize,
        direction: Direction,
    ) -> impl Future<Output = Result<Vec<Revision>>> + Send;
}

/// Finds users by when they registered. Interval series draw each
/// interval's cohort from here.
pub trait RegistrationIndex: Send + Sync + 'static {
    /// Users registered inside `window` (both ends inclusive), ordered by id.
    fn registered_between(
        &self,
        window: &DateWindow,
    ) -> impl Future<Output = Result<Vec<UserId>>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn rev_at(namespace: i32, day: u32) -> Revision {
        Revision {
            rev_id: 1,
            page_id: 1,
            namespace,
            user_id: "u1".into(),
            user_text: "U1".into(),
            timestamp: NaiveDate::from_ymd_opt(2013, 1, day)
                .unwrap()
                .and_hms_opt(12, 0, 0)
                .unwrap(),
            sha1: "a".into(),
        }
    }

    #[test]
    fn test_filter_default_matches_everything() {
        assert!(RevisionFilter::default().matches(&rev_at(4, 10)));
    }

    #[test]
    fn test_filter_namespace_and_bounds() {
        let filter = RevisionFilter {
            namespaces: vec![0],
            from: Some(rev_at(0, 5).timestamp),
            to: Some(rev_at(0, 10).timestamp),
        };
        assert!(filter.matches(&rev_at(0, 5)));
        assert!(filter.matches(&rev_at(0, 10)));
        assert!(!filter.matches(&rev_at(0, 11)));
        assert!(!filter.matches(&rev_at(0, 4)));
        assert!(!filter.matches(&rev_at(1, 7)));
    }
}
