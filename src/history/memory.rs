use std::collections::{HashMap, HashSet};
use std::future::{ready, Future};

use chrono::NaiveDateTime;

use super::{Direction, HistorySource, RegistrationIndex, Revision, RevisionFilter, UserId};
use crate::date_util::DateWindow;
use crate::error::{Error, Result};

/// In-process history store. Useful for offline runs over exported data and
/// for exercising the dispatcher without a database.
#[derive(Debug, Clone, Default)]
pub struct MemoryHistory {
    registrations: HashMap<String, NaiveDateTime>,
    /// Kept sorted by `rev_id`.
    revisions: Vec<Revision>,
    failing_users: HashSet<String>,
    failing_pages: HashSet<i64>,
}

impl MemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_registration(mut self, user_id: &str, at: NaiveDateTime) -> Self {
        self.registrations.insert(user_id.to_string(), at);
        self
    }

    pub fn with_revision(mut self, rev: Revision) -> Self {
        let pos = self.revisions.partition_point(|r| r.rev_id < rev.rev_id);
        self.revisions.insert(pos, rev);
        self
    }

    /// Make every lookup for `user_id` fail, as an unreachable store would.
    pub fn with_failing_user(mut self, user_id: &str) -> Self {
        self.failing_users.insert(user_id.to_string());
        self
    }

    /// Make neighborhood lookups on `page_id` fail.
    pub fn with_failing_page(mut self, page_id: i64) -> Self {
        self.failing_pages.insert(page_id);
        self
    }

    fn check_user(&self, user_id: &str) -> Result<()> {
        if self.failing_users.contains(user_id) {
            return Err(Error::Lookup {
                user_id: user_id.to_string(),
                message: "history unavailable".into(),
            });
        }
        Ok(())
    }
}

impl HistorySource for MemoryHistory {
    fn registration(
        &self,
        user_id: &str,
    ) -> impl Future<Output = Result<Option<NaiveDateTime>>> + Send {
        let result = self
            .check_user(user_id)
            .map(|_| self.registrations.get(user_id).copied());
        ready(result)
    }

    fn revisions(
        &self,
        user_id: &str,
        filter: &RevisionFilter,
    ) -> impl Future<Output = Result<Vec<Revision>>> + Send {
        let result = self.check_user(user_id).map(|_| {
            self.revisions
                .iter()
                .filter(|r| r.user_id == user_id && filter.matches(r))
                .cloned()
                .collect()
        });
        ready(result)
    }

    fn page_neighbors(
        &self,
        page_id: i64,
        rev_id: i64,
        limit: usize,
        direction: Direction,
    ) -> impl Future<Output = Result<Vec<Revision>>> + Send {
        if self.failing_pages.contains(&page_id) {
            return ready(Err(Error::Other(format!(
                "page {page_id} history unavailable"
            ))));
        }
        let on_page = self.revisions.iter().filter(|r| r.page_id == page_id);
        let neighbors: Vec<Revision> = match direction {
            Direction::Before => {
                let before: Vec<&Revision> = on_page.filter(|r| r.rev_id < rev_id).collect();
                let skip = before.len().saturating_sub(limit);
                before.into_iter().skip(skip).cloned().collect()
            }
            Direction::After => on_page
                .filter(|r| r.rev_id > rev_id)
                .take(limit)
                .cloned()
                .collect(),
        };
        ready(Ok(neighbors))
    }
}

impl RegistrationIndex for MemoryHistory {
    fn registered_between(
        &self,
        window: &DateWindow,
    ) -> impl Future<Output = Result<Vec<UserId>>> + Send {
        let mut users: Vec<UserId> = self
            .registrations
            .iter()
            .filter(|(_, at)| window.contains(**at))
            .map(|(user_id, _)| user_id.clone())
            .collect();
        users.sort();
        ready(Ok(users))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn rev(rev_id: i64, page_id: i64) -> Revision {
        Revision {
            rev_id,
            page_id,
            namespace: 0,
            user_id: "u1".into(),
            user_text: "U1".into(),
            timestamp: NaiveDate::from_ymd_opt(2013, 1, 1)
                .unwrap()
                .and_hms_opt(0, 0, 0)
                .unwrap(),
            sha1: format!("sha{rev_id}"),
        }
    }

    #[tokio::test]
    async fn test_neighbors_are_nearest_and_ascending() {
        let mut history = MemoryHistory::new();
        for id in [5, 1, 3, 2, 4, 6, 7] {
            history = history.with_revision(rev(id, 10));
        }
        history = history.with_revision(rev(100, 11));

        let before = history.page_neighbors(10, 5, 2, Direction::Before).await.unwrap();
        let ids: Vec<i64> = before.iter().map(|r| r.rev_id).collect();
        assert_eq!(ids, vec![3, 4]);

        let after = history.page_neighbors(10, 5, 15, Direction::After).await.unwrap();
        let ids: Vec<i64> = after.iter().map(|r| r.rev_id).collect();
        assert_eq!(ids, vec![6, 7]);
    }

    #[tokio::test]
    async fn test_registered_between_is_inclusive_and_sorted() {
        let at = |hour| {
            NaiveDate::from_ymd_opt(2013, 1, 1)
                .unwrap()
                .and_hms_opt(hour, 0, 0)
                .unwrap()
        };
        let history = MemoryHistory::new()
            .with_registration("u3", at(6))
            .with_registration("u1", at(0))
            .with_registration("u2", at(3))
            .with_registration("u4", at(7));

        let window = DateWindow::new(at(0), at(6)).unwrap();
        let users = history.registered_between(&window).await.unwrap();
        assert_eq!(users, vec!["u1", "u2", "u3"]);
    }

    #[tokio::test]
    async fn test_failing_user_errors() {
        let history = MemoryHistory::new().with_failing_user("u1");
        assert!(history.registration("u1").await.is_err());
        assert!(history.registration("u2").await.unwrap().is_none());
    }
}
