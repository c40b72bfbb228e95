use std::collections::HashMap;
use std::future::Future;

use chrono::NaiveDateTime;
use tokio_rusqlite::Connection;

use super::{repository, Database};
use crate::cohort::{CohortExpression, CohortSource};
use crate::date_util::DateWindow;
use crate::error::{Error, Result};
use crate::history::{
    Direction, HistorySource, RegistrationIndex, Revision, RevisionFilter, UserId,
};

/// Revisions and registrations come from the `revision`, `page` and
/// `user_registration` tables through the reader connection.
impl HistorySource for Database {
    fn registration(
        &self,
        user_id: &str,
    ) -> impl Future<Output = Result<Option<NaiveDateTime>>> + Send {
        fetch_registration(self.reader().clone(), user_id.to_string())
    }

    fn revisions(
        &self,
        user_id: &str,
        filter: &RevisionFilter,
    ) -> impl Future<Output = Result<Vec<Revision>>> + Send {
        fetch_revisions(self.reader().clone(), user_id.to_string(), filter.clone())
    }

    fn page_neighbors(
        &self,
        page_id: i64,
        rev_id: i64,
        limit: usize,
        direction: Direction,
    ) -> impl Future<Output = Result<Vec<Revision>>> + Send {
        fetch_page_neighbors(self.reader().clone(), page_id, rev_id, limit, direction)
    }
}

impl RegistrationIndex for Database {
    fn registered_between(
        &self,
        window: &DateWindow,
    ) -> impl Future<Output = Result<Vec<UserId>>> + Send {
        fetch_registered_between(self.reader().clone(), *window)
    }
}

async fn fetch_registered_between(reader: Connection, window: DateWindow) -> Result<Vec<UserId>> {
    let users = reader
        .call(move |conn| repository::users_registered_between(conn, window.start, window.end))
        .await?;
    Ok(users)
}

async fn fetch_registration(reader: Connection, user_id: String) -> Result<Option<NaiveDateTime>> {
    let registered = reader
        .call(move |conn| repository::get_registration(conn, &user_id))
        .await?;
    Ok(registered)
}

async fn fetch_revisions(
    reader: Connection,
    user_id: String,
    filter: RevisionFilter,
) -> Result<Vec<Revision>> {
    let revisions = reader
        .call(move |conn| repository::list_user_revisions(conn, &user_id, &filter))
        .await?;
    Ok(revisions)
}

async fn fetch_page_neighbors(
    reader: Connection,
    page_id: i64,
    rev_id: i64,
    limit: usize,
    direction: Direction,
) -> Result<Vec<Revision>> {
    let revisions = reader
        .call(move |conn| repository::page_neighbors(conn, page_id, rev_id, limit, direction))
        .await?;
    Ok(revisions)
}

/// Cohort names resolve through `cohort_meta`. A purely numeric argument
/// such as `12` or `1&2~3` is read as a cohort-id expression instead.
impl CohortSource for Database {
    fn users(&self, cohort: &str) -> impl Future<Output = Result<Vec<UserId>>> + Send {
        resolve_cohort(self.reader().clone(), cohort.trim().to_string())
    }
}

async fn resolve_cohort(reader: Connection, cohort: String) -> Result<Vec<UserId>> {
    if CohortExpression::is_expression(&cohort) {
        let expr = CohortExpression::parse(&cohort)?;
        let ids = expr.cohort_ids();
        let members = reader
            .call(move |conn| {
                let mut members = HashMap::new();
                for id in ids {
                    members.insert(id, repository::cohort_members_by_id(conn, id)?);
                }
                Ok::<_, rusqlite::Error>(members)
            })
            .await?;
        return Ok(expr.resolve(&members));
    }

    let name = cohort.clone();
    reader
        .call(move |conn| repository::cohort_members_by_name(conn, &name))
        .await?
        .ok_or_else(|| Error::NotFound(format!("cohort '{cohort}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::date_util::parse_timestamp;

    async fn seeded() -> Database {
        let db = Database::open_memory().await.unwrap();
        db.writer()
            .call(|conn| {
                repository::upsert_page(conn, 7, 0, "Sandbox")?;
                for (rev_id, user, ts, sha1) in [
                    (1, "u1", "20130101010000", "a"),
                    (2, "u2", "20130101020000", "b"),
                    (3, "u3", "20130101030000", "a"),
                ] {
                    repository::insert_revision(
                        conn,
                        &Revision {
                            rev_id,
                            page_id: 7,
                            namespace: 0,
                            user_id: user.into(),
                            user_text: user.into(),
                            timestamp: parse_timestamp(ts).unwrap(),
                            sha1: sha1.into(),
                        },
                    )?;
                }
                repository::set_registration(conn, "u2", parse_timestamp("20130101000000").unwrap())?;
                repository::save_cohort(conn, "first", None, &["u1".to_string(), "u2".to_string()])?;
                repository::save_cohort(conn, "second", None, &["u2".to_string(), "u3".to_string()])?;
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
        db
    }

    #[tokio::test]
    async fn test_history_lookups() {
        let db = seeded().await;

        assert!(db.registration("u2").await.unwrap().is_some());
        assert!(db.registration("u1").await.unwrap().is_none());

        let revs = db.revisions("u2", &RevisionFilter::default()).await.unwrap();
        assert_eq!(revs.len(), 1);
        assert_eq!(revs[0].rev_id, 2);

        let after = db.page_neighbors(7, 2, 15, Direction::After).await.unwrap();
        assert_eq!(after.iter().map(|r| r.rev_id).collect::<Vec<_>>(), vec![3]);
    }

    #[tokio::test]
    async fn test_registered_between() {
        let db = seeded().await;
        let day = DateWindow::new(
            parse_timestamp("20130101000000").unwrap(),
            parse_timestamp("20130101235959").unwrap(),
        )
        .unwrap();
        assert_eq!(db.registered_between(&day).await.unwrap(), vec!["u2"]);

        let later = DateWindow::new(
            parse_timestamp("20130102000000").unwrap(),
            parse_timestamp("20130102235959").unwrap(),
        )
        .unwrap();
        assert!(db.registered_between(&later).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cohort_by_name_and_expression() {
        let db = seeded().await;

        assert_eq!(db.users("first").await.unwrap(), vec!["u1", "u2"]);
        assert!(matches!(db.users("nope").await, Err(Error::NotFound(_))));

        // cohort ids are assigned in creation order
        assert_eq!(db.users("1&2").await.unwrap(), vec!["u2"]);
        assert_eq!(db.users("1~2").await.unwrap(), vec!["u1", "u2", "u3"]);
    }
}
