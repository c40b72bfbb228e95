use chrono::NaiveDateTime;
use rusqlite::types::{ToSql, Type};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

use crate::date_util::{format_timestamp, TIMESTAMP_FORMAT};
use crate::history::{Direction, Revision, RevisionFilter, UserId};

// ── Pages & Revisions ──────────────────────────────────────────────

pub fn upsert_page(
    conn: &Connection,
    page_id: i64,
    namespace: i32,
    title: &str,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO page (page_id, namespace, title) VALUES (?1, ?2, ?3)
         ON CONFLICT(page_id) DO UPDATE SET namespace = excluded.namespace, title = excluded.title",
        params![page_id, namespace, title],
    )?;
    Ok(())
}

/// Insert a revision. The page row must exist (see [`upsert_page`]); the
/// revision's `namespace` field is taken from the page on read.
pub fn insert_revision(conn: &Connection, rev: &Revision) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT OR REPLACE INTO revision (rev_id, page_id, user_id, user_text, timestamp, sha1)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            rev.rev_id,
            rev.page_id,
            rev.user_id,
            rev.user_text,
            format_timestamp(rev.timestamp),
            rev.sha1,
        ],
    )?;
    Ok(())
}

const REVISION_COLUMNS: &str =
    "r.rev_id, r.page_id, p.namespace, r.user_id, r.user_text, r.timestamp, r.sha1";

fn revision_from_row(row: &Row<'_>) -> Result<Revision, rusqlite::Error> {
    let raw: String = row.get(5)?;
    Ok(Revision {
        rev_id: row.get(0)?,
        page_id: row.get(1)?,
        namespace: row.get(2)?,
        user_id: row.get(3)?,
        user_text: row.get(4)?,
        timestamp: timestamp_column(5, &raw)?,
        sha1: row.get(6)?,
    })
}

/// A user's revisions matching `filter`, ordered by revision id.
pub fn list_user_revisions(
    conn: &Connection,
    user_id: &str,
    filter: &RevisionFilter,
) -> Result<Vec<Revision>, rusqlite::Error> {
    let mut sql = format!(
        "SELECT {REVISION_COLUMNS} FROM revision r JOIN page p ON p.page_id = r.page_id
         WHERE r.user_id = ?1"
    );
    let mut values: Vec<Box<dyn ToSql>> = vec![Box::new(user_id.to_string())];

    if let Some(from) = filter.from {
        values.push(Box::new(format_timestamp(from)));
        sql.push_str(&format!(" AND r.timestamp >= ?{}", values.len()));
    }
    if let Some(to) = filter.to {
        values.push(Box::new(format_timestamp(to)));
        sql.push_str(&format!(" AND r.timestamp <= ?{}", values.len()));
    }
    if !filter.namespaces.is_empty() {
        let mut placeholders = Vec::with_capacity(filter.namespaces.len());
        for ns in &filter.namespaces {
            values.push(Box::new(*ns));
            placeholders.push(format!("?{}", values.len()));
        }
        sql.push_str(&format!(" AND p.namespace IN ({})", placeholders.join(", ")));
    }
    sql.push_str(" ORDER BY r.rev_id");

    let mut stmt = conn.prepare(&sql)?;
    let refs: Vec<&dyn ToSql> = values.iter().map(|v| v.as_ref()).collect();
    let rows = stmt.query_map(refs.as_slice(), revision_from_row)?;
    rows.collect()
}

/// Up to `limit` revisions of a page on one side of `rev_id`, ascending.
pub fn page_neighbors(
    conn: &Connection,
    page_id: i64,
    rev_id: i64,
    limit: usize,
    direction: Direction,
) -> Result<Vec<Revision>, rusqlite::Error> {
    let (cmp, order) = match direction {
        Direction::Before => ("<", "DESC"),
        Direction::After => (">", "ASC"),
    };
    let sql = format!(
        "SELECT {REVISION_COLUMNS} FROM revision r JOIN page p ON p.page_id = r.page_id
         WHERE r.page_id = ?1 AND r.rev_id {cmp} ?2
         ORDER BY r.rev_id {order} LIMIT ?3"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![page_id, rev_id, limit as i64], revision_from_row)?;
    let mut revisions: Vec<Revision> = rows.collect::<Result<_, _>>()?;
    if direction == Direction::Before {
        revisions.reverse();
    }
    Ok(revisions)
}

// ── Registrations ──────────────────────────────────────────────────

pub fn set_registration(
    conn: &Connection,
    user_id: &str,
    registered_at: NaiveDateTime,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT OR REPLACE INTO user_registration (user_id, registered_at) VALUES (?1, ?2)",
        params![user_id, format_timestamp(registered_at)],
    )?;
    Ok(())
}

pub fn get_registration(
    conn: &Connection,
    user_id: &str,
) -> Result<Option<NaiveDateTime>, rusqlite::Error> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT registered_at FROM user_registration WHERE user_id = ?1",
            params![user_id],
            |row| row.get(0),
        )
        .optional()?;
    raw.map(|s| timestamp_column(0, &s)).transpose()
}

/// Users registered between `from` and `to`, both inclusive, ordered by id.
pub fn users_registered_between(
    conn: &Connection,
    from: NaiveDateTime,
    to: NaiveDateTime,
) -> Result<Vec<String>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT user_id FROM user_registration
         WHERE registered_at >= ?1 AND registered_at <= ?2
         ORDER BY user_id",
    )?;
    let rows = stmt.query_map(
        params![format_timestamp(from), format_timestamp(to)],
        |row| row.get(0),
    )?;
    rows.collect()
}

// ── Cohorts ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct CohortInfo {
    pub cohort_id: i64,
    pub name: String,
    pub description: Option<String>,
    pub created_at: String,
    pub member_count: i64,
}

/// Create a cohort, or replace the members of an existing one with the same name.
/// Duplicate user ids keep their first position.
pub fn save_cohort(
    conn: &Connection,
    name: &str,
    description: Option<&str>,
    users: &[UserId],
) -> Result<i64, rusqlite::Error> {
    conn.execute(
        "INSERT INTO cohort_meta (name, description, created_at)
         VALUES (?1, ?2, datetime('now'))
         ON CONFLICT(name) DO UPDATE SET
           description = COALESCE(excluded.description, cohort_meta.description)",
        params![name, description],
    )?;
    let cohort_id: i64 = conn.query_row(
        "SELECT cohort_id FROM cohort_meta WHERE name = ?1",
        params![name],
        |row| row.get(0),
    )?;

    conn.execute(
        "DELETE FROM cohort_members WHERE cohort_id = ?1",
        params![cohort_id],
    )?;
    let mut stmt = conn.prepare(
        "INSERT OR IGNORE INTO cohort_members (cohort_id, user_id, position) VALUES (?1, ?2, ?3)",
    )?;
    for (position, user_id) in users.iter().enumerate() {
        stmt.execute(params![cohort_id, user_id, position as i64])?;
    }
    Ok(cohort_id)
}

pub fn delete_cohort(conn: &Connection, name: &str) -> Result<bool, rusqlite::Error> {
    let count = conn.execute("DELETE FROM cohort_meta WHERE name = ?1", params![name])?;
    Ok(count > 0)
}

pub fn list_cohorts(conn: &Connection) -> Result<Vec<CohortInfo>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT m.cohort_id, m.name, m.description, m.created_at, COUNT(c.user_id)
         FROM cohort_meta m LEFT JOIN cohort_members c ON c.cohort_id = m.cohort_id
         GROUP BY m.cohort_id ORDER BY m.cohort_id",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(CohortInfo {
            cohort_id: row.get(0)?,
            name: row.get(1)?,
            description: row.get(2)?,
            created_at: row.get(3)?,
            member_count: row.get(4)?,
        })
    })?;
    rows.collect()
}

pub fn cohort_members_by_id(
    conn: &Connection,
    cohort_id: i64,
) -> Result<Vec<UserId>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT user_id FROM cohort_members WHERE cohort_id = ?1 ORDER BY position",
    )?;
    let rows = stmt.query_map(params![cohort_id], |row| row.get(0))?;
    rows.collect()
}

/// Members of the named cohort, `None` if no cohort has that name.
pub fn cohort_members_by_name(
    conn: &Connection,
    name: &str,
) -> Result<Option<Vec<UserId>>, rusqlite::Error> {
    let cohort_id: Option<i64> = conn
        .query_row(
            "SELECT cohort_id FROM cohort_meta WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )
        .optional()?;
    cohort_id
        .map(|id| cohort_members_by_id(conn, id))
        .transpose()
}

// ── Config ─────────────────────────────────────────────────────────

pub fn get_config(conn: &Connection, key: &str) -> Result<Option<String>, rusqlite::Error> {
    conn.query_row(
        "SELECT value FROM app_config WHERE key = ?1",
        params![key],
        |row| row.get(0),
    )
    .optional()
}

pub fn set_config(conn: &Connection, key: &str, value: &str) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT OR REPLACE INTO app_config (key, value, updated_at)
         VALUES (?1, ?2, datetime('now'))",
        params![key, value],
    )?;
    Ok(())
}

pub fn list_config(conn: &Connection) -> Result<Vec<(String, String)>, rusqlite::Error> {
    let mut stmt = conn.prepare("SELECT key, value FROM app_config ORDER BY key")?;
    let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
    rows.collect()
}

// ── Status ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreCounts {
    pub pages: i64,
    pub revisions: i64,
    pub registered_users: i64,
    pub cohorts: i64,
    pub first_revision: Option<String>,
    pub last_revision: Option<String>,
}

pub fn store_counts(conn: &Connection) -> Result<StoreCounts, rusqlite::Error> {
    let count = |table: &str| -> Result<i64, rusqlite::Error> {
        conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
            row.get(0)
        })
    };
    let (first_revision, last_revision) = conn.query_row(
        "SELECT MIN(timestamp), MAX(timestamp) FROM revision",
        [],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    Ok(StoreCounts {
        pages: count("page")?,
        revisions: count("revision")?,
        registered_users: count("user_registration")?,
        cohorts: count("cohort_meta")?,
        first_revision,
        last_revision,
    })
}

// ── Helpers ────────────────────────────────────────────────────────

fn timestamp_column(idx: usize, raw: &str) -> Result<NaiveDateTime, rusqlite::Error> {
    NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}
