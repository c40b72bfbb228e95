pub mod cohort;
pub mod config;
pub mod date_util;
pub mod dispatch;
pub mod error;
pub mod history;
pub mod metrics;
pub mod report;
pub mod storage;
pub mod timeseries;

pub use cohort::{CohortExpression, CohortSource, StaticCohorts};
pub use config::Settings;
pub use dispatch::{dispatch, DispatchOptions, DispatchProgress, LogProgress, NoopProgress};
pub use error::{Error, Result};
pub use history::{
    HistorySource, MemoryHistory, RegistrationIndex, Revision, RevisionFilter, UserId,
};
pub use metrics::{
    aggregate, AggregateSummary, CohortResultSet, MetricConfig, MetricKind, Outcome,
    RevertRateConfig, SurvivalConfig, ThresholdConfig,
};
pub use report::{JobOutcome, ReportDriver, ReportEntry, ReportJob};
pub use storage::Database;
pub use timeseries::{
    build_interval_series, read_snapshots, DataType, IntervalQuery, IntervalTable,
    MalformedLinePolicy, SeriesTable, SnapshotQuery, SnapshotRead, TimeSeriesCompiler,
};

// Re-export repository types needed by the binary crate, but not the module itself
pub use storage::repository::{CohortInfo, StoreCounts};

use std::sync::Arc;

use storage::repository;

/// Main entry point: the local store plus the report pipeline over it.
pub struct UserMetrics {
    db: Database,
}

impl UserMetrics {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Access the database (for direct queries in the CLI).
    pub fn db(&self) -> &Database {
        &self.db
    }

    /// Stored settings over built-in defaults.
    pub async fn settings(&self) -> Result<Settings> {
        let pairs = self.config_list().await?;
        Settings::from_pairs(&pairs)
    }

    /// Run report jobs with the store as both history and cohort source.
    pub async fn run_report(
        &self,
        jobs: Vec<ReportJob>,
        options: DispatchOptions,
        max_concurrent_jobs: usize,
        progress: Arc<dyn DispatchProgress>,
    ) -> Vec<ReportEntry> {
        let store = Arc::new(self.db.clone());
        ReportDriver::new(Arc::clone(&store), store, options)
            .with_max_concurrent_jobs(max_concurrent_jobs)
            .run(jobs, progress)
            .await
    }

    /// Interval time series over the stored registrations and history.
    pub async fn interval_series(
        &self,
        query: &IntervalQuery,
        options: &DispatchOptions,
        progress: Arc<dyn DispatchProgress>,
    ) -> Result<IntervalTable> {
        build_interval_series(Arc::new(self.db.clone()), query, options, progress).await
    }

    // ── Cohorts ────────────────────────────────────────────────────

    pub async fn cohort_save(
        &self,
        name: &str,
        description: Option<&str>,
        users: Vec<UserId>,
    ) -> Result<i64> {
        if CohortExpression::is_expression(name) {
            return Err(Error::Config(format!(
                "cohort name '{name}' would be read as a cohort id expression"
            )));
        }
        let id = self
            .db
            .writer()
            .call({
                let name = name.to_string();
                let description = description.map(str::to_string);
                move |conn| {
                    let tx = conn.transaction()?;
                    let id = repository::save_cohort(&tx, &name, description.as_deref(), &users)?;
                    tx.commit()?;
                    Ok::<i64, rusqlite::Error>(id)
                }
            })
            .await?;
        log::info!("saved cohort {name} (id {id})");
        Ok(id)
    }

    pub async fn cohort_list(&self) -> Result<Vec<CohortInfo>> {
        Ok(self
            .db
            .reader()
            .call(|conn| repository::list_cohorts(conn))
            .await?)
    }

    pub async fn cohort_members(&self, cohort: &str) -> Result<Vec<UserId>> {
        self.db.users(cohort).await
    }

    pub async fn cohort_delete(&self, name: &str) -> Result<bool> {
        Ok(self
            .db
            .writer()
            .call({
                let name = name.to_string();
                move |conn| repository::delete_cohort(conn, &name)
            })
            .await?)
    }

    pub async fn status(&self) -> Result<StoreCounts> {
        Ok(self
            .db
            .reader()
            .call(|conn| repository::store_counts(conn))
            .await?)
    }

    // ── Config commands ────────────────────────────────────────────

    pub async fn config_get(&self, key: &str) -> Result<Option<String>> {
        self.db
            .reader()
            .call({
                let key = key.to_string();
                move |conn| repository::get_config(conn, &key)
            })
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    /// Validates the key and value before storing.
    pub async fn config_set(&self, key: &str, value: &str) -> Result<()> {
        config::validate_entry(key, value)?;
        self.db
            .writer()
            .call({
                let key = key.to_string();
                let value = value.trim().to_string();
                move |conn| repository::set_config(conn, &key, &value)
            })
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    pub async fn config_list(&self) -> Result<Vec<(String, String)>> {
        self.db
            .reader()
            .call(|conn| repository::list_config(conn))
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::date_util::parse_timestamp;

    async fn app() -> UserMetrics {
        let db = Database::open_memory().await.unwrap();
        db.writer()
            .call(|conn| {
                repository::upsert_page(conn, 1, 0, "Sandbox")?;
                for (user, registered) in [("u1", "20130101000000"), ("u2", "20130101000000")] {
                    repository::set_registration(conn, user, parse_timestamp(registered).unwrap())?;
                }
                repository::insert_revision(
                    conn,
                    &Revision {
                        rev_id: 1,
                        page_id: 1,
                        namespace: 0,
                        user_id: "u1".into(),
                        user_text: "U1".into(),
                        timestamp: parse_timestamp("20130101013000").unwrap(),
                        sha1: "a".into(),
                    },
                )?;
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
        UserMetrics::new(db)
    }

    #[tokio::test]
    async fn test_config_set_validates() {
        let app = app().await;
        app.config_set("outer_pool_size", "16").await.unwrap();
        assert!(app.config_set("outer_pool_size", "0").await.is_err());
        assert!(app.config_set("bogus", "1").await.is_err());

        assert_eq!(app.config_get("outer_pool_size").await.unwrap().as_deref(), Some("16"));
        assert_eq!(app.settings().await.unwrap().outer_pool_size, 16);
    }

    #[tokio::test]
    async fn test_cohort_names_cannot_look_like_expressions() {
        let app = app().await;
        assert!(app.cohort_save("12", None, vec!["u1".into()]).await.is_err());
    }

    #[tokio::test]
    async fn test_report_against_store() {
        let app = app().await;
        app.cohort_save(
            "e3_ob2b",
            Some("onboarding"),
            vec!["u1".into(), "u2".into(), "u3".into()],
        )
        .await
        .unwrap();

        let jobs = vec![
            ReportJob::new("threshold", "e3_ob2b", MetricConfig::Threshold(ThresholdConfig::default())),
            ReportJob::new("by id", "1", MetricConfig::Survival(SurvivalConfig::default())),
        ];
        let entries = app
            .run_report(jobs, DispatchOptions::default(), 2, Arc::new(NoopProgress))
            .await;

        let Some(AggregateSummary::Attainment(threshold)) = entries[0].summary() else {
            panic!("expected attainment summary, got {:?}", entries[0].outcome);
        };
        assert_eq!(threshold.proportion, Some(0.5));
        assert_eq!(threshold.undefined, 1);

        let Some(AggregateSummary::Attainment(survival)) = entries[1].summary() else {
            panic!("expected attainment summary, got {:?}", entries[1].outcome);
        };
        assert_eq!(survival.met, 0);
        assert_eq!(survival.not_met, 2);

        let query = IntervalQuery {
            start: parse_timestamp("20130101000000").unwrap(),
            end: parse_timestamp("20130103000000").unwrap(),
            interval_hours: 24,
            metric: MetricConfig::Threshold(ThresholdConfig::default()),
            max_concurrent_intervals: 2,
        };
        let series = app
            .interval_series(&query, &DispatchOptions::default(), Arc::new(NoopProgress))
            .await
            .unwrap();
        assert_eq!(series.rows.len(), 2);
        let AggregateSummary::Attainment(first_day) = &series.rows[0].summary else {
            panic!("expected attainment summary");
        };
        assert_eq!((first_day.total, first_day.met), (2, 1));

        let status = app.status().await.unwrap();
        assert_eq!(status.revisions, 1);
        assert_eq!(status.cohorts, 1);
    }
}
