pub mod expression;

pub use expression::CohortExpression;

use std::collections::BTreeMap;
use std::future::{ready, Future};

use crate::error::{Error, Result};
use crate::history::UserId;

/// Resolves a cohort name to its users. Only the identifier list is consumed.
pub trait CohortSource: Send + Sync + 'static {
    fn users(&self, cohort: &str) -> impl Future<Output = Result<Vec<UserId>>> + Send;
}

/// A registry of named cohorts built up front and handed to the report driver.
#[derive(Debug, Clone, Default)]
pub struct StaticCohorts {
    cohorts: BTreeMap<String, Vec<UserId>>,
}

impl StaticCohorts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<I, S>(mut self, name: &str, users: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<UserId>,
    {
        self.cohorts
            .insert(name.to_string(), users.into_iter().map(Into::into).collect());
        self
    }
}

impl CohortSource for StaticCohorts {
    fn users(&self, cohort: &str) -> impl Future<Output = Result<Vec<UserId>>> + Send {
        let result = self
            .cohorts
            .get(cohort)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("cohort '{cohort}'")));
        ready(result)
    }
}
