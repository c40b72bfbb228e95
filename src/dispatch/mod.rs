pub mod pool;

pub use pool::dispatch;

use std::time::Duration;

use crate::error::{Error, Result};

pub const DEFAULT_OUTER_POOL_SIZE: usize = 8;
pub const DEFAULT_INNER_POOL_SIZE: usize = 4;

/// Options controlling how a cohort is fanned out over workers.
#[derive(Debug, Clone)]
pub struct DispatchOptions {
    /// Maximum concurrent workers over users.
    pub outer_pool_size: usize,
    /// Maximum concurrent per-revision lookups inside one user's evaluation.
    pub inner_pool_size: usize,
    /// Give up on a single user after this long; siblings keep running.
    pub entity_timeout: Option<Duration>,
    /// Report per-user completion through [`DispatchProgress`].
    pub log_progress: bool,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            outer_pool_size: DEFAULT_OUTER_POOL_SIZE,
            inner_pool_size: DEFAULT_INNER_POOL_SIZE,
            entity_timeout: None,
            log_progress: false,
        }
    }
}

impl DispatchOptions {
    pub fn validate(&self) -> Result<()> {
        if self.outer_pool_size == 0 || self.inner_pool_size == 0 {
            return Err(Error::Config(format!(
                "pool sizes must be at least 1 (outer={}, inner={})",
                self.outer_pool_size, self.inner_pool_size
            )));
        }
        Ok(())
    }
}

/// Receives progress while a cohort is evaluated. Called from a dedicated
/// forwarding task, never from inside result accumulation.
pub trait DispatchProgress: Send + Sync {
    fn on_entity_complete(&self, _done: usize, _total: usize) {}
}

/// Progress sink that ignores every event.
pub struct NoopProgress;

impl DispatchProgress for NoopProgress {}

/// Logs completion at roughly every tenth of the cohort.
pub struct LogProgress;

impl DispatchProgress for LogProgress {
    fn on_entity_complete(&self, done: usize, total: usize) {
        let step = (total / 10).max(1);
        if done % step == 0 || done == total {
            log::info!("processed {done}/{total} users");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_rejects_zero_pools() {
        let options = DispatchOptions {
            outer_pool_size: 0,
            ..Default::default()
        };
        assert!(matches!(options.validate(), Err(Error::Config(_))));

        let options = DispatchOptions {
            inner_pool_size: 0,
            ..Default::default()
        };
        assert!(options.validate().is_err());

        assert!(DispatchOptions::default().validate().is_ok());
    }
}
