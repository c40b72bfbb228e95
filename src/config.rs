use std::path::PathBuf;

use crate::dispatch::{DispatchOptions, DEFAULT_INNER_POOL_SIZE, DEFAULT_OUTER_POOL_SIZE};
use crate::error::{Error, Result};

pub const OUTER_POOL_SIZE: &str = "outer_pool_size";
pub const INNER_POOL_SIZE: &str = "inner_pool_size";
pub const MAX_CONCURRENT_JOBS: &str = "max_concurrent_jobs";
pub const OUTPUT_DIR: &str = "output_dir";

pub const KNOWN_KEYS: [&str; 4] = [OUTER_POOL_SIZE, INNER_POOL_SIZE, MAX_CONCURRENT_JOBS, OUTPUT_DIR];

const DEFAULT_OUTPUT_DIR: &str = "usermetrics-out";

/// Typed view over the `app_config` key/value table, with built-in defaults
/// filled in. CLI flags override these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub outer_pool_size: usize,
    pub inner_pool_size: usize,
    pub max_concurrent_jobs: usize,
    pub output_dir: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            outer_pool_size: DEFAULT_OUTER_POOL_SIZE,
            inner_pool_size: DEFAULT_INNER_POOL_SIZE,
            max_concurrent_jobs: 1,
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
        }
    }
}

impl Settings {
    /// Build from stored `(key, value)` pairs. Unknown keys are ignored.
    pub fn from_pairs(pairs: &[(String, String)]) -> Result<Self> {
        let mut settings = Self::default();
        for (key, value) in pairs {
            match key.as_str() {
                OUTER_POOL_SIZE => settings.outer_pool_size = parse_pool_size(key, value)?,
                INNER_POOL_SIZE => settings.inner_pool_size = parse_pool_size(key, value)?,
                MAX_CONCURRENT_JOBS => settings.max_concurrent_jobs = parse_pool_size(key, value)?,
                OUTPUT_DIR => settings.output_dir = PathBuf::from(value),
                _ => log::debug!("ignoring unknown config key {key}"),
            }
        }
        Ok(settings)
    }

    /// Pool sizes from these settings; timeout and progress stay at defaults.
    pub fn dispatch_options(&self) -> DispatchOptions {
        DispatchOptions {
            outer_pool_size: self.outer_pool_size,
            inner_pool_size: self.inner_pool_size,
            ..Default::default()
        }
    }
}

/// Reject unknown keys and values that would fail to load later.
pub fn validate_entry(key: &str, value: &str) -> Result<()> {
    match key {
        OUTER_POOL_SIZE | INNER_POOL_SIZE | MAX_CONCURRENT_JOBS => {
            parse_pool_size(key, value).map(|_| ())
        }
        OUTPUT_DIR if value.trim().is_empty() => {
            Err(Error::Config("output_dir must not be empty".into()))
        }
        OUTPUT_DIR => Ok(()),
        _ => Err(Error::Config(format!(
            "unknown config key '{key}' (known: {})",
            KNOWN_KEYS.join(", ")
        ))),
    }
}

fn parse_pool_size(key: &str, value: &str) -> Result<usize> {
    match value.trim().parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(Error::Config(format!(
            "{key} must be a positive integer, got '{value}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(k: &str, v: &str) -> (String, String) {
        (k.to_string(), v.to_string())
    }

    #[test]
    fn test_defaults_when_nothing_stored() {
        let settings = Settings::from_pairs(&[]).unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.dispatch_options().outer_pool_size, DEFAULT_OUTER_POOL_SIZE);
    }

    #[test]
    fn test_stored_values_override_defaults() {
        let settings = Settings::from_pairs(&[
            pair(OUTER_POOL_SIZE, "20"),
            pair(OUTPUT_DIR, "/tmp/dash"),
            pair("legacy_key", "x"),
        ])
        .unwrap();
        assert_eq!(settings.outer_pool_size, 20);
        assert_eq!(settings.inner_pool_size, DEFAULT_INNER_POOL_SIZE);
        assert_eq!(settings.output_dir, PathBuf::from("/tmp/dash"));
    }

    #[test]
    fn test_validate_entry() {
        assert!(validate_entry(INNER_POOL_SIZE, "3").is_ok());
        assert!(validate_entry(INNER_POOL_SIZE, "0").is_err());
        assert!(validate_entry(MAX_CONCURRENT_JOBS, "many").is_err());
        assert!(validate_entry("workspace_gid", "1").is_err());
        assert!(validate_entry(OUTPUT_DIR, " ").is_err());
    }
}
