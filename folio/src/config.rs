use crate::finder::DEFAULT_LIMIT;
use crate::jobs::DEFAULT_QUEUE;
use anyhow::{format_err, Result};
use dotenv::dotenv;
use lazy_static::lazy_static;
use std::env;
use std::str::FromStr;
use std::time::Duration;

lazy_static! {
    static ref DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1000);
}

pub const DEFAULT_MAX_PATH_SEGMENTS: usize = 20;
pub const DEFAULT_JOBS_LIMIT: i64 = 10;
pub const DEFAULT_JOBS_CONCURRENCY: usize = 4;

#[derive(Debug, Clone, PartialEq)]
pub struct JobsConfig {
    /// Maximum number of jobs fetched per scheduler run.
    pub limit: i64,
    /// Queue the poller runs. `None` runs every queue.
    pub queue: Option<String>,
    /// Maximum number of jobs executed at the same time.
    pub concurrency: usize,
    pub poll_interval: Duration,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            limit: DEFAULT_JOBS_LIMIT,
            queue: Some(DEFAULT_QUEUE.to_string()),
            concurrency: DEFAULT_JOBS_CONCURRENCY,
            poll_interval: *DEFAULT_POLL_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FolioConfig {
    pub default_limit: i64,
    pub max_path_segments: usize,
    pub jobs: JobsConfig,
}

impl Default for FolioConfig {
    fn default() -> Self {
        Self {
            default_limit: DEFAULT_LIMIT,
            max_path_segments: DEFAULT_MAX_PATH_SEGMENTS,
            jobs: JobsConfig::default(),
        }
    }
}

impl FolioConfig {
    /// Loads the configuration from the environment, reading a `.env` file first if present.
    ///
    /// Unset variables keep their default. `FOLIO_JOBS_QUEUE=*` runs every queue.
    pub fn from_env() -> Result<Self> {
        dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F: Fn(&str) -> Option<String>>(lookup: F) -> Result<Self> {
        let defaults = Self::default();
        let queue = match lookup("FOLIO_JOBS_QUEUE") {
            Some(queue) if queue == "*" => None,
            Some(queue) => Some(queue),
            None => defaults.jobs.queue,
        };
        let concurrency = parse(&lookup, "FOLIO_JOBS_CONCURRENCY")?
            .unwrap_or(defaults.jobs.concurrency);
        if concurrency == 0 {
            return Err(format_err!("FOLIO_JOBS_CONCURRENCY must be greater than 0"));
        }
        Ok(Self {
            default_limit: parse(&lookup, "FOLIO_DEFAULT_LIMIT")?.unwrap_or(defaults.default_limit),
            max_path_segments: parse(&lookup, "FOLIO_MAX_PATH_SEGMENTS")?
                .unwrap_or(defaults.max_path_segments),
            jobs: JobsConfig {
                limit: parse(&lookup, "FOLIO_JOBS_LIMIT")?.unwrap_or(defaults.jobs.limit),
                queue,
                concurrency,
                poll_interval: parse(&lookup, "FOLIO_JOBS_POLL_INTERVAL_MS")?
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.jobs.poll_interval),
            },
        })
    }
}

fn parse<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Debug,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|err| format_err!("Invalid value for {}: '{}' ({:?})", key, raw, err)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> Result<FolioConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        FolioConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[]).unwrap();
        assert_eq!(FolioConfig::default(), config);
        assert_eq!(10, config.default_limit);
        assert_eq!(Some("default".to_string()), config.jobs.queue);
    }

    #[test]
    fn test_overrides() {
        let config = config_from(&[
            ("FOLIO_DEFAULT_LIMIT", "25"),
            ("FOLIO_MAX_PATH_SEGMENTS", "5"),
            ("FOLIO_JOBS_LIMIT", "3"),
            ("FOLIO_JOBS_QUEUE", "*"),
            ("FOLIO_JOBS_CONCURRENCY", " 2 "),
            ("FOLIO_JOBS_POLL_INTERVAL_MS", "250"),
        ])
        .unwrap();
        assert_eq!(25, config.default_limit);
        assert_eq!(5, config.max_path_segments);
        assert_eq!(3, config.jobs.limit);
        assert_eq!(None, config.jobs.queue);
        assert_eq!(2, config.jobs.concurrency);
        assert_eq!(Duration::from_millis(250), config.jobs.poll_interval);
    }

    #[test]
    fn test_invalid_values() {
        assert!(config_from(&[("FOLIO_DEFAULT_LIMIT", "ten")]).is_err());
        assert!(config_from(&[("FOLIO_JOBS_CONCURRENCY", "0")]).is_err());
        assert!(config_from(&[("FOLIO_JOBS_POLL_INTERVAL_MS", "-1")]).is_err());
    }
}
