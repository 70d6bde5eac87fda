//! Job Configuration
//!
//! ## JobConfig
//!
//! Controls how every query job created by a [`JobStore`](crate::JobStore) runs:
//!
//! - **timeout_secs**: absolute deadline of a job's lifetime scope (default: 10 min)
//! - **poll_interval_ms**: delay between warehouse status fetches (default: 5 s)
//! - **max_partitions**: partitions requested for unordered queries (default: 10)
//! - **partition_queue_capacity**: blocks buffered per partition (default: 1024)
//! - **row_queue_capacity**: shared row queue bound; unset sizes it to the
//!   reported row count
//! - **failure_cleanup**: what happens to a truncated artifact (default: keep)
//! - **project_id** / **max_bytes_billed**: passed through on submission
//!
//! ## Environment
//!
//! [`JobConfig::from_env`] reads `QUARRY_JOB_TIMEOUT_SECS`,
//! `QUARRY_POLL_INTERVAL_MS`, `QUARRY_MAX_PARTITIONS`,
//! `QUARRY_ROW_QUEUE_CAPACITY`, `QUARRY_FAILURE_CLEANUP`, `QUARRY_PROJECT_ID`
//! and `QUARRY_MAX_BYTES_BILLED`. Unparsable values keep their default.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Largest shared row queue a job will allocate permits for.
const MAX_ROW_QUEUE_CAPACITY: usize = usize::MAX >> 4;

/// What to do with the output artifact when a job fails mid-write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureCleanup {
    /// Finalize the truncated artifact and leave it in place.
    #[default]
    Keep,
    /// Abort the upload and delete anything already written.
    Discard,
}

impl FromStr for FailureCleanup {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "keep" => Ok(FailureCleanup::Keep),
            "discard" => Ok(FailureCleanup::Discard),
            other => Err(format!("unknown failure cleanup '{}'", other)),
        }
    }
}

impl fmt::Display for FailureCleanup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureCleanup::Keep => write!(f, "keep"),
            FailureCleanup::Discard => write!(f, "discard"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobConfig {
    /// Lifetime scope deadline in seconds (default: 600)
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Warehouse status poll interval in milliseconds (default: 5000)
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Partitions requested when row order does not matter (default: 10)
    #[serde(default = "default_max_partitions")]
    pub max_partitions: u32,

    /// Binary blocks buffered between a partition's receiver and decoder (default: 1024)
    #[serde(default = "default_partition_queue_capacity")]
    pub partition_queue_capacity: usize,

    /// Shared row queue bound. `None` sizes it to the reported row count.
    #[serde(default)]
    pub row_queue_capacity: Option<usize>,

    #[serde(default)]
    pub failure_cleanup: FailureCleanup,

    /// Project the warehouse jobs are billed to.
    #[serde(default)]
    pub project_id: Option<String>,

    /// Upper bound on bytes billed per query.
    #[serde(default)]
    pub max_bytes_billed: Option<i64>,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            max_partitions: default_max_partitions(),
            partition_queue_capacity: default_partition_queue_capacity(),
            row_queue_capacity: None,
            failure_cleanup: FailureCleanup::default(),
            project_id: None,
            max_bytes_billed: None,
        }
    }
}

fn default_timeout_secs() -> u64 {
    10 * 60 // 10 minutes
}

fn default_poll_interval_ms() -> u64 {
    5_000
}

fn default_max_partitions() -> u32 {
    10
}

fn default_partition_queue_capacity() -> usize {
    1024
}

impl JobConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        Self {
            timeout_secs: parse_var(&lookup, "QUARRY_JOB_TIMEOUT_SECS").unwrap_or(defaults.timeout_secs),
            poll_interval_ms: parse_var(&lookup, "QUARRY_POLL_INTERVAL_MS")
                .unwrap_or(defaults.poll_interval_ms),
            max_partitions: parse_var(&lookup, "QUARRY_MAX_PARTITIONS")
                .unwrap_or(defaults.max_partitions),
            partition_queue_capacity: defaults.partition_queue_capacity,
            row_queue_capacity: parse_var(&lookup, "QUARRY_ROW_QUEUE_CAPACITY"),
            failure_cleanup: parse_var(&lookup, "QUARRY_FAILURE_CLEANUP")
                .unwrap_or(defaults.failure_cleanup),
            project_id: lookup("QUARRY_PROJECT_ID").filter(|s| !s.trim().is_empty()),
            max_bytes_billed: parse_var(&lookup, "QUARRY_MAX_BYTES_BILLED"),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// Capacity of the shared row queue for a result of `total_rows` rows.
    ///
    /// The header row takes one slot.
    pub fn row_queue_capacity_for(&self, total_rows: u64) -> usize {
        let wanted = match self.row_queue_capacity {
            Some(capacity) => capacity,
            None => usize::try_from(total_rows.saturating_add(1)).unwrap_or(usize::MAX),
        };
        wanted.clamp(1, MAX_ROW_QUEUE_CAPACITY)
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "Ignoring unparsable configuration value");
            None
        }
    }
}
