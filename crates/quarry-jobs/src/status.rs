//! Job status events and lifecycle states.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Status event relayed to a job's consumer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// No progress to report: not started yet, or ended without success.
    #[default]
    Unspecified,
    Running,
    ReadingResults,
    Done,
}

impl JobStatus {
    /// Numeric wire value.
    pub fn as_i32(self) -> i32 {
        match self {
            JobStatus::Unspecified => 0,
            JobStatus::Running => 1,
            JobStatus::ReadingResults => 2,
            JobStatus::Done => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Unspecified => "UNSPECIFIED",
            JobStatus::Running => "RUNNING",
            JobStatus::ReadingResults => "READING_RESULTS",
            JobStatus::Done => "DONE",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a job.
///
/// `Created -> Running -> ReadingResults -> Done`, and any non-terminal state
/// can move to `Cancelled`. `Done` and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    #[default]
    Created,
    Running,
    ReadingResults,
    Done,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Done | JobState::Cancelled)
    }

    /// Status event emitted on entering this state.
    pub fn status(self) -> JobStatus {
        match self {
            JobState::Created | JobState::Cancelled => JobStatus::Unspecified,
            JobState::Running => JobStatus::Running,
            JobState::ReadingResults => JobStatus::ReadingResults,
            JobState::Done => JobStatus::Done,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Created => write!(f, "CREATED"),
            JobState::Running => write!(f, "RUNNING"),
            JobState::ReadingResults => write!(f, "READING_RESULTS"),
            JobState::Done => write!(f, "DONE"),
            JobState::Cancelled => write!(f, "CANCELLED"),
        }
    }
}
