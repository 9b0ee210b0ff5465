//! Execution job records and their status history.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Job lifecycle states. Terminal states end the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    Ready,
    Running,
    FinishedWithSuccess,
    FinishedWithError,
    Failed,
}

/// Reported when a job has no status entries at all.
pub const UNKNOWN_STATUS: &str = "UNKNOWN";

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Ready => "READY",
            Self::Running => "RUNNING",
            Self::FinishedWithSuccess => "FINISHED_WITH_SUCCESS",
            Self::FinishedWithError => "FINISHED_WITH_ERROR",
            Self::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::FinishedWithSuccess | Self::FinishedWithError | Self::Failed
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "QUEUED" => Ok(Self::Queued),
            "READY" => Ok(Self::Ready),
            "RUNNING" => Ok(Self::Running),
            "FINISHED_WITH_SUCCESS" => Ok(Self::FinishedWithSuccess),
            "FINISHED_WITH_ERROR" => Ok(Self::FinishedWithError),
            "FAILED" => Ok(Self::Failed),
            other => Err(format!("unknown job status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionJob {
    pub id: String,
    pub user_id: String,
    pub session_id: String,
    pub file_path: String,
    pub created_at: DateTime<Utc>,
    pub output: Option<String>,
    pub error: Option<String>,
    pub exit_code: Option<i64>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEntry {
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
}

/// Final result written by the worker.
#[derive(Debug, Clone, PartialEq)]
pub struct JobOutcome {
    pub output: Option<String>,
    pub error: Option<String>,
    pub exit_code: i64,
}

impl JobOutcome {
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            output: None,
            error: Some(message.into()),
            exit_code: -1,
        }
    }
}

/// A job together with its status log, oldest entry first.
#[derive(Debug, Clone, PartialEq)]
pub struct JobWithHistory {
    pub job: ExecutionJob,
    pub statuses: Vec<StatusEntry>,
}

impl JobWithHistory {
    /// The chronologically latest entry.
    pub fn current_status(&self) -> Option<JobStatus> {
        self.statuses
            .iter()
            .enumerate()
            .max_by_key(|(pos, entry)| (entry.created_at, *pos))
            .map(|(_, entry)| entry.status)
    }

    pub fn status_label(&self) -> &'static str {
        self.current_status()
            .map(|s| s.as_str())
            .unwrap_or(UNKNOWN_STATUS)
    }

    pub fn summary(&self) -> JobSummary {
        JobSummary {
            id: self.job.id.clone(),
            status: self.status_label(),
            file_path: self.job.file_path.clone(),
            created_at: self.job.created_at,
        }
    }

    pub fn detail(&self) -> JobDetail {
        let mut history = self.statuses.clone();
        history.sort_by_key(|entry| entry.created_at);
        JobDetail {
            id: self.job.id.clone(),
            status: self.status_label(),
            file_path: self.job.file_path.clone(),
            created_at: self.job.created_at,
            output: self.job.output.clone(),
            error: self.job.error.clone(),
            exit_code: self.job.exit_code,
            completed_at: self.job.completed_at,
            status_history: history,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSummary {
    pub id: String,
    pub status: &'static str,
    pub file_path: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDetail {
    pub id: String,
    pub status: &'static str,
    pub file_path: String,
    pub created_at: DateTime<Utc>,
    pub output: Option<String>,
    pub error: Option<String>,
    pub exit_code: Option<i64>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status_history: Vec<StatusEntry>,
}
