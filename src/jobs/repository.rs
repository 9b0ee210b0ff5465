//! Durable job records on SQLite.

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::FromRow;
use tracing::debug;

use super::model::{ExecutionJob, JobOutcome, JobStatus, JobWithHistory, StatusEntry};
use crate::error::{Error, Result};

#[derive(Debug, FromRow)]
struct JobRow {
    id: String,
    user_id: String,
    session_id: String,
    file_path: String,
    created_at: DateTime<Utc>,
    output: Option<String>,
    error: Option<String>,
    exit_code: Option<i64>,
    completed_at: Option<DateTime<Utc>>,
}

impl From<JobRow> for ExecutionJob {
    fn from(row: JobRow) -> Self {
        Self {
            id: row.id,
            user_id: row.user_id,
            session_id: row.session_id,
            file_path: row.file_path,
            created_at: row.created_at,
            output: row.output,
            error: row.error,
            exit_code: row.exit_code,
            completed_at: row.completed_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct StatusRow {
    job_id: String,
    status: String,
    created_at: DateTime<Utc>,
}

impl StatusRow {
    fn into_entry(self) -> Result<StatusEntry> {
        let status = JobStatus::from_str(&self.status).map_err(|e| {
            Error::Database(sqlx::Error::Decode(e.into()))
        })?;
        Ok(StatusEntry {
            status,
            created_at: self.created_at,
        })
    }
}

const JOB_COLUMNS: &str =
    "id, user_id, session_id, file_path, created_at, output, error, exit_code, completed_at";

/// Job rows plus their append-only status logs.
#[derive(Debug, Clone)]
pub struct JobRepository {
    pool: SqlitePool,
}

impl JobRepository {
    /// Open (or create) the database at `path` and run migrations.
    pub async fn connect(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let repo = Self { pool };
        repo.migrate().await?;
        Ok(repo)
    }

    /// Private in-memory database, used by tests.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let repo = Self { pool };
        repo.migrate().await?;
        Ok(repo)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Database(e.into()))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Insert the job and its initial `QUEUED` entry in one transaction.
    pub async fn create_queued(
        &self,
        user_id: &str,
        session_id: &str,
        file_path: &str,
    ) -> Result<ExecutionJob> {
        let now = Utc::now();
        let job = ExecutionJob {
            id: uuid::Uuid::now_v7().simple().to_string(),
            user_id: user_id.to_string(),
            session_id: session_id.to_string(),
            file_path: file_path.to_string(),
            created_at: now,
            output: None,
            error: None,
            exit_code: None,
            completed_at: None,
        };

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO execution_jobs (id, user_id, session_id, file_path, created_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&job.id)
        .bind(&job.user_id)
        .bind(&job.session_id)
        .bind(&job.file_path)
        .bind(job.created_at)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "INSERT INTO execution_job_status_logs (id, job_id, status, created_at) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(uuid::Uuid::now_v7().simple().to_string())
        .bind(&job.id)
        .bind(JobStatus::Queued.as_str())
        .bind(now)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(job)
    }

    pub async fn find(&self, job_id: &str) -> Result<Option<ExecutionJob>> {
        let row: Option<JobRow> = sqlx::query_as(&format!(
            "SELECT {} FROM execution_jobs WHERE id = ?",
            JOB_COLUMNS
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    /// The job with its history, only if it belongs to `user_id`.
    pub async fn find_for_user(&self, job_id: &str, user_id: &str) -> Result<Option<JobWithHistory>> {
        let row: Option<JobRow> = sqlx::query_as(&format!(
            "SELECT {} FROM execution_jobs WHERE id = ? AND user_id = ?",
            JOB_COLUMNS
        ))
        .bind(job_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let statuses = self.statuses(job_id).await?;
        Ok(Some(JobWithHistory {
            job: row.into(),
            statuses,
        }))
    }

    /// Status log of one job, in append order.
    pub async fn statuses(&self, job_id: &str) -> Result<Vec<StatusEntry>> {
        let rows: Vec<StatusRow> = sqlx::query_as(
            "SELECT job_id, status, created_at FROM execution_job_status_logs \
             WHERE job_id = ? ORDER BY created_at ASC, rowid ASC",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(StatusRow::into_entry).collect()
    }

    pub async fn list_by_session(&self, session_id: &str) -> Result<Vec<JobWithHistory>> {
        self.list_where("session_id", session_id).await
    }

    pub async fn list_by_user(&self, user_id: &str) -> Result<Vec<JobWithHistory>> {
        self.list_where("user_id", user_id).await
    }

    /// Newest jobs first, each with its full log.
    async fn list_where(&self, column: &'static str, value: &str) -> Result<Vec<JobWithHistory>> {
        let jobs: Vec<JobRow> = sqlx::query_as(&format!(
            "SELECT {} FROM execution_jobs WHERE {} = ? ORDER BY created_at DESC, id DESC",
            JOB_COLUMNS, column
        ))
        .bind(value)
        .fetch_all(&self.pool)
        .await?;

        let logs: Vec<StatusRow> = sqlx::query_as(&format!(
            "SELECT l.job_id, l.status, l.created_at FROM execution_job_status_logs l \
             JOIN execution_jobs j ON j.id = l.job_id WHERE j.{} = ? \
             ORDER BY l.created_at ASC, l.rowid ASC",
            column
        ))
        .bind(value)
        .fetch_all(&self.pool)
        .await?;

        let mut by_job: HashMap<String, Vec<StatusEntry>> = HashMap::new();
        for row in logs {
            let job_id = row.job_id.clone();
            by_job.entry(job_id).or_default().push(row.into_entry()?);
        }

        Ok(jobs
            .into_iter()
            .map(|row| {
                let statuses = by_job.remove(&row.id).unwrap_or_default();
                JobWithHistory {
                    job: row.into(),
                    statuses,
                }
            })
            .collect())
    }

    /// Append one entry to the job's status log.
    pub async fn append_status(&self, job_id: &str, status: JobStatus) -> Result<()> {
        sqlx::query(
            "INSERT INTO execution_job_status_logs (id, job_id, status, created_at) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(uuid::Uuid::now_v7().simple().to_string())
        .bind(job_id)
        .bind(status.as_str())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        debug!(job_id = %job_id, status = %status, "Job status appended");
        Ok(())
    }

    pub async fn record_outcome(&self, job_id: &str, outcome: &JobOutcome) -> Result<()> {
        sqlx::query(
            "UPDATE execution_jobs SET output = ?, error = ?, exit_code = ?, completed_at = ? \
             WHERE id = ?",
        )
        .bind(&outcome.output)
        .bind(&outcome.error)
        .bind(outcome.exit_code)
        .bind(Utc::now())
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
