//! Job submission and queries.

use std::sync::Arc;

use tracing::info;

use super::model::{ExecutionJob, JobWithHistory};
use super::queue::{JobMessage, JobQueue};
use super::repository::JobRepository;
use crate::config::SOURCE_FILE_NAME;
use crate::error::{Error, Result};
use crate::session::SessionService;

pub struct ExecutionService {
    jobs: JobRepository,
    queue: Arc<dyn JobQueue>,
    sessions: Arc<SessionService>,
}

impl ExecutionService {
    pub fn new(jobs: JobRepository, queue: Arc<dyn JobQueue>, sessions: Arc<SessionService>) -> Self {
        Self {
            jobs,
            queue,
            sessions,
        }
    }

    /// Queue a run of the session's source file.
    ///
    /// The enqueue happens only after the job row and its `QUEUED` entry are
    /// committed; a crash in between leaves a `QUEUED` job for an external
    /// reconciler.
    pub async fn submit(&self, user_id: &str, session_id: &str) -> Result<ExecutionJob> {
        if session_id.is_empty() {
            return Err(Error::validation("sessionId is required"));
        }
        self.sessions.get_owned(session_id, user_id).await?;

        let source = self.sessions.workspace().source_file(session_id);
        if !tokio::fs::try_exists(&source).await.unwrap_or(false) {
            return Err(Error::not_found(format!(
                "File {} not found in session {}",
                SOURCE_FILE_NAME, session_id
            )));
        }

        let job = self
            .jobs
            .create_queued(user_id, session_id, SOURCE_FILE_NAME)
            .await?;

        self.queue
            .enqueue(JobMessage {
                job_id: job.id.clone(),
            })
            .await?;

        self.sessions.touch(session_id).await?;

        info!(job_id = %job.id, session_id = %session_id, "Execution job queued");
        Ok(job)
    }

    pub async fn list_by_user(&self, user_id: &str) -> Result<Vec<JobWithHistory>> {
        self.jobs.list_by_user(user_id).await
    }

    /// Jobs of a session the requester owns. Jobs outlive their session, so
    /// an expired session still lists its history when the jobs are the
    /// requester's.
    pub async fn list_by_session(&self, user_id: &str, session_id: &str) -> Result<Vec<JobWithHistory>> {
        if let Some(session) = self.sessions.get(session_id).await? {
            if session.user_id != user_id {
                return Err(Error::forbidden("Session does not belong to user"));
            }
        }
        let jobs = self.jobs.list_by_session(session_id).await?;
        Ok(jobs.into_iter().filter(|j| j.job.user_id == user_id).collect())
    }

    pub async fn get(&self, user_id: &str, job_id: &str) -> Result<JobWithHistory> {
        self.jobs
            .find_for_user(job_id, user_id)
            .await?
            .ok_or_else(|| Error::not_found("Execution job not found"))
    }
}
