//! Worker side of the pipeline: one disposable run container per job.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info, warn};

use super::model::{ExecutionJob, JobOutcome, JobStatus, JobWithHistory};
use super::queue::{JobHandler, JobMessage};
use super::repository::JobRepository;
use crate::config::{ExecutionConfig, WorkspaceConfig};
use crate::container::{ContainerRuntime, ContainerSpec};
use crate::error::{Error, Result};

pub struct ExecutionProcessor {
    jobs: JobRepository,
    runtime: Arc<dyn ContainerRuntime>,
    config: ExecutionConfig,
    workspace: WorkspaceConfig,
}

impl ExecutionProcessor {
    pub fn new(
        jobs: JobRepository,
        runtime: Arc<dyn ContainerRuntime>,
        config: ExecutionConfig,
        workspace: WorkspaceConfig,
    ) -> Self {
        Self {
            jobs,
            runtime,
            config,
            workspace,
        }
    }

    pub fn run_spec(&self, job: &ExecutionJob) -> ContainerSpec {
        let entrypoint = format!(
            "{}/{}",
            self.workspace.container_root(&job.session_id),
            job.file_path
        );
        ContainerSpec {
            image: self.config.image.clone(),
            name: None,
            cmd: vec!["dart".to_string(), "run".to_string(), entrypoint],
            working_dir: None,
            binds: vec![self.workspace.read_only_bind()],
            memory_bytes: self.config.memory_bytes,
            nano_cpus: self.config.nano_cpus,
            network_mode: "none".to_string(),
            exposed_port: None,
            tty: true,
        }
    }

    /// Run one job to a terminal status.
    ///
    /// Failures after the job is loaded are recorded on the job and then
    /// returned, so the queue can apply its own redelivery policy. A
    /// redelivered job that already reached a terminal status is a no-op.
    pub async fn process(&self, job_id: &str) -> Result<()> {
        info!(job_id = %job_id, "Processing execution job");

        let job = self
            .jobs
            .find(job_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("Execution job {} not found", job_id)))?;

        // Delivery is at-least-once; a job already in a terminal state is done.
        let history = JobWithHistory {
            statuses: self.jobs.statuses(job_id).await?,
            job,
        };
        if let Some(status) = history.current_status().filter(JobStatus::is_terminal) {
            info!(job_id = %job_id, status = %status.as_str(), "Job already finished, skipping");
            return Ok(());
        }
        let job = history.job;

        match self.execute(&job).await {
            Ok(()) => Ok(()),
            // Already recorded as FINISHED_WITH_ERROR.
            Err(e @ Error::Timeout(_)) => Err(e),
            Err(e) => {
                error!(job_id = %job_id, error = %e, "Error processing job");
                if let Err(record_err) = self
                    .jobs
                    .record_outcome(job_id, &JobOutcome::failure(e.to_string()))
                    .await
                {
                    error!(job_id = %job_id, error = %record_err, "Failed to record job failure");
                }
                if let Err(log_err) = self.jobs.append_status(job_id, JobStatus::Failed).await {
                    error!(job_id = %job_id, error = %log_err, "Failed to append FAILED status");
                }
                Err(e)
            }
        }
    }

    async fn execute(&self, job: &ExecutionJob) -> Result<()> {
        let job_id = job.id.as_str();
        self.jobs.append_status(job_id, JobStatus::Ready).await?;

        let container_id = self.runtime.create(&self.run_spec(job)).await?;
        info!(job_id = %job_id, container_id = %container_id, "Run container created");

        if let Err(e) = self.runtime.start(&container_id).await {
            self.discard(&container_id).await;
            return Err(e.into());
        }
        if let Err(e) = self.jobs.append_status(job_id, JobStatus::Running).await {
            self.discard(&container_id).await;
            return Err(e);
        }

        let exit_code = match tokio::time::timeout(self.config.timeout, self.runtime.wait(&container_id)).await {
            Ok(Ok(code)) => code,
            Ok(Err(e)) => {
                self.discard(&container_id).await;
                return Err(e.into());
            }
            Err(_) => {
                warn!(job_id = %job_id, container_id = %container_id, "Execution timed out");
                self.discard(&container_id).await;
                let timeout = Error::Timeout(self.config.timeout);
                self.jobs
                    .record_outcome(job_id, &JobOutcome::failure(timeout.to_string()))
                    .await?;
                self.jobs
                    .append_status(job_id, JobStatus::FinishedWithError)
                    .await?;
                return Err(timeout);
            }
        };

        info!(job_id = %job_id, exit_code, "Container finished");

        let output = match self.runtime.logs(&container_id).await {
            Ok(output) => output,
            Err(e) => {
                self.discard(&container_id).await;
                return Err(e.into());
            }
        };
        self.runtime.remove(&container_id, false).await?;

        let (outcome, status) = if exit_code == 0 {
            (
                JobOutcome {
                    output: Some(output),
                    error: None,
                    exit_code,
                },
                JobStatus::FinishedWithSuccess,
            )
        } else {
            (
                JobOutcome {
                    output: None,
                    error: Some(output),
                    exit_code,
                },
                JobStatus::FinishedWithError,
            )
        };
        self.jobs.record_outcome(job_id, &outcome).await?;
        self.jobs.append_status(job_id, status).await?;
        Ok(())
    }

    /// Force-kill and remove, ignoring failures.
    async fn discard(&self, container_id: &str) {
        if let Err(e) = self.runtime.kill(container_id).await {
            warn!(container_id = %container_id, error = %e, "Failed to kill run container");
        }
        if let Err(e) = self.runtime.remove(container_id, true).await {
            warn!(container_id = %container_id, error = %e, "Failed to remove run container");
        }
    }
}

#[async_trait]
impl JobHandler for ExecutionProcessor {
    async fn handle(&self, message: &JobMessage) -> Result<()> {
        self.process(&message.job_id).await
    }
}
