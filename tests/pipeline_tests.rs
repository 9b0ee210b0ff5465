mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use codepod::config::ExecutionConfig;
use codepod::jobs::{
    DeliveryPolicy, ExecutionProcessor, ExecutionService, JobRepository, JobStatus, MemoryQueue,
    WorkerPool,
};
use codepod::session::SessionService;
use codepod::Error;
use common::{FakeRuntime, WaitBehavior};

struct Pipeline {
    _dir: tempfile::TempDir,
    sessions: Arc<SessionService>,
    runtime: Arc<FakeRuntime>,
    jobs: JobRepository,
    queue: Arc<MemoryQueue>,
    service: ExecutionService,
    processor: Arc<ExecutionProcessor>,
}

async fn pipeline(config: ExecutionConfig) -> Pipeline {
    let dir = tempfile::tempdir().unwrap();
    let sessions = common::sessions(dir.path());
    let runtime = FakeRuntime::new();
    let jobs = JobRepository::in_memory().await.unwrap();
    let queue = Arc::new(MemoryQueue::new());
    let service = ExecutionService::new(jobs.clone(), queue.clone(), Arc::clone(&sessions));
    let processor = Arc::new(ExecutionProcessor::new(
        jobs.clone(),
        runtime.clone(),
        config,
        common::workspace(dir.path()),
    ));
    Pipeline {
        _dir: dir,
        sessions,
        runtime,
        jobs,
        queue,
        service,
        processor,
    }
}

fn statuses(history: &[codepod::jobs::StatusEntry]) -> Vec<JobStatus> {
    history.iter().map(|e| e.status).collect()
}

#[tokio::test]
async fn successful_run_records_output_and_history() {
    let p = pipeline(ExecutionConfig::default()).await;
    let session = p.sessions.create_session("alice").await.unwrap().session_id;

    let job = p.service.submit("alice", &session).await.unwrap();
    assert_eq!(job.file_path, "main.dart");
    p.processor.process(&job.id).await.unwrap();

    let done = p.service.get("alice", &job.id).await.unwrap();
    assert_eq!(done.job.exit_code, Some(0));
    assert_eq!(done.job.output.as_deref(), Some("Hello, Dart!\n"));
    assert!(done.job.error.is_none());
    assert!(done.job.completed_at.is_some());
    assert_eq!(
        statuses(&done.statuses),
        vec![
            JobStatus::Queued,
            JobStatus::Ready,
            JobStatus::Running,
            JobStatus::FinishedWithSuccess
        ]
    );
    assert_eq!(done.summary().status, "FINISHED_WITH_SUCCESS");

    let spec = &p.runtime.created()[0];
    assert_eq!(spec.image, "dart:3.9.4");
    assert_eq!(
        spec.cmd,
        vec![
            "dart".to_string(),
            "run".to_string(),
            format!("/code-files/{}/main.dart", session)
        ]
    );
    assert_eq!(spec.network_mode, "none");
    assert_eq!(spec.memory_bytes, 256 * 1024 * 1024);
    assert_eq!(spec.nano_cpus, 500_000_000);
    assert_eq!(spec.binds, vec!["code-files:/code-files:ro".to_string()]);
    assert!(p.runtime.live().is_empty());
}

#[tokio::test]
async fn nonzero_exit_is_finished_with_error() {
    let p = pipeline(ExecutionConfig::default()).await;
    p.runtime.set_wait(WaitBehavior::Exit {
        code: 254,
        output: "main.dart:2:3: Error: Expected ';' after this.\n".to_string(),
    });
    let session = p.sessions.create_session("alice").await.unwrap().session_id;

    let job = p.service.submit("alice", &session).await.unwrap();
    p.processor.process(&job.id).await.unwrap();

    let done = p.service.get("alice", &job.id).await.unwrap();
    assert_eq!(done.job.exit_code, Some(254));
    assert!(done.job.output.is_none());
    assert!(done.job.error.as_deref().unwrap().contains("Expected ';'"));
    assert_eq!(done.current_status(), Some(JobStatus::FinishedWithError));
    assert!(p.runtime.live().is_empty());
}

#[tokio::test]
async fn run_past_deadline_is_killed() {
    let p = pipeline(ExecutionConfig {
        timeout: Duration::from_secs(1),
        ..ExecutionConfig::default()
    })
    .await;
    p.runtime.set_wait(WaitBehavior::Hang);
    let session = p.sessions.create_session("alice").await.unwrap().session_id;

    let job = p.service.submit("alice", &session).await.unwrap();
    let err = p.processor.process(&job.id).await.unwrap_err();
    assert!(matches!(err, Error::Timeout(_)));

    let done = p.service.get("alice", &job.id).await.unwrap();
    assert_eq!(done.job.exit_code, Some(-1));
    assert_eq!(done.job.error.as_deref(), Some("Execution timeout (1s)"));
    assert_eq!(
        statuses(&done.statuses),
        vec![
            JobStatus::Queued,
            JobStatus::Ready,
            JobStatus::Running,
            JobStatus::FinishedWithError
        ]
    );
    assert_eq!(p.runtime.killed().len(), 1);
    assert!(p.runtime.live().is_empty());
}

#[tokio::test]
async fn infrastructure_failure_marks_job_failed() {
    let p = pipeline(ExecutionConfig::default()).await;
    p.runtime.fail_create.store(true, Ordering::SeqCst);
    let session = p.sessions.create_session("alice").await.unwrap().session_id;

    let job = p.service.submit("alice", &session).await.unwrap();
    assert!(p.processor.process(&job.id).await.is_err());

    let done = p.service.get("alice", &job.id).await.unwrap();
    assert_eq!(done.job.exit_code, Some(-1));
    assert!(done.job.error.as_deref().unwrap().contains("image not found"));
    assert_eq!(
        statuses(&done.statuses),
        vec![JobStatus::Queued, JobStatus::Ready, JobStatus::Failed]
    );
}

#[tokio::test]
async fn redelivered_job_runs_once() {
    let p = pipeline(ExecutionConfig::default()).await;
    let session = p.sessions.create_session("alice").await.unwrap().session_id;
    let job = p.service.submit("alice", &session).await.unwrap();

    p.processor.process(&job.id).await.unwrap();
    p.processor.process(&job.id).await.unwrap();

    let done = p.service.get("alice", &job.id).await.unwrap();
    assert_eq!(
        statuses(&done.statuses),
        vec![
            JobStatus::Queued,
            JobStatus::Ready,
            JobStatus::Running,
            JobStatus::FinishedWithSuccess
        ]
    );
    assert_eq!(p.runtime.created().len(), 1);
}

#[tokio::test]
async fn timed_out_job_is_not_rerun_on_redelivery() {
    let p = pipeline(ExecutionConfig {
        timeout: Duration::from_secs(1),
        ..ExecutionConfig::default()
    })
    .await;
    p.runtime.set_wait(WaitBehavior::Hang);
    let session = p.sessions.create_session("alice").await.unwrap().session_id;
    let job = p.service.submit("alice", &session).await.unwrap();

    assert!(p.processor.process(&job.id).await.is_err());
    p.processor.process(&job.id).await.unwrap();

    let done = p.service.get("alice", &job.id).await.unwrap();
    let terminal = done.statuses.iter().filter(|e| e.status.is_terminal()).count();
    assert_eq!(terminal, 1);
    assert_eq!(p.runtime.created().len(), 1);
}

#[tokio::test]
async fn unknown_job_is_rejected_without_records() {
    let p = pipeline(ExecutionConfig::default()).await;
    assert!(p.processor.process("does-not-exist").await.is_err());
    assert!(p.jobs.statuses("does-not-exist").await.unwrap().is_empty());
    assert!(p.runtime.created().is_empty());
}

#[tokio::test]
async fn submit_checks_session_and_source_file() {
    let p = pipeline(ExecutionConfig::default()).await;
    let session = p.sessions.create_session("alice").await.unwrap().session_id;

    assert!(matches!(
        p.service.submit("alice", "").await,
        Err(Error::Validation(_))
    ));
    assert!(matches!(
        p.service.submit("alice", "missing").await,
        Err(Error::NotFound(_))
    ));
    assert!(matches!(
        p.service.submit("mallory", &session).await,
        Err(Error::Forbidden(_))
    ));

    std::fs::remove_file(p.sessions.workspace().source_file(&session)).unwrap();
    match p.service.submit("alice", &session).await {
        Err(Error::NotFound(msg)) => assert!(msg.contains("main.dart")),
        other => panic!("unexpected result: {:?}", other.map(|j| j.id)),
    }
    assert!(p.service.list_by_user("alice").await.unwrap().is_empty());
}

#[tokio::test]
async fn queries_are_scoped_to_the_requester() {
    let p = pipeline(ExecutionConfig::default()).await;
    let session = p.sessions.create_session("alice").await.unwrap().session_id;
    let first = p.service.submit("alice", &session).await.unwrap();
    let second = p.service.submit("alice", &session).await.unwrap();

    let listed = p.service.list_by_session("alice", &session).await.unwrap();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].job.id, second.id);
    assert_eq!(listed[0].summary().status, "QUEUED");

    assert!(matches!(
        p.service.list_by_session("mallory", &session).await,
        Err(Error::Forbidden(_))
    ));
    assert!(matches!(
        p.service.get("mallory", &first.id).await,
        Err(Error::NotFound(_))
    ));
    assert!(p.service.list_by_user("mallory").await.unwrap().is_empty());
}

#[tokio::test]
async fn worker_pool_drives_submitted_jobs_to_completion() {
    let p = pipeline(ExecutionConfig::default()).await;
    let pool = WorkerPool::spawn(&p.queue, p.processor.clone(), 4, DeliveryPolicy::default())
        .await
        .unwrap();
    let session = p.sessions.create_session("alice").await.unwrap().session_id;

    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(p.service.submit("alice", &session).await.unwrap().id);
    }

    for id in &ids {
        let mut finished = false;
        for _ in 0..100 {
            let job = p.service.get("alice", id).await.unwrap();
            if job.current_status().is_some_and(|s| s.is_terminal()) {
                assert_eq!(job.current_status(), Some(JobStatus::FinishedWithSuccess));
                finished = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(finished, "job {} did not finish", id);
    }

    pool.shutdown().await;
    assert_eq!(p.runtime.created().len(), 3);
}
