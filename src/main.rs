//! Codepod - disposable Dart coding sandboxes behind an HTTP API.
//!
//! Usage:
//!   codepod serve [--port 8080]           # Start HTTP server, lifecycle manager and workers

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use codepod::bridge::LspBridge;
use codepod::config::Config;
use codepod::container::{ContainerRuntime, DockerRuntime};
use codepod::http_server;
use codepod::jobs::{
    DeliveryPolicy, ExecutionProcessor, ExecutionService, JobRepository, MemoryQueue, WorkerPool,
};
use codepod::lifecycle::LifecycleManager;
use codepod::session::SessionService;
use codepod::state::AppState;
use codepod::store::MemoryStore;

#[derive(Parser, Debug)]
#[command(name = "codepod")]
#[command(about = "Disposable Dart coding sandboxes with language server and code execution")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP server, the container lifecycle manager and the execution workers
    Serve(ServeArgs),
}

#[derive(clap::Args, Debug)]
struct ServeArgs {
    /// Port to listen on
    #[arg(long, env = "CODEPOD_PORT", default_value = "8080")]
    port: u16,

    /// SQLite database holding execution jobs
    #[arg(long, env = "CODEPOD_DATABASE", default_value = "/var/lib/codepod/jobs.db")]
    database: PathBuf,

    /// Local directory with session workspaces
    #[arg(long, env = "CODE_FILES_PATH", default_value = "/code-files")]
    code_files_path: PathBuf,

    /// Docker volume (or host path) backing the workspace directory
    #[arg(long, env = "CODE_FILES_VOLUME", default_value = "code-files")]
    code_files_volume: String,

    /// Maximum number of concurrent sessions
    #[arg(long, env = "CODEPOD_MAX_SESSIONS", default_value = "4")]
    max_sessions: i64,

    /// Session time-to-live in seconds
    #[arg(long, env = "CODEPOD_SESSION_TTL", default_value = "600")]
    session_ttl: u64,

    /// Language server image
    #[arg(long, env = "CODEPOD_LSP_IMAGE", default_value = "dart-lsp:3.9.4")]
    lsp_image: String,

    /// Docker network the language server containers join
    #[arg(long, env = "CODEPOD_NETWORK", default_value = "backend")]
    network: String,

    /// Image used to run submitted programs
    #[arg(long, env = "CODEPOD_RUN_IMAGE", default_value = "dart:3.9.4")]
    run_image: String,

    /// Execution timeout in seconds
    #[arg(long, env = "CODEPOD_EXECUTION_TIMEOUT", default_value = "30")]
    execution_timeout: u64,

    /// Number of jobs executed concurrently
    #[arg(long, env = "CODEPOD_WORKERS", default_value = "4")]
    workers: usize,

    /// Deliveries per job, including the first
    #[arg(long, env = "CODEPOD_JOB_ATTEMPTS", default_value = "1")]
    job_attempts: u32,

    /// Workspace root used by clients in document URIs
    #[arg(long, env = "CODEPOD_CLIENT_ROOT", default_value = "/workspace")]
    client_root: String,

    /// Public URL advertised for the language server WebSocket
    #[arg(long, env = "CODEPOD_PUBLIC_URL", default_value = "http://localhost:8080")]
    public_url: String,
}

impl ServeArgs {
    fn config(&self) -> Config {
        let mut config = Config::default();
        config.session.max_sessions = self.max_sessions;
        config.session.ttl = Duration::from_secs(self.session_ttl);
        config.workspace.code_files_path = self.code_files_path.clone();
        config.workspace.volume = self.code_files_volume.clone();
        config.lifecycle.image = self.lsp_image.clone();
        config.lifecycle.network = self.network.clone();
        config.execution.image = self.run_image.clone();
        config.execution.timeout = Duration::from_secs(self.execution_timeout);
        config.execution.concurrency = self.workers;
        config.execution.attempts = self.job_attempts;
        config.bridge.client_root = self.client_root.clone();
        config.bridge.public_url = self.public_url.clone();
        config
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Serve(serve_args) => serve(serve_args).await,
    }
}

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    let config = args.config();

    tokio::fs::create_dir_all(&config.workspace.code_files_path)
        .await
        .with_context(|| {
            format!(
                "creating workspace directory {}",
                config.workspace.code_files_path.display()
            )
        })?;

    let runtime: Arc<dyn ContainerRuntime> =
        Arc::new(DockerRuntime::connect().context("connecting to Docker")?);
    let jobs = JobRepository::connect(&args.database)
        .await
        .context("opening job database")?;

    let sessions = Arc::new(SessionService::new(
        Arc::new(MemoryStore::new()),
        config.session.clone(),
        config.workspace.clone(),
    ));

    let queue = Arc::new(MemoryQueue::new());
    let processor = Arc::new(ExecutionProcessor::new(
        jobs.clone(),
        Arc::clone(&runtime),
        config.execution.clone(),
        config.workspace.clone(),
    ));
    let pool = WorkerPool::spawn(
        &queue,
        processor,
        config.execution.concurrency,
        DeliveryPolicy {
            attempts: config.execution.attempts,
            backoff: config.execution.backoff,
        },
    )
    .await
    .context("starting execution workers")?;

    let executions = Arc::new(ExecutionService::new(
        jobs,
        queue.clone(),
        Arc::clone(&sessions),
    ));

    let lifecycle = Arc::new(LifecycleManager::new(
        Arc::clone(&sessions),
        Arc::clone(&runtime),
        config.lifecycle.clone(),
        config.workspace.clone(),
    ));
    lifecycle.start().await;

    let shutdown = CancellationToken::new();
    let reconciler = sessions.spawn_count_reconciler(shutdown.clone());

    let bridge = Arc::new(LspBridge::new(
        Arc::clone(&sessions),
        Arc::clone(&runtime),
        &config.lifecycle,
        config.bridge.clone(),
    ));

    let state = AppState::new(sessions, executions, bridge, config);

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown signal received");
            }
            shutdown.cancel();
        });
    }

    http_server::run_server(args.port, state, shutdown.clone())
        .await
        .context("running HTTP server")?;

    shutdown.cancel();
    let _ = reconciler.await;
    lifecycle.shutdown().await;
    pool.shutdown().await;
    info!("Shutdown complete");
    Ok(())
}
