//! Runtime configuration.
//!
//! Defaults mirror the fixed deployment constants; the CLI in `main.rs`
//! overrides individual values from flags or environment variables.

use std::path::PathBuf;
use std::time::Duration;

/// Fixed source file every session works on.
pub const SOURCE_FILE_NAME: &str = "main.dart";

/// Program written into every new workspace.
pub const INITIAL_TEMPLATE: &str = "void main() {\n  print('Hello, Dart!');\n}\n";

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub session: SessionConfig,
    pub workspace: WorkspaceConfig,
    pub lifecycle: LifecycleConfig,
    pub execution: ExecutionConfig,
    pub bridge: BridgeConfig,
}

/// Admission and TTL settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub max_sessions: i64,
    pub ttl: Duration,
    /// TTL forced onto a record by an explicit close.
    pub close_ttl: Duration,
    pub count_reconcile_interval: Duration,
    pub max_upload_bytes: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_sessions: 4,
            ttl: Duration::from_secs(600),
            close_ttl: Duration::from_secs(1),
            count_reconcile_interval: Duration::from_secs(30),
            max_upload_bytes: 1024 * 1024,
        }
    }
}

/// Where workspace files live, locally and inside containers.
#[derive(Debug, Clone)]
pub struct WorkspaceConfig {
    /// Directory this process writes session workspaces into.
    pub code_files_path: PathBuf,
    /// Mount point of the shared volume inside every container.
    pub container_mount: String,
    /// Docker volume (or host path) backing `code_files_path`.
    pub volume: String,
}

impl WorkspaceConfig {
    pub fn session_dir(&self, session_id: &str) -> PathBuf {
        self.code_files_path.join(session_id)
    }

    pub fn source_file(&self, session_id: &str) -> PathBuf {
        self.session_dir(session_id).join(SOURCE_FILE_NAME)
    }

    /// Workspace root as seen from inside a container.
    pub fn container_root(&self, session_id: &str) -> String {
        format!("{}/{}", self.container_mount.trim_end_matches('/'), session_id)
    }

    /// Read-only bind of the shared volume.
    pub fn read_only_bind(&self) -> String {
        format!("{}:{}:ro", self.volume, self.container_mount)
    }
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            code_files_path: PathBuf::from("/code-files"),
            container_mount: "/code-files".to_string(),
            volume: "code-files".to_string(),
        }
    }
}

/// Workspace (language server) container settings and reconciliation cadence.
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub image: String,
    pub network: String,
    pub lsp_port: u16,
    pub memory_bytes: i64,
    pub nano_cpus: i64,
    pub scan_interval: Duration,
    pub cleanup_interval: Duration,
    pub stop_grace: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            image: "dart-lsp:3.9.4".to_string(),
            network: "backend".to_string(),
            lsp_port: 9000,
            memory_bytes: 512 * 1024 * 1024,
            nano_cpus: 1_000_000_000,
            scan_interval: Duration::from_secs(5),
            cleanup_interval: Duration::from_secs(10),
            stop_grace: Duration::from_secs(5),
        }
    }
}

/// Run container and worker pool settings.
#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    pub image: String,
    pub memory_bytes: i64,
    pub nano_cpus: i64,
    pub timeout: Duration,
    pub concurrency: usize,
    /// Deliveries per message, including the first.
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            image: "dart:3.9.4".to_string(),
            memory_bytes: 256 * 1024 * 1024,
            nano_cpus: 500_000_000,
            timeout: Duration::from_secs(30),
            concurrency: 4,
            attempts: 1,
            backoff: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Workspace root the client editor uses in document URIs.
    pub client_root: String,
    /// Public URL advertised to clients for the bridge endpoint.
    pub public_url: String,
    pub connect_timeout: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            client_root: "/workspace".to_string(),
            public_url: "http://localhost:8080".to_string(),
            connect_timeout: Duration::from_secs(5),
        }
    }
}
