//! Workspace container lifecycle.
//!
//! Two loops reconcile the sessions in the store against the containers this
//! process tracks: the provisioning scan starts one container per session
//! that lacks one, the cleanup scan tears down containers whose session
//! entry has vanished. The local map is a cache of the store and is always
//! safe to rebuild from a fresh scan.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::join_all;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{LifecycleConfig, WorkspaceConfig};
use crate::container::{ContainerError, ContainerRuntime, ContainerSpec};
use crate::error::Result;
use crate::session::SessionService;

pub fn container_name(session_id: &str) -> String {
    format!("lsp-{}", session_id)
}

/// Outcome of a single provisioning scan.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScanReport {
    pub started: Vec<String>,
    pub adopted: Vec<String>,
    pub failed: Vec<String>,
}

pub struct LifecycleManager {
    sessions: Arc<SessionService>,
    runtime: Arc<dyn ContainerRuntime>,
    config: LifecycleConfig,
    workspace: WorkspaceConfig,
    /// Session id to workspace container id.
    containers: RwLock<HashMap<String, String>>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl LifecycleManager {
    pub fn new(
        sessions: Arc<SessionService>,
        runtime: Arc<dyn ContainerRuntime>,
        config: LifecycleConfig,
        workspace: WorkspaceConfig,
    ) -> Self {
        Self {
            sessions,
            runtime,
            config,
            workspace,
            containers: RwLock::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Snapshot of the tracking map.
    pub async fn tracked(&self) -> HashMap<String, String> {
        self.containers.read().await.clone()
    }

    /// Sweep workspaces left behind by an earlier process, then spawn the
    /// provisioning and cleanup loops. Run before sessions are admitted.
    pub async fn start(self: &Arc<Self>) {
        if let Err(e) = self.sweep_orphaned_workspaces().await {
            error!(error = %e, "Error sweeping orphaned workspaces");
        }
        info!(
            scan_secs = self.config.scan_interval.as_secs(),
            cleanup_secs = self.config.cleanup_interval.as_secs(),
            "Container lifecycle manager started"
        );

        let scanner = {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(manager.config.scan_interval);
                loop {
                    tokio::select! {
                        _ = manager.shutdown.cancelled() => break,
                        _ = interval.tick() => {
                            if let Err(e) = manager.scan_sessions().await {
                                error!(error = %e, "Error scanning sessions");
                            }
                        }
                    }
                }
            })
        };

        let cleaner = {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(manager.config.cleanup_interval);
                loop {
                    tokio::select! {
                        _ = manager.shutdown.cancelled() => break,
                        _ = interval.tick() => {
                            if let Err(e) = manager.cleanup_expired().await {
                                error!(error = %e, "Error in cleanup worker");
                            }
                        }
                    }
                }
            })
        };

        self.tasks.lock().await.extend([scanner, cleaner]);
    }

    /// Delete workspace directories that have no session entry. With a
    /// store that does not outlive the process these are the workspaces of
    /// sessions that were still live at the last shutdown.
    pub async fn sweep_orphaned_workspaces(&self) -> Result<Vec<String>> {
        let mut removed = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.workspace.code_files_path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(removed),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let Some(session_id) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if self.sessions.exists(&session_id).await? {
                continue;
            }
            match tokio::fs::remove_dir_all(entry.path()).await {
                Ok(()) => {
                    info!(session_id = %session_id, "Removed orphaned workspace");
                    removed.push(session_id);
                }
                Err(e) => {
                    warn!(session_id = %session_id, error = %e, "Failed to remove orphaned workspace");
                }
            }
        }

        Ok(removed)
    }

    /// Provision or adopt a container for every live session not yet tracked.
    pub async fn scan_sessions(&self) -> Result<ScanReport> {
        let mut report = ScanReport::default();

        for session_id in self.sessions.list_ids().await? {
            if self.containers.read().await.contains_key(&session_id) {
                continue;
            }
            let Some(session) = self.sessions.get(&session_id).await? else {
                continue;
            };

            if let Some(container_id) = session.container_id.as_deref() {
                if self.adopt(&session_id, container_id).await {
                    report.adopted.push(session_id);
                    continue;
                }
            }

            match self.start_container(&session_id).await {
                Ok(()) => report.started.push(session_id),
                Err(e) => {
                    error!(session_id = %session_id, error = %e, "Error creating container for session");
                    report.failed.push(session_id);
                }
            }
        }

        Ok(report)
    }

    /// Track a container recorded by an earlier process instance, if it
    /// still exists.
    async fn adopt(&self, session_id: &str, container_id: &str) -> bool {
        match self.runtime.inspect(container_id).await {
            Ok(info) => {
                self.containers
                    .write()
                    .await
                    .insert(session_id.to_string(), info.id);
                info!(session_id = %session_id, container_id = %container_id, "Adopted existing container");
                true
            }
            Err(ContainerError::NotFound(_)) => {
                warn!(session_id = %session_id, container_id = %container_id, "Recorded container is gone, re-provisioning");
                false
            }
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Failed to inspect recorded container");
                false
            }
        }
    }

    fn workspace_spec(&self, session_id: &str) -> ContainerSpec {
        ContainerSpec {
            image: self.config.image.clone(),
            name: Some(container_name(session_id)),
            cmd: Vec::new(),
            working_dir: Some(self.workspace.container_root(session_id)),
            binds: vec![self.workspace.read_only_bind()],
            memory_bytes: self.config.memory_bytes,
            nano_cpus: self.config.nano_cpus,
            network_mode: self.config.network.clone(),
            exposed_port: Some(self.config.lsp_port),
            tty: false,
        }
    }

    async fn start_container(&self, session_id: &str) -> Result<()> {
        info!(session_id = %session_id, "Starting container for session");

        let name = container_name(session_id);
        let workspace_root = self.workspace.container_root(session_id);

        let container_id = match self.runtime.create(&self.workspace_spec(session_id)).await {
            Ok(id) => {
                self.runtime.start(&id).await?;
                id
            }
            // A previous instance created it but crashed before recording it.
            Err(ContainerError::Conflict(_)) => {
                let existing = self.runtime.inspect(&name).await?;
                if !existing.running {
                    self.runtime.start(&existing.id).await?;
                }
                info!(session_id = %session_id, container_id = %existing.id, "Container already exists, reusing");
                existing.id
            }
            Err(e) => return Err(e.into()),
        };

        self.containers
            .write()
            .await
            .insert(session_id.to_string(), container_id.clone());

        if !self
            .sessions
            .attach_container(session_id, &container_id, &name, &workspace_root)
            .await?
        {
            // Expired meanwhile; the cleanup scan will remove the container.
            warn!(session_id = %session_id, "Session vanished before container was recorded");
        }

        info!(
            session_id = %session_id,
            container_id = %container_id,
            container_name = %name,
            working_dir = %workspace_root,
            "Container started"
        );
        Ok(())
    }

    /// Tear down containers whose session entry no longer exists. Returns the
    /// sessions that were fully cleaned up.
    pub async fn cleanup_expired(&self) -> Result<Vec<String>> {
        let tracked = self.tracked().await;
        let mut cleaned = Vec::new();

        for (session_id, container_id) in tracked {
            match self.sessions.exists(&session_id).await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => {
                    warn!(session_id = %session_id, error = %e, "Failed to check session");
                    continue;
                }
            }

            if self.teardown(&session_id, &container_id, true).await {
                self.containers.write().await.remove(&session_id);
                cleaned.push(session_id);
            }
        }

        if !cleaned.is_empty() {
            info!("Cleaned up {} expired sessions", cleaned.len());
        }
        Ok(cleaned)
    }

    /// Stop and remove a container, optionally deleting the workspace files.
    /// Failures are logged; returns true only when everything succeeded so
    /// the next pass retries otherwise.
    async fn teardown(&self, session_id: &str, container_id: &str, remove_files: bool) -> bool {
        let mut ok = true;

        match self.runtime.stop(container_id, self.config.stop_grace).await {
            Ok(()) | Err(ContainerError::NotFound(_)) => {}
            Err(e) => warn!(container_id = %container_id, error = %e, "Error stopping container"),
        }
        match self.runtime.remove(container_id, true).await {
            Ok(()) | Err(ContainerError::NotFound(_)) => {
                info!(session_id = %session_id, container_id = %container_id, "Container stopped");
            }
            Err(e) => {
                error!(container_id = %container_id, error = %e, "Error removing container");
                ok = false;
            }
        }

        if remove_files {
            let dir = self.workspace.session_dir(session_id);
            match tokio::fs::remove_dir_all(&dir).await {
                Ok(()) => info!(session_id = %session_id, "Cleaned up files for session"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    error!(session_id = %session_id, error = %e, "Error cleaning up files for session");
                    ok = false;
                }
            }
        }

        ok
    }

    /// Stop the loops, then stop and remove every tracked container
    /// concurrently. Sessions that are still live keep their files and have
    /// their container identity cleared so the next instance re-provisions
    /// them from a persistent store; otherwise the next `start` sweeps them.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        for task in self.tasks.lock().await.drain(..) {
            let _ = task.await;
        }

        info!("Stopping all language server containers");
        let tracked: Vec<(String, String)> = self.containers.write().await.drain().collect();

        join_all(tracked.iter().map(|(session_id, container_id)| async move {
            let live = self.sessions.exists(session_id).await.unwrap_or(false);
            self.teardown(session_id, container_id, !live).await;
            if live {
                if let Err(e) = self.sessions.detach_container(session_id).await {
                    warn!(session_id = %session_id, error = %e, "Failed to clear container identity");
                }
            }
        }))
        .await;

        info!("Container lifecycle manager stopped");
    }
}
