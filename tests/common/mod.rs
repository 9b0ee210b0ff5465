//! Shared fixtures for integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use codepod::bridge::LspBridge;
use codepod::config::{Config, SessionConfig, WorkspaceConfig};
use codepod::container::{
    ContainerError, ContainerInfo, ContainerResult, ContainerRuntime, ContainerSpec,
};
use codepod::http_server;
use codepod::jobs::{ExecutionService, JobRepository, MemoryQueue};
use codepod::session::SessionService;
use codepod::state::AppState;
use codepod::store::MemoryStore;

/// How `wait` behaves for run containers.
#[derive(Debug, Clone)]
pub enum WaitBehavior {
    Exit { code: i64, output: String },
    Hang,
}

#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub id: String,
    pub spec: ContainerSpec,
    pub running: bool,
}

/// In-process container engine recording every call.
pub struct FakeRuntime {
    containers: Mutex<HashMap<String, FakeContainer>>,
    created: Mutex<Vec<ContainerSpec>>,
    removed: Mutex<Vec<String>>,
    killed: Mutex<Vec<String>>,
    wait: Mutex<WaitBehavior>,
    next_id: AtomicUsize,
    pub fail_create: AtomicBool,
    pub fail_remove: AtomicBool,
    address: Mutex<Option<IpAddr>>,
    network: String,
}

impl FakeRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            containers: Mutex::new(HashMap::new()),
            created: Mutex::new(Vec::new()),
            removed: Mutex::new(Vec::new()),
            killed: Mutex::new(Vec::new()),
            wait: Mutex::new(WaitBehavior::Exit {
                code: 0,
                output: "Hello, Dart!\n".to_string(),
            }),
            next_id: AtomicUsize::new(1),
            fail_create: AtomicBool::new(false),
            fail_remove: AtomicBool::new(false),
            address: Mutex::new(Some("127.0.0.1".parse().unwrap())),
            network: "backend".to_string(),
        })
    }

    pub fn set_wait(&self, behavior: WaitBehavior) {
        *self.wait.lock().unwrap() = behavior;
    }

    pub fn set_address(&self, address: Option<IpAddr>) {
        *self.address.lock().unwrap() = address;
    }

    pub fn created(&self) -> Vec<ContainerSpec> {
        self.created.lock().unwrap().clone()
    }

    pub fn removed(&self) -> Vec<String> {
        self.removed.lock().unwrap().clone()
    }

    pub fn killed(&self) -> Vec<String> {
        self.killed.lock().unwrap().clone()
    }

    /// Containers that exist and have not been removed.
    pub fn live(&self) -> Vec<FakeContainer> {
        self.containers.lock().unwrap().values().cloned().collect()
    }

    /// Pretend a container already exists, as if left by an earlier process.
    pub fn insert_existing(&self, name: &str, running: bool) -> String {
        let id = self.allocate_id();
        self.containers.lock().unwrap().insert(
            id.clone(),
            FakeContainer {
                id: id.clone(),
                spec: ContainerSpec {
                    name: Some(name.to_string()),
                    ..ContainerSpec::default()
                },
                running,
            },
        );
        id
    }

    /// Make a container vanish without going through the runtime.
    pub fn forget(&self, id: &str) {
        self.containers.lock().unwrap().remove(id);
    }

    fn allocate_id(&self) -> String {
        format!("container-{}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn find(&self, id_or_name: &str) -> Option<FakeContainer> {
        let containers = self.containers.lock().unwrap();
        containers.get(id_or_name).cloned().or_else(|| {
            containers
                .values()
                .find(|c| c.spec.name.as_deref() == Some(id_or_name))
                .cloned()
        })
    }

    fn set_running(&self, id: &str, running: bool) -> ContainerResult<()> {
        let mut containers = self.containers.lock().unwrap();
        let container = containers
            .get_mut(id)
            .ok_or_else(|| ContainerError::NotFound(id.to_string()))?;
        container.running = running;
        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn create(&self, spec: &ContainerSpec) -> ContainerResult<String> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(ContainerError::Engine {
                operation: "create",
                message: "image not found".to_string(),
            });
        }
        if let Some(name) = spec.name.as_deref() {
            if self.find(name).is_some() {
                return Err(ContainerError::Conflict(name.to_string()));
            }
        }
        let id = self.allocate_id();
        self.created.lock().unwrap().push(spec.clone());
        self.containers.lock().unwrap().insert(
            id.clone(),
            FakeContainer {
                id: id.clone(),
                spec: spec.clone(),
                running: false,
            },
        );
        Ok(id)
    }

    async fn start(&self, id: &str) -> ContainerResult<()> {
        self.set_running(id, true)
    }

    async fn stop(&self, id: &str, _grace: Duration) -> ContainerResult<()> {
        self.set_running(id, false)
    }

    async fn kill(&self, id: &str) -> ContainerResult<()> {
        self.killed.lock().unwrap().push(id.to_string());
        self.set_running(id, false)
    }

    async fn remove(&self, id: &str, _force: bool) -> ContainerResult<()> {
        if self.fail_remove.load(Ordering::SeqCst) {
            return Err(ContainerError::Engine {
                operation: "remove",
                message: "device busy".to_string(),
            });
        }
        self.containers
            .lock()
            .unwrap()
            .remove(id)
            .ok_or_else(|| ContainerError::NotFound(id.to_string()))?;
        self.removed.lock().unwrap().push(id.to_string());
        Ok(())
    }

    async fn inspect(&self, id_or_name: &str) -> ContainerResult<ContainerInfo> {
        let container = self
            .find(id_or_name)
            .ok_or_else(|| ContainerError::NotFound(id_or_name.to_string()))?;
        let mut networks = HashMap::new();
        if let Some(ip) = *self.address.lock().unwrap() {
            networks.insert(self.network.clone(), ip);
        }
        Ok(ContainerInfo {
            id: container.id,
            running: container.running,
            networks,
        })
    }

    async fn wait(&self, id: &str) -> ContainerResult<i64> {
        if self.find(id).is_none() {
            return Err(ContainerError::NotFound(id.to_string()));
        }
        let behavior = self.wait.lock().unwrap().clone();
        match behavior {
            WaitBehavior::Exit { code, .. } => {
                self.set_running(id, false)?;
                Ok(code)
            }
            WaitBehavior::Hang => std::future::pending().await,
        }
    }

    async fn logs(&self, id: &str) -> ContainerResult<String> {
        if self.find(id).is_none() {
            return Err(ContainerError::NotFound(id.to_string()));
        }
        match &*self.wait.lock().unwrap() {
            WaitBehavior::Exit { output, .. } => Ok(output.clone()),
            WaitBehavior::Hang => Ok(String::new()),
        }
    }
}

pub fn workspace(root: &Path) -> WorkspaceConfig {
    WorkspaceConfig {
        code_files_path: root.to_path_buf(),
        ..WorkspaceConfig::default()
    }
}

pub fn sessions(root: &Path) -> Arc<SessionService> {
    Arc::new(SessionService::new(
        Arc::new(MemoryStore::new()),
        SessionConfig::default(),
        workspace(root),
    ))
}

/// The full HTTP surface served on an ephemeral local port.
pub struct TestApp {
    pub addr: SocketAddr,
    pub sessions: Arc<SessionService>,
    pub runtime: Arc<FakeRuntime>,
    pub dir: tempfile::TempDir,
}

impl TestApp {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn ws_url(&self, path: &str) -> String {
        format!("ws://{}{}", self.addr, path)
    }

    /// Give a session a running container, as the lifecycle manager would.
    pub async fn provision(&self, session_id: &str) -> String {
        let name = format!("lsp-{}", session_id);
        let container_id = self.runtime.insert_existing(&name, true);
        self.sessions
            .attach_container(
                session_id,
                &container_id,
                &name,
                &format!("/code-files/{}", session_id),
            )
            .await
            .unwrap();
        container_id
    }
}

pub async fn spawn_app(lsp_port: u16) -> TestApp {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.workspace.code_files_path = dir.path().to_path_buf();
    config.lifecycle.lsp_port = lsp_port;

    let runtime = FakeRuntime::new();
    let sessions = Arc::new(SessionService::new(
        Arc::new(MemoryStore::new()),
        config.session.clone(),
        config.workspace.clone(),
    ));
    let jobs = JobRepository::in_memory().await.unwrap();
    let executions = Arc::new(ExecutionService::new(
        jobs,
        Arc::new(MemoryQueue::new()),
        Arc::clone(&sessions),
    ));
    let bridge = Arc::new(LspBridge::new(
        Arc::clone(&sessions),
        runtime.clone(),
        &config.lifecycle,
        config.bridge.clone(),
    ));
    let state = AppState::new(Arc::clone(&sessions), executions, bridge, config);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, http_server::router(state)).await.unwrap();
    });

    TestApp {
        addr,
        sessions,
        runtime,
        dir,
    }
}
