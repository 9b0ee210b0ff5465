//! Container control surface.
//!
//! `ContainerRuntime` is the seam between the orchestration code and the
//! engine; `DockerRuntime` drives a Docker daemon through bollard.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, KillContainerOptions, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::models::HostConfig;
use bollard::Docker;
use futures_util::StreamExt;
use thiserror::Error;
use tracing::debug;

pub type ContainerResult<T> = Result<T, ContainerError>;

#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("container not found: {0}")]
    NotFound(String),

    /// A container with the requested name already exists.
    #[error("container name already in use: {0}")]
    Conflict(String),

    #[error("container {operation} failed: {message}")]
    Engine { operation: &'static str, message: String },

    #[error("container runtime unavailable: {0}")]
    Unavailable(String),
}

/// Everything needed to create a container.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerSpec {
    pub image: String,
    pub name: Option<String>,
    pub cmd: Vec<String>,
    pub working_dir: Option<String>,
    pub binds: Vec<String>,
    pub memory_bytes: i64,
    pub nano_cpus: i64,
    pub network_mode: String,
    pub exposed_port: Option<u16>,
    pub tty: bool,
}

/// Subset of inspect output the orchestrator cares about.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerInfo {
    pub id: String,
    pub running: bool,
    /// Network name to container address.
    pub networks: HashMap<String, IpAddr>,
}

impl ContainerInfo {
    pub fn address_on(&self, network: &str) -> Option<IpAddr> {
        self.networks.get(network).copied()
    }
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create a container and return its id.
    async fn create(&self, spec: &ContainerSpec) -> ContainerResult<String>;

    async fn start(&self, id: &str) -> ContainerResult<()>;

    /// Stop with a grace period, after which the engine force-kills.
    async fn stop(&self, id: &str, grace: Duration) -> ContainerResult<()>;

    async fn kill(&self, id: &str) -> ContainerResult<()>;

    async fn remove(&self, id: &str, force: bool) -> ContainerResult<()>;

    /// Look up a container by id or name.
    async fn inspect(&self, id_or_name: &str) -> ContainerResult<ContainerInfo>;

    /// Block until the container exits and return its exit code.
    async fn wait(&self, id: &str) -> ContainerResult<i64>;

    /// Combined stdout/stderr captured so far.
    async fn logs(&self, id: &str) -> ContainerResult<String>;
}

/// bollard-backed runtime talking to the local Docker daemon.
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    pub fn connect() -> ContainerResult<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| ContainerError::Unavailable(e.to_string()))?;
        Ok(Self { docker })
    }

    pub fn from_client(docker: Docker) -> Self {
        Self { docker }
    }
}

fn engine_error(operation: &'static str, id: &str, err: bollard::errors::Error) -> ContainerError {
    match err {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        } => ContainerError::NotFound(id.to_string()),
        bollard::errors::Error::DockerResponseServerError {
            status_code: 409,
            message,
        } if operation == "create" => {
            debug!(name = %id, message = %message, "Name conflict on create");
            ContainerError::Conflict(id.to_string())
        }
        other => ContainerError::Engine {
            operation,
            message: other.to_string(),
        },
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create(&self, spec: &ContainerSpec) -> ContainerResult<String> {
        let host_config = HostConfig {
            binds: if spec.binds.is_empty() {
                None
            } else {
                Some(spec.binds.clone())
            },
            memory: Some(spec.memory_bytes),
            nano_cpus: Some(spec.nano_cpus),
            network_mode: Some(spec.network_mode.clone()),
            ..Default::default()
        };

        let exposed_ports = spec.exposed_port.map(|port| {
            let mut ports = HashMap::new();
            ports.insert(format!("{}/tcp", port), HashMap::new());
            ports
        });

        let config = Config {
            image: Some(spec.image.clone()),
            cmd: if spec.cmd.is_empty() {
                None
            } else {
                Some(spec.cmd.clone())
            },
            working_dir: spec.working_dir.clone(),
            exposed_ports,
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(spec.tty),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = spec.name.clone().map(|name| CreateContainerOptions {
            name,
            platform: None,
        });
        let label = spec.name.as_deref().unwrap_or(&spec.image);

        let response = self
            .docker
            .create_container(options, config)
            .await
            .map_err(|e| engine_error("create", label, e))?;
        Ok(response.id)
    }

    async fn start(&self, id: &str) -> ContainerResult<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| engine_error("start", id, e))
    }

    async fn stop(&self, id: &str, grace: Duration) -> ContainerResult<()> {
        let options = StopContainerOptions {
            t: grace.as_secs() as i64,
        };
        match self.docker.stop_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            // Already stopped.
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(engine_error("stop", id, e)),
        }
    }

    async fn kill(&self, id: &str) -> ContainerResult<()> {
        self.docker
            .kill_container(id, None::<KillContainerOptions<String>>)
            .await
            .map_err(|e| engine_error("kill", id, e))
    }

    async fn remove(&self, id: &str, force: bool) -> ContainerResult<()> {
        let options = RemoveContainerOptions {
            force,
            ..Default::default()
        };
        self.docker
            .remove_container(id, Some(options))
            .await
            .map_err(|e| engine_error("remove", id, e))
    }

    async fn inspect(&self, id_or_name: &str) -> ContainerResult<ContainerInfo> {
        let response = self
            .docker
            .inspect_container(id_or_name, None::<InspectContainerOptions>)
            .await
            .map_err(|e| engine_error("inspect", id_or_name, e))?;

        let networks = response
            .network_settings
            .and_then(|settings| settings.networks)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|(name, endpoint)| {
                let ip = endpoint.ip_address.filter(|ip| !ip.is_empty())?;
                ip.parse::<IpAddr>().ok().map(|ip| (name, ip))
            })
            .collect();

        Ok(ContainerInfo {
            id: response.id.unwrap_or_else(|| id_or_name.to_string()),
            running: response.state.and_then(|s| s.running).unwrap_or(false),
            networks,
        })
    }

    async fn wait(&self, id: &str) -> ContainerResult<i64> {
        let mut stream = Box::pin(
            self.docker
                .wait_container(id, None::<WaitContainerOptions<String>>),
        );
        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // bollard reports a nonzero exit as an error carrying the code.
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(engine_error("wait", id, e)),
            None => Err(ContainerError::Engine {
                operation: "wait",
                message: "wait stream ended without a status".to_string(),
            }),
        }
    }

    async fn logs(&self, id: &str) -> ContainerResult<String> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            follow: false,
            ..Default::default()
        };
        let mut stream = Box::pin(self.docker.logs(id, Some(options)));
        let mut output = String::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| engine_error("logs", id, e))?;
            output.push_str(&String::from_utf8_lossy(&chunk.into_bytes()));
        }
        Ok(output)
    }
}
