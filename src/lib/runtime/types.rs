use std::collections::HashMap;

use async_trait::async_trait;
use bollard::models::HostConfig;
use serde::{Deserialize, Serialize};

/// Error surfaced by the container runtime. The message text is the only
/// structured signal available, it feeds the error classifier.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct RuntimeError {
    pub message: String,
}

impl RuntimeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<bollard::errors::Error> for RuntimeError {
    fn from(err: bollard::errors::Error) -> Self {
        RuntimeError::new(err.to_string())
    }
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSummary {
    pub id: String,
    /// Names without the leading `/` the daemon reports.
    pub names: Vec<String>,
    pub image: String,
    pub state: String,
    pub status: String,
}

impl ContainerSummary {
    pub fn has_name(&self, name: &str) -> bool {
        let name = name.trim_start_matches('/');
        self.names.iter().any(|n| n == name)
    }
}

/// Creation-time configuration of a container, captured from inspect and
/// replayed when the container is recreated.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub image: String,
    pub env: Vec<String>,
    pub cmd: Option<Vec<String>>,
    pub entrypoint: Option<Vec<String>>,
    pub working_dir: Option<String>,
    pub user: Option<String>,
    pub labels: HashMap<String, String>,
    pub exposed_ports: Vec<String>,
    pub tty: bool,
    /// Mounts, port bindings, restart policy, resources and networking.
    pub host_config: Option<HostConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSnapshot {
    pub id: String,
    pub name: String,
    pub running: bool,
    pub spec: ContainerSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageSummary {
    pub id: String,
    pub repo_tags: Vec<String>,
    pub size: i64,
    pub created: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageDetail {
    pub id: String,
    pub repo_tags: Vec<String>,
    pub size: i64,
    pub created: Option<String>,
    pub architecture: Option<String>,
    pub os: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSummary {
    pub id: String,
    pub name: String,
    pub driver: String,
    pub containers: Vec<String>,
}

/// Facade over the container runtime. Every call is a request/response RPC.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn list_containers(&self) -> RuntimeResult<Vec<ContainerSummary>>;
    async fn inspect_container(&self, id: &str) -> RuntimeResult<ContainerSnapshot>;
    async fn create_container(&self, name: &str, spec: &ContainerSpec) -> RuntimeResult<String>;
    async fn start_container(&self, id: &str) -> RuntimeResult<()>;
    async fn stop_container(&self, id: &str) -> RuntimeResult<()>;
    async fn remove_container(&self, id: &str, force: bool) -> RuntimeResult<()>;
    async fn rename_container(&self, id: &str, new_name: &str) -> RuntimeResult<()>;

    async fn list_images(&self) -> RuntimeResult<Vec<ImageSummary>>;
    async fn inspect_image(&self, reference: &str) -> RuntimeResult<ImageDetail>;
    async fn remove_image(&self, reference: &str, force: bool) -> RuntimeResult<()>;

    async fn list_networks(&self) -> RuntimeResult<Vec<NetworkSummary>>;
    async fn inspect_network(&self, id: &str) -> RuntimeResult<NetworkSummary>;
}
