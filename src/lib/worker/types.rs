use std::sync::Arc;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Mutex;

use crate::lib::errors::types::{ClassifiedError, ErrorCode};
use crate::lib::pull::pipeline::PullPipeline;
use crate::lib::pull::types::PullError;
use crate::lib::replace::orchestrator::Orchestrator;
use crate::lib::replace::types::{ConfigOverrides, ReplaceError};
use crate::lib::runtime::types::ContainerRuntime;
use crate::lib::session::router::SessionRouter;
use crate::lib::session::sender::MessageSender;

/// Owns the services and launches pulls and replacements in the background.
pub struct Worker {
    pub runtime: Arc<dyn ContainerRuntime>,
    pub pipeline: Arc<PullPipeline>,
    pub orchestrator: Arc<Orchestrator>,
    pub router: Arc<SessionRouter>,
    pub sender: MessageSender,
    pub sysinfo: Mutex<sysinfo::System>,
}

/// Work in flight at the moment stats were taken.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Workload {
    pub pulls: usize,
    pub replacements: usize,
    pub live_sessions: usize,
}

impl Workload {
    pub fn active_tasks(&self) -> usize {
        self.pulls + self.replacements
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct MemoryUsage {
    #[serde(serialize_with = "super::stats::megabytes")]
    pub total: u64,
    #[serde(serialize_with = "super::stats::megabytes")]
    pub used: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HostStats {
    pub system_name: String,
    pub hostname: String,
    pub total_cpus: usize,
    #[serde(serialize_with = "super::stats::percent")]
    pub cpu_usage: f32,
    pub memory: MemoryUsage,
    pub swap: MemoryUsage,
    #[serde(serialize_with = "super::stats::percent")]
    pub disk_usage: f32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemStats {
    #[serde(flatten)]
    pub host: HostStats,
    pub active_tasks: usize,
    pub workload: Workload,
}

pub struct TaskServer {
    pub worker: Arc<Worker>,
    pub listen: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullPayload {
    pub image_name: String,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerPayload {
    pub container_id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePayload {
    #[serde(default)]
    pub container_id: String,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub pull: bool,
    #[serde(default)]
    pub overrides: ConfigOverrides,
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImageQuery {
    pub reference: String,
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskAccepted {
    pub task_id: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Runtime(ClassifiedError),
    #[error(transparent)]
    Pull(#[from] PullError),
    #[error(transparent)]
    Replace(#[from] ReplaceError),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    BadRequest(String),
}

impl From<ClassifiedError> for ApiError {
    fn from(err: ClassifiedError) -> Self {
        ApiError::Runtime(err)
    }
}

fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::ContainerNotFound | ErrorCode::ImageNotFound => StatusCode::NOT_FOUND,
        ErrorCode::PortConflict
        | ErrorCode::ContainerNameConflict
        | ErrorCode::ImageInUse
        | ErrorCode::ContainerAlreadyRunning
        | ErrorCode::ContainerAlreadyStopped => StatusCode::CONFLICT,
        ErrorCode::InvalidConfig | ErrorCode::BindParseError | ErrorCode::MountPathNotShared => {
            StatusCode::BAD_REQUEST
        }
        ErrorCode::DaemonUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorCode::ImagePullFailed => StatusCode::BAD_GATEWAY,
        ErrorCode::Unknown => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl ApiError {
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            ApiError::Runtime(err) => Some(err.code),
            ApiError::Replace(err) => err.code(),
            _ => None,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Runtime(err) => status_for(err.code),
            ApiError::Pull(PullError::AlreadyPulling(_) | PullError::Cancelled(_)) => StatusCode::CONFLICT,
            ApiError::Pull(PullError::Exhausted { .. }) => StatusCode::BAD_GATEWAY,
            ApiError::Replace(ReplaceError::AlreadyActive(_)) => StatusCode::CONFLICT,
            ApiError::Replace(ReplaceError::Runtime(err)) => status_for(err.code),
            ApiError::Replace(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "code": self.code(),
            "message": self.to_string(),
        });
        (self.status(), Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
