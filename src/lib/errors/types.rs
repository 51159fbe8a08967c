use std::fmt;

use serde::{Deserialize, Serialize};

/// Closed set of runtime failure categories surfaced to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    PortConflict,
    ImageNotFound,
    ContainerNameConflict,
    MountPathNotShared,
    ImageInUse,
    ContainerNotFound,
    ContainerAlreadyRunning,
    ContainerAlreadyStopped,
    ImagePullFailed,
    InvalidConfig,
    DaemonUnavailable,
    BindParseError,
    Unknown,
}

impl ErrorCode {
    /// Message used when a rule matched but could not extract a detail.
    pub fn default_message(&self) -> &'static str {
        match self {
            ErrorCode::PortConflict => "port is already allocated",
            ErrorCode::ImageNotFound => "image does not exist",
            ErrorCode::ContainerNameConflict => "container name is already in use",
            ErrorCode::MountPathNotShared => "mount path does not exist or is not accessible",
            ErrorCode::ImageInUse => "image is being used by a container",
            ErrorCode::ContainerNotFound => "container does not exist",
            ErrorCode::ContainerAlreadyRunning => "container is already running",
            ErrorCode::ContainerAlreadyStopped => "container is already stopped",
            ErrorCode::ImagePullFailed => "image could not be pulled",
            ErrorCode::InvalidConfig => "invalid container configuration",
            ErrorCode::DaemonUnavailable => "cannot connect to the container daemon",
            ErrorCode::BindParseError => "failed to parse bind mount",
            ErrorCode::Unknown => "unknown error",
        }
    }
}

/// Result of classifying a raw runtime error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClassifiedError {
    pub code: ErrorCode,
    pub message: String,
}

impl fmt::Display for ClassifiedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ClassifiedError {}
