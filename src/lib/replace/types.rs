use std::collections::HashMap;

use bollard::models::HostConfig;
use serde::{Deserialize, Serialize};

use crate::lib::errors::types::{ClassifiedError, ErrorCode};
use crate::lib::pull::types::PullError;
use crate::lib::runtime::types::ContainerSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReplacementState {
    Stopping,
    ConfigCaptured,
    BackedUp,
    Creating,
    Validating,
    Committed,
    RollingBack,
    Failed,
}

impl ReplacementState {
    pub fn progress(&self) -> u8 {
        match self {
            ReplacementState::Stopping => 10,
            ReplacementState::ConfigCaptured => 25,
            ReplacementState::BackedUp => 40,
            ReplacementState::Creating => 60,
            ReplacementState::Validating => 85,
            ReplacementState::Committed => 100,
            ReplacementState::RollingBack | ReplacementState::Failed => 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplacementJob {
    pub task_id: String,
    /// Container id or name the caller asked to replace.
    pub source_id: String,
    pub state: ReplacementState,
    /// Resolved once the source has been inspected.
    pub original_id: Option<String>,
    pub container_name: Option<String>,
    pub backup_name: Option<String>,
    pub new_container_id: Option<String>,
    pub error: Option<String>,
}

impl ReplacementJob {
    pub fn new(source_id: &str, task_id: &str) -> Self {
        ReplacementJob {
            task_id: task_id.to_string(),
            source_id: source_id.to_string(),
            state: ReplacementState::Stopping,
            original_id: None,
            container_name: None,
            backup_name: None,
            new_container_id: None,
            error: None,
        }
    }
}

/// Field-wise replacements for the captured container configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigOverrides {
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub env: Option<Vec<String>>,
    #[serde(default)]
    pub cmd: Option<Vec<String>>,
    /// Merged over the captured labels.
    #[serde(default)]
    pub labels: Option<HashMap<String, String>>,
    #[serde(default)]
    pub host_config: Option<HostConfig>,
}

impl ConfigOverrides {
    pub fn apply(&self, mut spec: ContainerSpec) -> ContainerSpec {
        if let Some(image) = &self.image {
            spec.image = image.clone();
        }
        if let Some(env) = &self.env {
            spec.env = env.clone();
        }
        if let Some(cmd) = &self.cmd {
            spec.cmd = Some(cmd.clone());
        }
        if let Some(labels) = &self.labels {
            spec.labels
                .extend(labels.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        if let Some(host_config) = &self.host_config {
            spec.host_config = Some(host_config.clone());
        }
        spec
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReplaceRequest {
    pub container_id: String,
    /// Acquire `overrides.image` through the pull pipeline before stopping.
    pub pull: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ReplaceError {
    #[error("container {0} is already being replaced")]
    AlreadyActive(String),
    #[error(transparent)]
    Pull(#[from] PullError),
    #[error("{0}")]
    Runtime(ClassifiedError),
    #[error("new container {0} is not running after start")]
    NotRunning(String),
    #[error("illegal replacement transition from {from:?} to {to:?}")]
    IllegalTransition {
        from: ReplacementState,
        to: ReplacementState,
    },
}

impl ReplaceError {
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            ReplaceError::Runtime(classified) => Some(classified.code),
            ReplaceError::Pull(PullError::Exhausted { .. }) => Some(ErrorCode::ImagePullFailed),
            _ => None,
        }
    }

    pub fn user_message(&self) -> String {
        match self {
            ReplaceError::Pull(err) => err.user_message(),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_only_touch_given_fields() {
        let spec = ContainerSpec {
            image: "app:1".to_string(),
            env: vec!["A=1".to_string()],
            cmd: Some(vec!["serve".to_string()]),
            labels: HashMap::from([("tier".to_string(), "web".to_string())]),
            ..Default::default()
        };
        let overrides = ConfigOverrides {
            image: Some("app:2".to_string()),
            labels: Some(HashMap::from([("rev".to_string(), "2".to_string())])),
            ..Default::default()
        };
        let spec = overrides.apply(spec);
        assert_eq!(spec.image, "app:2");
        assert_eq!(spec.env, vec!["A=1"]);
        assert_eq!(spec.cmd, Some(vec!["serve".to_string()]));
        assert_eq!(spec.labels.len(), 2);
    }

    #[test]
    fn progress_rises_through_forward_states() {
        let forward = [
            ReplacementState::Stopping,
            ReplacementState::ConfigCaptured,
            ReplacementState::BackedUp,
            ReplacementState::Creating,
            ReplacementState::Validating,
            ReplacementState::Committed,
        ];
        assert!(forward.windows(2).all(|w| w[0].progress() < w[1].progress()));
        assert_eq!(ReplacementState::Committed.progress(), 100);
    }
}
