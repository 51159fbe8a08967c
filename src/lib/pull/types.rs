use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    Mirror,
    Proxy,
    Direct,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::Mirror => write!(f, "mirror"),
            Strategy::Proxy => write!(f, "proxy"),
            Strategy::Direct => write!(f, "direct"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PullStatus {
    Idle,
    Pulling,
    Success,
    Failed,
}

/// `(repository, tag)` identity of a pull.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageKey {
    pub repository: String,
    pub tag: String,
}

impl ImageKey {
    pub fn new(repository: &str, tag: Option<&str>) -> Self {
        let tag = tag.map(str::trim).filter(|t| !t.is_empty()).unwrap_or("latest");
        ImageKey {
            repository: repository.trim().to_string(),
            tag: tag.to_string(),
        }
    }

    /// Parse `repo[:tag]`, ignoring a registry port like `host:5000/app`.
    pub fn parse(reference: &str) -> Self {
        let reference = reference.trim();
        let last_slash = reference.rfind('/').map(|i| i + 1).unwrap_or(0);
        match reference[last_slash..].rfind(':') {
            Some(i) => {
                let split = last_slash + i;
                ImageKey::new(&reference[..split], Some(&reference[split + 1..]))
            }
            None => ImageKey::new(reference, None),
        }
    }

    /// Repository with the implicit official namespace made explicit.
    /// Mirrors do not resolve bare official names like `nginx`.
    pub fn normalized_repository(&self) -> String {
        if self.repository.contains('/') {
            self.repository.clone()
        } else {
            format!("library/{}", self.repository)
        }
    }
}

impl fmt::Display for ImageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.repository, self.tag)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullTask {
    pub task_id: String,
    pub repository: String,
    pub tag: String,
    pub strategy: Option<Strategy>,
    pub status: PullStatus,
    pub progress: u8,
    pub last_message: String,
}

/// One subprocess invocation of the copy tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyRequest {
    pub source: String,
    pub destination: String,
    pub proxy: Option<String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempt {
    pub strategy: Strategy,
    /// Human readable route, e.g. the mirror host.
    pub route: String,
    pub request: CopyRequest,
}

#[derive(Debug, thiserror::Error)]
pub enum CopyError {
    #[error("failed to launch {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },
    #[error("copy timed out after {}s", .0.as_secs())]
    TimedOut(Duration),
    #[error("{reason}")]
    Failed { code: Option<i32>, reason: String },
    #[error("reading copy output failed: {0}")]
    Io(#[from] std::io::Error),
}

impl CopyError {
    /// Short reason suitable for a client log line.
    pub fn reason(&self) -> String {
        match self {
            CopyError::Spawn { tool, source } if source.kind() == std::io::ErrorKind::NotFound => {
                format!("{} is not installed", tool)
            }
            other => other.to_string(),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum PullError {
    #[error("image {0} is already being pulled")]
    AlreadyPulling(String),
    #[error("pull of {0} cancelled")]
    Cancelled(String),
    #[error("all pull strategies failed for {image}, check the network connection and image name")]
    Exhausted {
        image: String,
        last_reason: Option<String>,
    },
}

impl PullError {
    pub fn user_message(&self) -> String {
        match self {
            PullError::Exhausted {
                last_reason: Some(reason),
                ..
            } => format!("{} (last error: {})", self, reason),
            other => other.to_string(),
        }
    }
}

/// Receives the ordered events of a long-running operation.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn on_progress(&self, percent: u8);
    async fn on_log(&self, line: &str);
    async fn on_complete(&self);
    async fn on_error(&self, detail: &str);
}
