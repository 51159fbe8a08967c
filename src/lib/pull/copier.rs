use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::analyzer;
use super::types::{CopyError, CopyRequest};

const PROXY_VARS: [&str; 4] = ["HTTP_PROXY", "HTTPS_PROXY", "http_proxy", "https_proxy"];

/// Bound on waiting for the stderr reader once stdout has closed.
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Copies an image from a registry into the local image store.
///
/// Every stdout line is pushed to `output` as it arrives. The sender is
/// dropped when the copy finishes so the consumer sees end-of-stream.
#[async_trait]
pub trait ImageCopier: Send + Sync {
    async fn copy(
        &self,
        request: &CopyRequest,
        output: mpsc::UnboundedSender<String>,
    ) -> Result<(), CopyError>;
}

/// [`ImageCopier`] that shells out to `skopeo copy`.
#[derive(Debug, Clone)]
pub struct SkopeoCopier {
    tool: String,
    platform_override: Option<(String, String)>,
}

impl SkopeoCopier {
    pub fn new(tool: impl Into<String>) -> Self {
        // Apple silicon hosts run linux/arm64 images in the daemon VM.
        let platform_override = (std::env::consts::OS == "macos"
            && std::env::consts::ARCH == "aarch64")
            .then(|| ("arm64".to_string(), "linux".to_string()));
        SkopeoCopier {
            tool: tool.into(),
            platform_override,
        }
    }

    pub fn build_args(&self, request: &CopyRequest) -> Vec<String> {
        let mut args = vec!["copy".to_string(), "--insecure-policy".to_string()];
        if let Some((arch, os)) = &self.platform_override {
            args.extend([
                "--override-arch".to_string(),
                arch.clone(),
                "--override-os".to_string(),
                os.clone(),
            ]);
        }
        args.push(request.source.clone());
        args.push(request.destination.clone());
        args
    }
}

#[async_trait]
impl ImageCopier for SkopeoCopier {
    async fn copy(
        &self,
        request: &CopyRequest,
        output: mpsc::UnboundedSender<String>,
    ) -> Result<(), CopyError> {
        let args = self.build_args(request);
        let mut cmd = Command::new(&self.tool);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        match &request.proxy {
            Some(proxy) => {
                for var in PROXY_VARS {
                    cmd.env(var, proxy);
                }
            }
            None => {
                for var in PROXY_VARS {
                    cmd.env_remove(var);
                }
            }
        }

        info!(
            tool = %self.tool,
            args = %args.join(" "),
            proxied = request.proxy.is_some(),
            timeout_secs = request.timeout.as_secs(),
            "Launching image copy"
        );
        let mut child = cmd.spawn().map_err(|source| CopyError::Spawn {
            tool: self.tool.clone(),
            source,
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CopyError::Io(std::io::Error::other("stdout not captured")))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| CopyError::Io(std::io::Error::other("stderr not captured")))?;

        // Drained on its own task so a full stderr pipe never blocks the child
        // while stdout is being parsed.
        let stderr_reader = tokio::spawn(async move {
            let mut buf = Vec::new();
            let mut reader = BufReader::new(stderr);
            if let Err(e) = reader.read_to_end(&mut buf).await {
                warn!(error = %e, "Failed to read copy stderr");
            }
            String::from_utf8_lossy(&buf).into_owned()
        });

        let mut stdout_text = String::new();
        let run = async {
            let mut lines = BufReader::new(stdout).lines();
            while let Some(line) = lines.next_line().await? {
                stdout_text.push_str(&line);
                stdout_text.push('\n');
                let _ = output.send(line);
            }
            child.wait().await
        };
        let waited = tokio::time::timeout(request.timeout, run).await;
        drop(output);

        let status = match waited {
            Ok(status) => status?,
            Err(_) => {
                warn!(
                    source = %request.source,
                    timeout_secs = request.timeout.as_secs(),
                    "Image copy timed out, killing process"
                );
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "Failed to kill copy process");
                }
                stderr_reader.abort();
                return Err(CopyError::TimedOut(request.timeout));
            }
        };

        let stderr_text = match tokio::time::timeout(STDERR_DRAIN_TIMEOUT, stderr_reader).await {
            Ok(Ok(text)) => text,
            _ => String::new(),
        };

        if status.success() {
            debug!(source = %request.source, "Image copy finished");
            return Ok(());
        }

        let reason = analyzer::analyze(&stderr_text, &stdout_text).unwrap_or_else(|| {
            let tail: String = stderr_text.trim().chars().take(200).collect();
            match status.code() {
                Some(code) => format!("copy exited with code {}: {}", code, tail),
                None => format!("copy terminated by signal: {}", tail),
            }
        });
        warn!(
            source = %request.source,
            code = ?status.code(),
            reason = %reason,
            "Image copy failed"
        );
        Err(CopyError::Failed {
            code: status.code(),
            reason,
        })
    }
}
