use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use super::router::SessionRouter;
use super::types::{Envelope, MessageStatus, MessageType};
use crate::lib::pull::types::ProgressSink;

/// Best-effort delivery of task envelopes.
///
/// Every send resolves the task's live session through the router first.
/// Nothing here returns an error: a missing or closed session only produces
/// a log line.
#[derive(Debug, Clone)]
pub struct MessageSender {
    router: Arc<SessionRouter>,
}

impl MessageSender {
    pub fn new(router: Arc<SessionRouter>) -> Self {
        Self { router }
    }

    pub async fn send(&self, session_id: Option<&str>, envelope: Envelope) {
        let task_id = envelope.task_id.clone();
        let Some(session) = self.router.session_for(session_id, &task_id).await else {
            debug!(task_id = %task_id, kind = ?envelope.kind, "No live session, message dropped");
            return;
        };

        let frame = match serde_json::to_string(&envelope) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "Failed to encode envelope");
                return;
            }
        };

        match session.outbound.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(task_id = %task_id, session_id = %session.id, "Session queue full, message dropped");
            }
            Err(TrySendError::Closed(_)) => {
                warn!(task_id = %task_id, session_id = %session.id, "Session closed during send");
            }
        }
    }

    pub async fn send_start(&self, session_id: Option<&str>, task_id: &str, data: Value) {
        let env = Envelope::new(MessageType::Start, task_id, MessageStatus::Processing, 0).with_data(data);
        self.send(session_id, env).await;
    }

    pub async fn send_progress(&self, session_id: Option<&str>, task_id: &str, progress: u8, data: Value) {
        let env = Envelope::new(MessageType::Progress, task_id, MessageStatus::Processing, progress)
            .with_data(data);
        self.send(session_id, env).await;
    }

    pub async fn send_log(&self, session_id: Option<&str>, task_id: &str, line: &str) {
        let env = Envelope::new(MessageType::Log, task_id, MessageStatus::Processing, 0)
            .with_data(json!({ "line": line }));
        self.send(session_id, env).await;
    }

    pub async fn send_complete(&self, session_id: Option<&str>, task_id: &str, data: Value) {
        let env = Envelope::new(MessageType::Complete, task_id, MessageStatus::Success, 100).with_data(data);
        self.send(session_id, env).await;
    }

    pub async fn send_error(&self, session_id: Option<&str>, task_id: &str, message: &str) {
        let env = Envelope::new(MessageType::Error, task_id, MessageStatus::Error, 0).with_error(message);
        self.send(session_id, env).await;
    }
}

/// [`ProgressSink`] delivering one task's events through a [`MessageSender`].
#[derive(Debug, Clone)]
pub struct TaskChannel {
    sender: MessageSender,
    session_id: Option<String>,
    task_id: String,
    /// Echoed in the data of every envelope, e.g. the image being pulled.
    context: Value,
}

impl TaskChannel {
    pub fn new(sender: MessageSender, session_id: Option<String>, task_id: &str, context: Value) -> Self {
        Self {
            sender,
            session_id,
            task_id: task_id.to_string(),
            context,
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub async fn start(&self) {
        self.sender
            .send_start(self.session_id.as_deref(), &self.task_id, self.context.clone())
            .await;
    }
}

#[async_trait]
impl ProgressSink for TaskChannel {
    async fn on_progress(&self, percent: u8) {
        self.sender
            .send_progress(self.session_id.as_deref(), &self.task_id, percent, self.context.clone())
            .await;
    }

    async fn on_log(&self, line: &str) {
        self.sender
            .send_log(self.session_id.as_deref(), &self.task_id, line)
            .await;
    }

    async fn on_complete(&self) {
        self.sender
            .send_complete(self.session_id.as_deref(), &self.task_id, self.context.clone())
            .await;
    }

    async fn on_error(&self, detail: &str) {
        self.sender
            .send_error(self.session_id.as_deref(), &self.task_id, detail)
            .await;
    }
}
