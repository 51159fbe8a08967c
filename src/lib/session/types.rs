use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

/// Outbound half of a transport session. Frames are JSON text.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub id: String,
    pub outbound: mpsc::Sender<String>,
}

impl SessionHandle {
    pub fn new(id: impl Into<String>, outbound: mpsc::Sender<String>) -> Self {
        Self {
            id: id.into(),
            outbound,
        }
    }

    /// A session is live while its socket writer still holds the receiver.
    pub fn is_live(&self) -> bool {
        !self.outbound.is_closed()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    Start,
    Progress,
    Log,
    Complete,
    Error,
    Heartbeat,
    CancelPull,
    ContainerList,
    ContainerOperationResult,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageStatus {
    Processing,
    Success,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub task_id: String,
    pub data: Value,
    /// Milliseconds since the unix epoch.
    pub timestamp: u64,
    pub status: MessageStatus,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl Envelope {
    pub fn new(kind: MessageType, task_id: &str, status: MessageStatus, progress: u8) -> Self {
        Envelope {
            kind,
            task_id: task_id.to_string(),
            data: Value::Null,
            timestamp: now_millis(),
            status,
            progress: progress.min(100),
            error_message: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }
}

/// Inbound client frame. `type` is kept as a string so unknown kinds can be
/// answered instead of dropping the frame.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Inbound {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub data: Value,
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_wire_shape() {
        let env = Envelope::new(MessageType::Progress, "t1", MessageStatus::Processing, 40)
            .with_data(json!({"line": "x"}));
        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(value["type"], "PROGRESS");
        assert_eq!(value["taskId"], "t1");
        assert_eq!(value["status"], "PROCESSING");
        assert_eq!(value["progress"], 40);
        assert!(value.get("errorMessage").is_none());

        let env = Envelope::new(MessageType::Error, "t1", MessageStatus::Error, 0).with_error("boom");
        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(value["errorMessage"], "boom");
    }

    #[test]
    fn inbound_tolerates_missing_fields() {
        let msg: Inbound = serde_json::from_str(r#"{"type":"HEARTBEAT"}"#).unwrap();
        assert_eq!(msg.kind, "HEARTBEAT");
        assert!(msg.task_id.is_none());
        assert!(msg.data.is_null());
    }

    #[test]
    fn handle_liveness_follows_receiver() {
        let (tx, rx) = mpsc::channel(1);
        let handle = SessionHandle::new("s1", tx);
        assert!(handle.is_live());
        drop(rx);
        assert!(!handle.is_live());
    }
}
