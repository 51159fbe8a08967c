use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::types::{ContainerPayload, HostStats, PullPayload, SystemStats, UpdatePayload, Workload, Worker};
use crate::lib::config::types::PullSettings;
use crate::lib::errors::classifier::classify;
use crate::lib::errors::types::ClassifiedError;
use crate::lib::pull::copier::ImageCopier;
use crate::lib::pull::pipeline::PullPipeline;
use crate::lib::pull::types::{ImageKey, PullError};
use crate::lib::replace::orchestrator::Orchestrator;
use crate::lib::replace::types::{ReplaceError, ReplaceRequest};
use crate::lib::runtime::types::{ContainerRuntime, ContainerSummary};
use crate::lib::session::router::SessionRouter;
use crate::lib::session::sender::{MessageSender, TaskChannel};
use crate::lib::session::types::{Envelope, Inbound, MessageStatus, MessageType};

fn new_task_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

impl Worker {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        copier: Arc<dyn ImageCopier>,
        settings: PullSettings,
    ) -> Self {
        let pipeline = Arc::new(PullPipeline::new(copier, Arc::new(RwLock::new(settings))));
        let orchestrator = Arc::new(Orchestrator::new(runtime.clone(), pipeline.clone()));
        let router = Arc::new(SessionRouter::new());
        Worker {
            runtime,
            pipeline,
            orchestrator,
            sender: MessageSender::new(router.clone()),
            router,
            sysinfo: Mutex::new(sysinfo::System::new_all()),
        }
    }

    /// Claim the image and pull it in the background. Returns the task id.
    pub fn start_pull(
        &self,
        key: ImageKey,
        session_id: Option<String>,
        task_id: Option<String>,
    ) -> Result<String, PullError> {
        let task_id = task_id.unwrap_or_else(new_task_id);
        let ticket = self.pipeline.begin(key.clone(), &task_id)?;
        let channel = TaskChannel::new(
            self.sender.clone(),
            session_id,
            &task_id,
            json!({ "imageName": key.repository, "tag": key.tag }),
        );

        let pipeline = self.pipeline.clone();
        tokio::spawn(async move {
            channel.start().await;
            match pipeline.pull(ticket, &channel).await {
                Ok(strategy) => info!(task_id = %channel.task_id(), strategy = %strategy, "Pull task finished"),
                Err(e) => warn!(task_id = %channel.task_id(), error = %e, "Pull task failed"),
            }
        });
        info!(task_id = %task_id, image = %key, "Pull task queued");
        Ok(task_id)
    }

    /// Cancel a running pull, standalone or inside a replacement. The pull's
    /// own task reports the cancellation to its client. Returns the cancelled
    /// task id.
    pub fn cancel_pull(&self, key: &ImageKey) -> Option<String> {
        self.pipeline.cancel(key)
    }

    pub async fn start_replace(
        &self,
        request: ReplaceRequest,
        session_id: Option<String>,
        task_id: Option<String>,
    ) -> Result<String, ReplaceError> {
        let task_id = task_id.unwrap_or_else(new_task_id);
        let guard = self.orchestrator.claim(&request.container_id, &task_id).await?;
        let channel = TaskChannel::new(
            self.sender.clone(),
            session_id,
            &task_id,
            json!({ "containerId": request.container_id }),
        );

        let orchestrator = self.orchestrator.clone();
        tokio::spawn(async move {
            channel.start().await;
            match orchestrator.run(guard, &request, &channel).await {
                Ok(job) => info!(task_id = %channel.task_id(), new_id = ?job.new_container_id, "Replace task finished"),
                Err(e) => warn!(task_id = %channel.task_id(), error = %e, "Replace task failed"),
            }
        });
        info!(task_id = %task_id, "Replace task queued");
        Ok(task_id)
    }

    pub async fn list_containers(&self) -> Result<Vec<ContainerSummary>, ClassifiedError> {
        self.runtime
            .list_containers()
            .await
            .map_err(|e| classify("list containers", "", &e.message))
    }

    pub async fn start_container(&self, id: &str) -> Result<(), ClassifiedError> {
        self.runtime
            .start_container(id)
            .await
            .map_err(|e| classify("start container", id, &e.message))
    }

    pub async fn stop_container(&self, id: &str) -> Result<(), ClassifiedError> {
        self.runtime
            .stop_container(id)
            .await
            .map_err(|e| classify("stop container", id, &e.message))
    }

    pub async fn workload(&self) -> Workload {
        Workload {
            pulls: self.pipeline.active_count(),
            replacements: self.orchestrator.active_count(),
            live_sessions: self.router.live_sessions().await,
        }
    }

    pub async fn stats(&self) -> SystemStats {
        let workload = self.workload().await;
        let mut sys = self.sysinfo.lock().await;
        sys.refresh_cpu_usage();
        sys.refresh_memory();
        let host = HostStats::collect(&sys, &sysinfo::Disks::new_with_refreshed_list());
        SystemStats::new(host, workload)
    }

    /// Handle one inbound socket frame. The returned envelope, if any, is the
    /// direct reply for the sending session.
    pub async fn handle_message(&self, session_id: &str, text: &str) -> Option<Envelope> {
        let inbound: Inbound = match serde_json::from_str(text) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(session_id = %session_id, error = %e, "Malformed frame");
                return Some(error_reply("", &format!("malformed message: {}", e)));
            }
        };
        let task_id = inbound.task_id.clone().unwrap_or_default();
        let session = Some(session_id.to_string());

        match inbound.kind.as_str() {
            "HEARTBEAT" => Some(
                Envelope::new(MessageType::Heartbeat, &task_id, MessageStatus::Success, 0)
                    .with_data(inbound.data),
            ),
            "PULL_IMAGE" => {
                let payload: PullPayload = match payload(&task_id, inbound.data) {
                    Ok(p) => p,
                    Err(reply) => return Some(reply),
                };
                let key = ImageKey::new(&payload.image_name, payload.tag.as_deref());
                match self.start_pull(key, session, inbound.task_id) {
                    Ok(_) => None,
                    Err(e) => Some(error_reply(&task_id, &e.user_message())),
                }
            }
            "CANCEL_PULL" => {
                let payload: PullPayload = match payload(&task_id, inbound.data) {
                    Ok(p) => p,
                    Err(reply) => return Some(reply),
                };
                let key = ImageKey::new(&payload.image_name, payload.tag.as_deref());
                match self.cancel_pull(&key) {
                    Some(cancelled) => Some(
                        Envelope::new(MessageType::CancelPull, &cancelled, MessageStatus::Success, 0)
                            .with_data(json!({ "imageName": key.repository, "tag": key.tag })),
                    ),
                    None => Some(error_reply(&task_id, &format!("no pull of {} in progress", key))),
                }
            }
            "CONTAINER_LIST" => match self.list_containers().await {
                Ok(containers) => Some(
                    Envelope::new(MessageType::ContainerList, &task_id, MessageStatus::Success, 100)
                        .with_data(json!(containers)),
                ),
                Err(e) => Some(error_reply(&task_id, &e.message)),
            },
            "CONTAINER_START" | "CONTAINER_STOP" => {
                let payload: ContainerPayload = match payload(&task_id, inbound.data) {
                    Ok(p) => p,
                    Err(reply) => return Some(reply),
                };
                let starting = inbound.kind == "CONTAINER_START";
                let result = if starting {
                    self.start_container(&payload.container_id).await
                } else {
                    self.stop_container(&payload.container_id).await
                };
                Some(match result {
                    Ok(()) => Envelope::new(
                        MessageType::ContainerOperationResult,
                        &task_id,
                        MessageStatus::Success,
                        100,
                    )
                    .with_data(json!({
                        "containerId": payload.container_id,
                        "operation": if starting { "start" } else { "stop" },
                    })),
                    Err(e) => error_reply(&task_id, &e.message),
                })
            }
            "CONTAINER_UPDATE" => {
                let payload: UpdatePayload = match payload(&task_id, inbound.data) {
                    Ok(p) => p,
                    Err(reply) => return Some(reply),
                };
                match self.start_replace(replace_request(payload), session, inbound.task_id).await {
                    Ok(_) => None,
                    Err(e) => Some(error_reply(&task_id, &e.user_message())),
                }
            }
            other => Some(error_reply(&task_id, &format!("unsupported message type {}", other))),
        }
    }
}

/// Fold the top-level image of an update request into its overrides.
pub fn replace_request(payload: UpdatePayload) -> ReplaceRequest {
    let mut overrides = payload.overrides;
    if payload.image.is_some() {
        overrides.image = payload.image;
    }
    ReplaceRequest {
        container_id: payload.container_id,
        pull: payload.pull,
        overrides,
    }
}

fn error_reply(task_id: &str, message: &str) -> Envelope {
    Envelope::new(MessageType::Error, task_id, MessageStatus::Error, 0).with_error(message)
}

fn payload<T: DeserializeOwned>(task_id: &str, data: Value) -> Result<T, Envelope> {
    serde_json::from_value(data).map_err(|e| error_reply(task_id, &format!("invalid payload: {}", e)))
}

/// Periodically drop bindings of tasks whose client never came back.
pub async fn sweep_bindings(router: Arc<SessionRouter>, ttl: Duration, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        let evicted = router.evict_stale(ttl).await;
        if evicted > 0 {
            info!(evicted, "Evicted stale task bindings");
        }
    }
}
