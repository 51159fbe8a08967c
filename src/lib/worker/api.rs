use axum::{
    Json, Router,
    extract::{
        Path, Query, State as AxumState,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use super::types::{ApiError, ApiResult, ImageQuery, PullPayload, TaskAccepted, TaskServer, UpdatePayload, Worker};
use super::worker::replace_request;
use crate::lib::config::types::{PullSettings, parse_mirrors};
use crate::lib::errors::classifier::classify;
use crate::lib::pull::types::ImageKey;
use crate::lib::session::types::SessionHandle;

/// Frames queued per socket before sends start being dropped.
const OUTBOUND_BUFFER: usize = 256;

type Shared = AxumState<Arc<Worker>>;

impl TaskServer {
    pub fn new(worker: Arc<Worker>, listen: &str) -> Self {
        Self {
            worker,
            listen: listen.to_string(),
        }
    }

    async fn list_containers(AxumState(worker): Shared) -> ApiResult<impl IntoResponse> {
        Ok(Json(worker.list_containers().await?))
    }

    async fn start_container(AxumState(worker): Shared, Path(id): Path<String>) -> ApiResult<impl IntoResponse> {
        worker.start_container(&id).await?;
        info!(container = %id, "Container started");
        Ok(Json(json!({ "containerId": id, "operation": "start" })))
    }

    async fn stop_container(AxumState(worker): Shared, Path(id): Path<String>) -> ApiResult<impl IntoResponse> {
        worker.stop_container(&id).await?;
        info!(container = %id, "Container stopped");
        Ok(Json(json!({ "containerId": id, "operation": "stop" })))
    }

    async fn replace_container(
        AxumState(worker): Shared,
        Path(id): Path<String>,
        Json(mut payload): Json<UpdatePayload>,
    ) -> ApiResult<impl IntoResponse> {
        payload.container_id = id;
        let session_id = payload.session_id.take();
        let task_id = worker.start_replace(replace_request(payload), session_id, None).await?;
        Ok((StatusCode::ACCEPTED, Json(TaskAccepted { task_id })))
    }

    async fn list_replacements(AxumState(worker): Shared) -> impl IntoResponse {
        Json(worker.orchestrator.jobs())
    }

    async fn list_images(AxumState(worker): Shared) -> ApiResult<impl IntoResponse> {
        let images = worker
            .runtime
            .list_images()
            .await
            .map_err(|e| classify("list images", "", &e.message))?;
        Ok(Json(images))
    }

    async fn inspect_image(
        AxumState(worker): Shared,
        Query(query): Query<ImageQuery>,
    ) -> ApiResult<impl IntoResponse> {
        let image = worker
            .runtime
            .inspect_image(&query.reference)
            .await
            .map_err(|e| classify("inspect image", &query.reference, &e.message))?;
        Ok(Json(image))
    }

    async fn remove_image(
        AxumState(worker): Shared,
        Query(query): Query<ImageQuery>,
    ) -> ApiResult<impl IntoResponse> {
        worker
            .runtime
            .remove_image(&query.reference, query.force)
            .await
            .map_err(|e| classify("remove image", &query.reference, &e.message))?;
        info!(image = %query.reference, "Image removed");
        Ok(StatusCode::NO_CONTENT)
    }

    async fn pull_image(AxumState(worker): Shared, Json(payload): Json<PullPayload>) -> ApiResult<impl IntoResponse> {
        if payload.image_name.trim().is_empty() {
            return Err(ApiError::BadRequest("imageName is required".to_string()));
        }
        let key = ImageKey::new(&payload.image_name, payload.tag.as_deref());
        let task_id = worker.start_pull(key, payload.session_id, None)?;
        Ok((StatusCode::ACCEPTED, Json(TaskAccepted { task_id })))
    }

    async fn cancel_pull(AxumState(worker): Shared, Json(payload): Json<PullPayload>) -> ApiResult<impl IntoResponse> {
        let key = ImageKey::new(&payload.image_name, payload.tag.as_deref());
        match worker.cancel_pull(&key) {
            Some(task_id) => Ok(Json(TaskAccepted { task_id })),
            None => Err(ApiError::NotFound(format!("no pull of {} in progress", key))),
        }
    }

    async fn list_pulls(AxumState(worker): Shared) -> impl IntoResponse {
        Json(worker.pipeline.tasks())
    }

    async fn list_networks(AxumState(worker): Shared) -> ApiResult<impl IntoResponse> {
        let networks = worker
            .runtime
            .list_networks()
            .await
            .map_err(|e| classify("list networks", "", &e.message))?;
        Ok(Json(networks))
    }

    async fn inspect_network(AxumState(worker): Shared, Path(id): Path<String>) -> ApiResult<impl IntoResponse> {
        let network = worker
            .runtime
            .inspect_network(&id)
            .await
            .map_err(|e| classify("inspect network", &id, &e.message))?;
        Ok(Json(network))
    }

    async fn get_pull_settings(AxumState(worker): Shared) -> impl IntoResponse {
        let settings = worker.pipeline.settings();
        let current = settings.read().await.clone();
        Json(current)
    }

    async fn put_pull_settings(
        AxumState(worker): Shared,
        Json(mut update): Json<PullSettings>,
    ) -> impl IntoResponse {
        update.mirrors = parse_mirrors(&update.mirrors.join("\n"));
        update.proxy_url = update.proxy_url.filter(|p| !p.trim().is_empty());
        info!(mirrors = update.mirrors.len(), proxied = update.proxy_url.is_some(), "Pull settings replaced");
        let settings = worker.pipeline.settings();
        *settings.write().await = update.clone();
        Json(update)
    }

    async fn system_stats(AxumState(worker): Shared) -> impl IntoResponse {
        Json(worker.stats().await)
    }

    async fn ws_upgrade(ws: WebSocketUpgrade, AxumState(worker): Shared) -> impl IntoResponse {
        ws.on_upgrade(move |socket| TaskServer::serve_socket(worker, socket))
    }

    async fn serve_socket(worker: Arc<Worker>, socket: WebSocket) {
        let session_id = uuid::Uuid::new_v4().to_string();
        let (tx, mut rx) = mpsc::channel::<String>(OUTBOUND_BUFFER);
        worker
            .router
            .add_session(SessionHandle::new(&session_id, tx.clone()))
            .await;

        let (mut outgoing, mut incoming) = socket.split();
        let writer = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if outgoing.send(Message::Text(frame.into())).await.is_err() {
                    break;
                }
            }
        });

        while let Some(msg) = incoming.next().await {
            let text = match msg {
                Ok(Message::Text(text)) => text,
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(e) => {
                    debug!(session_id = %session_id, error = %e, "Socket read failed");
                    break;
                }
            };
            let Some(reply) = worker.handle_message(&session_id, text.as_str()).await else {
                continue;
            };
            match serde_json::to_string(&reply) {
                Ok(frame) => {
                    if tx.try_send(frame).is_err() {
                        warn!(session_id = %session_id, "Reply dropped, session queue unavailable");
                    }
                }
                Err(e) => warn!(error = %e, "Failed to encode reply"),
            }
        }

        worker.router.remove_session(&session_id).await;
        drop(tx);
        writer.abort();
    }

    pub fn router(worker: Arc<Worker>) -> Router {
        Router::new()
            .route("/ws", get(TaskServer::ws_upgrade))
            .route("/containers", get(TaskServer::list_containers))
            .route("/containers/replacements", get(TaskServer::list_replacements))
            .route("/containers/{id}/start", post(TaskServer::start_container))
            .route("/containers/{id}/stop", post(TaskServer::stop_container))
            .route("/containers/{id}/replace", post(TaskServer::replace_container))
            .route(
                "/images",
                get(TaskServer::list_images).delete(TaskServer::remove_image),
            )
            .route("/images/inspect", get(TaskServer::inspect_image))
            .route("/images/pull", post(TaskServer::pull_image))
            .route("/images/pull/cancel", post(TaskServer::cancel_pull))
            .route("/images/pulls", get(TaskServer::list_pulls))
            .route("/networks", get(TaskServer::list_networks))
            .route("/networks/{id}", get(TaskServer::inspect_network))
            .route(
                "/settings/pull",
                get(TaskServer::get_pull_settings).put(TaskServer::put_pull_settings),
            )
            .route("/system/stats", get(TaskServer::system_stats))
            .layer(TraceLayer::new_for_http())
            .with_state(worker)
    }

    pub async fn start_server(self) -> std::io::Result<()> {
        let app = TaskServer::router(self.worker.clone());
        let listener = TcpListener::bind(&self.listen).await?;
        info!(listen = %self.listen, "Listening");
        axum::serve(listener, app).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lib::pull::pipeline::tests::ScriptedCopier;
    use crate::lib::runtime::fake::FakeRuntime;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use serde_json::Value;
    use tower::ServiceExt;

    fn app() -> (Arc<FakeRuntime>, Arc<Worker>, Router) {
        let runtime = Arc::new(FakeRuntime::new());
        let copier = Arc::new(ScriptedCopier::new(|_| true));
        let worker = Arc::new(Worker::new(runtime.clone(), copier, PullSettings::default()));
        (runtime, worker.clone(), TaskServer::router(worker))
    }

    async fn call(app: Router, method: &str, uri: &str, body: Value) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn start_missing_container_is_not_found() {
        let (_, _, app) = app();
        let (status, body) = call(app, "POST", "/containers/ghost/start", Value::Null).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "CONTAINER_NOT_FOUND");
        assert!(body["message"].as_str().unwrap().starts_with("start container failed: "));
    }

    #[tokio::test]
    async fn image_references_travel_as_query() {
        let (runtime, _, app) = app();
        let (status, body) = call(app.clone(), "GET", "/images/inspect?reference=redis:7", Value::Null).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "IMAGE_NOT_FOUND");

        let (status, _) = call(app, "DELETE", "/images?reference=library/redis:7&force=true", Value::Null).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(runtime.calls().contains(&"remove_image library/redis:7".to_string()));
    }

    #[tokio::test]
    async fn duplicate_pull_conflicts() {
        let (_, worker, app) = app();
        let _ticket = worker.pipeline.begin(ImageKey::parse("redis:7"), "held").unwrap();

        let (status, _) = call(app, "POST", "/images/pull", json!({"imageName": "redis", "tag": "7"})).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn pull_settings_can_be_replaced() {
        let (_, worker, app) = app();
        let (status, body) = call(
            app,
            "PUT",
            "/settings/pull",
            json!({
                "mirrors": ["https://m1.io/"],
                "proxyUrl": "",
                "mirrorTimeoutSecs": 5,
                "proxyTimeoutSecs": 30,
                "directTimeoutSecs": 60
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["mirrors"], json!(["m1.io"]));

        let settings = worker.pipeline.settings();
        let current = settings.read().await;
        assert_eq!(current.mirrors, vec!["m1.io"]);
        assert_eq!(current.proxy_url, None);
        assert_eq!(current.mirror_timeout_secs, 5);
    }

    #[tokio::test]
    async fn replace_is_accepted_then_listed_pull_is_idle() {
        let (runtime, _, app) = app();
        runtime.add_container("web1", "app:1", true);

        let (status, body) = call(app.clone(), "POST", "/containers/web1/replace", json!({"image": "app:2"})).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert!(body["taskId"].as_str().is_some());

        let (status, body) = call(app.clone(), "POST", "/containers/ghost/replace", json!({"image": "app:2"})).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "CONTAINER_NOT_FOUND");

        let (status, body) = call(app, "GET", "/images/pulls", Value::Null).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!([]));
    }
}
