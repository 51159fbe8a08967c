//! Image acquisition across mirror, proxy and direct routes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{RwLock, mpsc, watch};
use tracing::{info, warn};

use super::copier::ImageCopier;
use super::progress::ProgressTracker;
use super::types::{
    Attempt, CopyRequest, ImageKey, ProgressSink, PullError, PullStatus, PullTask, Strategy,
};
use crate::lib::config::types::PullSettings;

struct PullEntry {
    task: PullTask,
    cancel: watch::Sender<bool>,
}

type Registry = Arc<Mutex<HashMap<ImageKey, PullEntry>>>;

fn lock(registry: &Registry) -> MutexGuard<'_, HashMap<ImageKey, PullEntry>> {
    registry.lock().unwrap_or_else(|e| e.into_inner())
}

/// Exclusive right to pull one `(repository, tag)`.
///
/// The ticket carries the cancellation flag from the moment the key is
/// claimed, so a cancel is observed even before the pull starts running.
/// Dropping a ticket whose pull never reached a terminal state marks the task
/// failed, which covers aborted and panicked workers.
pub struct PullTicket {
    key: ImageKey,
    task_id: String,
    registry: Registry,
    cancelled: watch::Receiver<bool>,
}

impl PullTicket {
    fn is_cancelled(&self) -> bool {
        *self.cancelled.borrow()
    }
}

enum AttemptFailure {
    Cancelled,
    Failed(String),
}

async fn cancellation(mut flag: watch::Receiver<bool>) {
    // a dropped sender means the entry was superseded, which only happens
    // once this pull is no longer the active one
    let _ = flag.wait_for(|set| *set).await;
}

impl Drop for PullTicket {
    fn drop(&mut self) {
        let mut tasks = lock(&self.registry);
        if let Some(entry) = tasks.get_mut(&self.key) {
            if entry.task.status == PullStatus::Pulling && entry.task.task_id == self.task_id {
                entry.task.status = PullStatus::Failed;
                entry.task.last_message = "pull interrupted".to_string();
                warn!(image = %self.key, "Pull ended without a result, marked failed");
            }
        }
    }
}

pub struct PullPipeline {
    copier: Arc<dyn ImageCopier>,
    settings: Arc<RwLock<PullSettings>>,
    registry: Registry,
}

/// Build the ordered list of copy attempts for `key`.
pub fn plan_attempts(settings: &PullSettings, key: &ImageKey) -> Vec<Attempt> {
    let normalized = key.normalized_repository();
    let destination = format!("docker-daemon:{}:{}", key.repository, key.tag);
    let canonical = format!("docker://{}:{}", normalized, key.tag);

    let mut attempts: Vec<Attempt> = settings
        .mirrors
        .iter()
        .map(|mirror| Attempt {
            strategy: Strategy::Mirror,
            route: mirror.clone(),
            request: CopyRequest {
                source: format!("docker://{}/{}:{}", mirror, normalized, key.tag),
                destination: destination.clone(),
                proxy: None,
                timeout: Duration::from_secs(settings.mirror_timeout_secs),
            },
        })
        .collect();

    if let Some(proxy) = &settings.proxy_url {
        attempts.push(Attempt {
            strategy: Strategy::Proxy,
            route: proxy.clone(),
            request: CopyRequest {
                source: canonical.clone(),
                destination: destination.clone(),
                proxy: Some(proxy.clone()),
                timeout: Duration::from_secs(settings.proxy_timeout_secs),
            },
        });
    }

    attempts.push(Attempt {
        strategy: Strategy::Direct,
        route: "official registry".to_string(),
        request: CopyRequest {
            source: canonical,
            destination,
            proxy: None,
            timeout: Duration::from_secs(settings.direct_timeout_secs),
        },
    });
    attempts
}

impl PullPipeline {
    pub fn new(copier: Arc<dyn ImageCopier>, settings: Arc<RwLock<PullSettings>>) -> Self {
        PullPipeline {
            copier,
            settings,
            registry: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn settings(&self) -> Arc<RwLock<PullSettings>> {
        self.settings.clone()
    }

    /// Claim `key` for a new pull. A pull already in progress for the same
    /// key is rejected, never queued.
    pub fn begin(&self, key: ImageKey, task_id: &str) -> Result<PullTicket, PullError> {
        let mut tasks = lock(&self.registry);
        if let Some(entry) = tasks.get(&key) {
            if entry.task.status == PullStatus::Pulling {
                return Err(PullError::AlreadyPulling(key.to_string()));
            }
        }
        let (cancel, cancelled) = watch::channel(false);
        tasks.insert(
            key.clone(),
            PullEntry {
                task: PullTask {
                    task_id: task_id.to_string(),
                    repository: key.repository.clone(),
                    tag: key.tag.clone(),
                    strategy: None,
                    status: PullStatus::Pulling,
                    progress: 0,
                    last_message: "pull started".to_string(),
                },
                cancel,
            },
        );
        Ok(PullTicket {
            key,
            task_id: task_id.to_string(),
            registry: self.registry.clone(),
            cancelled,
        })
    }

    /// Cancel a running pull. Returns the task id of the cancelled pull.
    ///
    /// The running attempt is dropped, which kills its copy process, and the
    /// pull reports a single error to its sink.
    pub fn cancel(&self, key: &ImageKey) -> Option<String> {
        let mut tasks = lock(&self.registry);
        let entry = tasks.get_mut(key)?;
        if entry.task.status != PullStatus::Pulling {
            return None;
        }
        entry.task.status = PullStatus::Failed;
        entry.task.last_message = "pull cancelled".to_string();
        entry.cancel.send_replace(true);
        info!(image = %key, task_id = %entry.task.task_id, "Pull cancelled");
        Some(entry.task.task_id.clone())
    }

    pub fn tasks(&self) -> Vec<PullTask> {
        lock(&self.registry).values().map(|e| e.task.clone()).collect()
    }

    #[cfg(test)]
    pub fn task(&self, key: &ImageKey) -> Option<PullTask> {
        lock(&self.registry).get(key).map(|e| e.task.clone())
    }

    pub fn active_count(&self) -> usize {
        lock(&self.registry)
            .values()
            .filter(|e| e.task.status == PullStatus::Pulling)
            .count()
    }

    /// Apply `apply` while the ticket's task is still pulling. Returns false
    /// once the task went terminal, e.g. after a cancel.
    fn update(&self, ticket: &PullTicket, apply: impl FnOnce(&mut PullTask)) -> bool {
        let mut tasks = lock(&self.registry);
        match tasks.get_mut(&ticket.key) {
            Some(entry) if entry.task.task_id == ticket.task_id && entry.task.status == PullStatus::Pulling => {
                apply(&mut entry.task);
                true
            }
            _ => false,
        }
    }

    /// Acquire the image, trying each route in order until one succeeds.
    pub async fn pull(&self, ticket: PullTicket, sink: &dyn ProgressSink) -> Result<Strategy, PullError> {
        let key = ticket.key.clone();
        let settings = self.settings.read().await.clone();
        let attempts = plan_attempts(&settings, &key);

        info!(image = %key, attempts = attempts.len(), "Starting image pull");
        let mut last_reason = None;

        for attempt in attempts {
            if ticket.is_cancelled() {
                break;
            }
            self.update(&ticket, |task| {
                task.strategy = Some(attempt.strategy);
                task.progress = 0;
                task.last_message = format!("trying {} ({})", attempt.strategy, attempt.route);
            });
            match attempt.strategy {
                Strategy::Mirror => sink.on_log(&format!("Trying mirror {}", attempt.route)).await,
                Strategy::Proxy => sink.on_log("Trying proxy").await,
                Strategy::Direct => sink.on_log("Pulling from the official registry").await,
            }

            match self.run_attempt(&ticket, &attempt, sink).await {
                Ok(()) => {
                    let settled = self.update(&ticket, |task| {
                        task.status = PullStatus::Success;
                        task.progress = 100;
                        task.last_message = format!("pulled via {}", attempt.strategy);
                    });
                    if !settled {
                        break;
                    }
                    info!(image = %key, strategy = %attempt.strategy, route = %attempt.route, "Image pulled");
                    sink.on_progress(100).await;
                    sink.on_log(&format!("Pulled via {} ({})", attempt.strategy, attempt.route))
                        .await;
                    sink.on_complete().await;
                    return Ok(attempt.strategy);
                }
                Err(AttemptFailure::Cancelled) => break,
                Err(AttemptFailure::Failed(reason)) => {
                    warn!(
                        image = %key,
                        strategy = %attempt.strategy,
                        route = %attempt.route,
                        reason = %reason,
                        "Pull attempt failed"
                    );
                    sink.on_log(&format!(
                        "{} {} failed: {}",
                        attempt.strategy, attempt.route, reason
                    ))
                    .await;
                    last_reason = Some(reason);
                }
            }
        }

        if ticket.is_cancelled() {
            let err = PullError::Cancelled(key.to_string());
            info!(image = %key, task_id = %ticket.task_id, "Pull stopped by cancel");
            sink.on_error(&err.user_message()).await;
            return Err(err);
        }

        let err = PullError::Exhausted {
            image: key.to_string(),
            last_reason,
        };
        let message = err.user_message();
        self.update(&ticket, |task| {
            task.status = PullStatus::Failed;
            task.last_message = message.clone();
        });
        sink.on_error(&message).await;
        Err(err)
    }

    async fn run_attempt(
        &self,
        ticket: &PullTicket,
        attempt: &Attempt,
        sink: &dyn ProgressSink,
    ) -> Result<(), AttemptFailure> {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let copy = self.copier.copy(&attempt.request, tx);

        let forward = async {
            let mut tracker = ProgressTracker::new();
            while let Some(line) = rx.recv().await {
                let (percent, line) = tracker.observe(&line);
                self.update(ticket, |task| {
                    task.progress = percent;
                    task.last_message = line.clone();
                });
                sink.on_progress(percent).await;
                sink.on_log(&line).await;
            }
        };

        let work = async {
            let (result, ()) = tokio::join!(copy, forward);
            result.map_err(|e| AttemptFailure::Failed(e.reason()))
        };

        tokio::select! {
            outcome = work => outcome,
            () = cancellation(ticket.cancelled.clone()) => Err(AttemptFailure::Cancelled),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::lib::pull::types::CopyError;
    use async_trait::async_trait;

    /// Copier that replays scripted output and records every source it saw.
    pub(crate) struct ScriptedCopier {
        pub calls: Mutex<Vec<CopyRequest>>,
        pub succeed_when: Box<dyn Fn(&CopyRequest) -> bool + Send + Sync>,
        pub delay: Duration,
        /// Fail only after the tool already reported writing the manifest.
        pub fail_late: bool,
    }

    impl ScriptedCopier {
        pub(crate) fn new(succeed_when: impl Fn(&CopyRequest) -> bool + Send + Sync + 'static) -> Self {
            ScriptedCopier {
                calls: Mutex::new(Vec::new()),
                succeed_when: Box::new(succeed_when),
                delay: Duration::ZERO,
                fail_late: false,
            }
        }

        pub(crate) fn sources(&self) -> Vec<String> {
            self.calls.lock().unwrap().iter().map(|r| r.source.clone()).collect()
        }
    }

    #[async_trait]
    impl ImageCopier for ScriptedCopier {
        async fn copy(
            &self,
            request: &CopyRequest,
            output: mpsc::UnboundedSender<String>,
        ) -> Result<(), CopyError> {
            self.calls.lock().unwrap().push(request.clone());
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let _ = output.send("Getting image source signatures".to_string());
            let _ = output.send("Copying blob sha256:1".to_string());
            if (self.succeed_when)(request) {
                let _ = output.send("Copying config sha256:2".to_string());
                let _ = output.send("Writing manifest to image destination".to_string());
                Ok(())
            } else {
                if self.fail_late {
                    let _ = output.send("Writing manifest to image destination".to_string());
                }
                let _ = output.send("dial tcp: i/o timeout".to_string());
                Err(CopyError::Failed {
                    code: Some(1),
                    reason: "network connection timed out".to_string(),
                })
            }
        }
    }

    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub events: Mutex<Vec<String>>,
    }

    impl RecordingSink {
        pub(crate) fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }

        pub(crate) fn progress(&self) -> Vec<u8> {
            self.events()
                .iter()
                .filter_map(|e| e.strip_prefix("progress:"))
                .filter_map(|p| p.parse().ok())
                .collect()
        }
    }

    #[async_trait]
    impl ProgressSink for RecordingSink {
        async fn on_progress(&self, percent: u8) {
            self.events.lock().unwrap().push(format!("progress:{}", percent));
        }
        async fn on_log(&self, line: &str) {
            self.events.lock().unwrap().push(format!("log:{}", line));
        }
        async fn on_complete(&self) {
            self.events.lock().unwrap().push("complete".to_string());
        }
        async fn on_error(&self, detail: &str) {
            self.events.lock().unwrap().push(format!("error:{}", detail));
        }
    }

    fn pipeline(copier: Arc<ScriptedCopier>, settings: PullSettings) -> PullPipeline {
        PullPipeline::new(copier, Arc::new(RwLock::new(settings)))
    }

    #[test]
    fn plan_orders_mirror_proxy_direct() {
        let settings = PullSettings {
            mirrors: vec!["m1.io".to_string(), "m2.io".to_string()],
            proxy_url: Some("http://proxy:3128".to_string()),
            ..Default::default()
        };
        let attempts = plan_attempts(&settings, &ImageKey::parse("nginx:1.25"));
        let shape: Vec<(Strategy, &str, u64)> = attempts
            .iter()
            .map(|a| (a.strategy, a.request.source.as_str(), a.request.timeout.as_secs()))
            .collect();
        assert_eq!(
            shape,
            vec![
                (Strategy::Mirror, "docker://m1.io/library/nginx:1.25", 10),
                (Strategy::Mirror, "docker://m2.io/library/nginx:1.25", 10),
                (Strategy::Proxy, "docker://library/nginx:1.25", 30),
                (Strategy::Direct, "docker://library/nginx:1.25", 60),
            ]
        );
        assert!(attempts.iter().all(|a| a.request.destination == "docker-daemon:nginx:1.25"));
        assert_eq!(attempts[2].request.proxy.as_deref(), Some("http://proxy:3128"));
        assert_eq!(attempts[3].request.proxy, None);
    }

    #[tokio::test]
    async fn mirror_success_short_circuits() {
        let copier = Arc::new(ScriptedCopier::new(|r| r.source.contains("m1.io")));
        let settings = PullSettings {
            mirrors: vec!["m1.io".to_string(), "m2.io".to_string()],
            proxy_url: Some("http://proxy:3128".to_string()),
            ..Default::default()
        };
        let pipeline = pipeline(copier.clone(), settings);
        let sink = RecordingSink::default();

        let ticket = pipeline.begin(ImageKey::parse("nginx"), "t1").unwrap();
        let strategy = pipeline.pull(ticket, &sink).await.unwrap();

        assert_eq!(strategy, Strategy::Mirror);
        assert_eq!(copier.sources(), vec!["docker://m1.io/library/nginx:latest"]);
        assert_eq!(sink.events().last().map(String::as_str), Some("complete"));
    }

    #[tokio::test]
    async fn falls_through_to_direct_and_resets_progress() {
        let copier = Arc::new(ScriptedCopier::new(|r| r.proxy.is_none() && !r.source.contains("m1.io")));
        let settings = PullSettings {
            mirrors: vec!["m1.io".to_string()],
            ..Default::default()
        };
        let pipeline = pipeline(copier.clone(), settings);
        let sink = RecordingSink::default();

        let ticket = pipeline.begin(ImageKey::parse("redis:7"), "t2").unwrap();
        assert_eq!(pipeline.pull(ticket, &sink).await.unwrap(), Strategy::Direct);
        assert_eq!(copier.sources().len(), 2);

        // first attempt: 10, 12, 12 (timeout line); second: 10, 12, 80, 99, then 100 on exit
        assert_eq!(sink.progress(), vec![10, 12, 12, 10, 12, 80, 99, 100]);
        assert!(sink.events().contains(&format!("log:{}", crate::lib::pull::progress::TIMEOUT_NOTICE)));

        let task = pipeline.task(&ImageKey::parse("redis:7")).unwrap();
        assert_eq!(task.status, PullStatus::Success);
        assert_eq!(task.strategy, Some(Strategy::Direct));
        assert_eq!(task.progress, 100);
    }

    #[tokio::test]
    async fn bare_pull_without_mirrors_or_proxy_uses_direct_only() {
        let copier = Arc::new(ScriptedCopier::new(|_| true));
        let pipeline = pipeline(copier.clone(), PullSettings::default());
        let sink = RecordingSink::default();

        let ticket = pipeline.begin(ImageKey::parse("redis:7"), "t3").unwrap();
        assert_eq!(pipeline.pull(ticket, &sink).await.unwrap(), Strategy::Direct);
        assert_eq!(copier.sources(), vec!["docker://library/redis:7"]);
    }

    #[tokio::test]
    async fn exhaustion_reports_one_error() {
        let copier = Arc::new(ScriptedCopier::new(|_| false));
        let pipeline = pipeline(copier, PullSettings::default());
        let sink = RecordingSink::default();

        let ticket = pipeline.begin(ImageKey::parse("ghost:1"), "t4").unwrap();
        let err = pipeline.pull(ticket, &sink).await.unwrap_err();
        assert!(matches!(err, PullError::Exhausted { .. }));

        let errors: Vec<_> = sink.events().into_iter().filter(|e| e.starts_with("error:")).collect();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("network connection timed out"));
        assert!(!sink.events().contains(&"complete".to_string()));
        assert_eq!(
            pipeline.task(&ImageKey::parse("ghost:1")).unwrap().status,
            PullStatus::Failed
        );
        // a terminal pull may be re-triggered
        assert!(pipeline.begin(ImageKey::parse("ghost:1"), "t5").is_ok());
    }

    #[tokio::test]
    async fn concurrent_pull_of_same_image_is_rejected() {
        let copier = Arc::new(ScriptedCopier::new(|_| true));
        let pipeline = pipeline(copier, PullSettings::default());

        let first = pipeline.begin(ImageKey::parse("redis:7"), "a").unwrap();
        let second = pipeline.begin(ImageKey::parse("redis:7"), "b");
        assert!(matches!(second, Err(PullError::AlreadyPulling(_))));
        // a different tag is independent
        assert!(pipeline.begin(ImageKey::parse("redis:6"), "c").is_ok());

        drop(first);
        let task = pipeline.task(&ImageKey::parse("redis:7")).unwrap();
        assert_eq!(task.status, PullStatus::Failed);
        assert!(pipeline.begin(ImageKey::parse("redis:7"), "d").is_ok());
    }

    #[tokio::test]
    async fn failed_attempt_never_reports_completion() {
        let mut copier = ScriptedCopier::new(|r| !r.source.contains("m1.io"));
        copier.fail_late = true;
        let settings = PullSettings {
            mirrors: vec!["m1.io".to_string()],
            ..Default::default()
        };
        let pipeline = pipeline(Arc::new(copier), settings);
        let sink = RecordingSink::default();

        let ticket = pipeline.begin(ImageKey::parse("redis:7"), "t7").unwrap();
        assert_eq!(pipeline.pull(ticket, &sink).await.unwrap(), Strategy::Direct);

        // mirror attempt tops out at 99 before failing
        assert_eq!(sink.progress(), vec![10, 12, 99, 99, 10, 12, 80, 99, 100]);
        assert_eq!(sink.progress().iter().filter(|p| **p == 100).count(), 1);
    }

    #[tokio::test]
    async fn cancel_kills_running_attempt() {
        let mut copier = ScriptedCopier::new(|_| true);
        copier.delay = Duration::from_secs(30);
        let copier = Arc::new(copier);
        let pipeline = Arc::new(pipeline(copier.clone(), PullSettings::default()));
        let key = ImageKey::parse("redis:7");

        let ticket = pipeline.begin(key.clone(), "t6").unwrap();
        let worker = {
            let pipeline = pipeline.clone();
            tokio::spawn(async move {
                let sink = RecordingSink::default();
                let result = pipeline.pull(ticket, &sink).await;
                (result, sink.events())
            })
        };
        while copier.sources().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert_eq!(pipeline.cancel(&key).as_deref(), Some("t6"));
        let (result, events) = tokio::time::timeout(Duration::from_secs(5), worker)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(PullError::Cancelled(_))));
        let errors: Vec<_> = events.iter().filter(|e| e.starts_with("error:")).collect();
        assert_eq!(errors, vec!["error:pull of redis:7 cancelled"]);
        assert!(!events.contains(&"complete".to_string()));
        assert_eq!(pipeline.task(&key).unwrap().status, PullStatus::Failed);
        assert_eq!(pipeline.cancel(&key), None);
    }

    #[tokio::test]
    async fn cancel_before_the_pull_runs_is_honoured() {
        let copier = Arc::new(ScriptedCopier::new(|_| true));
        let pipeline = pipeline(copier.clone(), PullSettings::default());
        let key = ImageKey::parse("redis:7");
        let sink = RecordingSink::default();

        let ticket = pipeline.begin(key.clone(), "t8").unwrap();
        assert_eq!(pipeline.cancel(&key).as_deref(), Some("t8"));
        let err = pipeline.pull(ticket, &sink).await.unwrap_err();

        assert!(matches!(err, PullError::Cancelled(_)));
        assert!(copier.sources().is_empty());
        assert_eq!(sink.events(), vec!["error:pull of redis:7 cancelled"]);
    }
}
