//! Binds long-running tasks to the transport session that should receive
//! their progress.
//!
//! A task stays bound to the session that started it. When that session is
//! gone the binding moves to the most recently opened live session the next
//! time the task is resolved, so a reloaded client keeps receiving progress.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::{debug, info};

use super::types::SessionHandle;

#[derive(Debug, Clone)]
struct Binding {
    session_id: String,
    touched: Instant,
}

#[derive(Debug, Default)]
struct RouterState {
    sessions: HashMap<String, SessionHandle>,
    bindings: HashMap<String, Binding>,
    latest: Option<String>,
}

impl RouterState {
    fn live(&self, session_id: &str) -> Option<&SessionHandle> {
        self.sessions.get(session_id).filter(|s| s.is_live())
    }

    /// Most recent live session, falling back to any live one and moving the
    /// pointer there.
    fn latest_live(&mut self) -> Option<SessionHandle> {
        if let Some(handle) = self.latest.as_deref().and_then(|id| self.live(id)) {
            return Some(handle.clone());
        }
        let fallback = self.sessions.values().find(|s| s.is_live())?.clone();
        self.latest = Some(fallback.id.clone());
        Some(fallback)
    }

    fn bind(&mut self, task_id: &str, session_id: &str) {
        self.bindings.insert(
            task_id.to_string(),
            Binding {
                session_id: session_id.to_string(),
                touched: Instant::now(),
            },
        );
    }
}

#[derive(Debug, Default)]
pub struct SessionRouter {
    state: RwLock<RouterState>,
}

impl SessionRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_session(&self, session: SessionHandle) {
        let mut state = self.state.write().await;
        info!(session_id = %session.id, "Session opened");
        state.latest = Some(session.id.clone());
        state.sessions.insert(session.id.clone(), session);
    }

    /// Drop a session from the live set. Bindings pointing at it are kept.
    pub async fn remove_session(&self, session_id: &str) {
        let mut state = self.state.write().await;
        if state.sessions.remove(session_id).is_some() {
            info!(session_id = %session_id, "Session closed");
        }
    }

    pub async fn register_task(&self, task_id: &str, session_id: &str) {
        self.state.write().await.bind(task_id, session_id);
    }

    /// Live session for `task_id`, migrating the binding if its session died.
    pub async fn resolve(&self, task_id: &str) -> Option<SessionHandle> {
        let mut state = self.state.write().await;

        let bound = state.bindings.get(task_id).map(|b| b.session_id.clone());
        if let Some(session_id) = &bound {
            if let Some(handle) = state.live(session_id).cloned() {
                if let Some(binding) = state.bindings.get_mut(task_id) {
                    binding.touched = Instant::now();
                }
                return Some(handle);
            }
        }

        let target = state.latest_live()?;
        match bound {
            Some(old) => {
                info!(
                    task_id = %task_id,
                    from = %old,
                    to = %target.id,
                    "Migrated task to newest session"
                );
            }
            None => debug!(task_id = %task_id, session_id = %target.id, "Bound task to newest session"),
        }
        state.bind(task_id, &target.id);
        Some(target)
    }

    /// Resolve, preferring `preferred` when it is still live.
    pub async fn session_for(&self, preferred: Option<&str>, task_id: &str) -> Option<SessionHandle> {
        if let Some(session_id) = preferred {
            let mut state = self.state.write().await;
            if let Some(handle) = state.live(session_id).cloned() {
                state.bind(task_id, session_id);
                return Some(handle);
            }
        }
        self.resolve(task_id).await
    }

    #[cfg(test)]
    pub async fn bound_session(&self, task_id: &str) -> Option<String> {
        self.state
            .read()
            .await
            .bindings
            .get(task_id)
            .map(|b| b.session_id.clone())
    }

    pub async fn live_sessions(&self) -> usize {
        self.state
            .read()
            .await
            .sessions
            .values()
            .filter(|s| s.is_live())
            .count()
    }

    /// Remove bindings whose session is gone and which were idle for `ttl`.
    /// Returns the number of evicted bindings.
    pub async fn evict_stale(&self, ttl: Duration) -> usize {
        let mut state = self.state.write().await;
        let RouterState {
            sessions, bindings, ..
        } = &mut *state;
        let before = bindings.len();
        bindings.retain(|_, binding| {
            let live = sessions
                .get(&binding.session_id)
                .is_some_and(|s| s.is_live());
            live || binding.touched.elapsed() < ttl
        });
        before - bindings.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn session(id: &str) -> (SessionHandle, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(8);
        (SessionHandle::new(id, tx), rx)
    }

    #[tokio::test]
    async fn live_original_session_is_kept() {
        let router = SessionRouter::new();
        let (a, _ra) = session("a");
        let (b, _rb) = session("b");
        router.add_session(a).await;
        router.register_task("t", "a").await;
        router.add_session(b).await;

        assert_eq!(router.resolve("t").await.unwrap().id, "a");
    }

    #[tokio::test]
    async fn dead_session_migrates_to_newest() {
        let router = SessionRouter::new();
        let (a, ra) = session("a");
        router.add_session(a).await;
        router.register_task("t", "a").await;

        let (b, _rb) = session("b");
        router.add_session(b).await;
        drop(ra);

        assert_eq!(router.resolve("t").await.unwrap().id, "b");
        assert_eq!(router.bound_session("t").await.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn removal_keeps_bindings_and_nothing_live_resolves_none() {
        let router = SessionRouter::new();
        let (a, _ra) = session("a");
        router.add_session(a).await;
        router.register_task("t", "a").await;
        router.remove_session("a").await;

        assert!(router.resolve("t").await.is_none());
        assert_eq!(router.bound_session("t").await.as_deref(), Some("a"));

        // the client reconnects
        let (c, _rc) = session("c");
        router.add_session(c).await;
        assert_eq!(router.resolve("t").await.unwrap().id, "c");
    }

    #[tokio::test]
    async fn dead_latest_falls_back_to_any_live_session() {
        let router = SessionRouter::new();
        let (a, _ra) = session("a");
        let (b, rb) = session("b");
        router.add_session(a).await;
        router.add_session(b).await;
        drop(rb);

        assert_eq!(router.resolve("fresh").await.unwrap().id, "a");
    }

    #[tokio::test]
    async fn preferred_session_wins_when_live() {
        let router = SessionRouter::new();
        let (a, _ra) = session("a");
        let (b, _rb) = session("b");
        router.add_session(a).await;
        router.add_session(b).await;

        assert_eq!(router.session_for(Some("a"), "t").await.unwrap().id, "a");
        assert_eq!(router.session_for(Some("gone"), "u").await.unwrap().id, "b");
    }

    #[tokio::test]
    async fn eviction_spares_live_bindings() {
        let router = SessionRouter::new();
        let (a, _ra) = session("a");
        let (b, rb) = session("b");
        router.add_session(a).await;
        router.add_session(b).await;
        router.register_task("live", "a").await;
        router.register_task("orphan", "b").await;
        drop(rb);

        assert_eq!(router.evict_stale(Duration::ZERO).await, 1);
        assert_eq!(router.bound_session("live").await.as_deref(), Some("a"));
        assert!(router.bound_session("orphan").await.is_none());
    }
}
