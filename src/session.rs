//! Session lifecycle and thread-safe concurrent access.
//!
//! A map-wide `RwLock` holds the session table; a per-session `Mutex`
//! execute lock serializes concurrent requests against the same session in
//! arrival order while different sessions run fully in parallel. A
//! background reaper sweeps idle sessions but never evicts one whose
//! execute lock is currently held.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

use crate::sandbox::{AttachedArtifacts, SandboxLoader};

/// Parsed session manager configuration.
#[derive(Debug, Clone)]
pub struct SessionManagerConfig {
    /// How long a session may sit idle before the sweeper reclaims it.
    pub idle_timeout: Duration,
    /// Interval between sweeper passes.
    pub sweep_interval: Duration,
}

impl Default for SessionManagerConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Point-in-time snapshot of `Session` metadata.
#[derive(Debug, Clone)]
pub struct SessionMetadata {
    pub session_id: String,
    pub created_at: Instant,
    pub last_used_at: Instant,
    pub execution_count: u64,
    pub initialized: bool,
}

/// A single REPL session: accumulated continuation state, attached
/// dependency artifacts, and (once an execution has happened) a sandbox.
///
/// `accumulated_state` models the scripting runtime's "continue from here"
/// token. Not every compiler backend supports true incremental continuation,
/// so this crate accumulates source prefixes per session and recompiles the
/// concatenation on each call. `Reset` discards the whole session, capping
/// how large that concatenation can grow.
pub struct Session {
    pub id: String,
    created_at: Instant,
    last_used_at: Mutex<Instant>,
    execution_count: Mutex<u64>,
    initialized: Mutex<bool>,
    pub accumulated_state: Mutex<Option<String>>,
    pub attached_artifacts: Mutex<AttachedArtifacts>,
    pub sandbox: Mutex<Option<Arc<SandboxLoader>>>,
}

impl Session {
    fn new(id: String) -> Self {
        let now = Instant::now();
        Self {
            id,
            created_at: now,
            last_used_at: Mutex::new(now),
            execution_count: Mutex::new(0),
            initialized: Mutex::new(false),
            accumulated_state: Mutex::new(None),
            attached_artifacts: Mutex::new(AttachedArtifacts::default()),
            sandbox: Mutex::new(None),
        }
    }

    async fn touch(&self) {
        *self.last_used_at.lock().await = Instant::now();
    }

    /// Record a successful execution: bumps `execution_count`, flips
    /// `initialized`, refreshes `last_used_at`, and stores the new
    /// continuation state.
    pub async fn record_execution(&self, new_state: Option<String>) {
        *self.last_used_at.lock().await = Instant::now();
        *self.execution_count.lock().await += 1;
        *self.initialized.lock().await = true;
        *self.accumulated_state.lock().await = new_state;
    }

    pub async fn metadata(&self) -> SessionMetadata {
        SessionMetadata {
            session_id: self.id.clone(),
            created_at: self.created_at,
            last_used_at: *self.last_used_at.lock().await,
            execution_count: *self.execution_count.lock().await,
            initialized: *self.initialized.lock().await,
        }
    }

    async fn is_idle_expired(&self, timeout: Duration) -> bool {
        self.last_used_at.lock().await.elapsed() > timeout
    }

    async fn dispose_sandbox(&self) {
        let sandbox = self.sandbox.lock().await.take();
        if let Some(sandbox) = sandbox {
            if let Err(e) = sandbox.dispose().await {
                tracing::warn!(session = %self.id, error = %e, "error disposing sandbox");
            }
        }
    }
}

/// Holds the per-session execute lock for the duration of one execution.
/// Dropping it releases the lock, letting the next queued execution (or the
/// sweeper) proceed.
pub struct ExecuteGuard {
    _guard: OwnedMutexGuard<()>,
}

/// Owns the set of live sessions.
pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    execute_locks: RwLock<HashMap<String, Arc<Mutex<()>>>>,
    config: SessionManagerConfig,
}

impl SessionManager {
    #[must_use]
    pub fn new(config: SessionManagerConfig) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            execute_locks: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Generate a fresh, collision-free session id and insert an empty
    /// session. Session ids are universally unique;
    /// a collision (vanishingly unlikely with UUIDv4) re-draws.
    pub async fn create(&self) -> String {
        loop {
            let id = Uuid::new_v4().to_string();
            let mut sessions = self.sessions.write().await;
            if sessions.contains_key(&id) {
                continue;
            }
            sessions.insert(id.clone(), Arc::new(Session::new(id.clone())));
            info!(session = %id, "created session");
            return id;
        }
    }

    pub async fn exists(&self, id: &str) -> bool {
        self.sessions.read().await.contains_key(id)
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Session>> {
        let session = self.sessions.read().await.get(id).cloned();
        if let Some(session) = &session {
            session.touch().await;
        }
        session
    }

    pub async fn metadata(&self, id: &str) -> Option<SessionMetadata> {
        let session = self.sessions.read().await.get(id).cloned()?;
        Some(session.metadata().await)
    }

    /// Snapshot of every live session id.
    pub async fn active_ids(&self) -> Vec<String> {
        self.sessions.read().await.keys().cloned().collect()
    }

    /// Evict a session, tearing down its sandbox. Idempotent: returns
    /// `false` on a second call for the same id.
    pub async fn remove(&self, id: &str) -> bool {
        let session = self.sessions.write().await.remove(id);
        self.execute_locks.write().await.remove(id);
        match session {
            Some(session) => {
                session.dispose_sandbox().await;
                info!(session = %id, "removed session");
                true
            }
            None => false,
        }
    }

    /// Remove every live session.
    pub async fn remove_all(&self) -> usize {
        let ids = self.active_ids().await;
        let mut cleared = 0;
        for id in ids {
            if self.remove(&id).await {
                cleared += 1;
            }
        }
        cleared
    }

    async fn get_execute_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        {
            let locks = self.execute_locks.read().await;
            if let Some(lock) = locks.get(session_id) {
                return Arc::clone(lock);
            }
        }
        let mut locks = self.execute_locks.write().await;
        Arc::clone(
            locks
                .entry(session_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    /// Block until this session's execute lock is free, then hold it until
    /// the returned guard drops.
    pub async fn acquire(&self, session_id: &str) -> ExecuteGuard {
        let lock = self.get_execute_lock(session_id).await;
        let guard = lock.lock_owned().await;
        ExecuteGuard { _guard: guard }
    }

    /// Non-blocking variant: returns `None` immediately if another
    /// execution already holds this session's lock, letting the caller
    /// fail fast with `SESSION_BUSY`.
    pub async fn try_acquire(&self, session_id: &str) -> Option<ExecuteGuard> {
        let lock = self.get_execute_lock(session_id).await;
        lock.try_lock_owned().ok().map(|guard| ExecuteGuard { _guard: guard })
    }

    /// Remove every session idle past `idle_timeout`, skipping any session
    /// whose execute lock is currently held.
    pub async fn sweep(&self) -> usize {
        let candidates: Vec<String> = {
            let sessions = self.sessions.read().await;
            let mut expired = Vec::new();
            for (id, session) in sessions.iter() {
                if session.is_idle_expired(self.config.idle_timeout).await {
                    expired.push(id.clone());
                }
            }
            expired
        };

        let mut evicted = 0;
        for id in candidates {
            let lock = self.get_execute_lock(&id).await;
            if lock.try_lock().is_ok() {
                if self.remove(&id).await {
                    evicted += 1;
                }
            } else {
                debug!(session = %id, "skipping sweep: execution in flight");
            }
        }

        if evicted > 0 {
            info!(evicted, "sweep cycle evicted sessions");
        }
        evicted
    }

    /// Start the background sweeper task.
    pub fn start_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        let interval = manager.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                manager.sweep().await;
            }
        })
    }

    /// Tear down every session (process shutdown).
    pub async fn shutdown(&self) {
        let cleared = self.remove_all().await;
        info!(cleared, "session manager shut down");
    }
}

/// Render a session id for logs, honoring `mask_session_ids_in_logs`.
#[must_use]
pub fn mask(session_id: &str, mask_enabled: bool) -> String {
    if !mask_enabled {
        return session_id.to_string();
    }
    session_id.get(..8).map_or_else(|| session_id.to_string(), |prefix| format!("{prefix}…"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn newly_created_session_is_uninitialized() {
        let manager = SessionManager::new(SessionManagerConfig::default());
        let id = manager.create().await;
        let metadata = manager.metadata(&id).await.unwrap();
        assert_eq!(metadata.execution_count, 0);
        assert!(!metadata.initialized);
    }

    #[tokio::test]
    async fn record_execution_increments_count_and_initializes() {
        let manager = SessionManager::new(SessionManagerConfig::default());
        let id = manager.create().await;
        let session = manager.get(&id).await.unwrap();
        session.record_execution(Some("int x = 10;".to_string())).await;
        session.record_execution(Some("int x = 10;\nint y = 1;".to_string())).await;
        let metadata = manager.metadata(&id).await.unwrap();
        assert_eq!(metadata.execution_count, 2);
        assert!(metadata.initialized);
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let manager = SessionManager::new(SessionManagerConfig::default());
        let id = manager.create().await;
        assert!(manager.remove(&id).await);
        assert!(!manager.remove(&id).await);
    }

    #[tokio::test]
    async fn reset_of_one_session_does_not_touch_another() {
        let manager = SessionManager::new(SessionManagerConfig::default());
        let a = manager.create().await;
        let b = manager.create().await;
        let session_b = manager.get(&b).await.unwrap();
        session_b.record_execution(Some("int x = 10;".to_string())).await;

        manager.remove(&a).await;

        assert!(manager.exists(&b).await);
        let state = session_b.accumulated_state.lock().await;
        assert_eq!(state.as_deref(), Some("int x = 10;"));
    }

    #[tokio::test]
    async fn sweep_only_removes_sessions_past_idle_timeout() {
        let manager = SessionManager::new(SessionManagerConfig {
            idle_timeout: Duration::from_millis(10),
            sweep_interval: Duration::from_secs(60),
        });
        let stale = manager.create().await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        let fresh = manager.create().await;

        let evicted = manager.sweep().await;
        assert_eq!(evicted, 1);
        assert!(!manager.exists(&stale).await);
        assert!(manager.exists(&fresh).await);
    }

    #[tokio::test]
    async fn sweep_skips_session_with_execution_in_flight() {
        let manager = SessionManager::new(SessionManagerConfig {
            idle_timeout: Duration::from_millis(1),
            sweep_interval: Duration::from_secs(60),
        });
        let id = manager.create().await;
        let _guard = manager.acquire(&id).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        let evicted = manager.sweep().await;
        assert_eq!(evicted, 0);
        assert!(manager.exists(&id).await);
    }

    #[tokio::test]
    async fn concurrent_executions_on_same_session_serialize() {
        let manager = Arc::new(SessionManager::new(SessionManagerConfig::default()));
        let id = manager.create().await;

        let first = manager.try_acquire(&id).await;
        assert!(first.is_some());
        let second = manager.try_acquire(&id).await;
        assert!(second.is_none(), "second caller must observe SESSION_BUSY");

        drop(first);
        let third = manager.try_acquire(&id).await;
        assert!(third.is_some());
    }

    #[test]
    fn mask_shortens_session_id_when_enabled() {
        let id = "abcdefgh-1234-5678";
        assert_eq!(mask(id, false), id);
        assert_eq!(mask(id, true), "abcdefgh…");
    }
}
