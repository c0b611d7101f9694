//! Shared application state and the terminal session store.

use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::executor::{Executor, LocalExecutor};
use crate::remote::RemoteExecutor;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Session id used when a client does not send one.
pub const DEFAULT_SESSION_ID: &str = "default";

/// A terminal session: working directory plus environment snapshot.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub cwd: PathBuf,
    pub env: Arc<HashMap<String, String>>,
    pub created_at: Instant,
    pub last_used: Instant,
}

impl Session {
    fn new(id: &str, root: &Path) -> Self {
        let now = Instant::now();
        Self {
            id: id.to_string(),
            cwd: root.to_path_buf(),
            env: Arc::new(std::env::vars().collect()),
            created_at: now,
            last_used: now,
        }
    }
}

/// Process-wide session map, created lazily and never evicted unless
/// [`SessionStore::cleanup_expired`] is driven by a TTL task.
///
/// Callers get snapshots. Two racing `cd`s resolve last-writer-wins; the map
/// itself is only touched under the lock.
#[derive(Debug)]
pub struct SessionStore {
    root: PathBuf,
    sessions: RwLock<HashMap<String, Session>>,
}

impl SessionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Snapshot of the session, creating it on first reference.
    pub async fn get(&self, id: &str) -> Session {
        let mut session = {
            let mut sessions = self.sessions.write().await;
            let root = &self.root;
            let session = sessions.entry(id.to_string()).or_insert_with(|| {
                info!(session = %id, "Created session");
                Session::new(id, root)
            });
            session.last_used = Instant::now();
            session.clone()
        };

        let is_dir = tokio::fs::metadata(&session.cwd)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false);
        if !is_dir {
            warn!(
                session = %id,
                cwd = ?session.cwd,
                "Session cwd vanished, resetting to project root"
            );
            self.reset_vanished(id, &session.cwd).await;
            session.cwd = self.root.clone();
        }
        session
    }

    /// Point the session back at the root, unless its cwd moved on since
    /// `stale` was read.
    async fn reset_vanished(&self, id: &str, stale: &Path) {
        if let Some(session) = self.sessions.write().await.get_mut(id) {
            if session.cwd == stale {
                session.cwd = self.root.clone();
            }
        }
    }

    /// Replace the session's cwd.
    pub async fn update(&self, id: &str, cwd: PathBuf) {
        let mut sessions = self.sessions.write().await;
        let root = &self.root;
        let session = sessions
            .entry(id.to_string())
            .or_insert_with(|| Session::new(id, root));
        session.cwd = cwd;
        session.last_used = Instant::now();
    }

    /// Snapshot of an existing session without creating one.
    pub async fn peek(&self, id: &str) -> Option<Session> {
        self.sessions.read().await.get(id).cloned()
    }

    pub async fn list(&self) -> Vec<Session> {
        let mut list: Vec<Session> = self.sessions.read().await.values().cloned().collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Drop sessions idle for longer than `ttl`. Returns how many went.
    pub async fn cleanup_expired(&self, ttl: Duration) -> usize {
        let mut sessions = self.sessions.write().await;
        let now = Instant::now();
        let before = sessions.len();
        sessions.retain(|id, s| {
            let keep = now.duration_since(s.last_used) <= ttl;
            if !keep {
                info!(session = %id, "Cleaning up expired session");
            }
            keep
        });
        before - sessions.len()
    }
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub sessions: Arc<SessionStore>,
    pub dispatcher: Arc<Dispatcher>,
    pub remote: Arc<RemoteExecutor>,
}

impl AppState {
    /// Wire the production backends: host shell locally, OpenSSH remotely.
    pub fn new(config: Config) -> Self {
        Self::with_backends(
            config,
            Arc::new(LocalExecutor::new()),
            Arc::new(RemoteExecutor::openssh()),
        )
    }

    pub fn with_backends(
        config: Config,
        executor: Arc<dyn Executor>,
        remote: Arc<RemoteExecutor>,
    ) -> Self {
        let config = Arc::new(config);
        let sessions = Arc::new(SessionStore::new(config.project_root.clone()));
        let dispatcher = Arc::new(Dispatcher::new(config.clone(), sessions.clone(), executor));
        Self {
            config,
            sessions,
            dispatcher,
            remote,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, SessionStore) {
        let dir = TempDir::new().unwrap();
        let root = dir.path().canonicalize().unwrap();
        (dir, SessionStore::new(root))
    }

    #[tokio::test]
    async fn sessions_are_created_lazily_at_root() {
        let (dir, store) = store();
        assert_eq!(store.len().await, 0);
        let session = store.get("a").await;
        assert_eq!(session.cwd, dir.path().canonicalize().unwrap());
        assert_eq!(session.env.len(), std::env::vars().count());
        assert_eq!(store.len().await, 1);
        store.get("a").await;
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn sessions_are_isolated() {
        let (dir, store) = store();
        let sub = dir.path().canonicalize().unwrap().join("sub");
        std::fs::create_dir(&sub).unwrap();

        store.update("a", sub.clone()).await;
        assert_eq!(store.get("a").await.cwd, sub);
        assert_eq!(store.get("b").await.cwd, dir.path().canonicalize().unwrap());
    }

    #[tokio::test]
    async fn vanished_cwd_resets_to_root() {
        let (dir, store) = store();
        let root = dir.path().canonicalize().unwrap();
        let sub = root.join("gone");
        std::fs::create_dir(&sub).unwrap();
        store.update("a", sub.clone()).await;
        std::fs::remove_dir(&sub).unwrap();
        assert_eq!(store.get("a").await.cwd, root);
    }

    #[tokio::test]
    async fn vanished_reset_keeps_a_newer_cwd() {
        let (dir, store) = store();
        let root = dir.path().canonicalize().unwrap();
        let newer = root.join("newer");
        std::fs::create_dir(&newer).unwrap();
        store.update("a", newer.clone()).await;

        store.reset_vanished("a", &root.join("gone")).await;
        assert_eq!(store.peek("a").await.unwrap().cwd, newer);

        store.reset_vanished("a", &newer).await;
        assert_eq!(store.peek("a").await.unwrap().cwd, root);
    }

    #[tokio::test]
    async fn peek_does_not_create() {
        let (_dir, store) = store();
        assert!(store.peek("nobody").await.is_none());
        assert_eq!(store.len().await, 0);
    }

    #[tokio::test]
    async fn concurrent_updates_never_corrupt_the_store() {
        let (dir, store) = store();
        let root = dir.path().canonicalize().unwrap();
        let mut dirs = Vec::new();
        for i in 0..8 {
            let d = root.join(format!("d{}", i));
            std::fs::create_dir(&d).unwrap();
            dirs.push(d);
        }
        let store = Arc::new(store);

        let mut handles = Vec::new();
        for d in dirs.clone() {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..50 {
                    store.update("shared", d.clone()).await;
                    store.get("shared").await;
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(store.len().await, 1);
        let winner = store.get("shared").await.cwd;
        assert!(dirs.contains(&winner));
    }

    #[tokio::test]
    async fn cleanup_removes_idle_sessions() {
        let (_dir, store) = store();
        store.get("old").await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        store.get("fresh").await;

        let removed = store.cleanup_expired(Duration::from_millis(20)).await;
        assert_eq!(removed, 1);
        assert!(store.peek("old").await.is_none());
        assert!(store.peek("fresh").await.is_some());
    }
}
