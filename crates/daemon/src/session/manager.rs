//! Session registry for managing many process sessions.
//!
//! This module provides a thread-safe registry that creates sessions,
//! routes control operations to them, serves their output history and
//! removes them once they are finished.

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use dashmap::DashMap;
use protocol::{MediaEntry, MediaEvent, OutputEntry, SessionSnapshot};

use super::backend::{self, SpawnError, SpawnRequest};
use super::environment::{build_environment, resolve_workspace};
use super::multiplexer::{SubscriberId, Subscription};
use super::reader::{spawn_reader_loop, ReaderSettings};
use super::state::{Session, SessionId, SessionLimits};
use crate::config::{Config, SessionConfig};
use crate::shell::ShellResolver;

/// Trait for session management operations.
///
/// Control operations report failure as `false` or `None`: an unknown
/// session ID, a session that already finished, or an OS-level fault all
/// look the same to the caller. Only [`create`](Self::create) returns an
/// error, because a spawn failure leaves nothing behind to query.
#[allow(async_fn_in_trait)]
pub trait SessionManager: Send + Sync {
    /// Starts `command` in `workspace` and registers the new session.
    ///
    /// An empty command starts an interactive login shell.
    async fn create(&self, workspace: &Path, command: &str)
        -> Result<SessionSnapshot, SpawnError>;

    /// Writes input to a running session.
    async fn write(&self, session_id: &str, data: &[u8]) -> bool;

    /// Resizes a running PTY session.
    async fn resize(&self, session_id: &str, rows: u16, cols: u16) -> bool;

    /// Delivers a raw signal without changing the session status.
    async fn send_signal(&self, session_id: &str, signal: i32) -> bool;

    /// Gracefully stops a running session and marks it cancelled.
    async fn cancel(&self, session_id: &str) -> bool;

    /// Immediately stops a running session and marks it killed.
    async fn kill(&self, session_id: &str) -> bool;

    /// Output entries newer than `since`. Unknown sessions yield nothing.
    fn buffer_since(&self, session_id: &str, since: u64) -> Vec<OutputEntry>;

    /// Media entries newer than `since`. Unknown sessions yield nothing.
    fn media_since(&self, session_id: &str, since: u64) -> Vec<MediaEntry>;

    /// Snapshots of every registered session, oldest first.
    fn list_sessions(&self) -> Vec<SessionSnapshot>;

    /// Releases a finished session and forgets it.
    ///
    /// Returns false for running or unknown sessions.
    async fn cleanup_session(&self, session_id: &str) -> bool;
}

/// Thread-safe session registry using DashMap.
///
/// Map guards are never held across an `.await` or a backend call: every
/// operation clones the session's `Arc` out of the map first.
pub struct SessionRegistry {
    /// Map of session ID to session.
    sessions: DashMap<SessionId, Arc<Session>>,
    /// Session defaults.
    config: SessionConfig,
    /// Turns command strings into argv vectors.
    resolver: ShellResolver,
    /// Serializes the session-limit check with the insert that follows it.
    create_gate: Mutex<()>,
}

impl SessionRegistry {
    /// Creates an empty registry.
    pub fn new(config: SessionConfig, resolver: ShellResolver) -> Self {
        Self {
            sessions: DashMap::new(),
            config,
            resolver,
            create_gate: Mutex::new(()),
        }
    }

    /// Creates an empty registry from the full daemon configuration.
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.session.clone(), ShellResolver::from_config(config))
    }

    fn session(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions
            .get(session_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    fn limits(&self) -> SessionLimits {
        SessionLimits {
            output_buffer_cap: self.config.output_buffer_cap,
            media_buffer_cap: self.config.media_buffer_cap,
            subscriber_capacity: self.config.subscriber_capacity,
        }
    }

    fn reader_settings(&self) -> ReaderSettings {
        ReaderSettings {
            poll_interval: self.config.poll_interval(),
            exit_grace: self.config.exit_grace(),
        }
    }

    /// Snapshot of one session.
    pub fn get(&self, session_id: &str) -> Option<SessionSnapshot> {
        self.session(session_id).map(|s| s.snapshot())
    }

    /// Number of registered sessions, finished ones included.
    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Number of sessions still running.
    pub fn running_count(&self) -> usize {
        self.sessions
            .iter()
            .filter(|entry| entry.value().is_running())
            .count()
    }

    /// Latest output sequence number of a session.
    pub fn latest_seq(&self, session_id: &str) -> Option<u64> {
        self.session(session_id).map(|s| s.latest_seq())
    }

    /// Appends a media event to a running session.
    ///
    /// Returns the assigned media sequence number.
    pub fn publish_media(&self, session_id: &str, event: MediaEvent) -> Option<u64> {
        self.session(session_id)?
            .append_media(event)
            .map(|entry| entry.seq)
    }

    /// Registers a live subscriber for a session's events.
    pub fn subscribe(&self, session_id: &str) -> Option<Subscription> {
        self.session(session_id).map(|s| s.subscribe())
    }

    /// Removes a live subscriber.
    pub fn unsubscribe(&self, session_id: &str, subscriber: SubscriberId) -> bool {
        self.session(session_id)
            .is_some_and(|s| s.unsubscribe(subscriber))
    }

    /// Checks the session limit, spawns and registers, all under the create gate.
    ///
    /// Must not await: the std guard is held until the session is inserted.
    fn create_session(&self, workspace: &Path, command: &str) -> Result<SessionSnapshot, SpawnError> {
        let _gate = self.create_gate.lock().unwrap_or_else(PoisonError::into_inner);

        let limit = self.config.max_sessions;
        if self.running_count() >= limit {
            tracing::warn!(limit, "Refusing to create session, limit reached");
            return Err(SpawnError::TooManySessions { limit });
        }

        let cwd = resolve_workspace(workspace);
        let argv = self.resolver.resolve(command);
        let kind = backend::select_backend(self.config.backend);

        let request = SpawnRequest {
            argv,
            cwd,
            env: build_environment(&self.config.env),
            rows: self.config.rows,
            cols: self.config.cols,
            read_chunk_size: self.config.read_chunk_size,
        };

        let spawned = backend::spawn(kind, &request).map_err(|e| {
            tracing::error!(command = %command, error = %e, "Failed to spawn session");
            e
        })?;

        let session = Arc::new(Session::new(
            &request.cwd,
            command,
            spawned.backend,
            self.limits(),
        ));

        // Start the read loop
        let handle = spawn_reader_loop(Arc::clone(&session), spawned.output, self.reader_settings());
        session.set_reader(handle);

        let snapshot = session.snapshot();
        self.sessions.insert(snapshot.id.clone(), session);

        tracing::info!(
            session_id = %snapshot.id,
            pid = ?snapshot.pid,
            backend = %snapshot.backend,
            workspace = %snapshot.workspace,
            argv = ?request.argv,
            "Created new session"
        );

        Ok(snapshot)
    }

    /// Kills every running session and releases all of them.
    ///
    /// Returns the number of sessions that were released.
    pub async fn shutdown(&self) -> usize {
        let ids: Vec<SessionId> = self.sessions.iter().map(|e| e.key().clone()).collect();

        let mut released = 0;
        for id in ids {
            let Some((_, session)) = self.sessions.remove(&id) else {
                continue;
            };
            if session.kill().await {
                tracing::debug!(session_id = %id, "Killed session during shutdown");
            }
            session.release().await;
            released += 1;
        }

        tracing::info!(sessions = released, "Session registry shut down");
        released
    }
}

impl SessionManager for SessionRegistry {
    async fn create(
        &self,
        workspace: &Path,
        command: &str,
    ) -> Result<SessionSnapshot, SpawnError> {
        self.create_session(workspace, command)
    }

    async fn write(&self, session_id: &str, data: &[u8]) -> bool {
        match self.session(session_id) {
            Some(session) => session.write(data).await,
            None => false,
        }
    }

    async fn resize(&self, session_id: &str, rows: u16, cols: u16) -> bool {
        match self.session(session_id) {
            Some(session) => session.resize(rows, cols).await,
            None => false,
        }
    }

    async fn send_signal(&self, session_id: &str, signal: i32) -> bool {
        match self.session(session_id) {
            Some(session) => session.send_signal(signal).await,
            None => false,
        }
    }

    async fn cancel(&self, session_id: &str) -> bool {
        match self.session(session_id) {
            Some(session) => session.cancel().await,
            None => false,
        }
    }

    async fn kill(&self, session_id: &str) -> bool {
        match self.session(session_id) {
            Some(session) => session.kill().await,
            None => false,
        }
    }

    fn buffer_since(&self, session_id: &str, since: u64) -> Vec<OutputEntry> {
        self.session(session_id)
            .map(|s| s.output_since(since))
            .unwrap_or_default()
    }

    fn media_since(&self, session_id: &str, since: u64) -> Vec<MediaEntry> {
        self.session(session_id)
            .map(|s| s.media_since(since))
            .unwrap_or_default()
    }

    fn list_sessions(&self) -> Vec<SessionSnapshot> {
        let mut sessions: Vec<SessionSnapshot> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect::<Vec<_>>()
            .into_iter()
            .map(|s| s.snapshot())
            .collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        sessions
    }

    async fn cleanup_session(&self, session_id: &str) -> bool {
        let removed = self
            .sessions
            .remove_if(session_id, |_, session| session.status().is_terminal());

        let Some((id, session)) = removed else {
            return false;
        };

        session.release().await;
        tracing::info!(session_id = %id, "Cleaned up session");
        true
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::{AutomationConfig, BackendPreference};
    use protocol::SessionStatus;
    use std::time::Duration;
    use tempfile::TempDir;

    fn registry(backend: BackendPreference) -> SessionRegistry {
        let config = SessionConfig {
            backend,
            max_sessions: 4,
            poll_interval_ms: 10,
            exit_grace_ms: 300,
            ..SessionConfig::default()
        };
        SessionRegistry::new(config, ShellResolver::new("/bin/sh", AutomationConfig::default()))
    }

    async fn wait_status(registry: &SessionRegistry, id: &str) -> SessionStatus {
        for _ in 0..300 {
            if let Some(snap) = registry.get(id) {
                if snap.status.is_terminal() {
                    return snap.status;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("session {id} did not finish");
    }

    fn text(registry: &SessionRegistry, id: &str) -> String {
        registry
            .buffer_since(id, 0)
            .into_iter()
            .map(|e| e.text)
            .collect()
    }

    #[tokio::test]
    async fn test_create_and_complete() {
        let dir = TempDir::new().unwrap();
        let registry = registry(BackendPreference::Pipe);

        let snap = registry.create(dir.path(), "pwd; echo done").await.unwrap();
        assert_eq!(snap.status, SessionStatus::Running);
        assert_eq!(registry.count(), 1);

        assert_eq!(wait_status(&registry, &snap.id).await, SessionStatus::Completed);
        let out = text(&registry, &snap.id);
        assert!(out.contains("done"), "got {out:?}");
        let canonical = dir.path().canonicalize().unwrap();
        assert!(
            out.contains(dir.path().to_str().unwrap()) || out.contains(canonical.to_str().unwrap()),
            "got {out:?}"
        );
    }

    #[tokio::test]
    async fn test_unknown_session_is_fail_soft() {
        let registry = registry(BackendPreference::Pipe);

        assert!(!registry.write("missing", b"x").await);
        assert!(!registry.resize("missing", 1, 1).await);
        assert!(!registry.send_signal("missing", 15).await);
        assert!(!registry.cancel("missing").await);
        assert!(!registry.kill("missing").await);
        assert!(!registry.cleanup_session("missing").await);
        assert!(registry.buffer_since("missing", 0).is_empty());
        assert!(registry.media_since("missing", 0).is_empty());
        assert!(registry.get("missing").is_none());
        assert!(registry.publish_media("missing", MediaEvent::new("x", serde_json::Value::Null)).is_none());
        assert!(registry.subscribe("missing").is_none());
    }

    #[tokio::test]
    async fn test_cancel_then_cleanup() {
        let registry = registry(BackendPreference::Pty);
        let snap = registry.create(Path::new(""), "sleep 30").await.unwrap();

        assert!(!registry.cleanup_session(&snap.id).await);
        assert!(registry.cancel(&snap.id).await);
        assert!(!registry.kill(&snap.id).await);
        assert_eq!(registry.get(&snap.id).unwrap().status, SessionStatus::Cancelled);

        assert!(registry.cleanup_session(&snap.id).await);
        assert!(registry.get(&snap.id).is_none());
        assert!(!registry.cleanup_session(&snap.id).await);
    }

    #[tokio::test]
    async fn test_session_limit() {
        let registry = registry(BackendPreference::Pipe);
        let mut ids = Vec::new();
        for _ in 0..4 {
            ids.push(registry.create(Path::new(""), "sleep 30").await.unwrap().id);
        }

        let err = registry.create(Path::new(""), "sleep 30").await.unwrap_err();
        assert!(matches!(err, SpawnError::TooManySessions { limit: 4 }));

        assert!(registry.kill(&ids[0]).await);
        assert!(registry.create(Path::new(""), "true").await.is_ok());

        assert_eq!(registry.shutdown().await, 5);
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_creates_respect_limit() {
        let registry = Arc::new(registry(BackendPreference::Pipe));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move { registry.create(Path::new(""), "sleep 30").await })
            })
            .collect();

        let mut created = 0;
        let mut refused = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => created += 1,
                Err(SpawnError::TooManySessions { limit: 4 }) => refused += 1,
                Err(e) => panic!("unexpected spawn error: {e}"),
            }
        }

        assert_eq!(created, 4);
        assert_eq!(refused, 12);
        assert_eq!(registry.running_count(), 4);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_media_publish_and_poll() {
        let registry = registry(BackendPreference::Pipe);
        let snap = registry.create(Path::new(""), "sleep 30").await.unwrap();

        let first = registry.publish_media(&snap.id, MediaEvent::new("image", serde_json::json!({"n": 1})));
        let second = registry.publish_media(&snap.id, MediaEvent::new("image", serde_json::json!({"n": 2})));
        assert_eq!(first, Some(1));
        assert_eq!(second, Some(2));

        let entries = registry.media_since(&snap.id, 1);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].event.payload["n"], 2);

        assert!(registry.kill(&snap.id).await);
        assert!(registry.publish_media(&snap.id, MediaEvent::new("late", serde_json::Value::Null)).is_none());
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_list_sessions_is_ordered() {
        let registry = registry(BackendPreference::Pipe);
        let a = registry.create(Path::new(""), "true").await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let b = registry.create(Path::new(""), "true").await.unwrap();

        let ids: Vec<String> = registry.list_sessions().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![a.id, b.id]);
        registry.shutdown().await;
    }
}
