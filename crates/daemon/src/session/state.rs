//! A single managed session.
//!
//! [`Session`] owns the process backend, the output history and the
//! subscriber hub of one child process. It is shared as `Arc<Session>`
//! between the registry, control operations and the reader loop.
//!
//! Lock order is lifecycle, then buffer, then hub. None of these are
//! `std` mutexes held across an `.await`; the backend sits behind an async
//! mutex because control operations and the reader loop both use it.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use protocol::{
    BackendKind, MediaEntry, MediaEvent, OutputEntry, SessionEvent, SessionSnapshot,
    SessionStatus,
};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::backend::ProcessBackend;
use super::buffer::OutputBuffer;
use super::multiplexer::{SubscriberHub, SubscriberId, Subscription};

/// Unique identifier for a session.
pub type SessionId = String;

/// Interval between exit polls while waiting for a process.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Sizes of the per-session queues and rings.
#[derive(Debug, Clone, Copy)]
pub struct SessionLimits {
    /// Output entries retained.
    pub output_buffer_cap: usize,
    /// Media entries retained.
    pub media_buffer_cap: usize,
    /// Events queued per subscriber before it is dropped.
    pub subscriber_capacity: usize,
}

#[derive(Debug)]
struct Lifecycle {
    status: SessionStatus,
    return_code: Option<i32>,
}

/// One managed child process and everything recorded about it.
pub struct Session {
    id: SessionId,
    workspace: PathBuf,
    command: String,
    created_at: u64,
    kind: BackendKind,
    pid: Option<u32>,
    lifecycle: Mutex<Lifecycle>,
    buffer: Mutex<OutputBuffer>,
    hub: SubscriberHub,
    backend: tokio::sync::Mutex<Option<Box<dyn ProcessBackend>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Wraps a freshly spawned backend in a running session.
    pub fn new(
        workspace: &Path,
        command: &str,
        backend: Box<dyn ProcessBackend>,
        limits: SessionLimits,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            workspace: workspace.to_path_buf(),
            command: command.to_string(),
            created_at: now_millis(),
            kind: backend.kind(),
            pid: backend.pid(),
            lifecycle: Mutex::new(Lifecycle {
                status: SessionStatus::Running,
                return_code: None,
            }),
            buffer: Mutex::new(OutputBuffer::new(
                limits.output_buffer_cap,
                limits.media_buffer_cap,
            )),
            hub: SubscriberHub::new(limits.subscriber_capacity),
            backend: tokio::sync::Mutex::new(Some(backend)),
            reader: Mutex::new(None),
        }
    }

    /// Returns the session ID.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Returns the working directory the process was started in.
    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    /// Returns the backend kind.
    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    /// Returns the child's process ID.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Creation time in Unix epoch milliseconds.
    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn buffer(&self) -> MutexGuard<'_, OutputBuffer> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current status.
    pub fn status(&self) -> SessionStatus {
        self.lifecycle().status
    }

    /// Exit code, once recorded.
    pub fn return_code(&self) -> Option<i32> {
        self.lifecycle().return_code
    }

    /// Returns true while the status is `Running`.
    pub fn is_running(&self) -> bool {
        self.status() == SessionStatus::Running
    }

    /// Moves a running session to `status`.
    ///
    /// Returns false if the session already reached a terminal status, in
    /// which case nothing changes.
    pub fn claim_terminal(&self, status: SessionStatus) -> bool {
        let mut lifecycle = self.lifecycle();
        if lifecycle.status != SessionStatus::Running {
            return false;
        }
        lifecycle.status = status;
        true
    }

    /// Records the observed exit and settles the final status.
    ///
    /// A session that is still running becomes completed or failed
    /// according to `code`; a cancelled or killed session keeps its status
    /// and only gains the return code.
    pub fn finish(&self, code: Option<i32>) -> SessionStatus {
        let mut lifecycle = self.lifecycle();
        if code.is_some() {
            lifecycle.return_code = code;
        }
        if lifecycle.status == SessionStatus::Running {
            lifecycle.status = SessionStatus::from_exit_code(code);
        }
        lifecycle.status
    }

    /// Appends decoded output and pushes it to subscribers.
    ///
    /// Returns `None` once the session is terminal.
    pub fn append_output(&self, text: String) -> Option<OutputEntry> {
        let lifecycle = self.lifecycle();
        if lifecycle.status != SessionStatus::Running {
            return None;
        }

        let entry = self.buffer().append_output(text);
        self.hub.broadcast(&SessionEvent::Output(entry.clone()));
        drop(lifecycle);
        Some(entry)
    }

    /// Appends a media event and pushes it to subscribers.
    ///
    /// Returns `None` once the session is terminal.
    pub fn append_media(&self, event: MediaEvent) -> Option<MediaEntry> {
        let lifecycle = self.lifecycle();
        if lifecycle.status != SessionStatus::Running {
            return None;
        }

        let entry = self.buffer().append_media(event);
        self.hub.broadcast(&SessionEvent::Media(entry.clone()));
        drop(lifecycle);
        Some(entry)
    }

    /// Output entries newer than `since`.
    pub fn output_since(&self, since: u64) -> Vec<OutputEntry> {
        self.buffer().output_since(since)
    }

    /// Media entries newer than `since`.
    pub fn media_since(&self, since: u64) -> Vec<MediaEntry> {
        self.buffer().media_since(since)
    }

    /// Latest output sequence number.
    pub fn latest_seq(&self) -> u64 {
        self.buffer().latest_output_seq()
    }

    /// Registers a live subscriber.
    pub fn subscribe(&self) -> Subscription {
        self.hub.subscribe()
    }

    /// Removes a live subscriber.
    pub fn unsubscribe(&self, subscriber: SubscriberId) -> bool {
        self.hub.unsubscribe(subscriber).is_some()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.hub.subscriber_count()
    }

    /// Sends the final `Exited` event and closes every subscription.
    pub fn close_subscribers(&self) {
        let (status, return_code) = {
            let lifecycle = self.lifecycle();
            (lifecycle.status, lifecycle.return_code)
        };
        self.hub.close(SessionEvent::Exited {
            status,
            return_code,
        });
    }

    /// Returns a point-in-time view of the session.
    pub fn snapshot(&self) -> SessionSnapshot {
        let (status, return_code) = {
            let lifecycle = self.lifecycle();
            (lifecycle.status, lifecycle.return_code)
        };

        SessionSnapshot {
            id: self.id.clone(),
            workspace: self.workspace.display().to_string(),
            command: self.command.clone(),
            status,
            created_at: self.created_at,
            return_code,
            backend: self.kind,
            pid: self.pid,
            latest_seq: self.latest_seq(),
        }
    }

    /// Writes input to the process. False if terminal or the write failed.
    pub async fn write(&self, data: &[u8]) -> bool {
        if !self.is_running() {
            return false;
        }

        let mut backend = self.backend.lock().await;
        match backend.as_mut() {
            Some(backend) => match backend.write(data) {
                Ok(()) => true,
                Err(e) => {
                    tracing::debug!(session_id = %self.id, error = %e, "Write failed");
                    false
                }
            },
            None => false,
        }
    }

    /// Resizes the terminal. False for pipe sessions and terminal sessions.
    pub async fn resize(&self, rows: u16, cols: u16) -> bool {
        if !self.is_running() || self.kind != BackendKind::Pty {
            return false;
        }

        let mut backend = self.backend.lock().await;
        backend.as_mut().is_some_and(|b| b.resize(rows, cols))
    }

    /// Delivers a raw signal without changing the status.
    pub async fn send_signal(&self, signal: i32) -> bool {
        if !self.is_running() {
            return false;
        }

        let mut backend = self.backend.lock().await;
        backend.as_mut().is_some_and(|b| b.signal(signal))
    }

    /// Marks the session cancelled and asks the process to stop.
    pub async fn cancel(&self) -> bool {
        if !self.claim_terminal(SessionStatus::Cancelled) {
            return false;
        }

        let mut backend = self.backend.lock().await;
        if let Some(backend) = backend.as_mut() {
            backend.terminate();
        }
        tracing::info!(session_id = %self.id, "Session cancelled");
        true
    }

    /// Marks the session killed and stops the process immediately.
    pub async fn kill(&self) -> bool {
        if !self.claim_terminal(SessionStatus::Killed) {
            return false;
        }

        self.force_stop().await;
        tracing::info!(session_id = %self.id, "Session killed");
        true
    }

    /// Sends an immediate kill regardless of status.
    pub async fn force_stop(&self) -> bool {
        let mut backend = self.backend.lock().await;
        backend.as_mut().is_some_and(|b| b.kill())
    }

    /// Returns the exit code if the process has exited.
    pub async fn try_wait(&self) -> Option<i32> {
        let mut backend = self.backend.lock().await;
        backend.as_mut().and_then(|b| b.try_wait())
    }

    /// Waits up to `timeout` for the process to exit.
    pub async fn wait(&self, timeout: Duration) -> Option<i32> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(code) = self.try_wait().await {
                return Some(code);
            }

            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            tokio::time::sleep(WAIT_POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    /// Stores the reader loop's task handle.
    pub fn set_reader(&self, handle: JoinHandle<()>) {
        *self.reader.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    /// Returns true while the reader loop task is alive.
    pub fn reader_active(&self) -> bool {
        self.reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Stops the reader loop, releases the backend and closes subscribers.
    ///
    /// Returns false if the backend had already been released.
    pub async fn release(&self) -> bool {
        let reader = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = reader {
            handle.abort();
        }

        let backend = self.backend.lock().await.take();
        let released = match backend {
            Some(mut backend) => {
                backend.release();
                if let Some(code) = backend.try_wait() {
                    self.finish(Some(code));
                }
                true
            }
            None => false,
        };

        self.close_subscribers();
        released
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    /// Backend stand-in that records calls and exits on demand.
    #[derive(Default)]
    struct FakeBackend {
        written: Vec<u8>,
        exit_code: Option<i32>,
        terminated: bool,
        killed: bool,
    }

    impl ProcessBackend for FakeBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::Pipe
        }

        fn pid(&self) -> Option<u32> {
            Some(4242)
        }

        fn write(&mut self, data: &[u8]) -> io::Result<()> {
            self.written.extend_from_slice(data);
            Ok(())
        }

        fn signal(&mut self, _signal: i32) -> bool {
            true
        }

        fn terminate(&mut self) -> bool {
            self.terminated = true;
            self.exit_code = Some(143);
            true
        }

        fn kill(&mut self) -> bool {
            self.killed = true;
            self.exit_code = Some(137);
            true
        }

        fn try_wait(&mut self) -> Option<i32> {
            self.exit_code
        }

        fn release(&mut self) {
            if self.exit_code.is_none() {
                self.kill();
            }
        }
    }

    fn limits() -> SessionLimits {
        SessionLimits {
            output_buffer_cap: 100,
            media_buffer_cap: 10,
            subscriber_capacity: 16,
        }
    }

    fn session() -> Session {
        Session::new(
            Path::new("/tmp"),
            "echo hi",
            Box::new(FakeBackend::default()),
            limits(),
        )
    }

    #[test]
    fn test_new_session_is_running() {
        let s = session();
        assert!(s.is_running());
        assert_eq!(s.pid(), Some(4242));
        assert_eq!(s.kind(), BackendKind::Pipe);

        let snap = s.snapshot();
        assert_eq!(snap.command, "echo hi");
        assert_eq!(snap.status, SessionStatus::Running);
        assert_eq!(snap.latest_seq, 0);
        assert!(Uuid::parse_str(&snap.id).is_ok());
    }

    #[test]
    fn test_claim_terminal_is_first_wins() {
        let s = session();
        assert!(s.claim_terminal(SessionStatus::Cancelled));
        assert!(!s.claim_terminal(SessionStatus::Killed));
        assert_eq!(s.status(), SessionStatus::Cancelled);
    }

    #[test]
    fn test_finish_keeps_claimed_status() {
        let s = session();
        s.claim_terminal(SessionStatus::Killed);
        assert_eq!(s.finish(Some(137)), SessionStatus::Killed);
        assert_eq!(s.return_code(), Some(137));
    }

    #[test]
    fn test_finish_from_exit_code() {
        let ok = session();
        assert_eq!(ok.finish(Some(0)), SessionStatus::Completed);

        let failed = session();
        assert_eq!(failed.finish(Some(2)), SessionStatus::Failed);
        assert_eq!(failed.return_code(), Some(2));
    }

    #[test]
    fn test_no_appends_after_terminal() {
        let s = session();
        assert_eq!(s.append_output("a".to_string()).map(|e| e.seq), Some(1));
        s.finish(Some(0));

        assert!(s.append_output("late".to_string()).is_none());
        assert!(s.append_media(MediaEvent::new("x", serde_json::Value::Null)).is_none());
        assert_eq!(s.output_since(0).len(), 1);
    }

    #[test]
    fn test_append_reaches_subscribers() {
        let s = session();
        let mut sub = s.subscribe();

        s.append_output("hello".to_string());
        s.append_media(MediaEvent::new("image", serde_json::json!({"w": 1})));

        assert!(matches!(sub.try_recv(), Some(SessionEvent::Output(e)) if e.text == "hello"));
        assert!(matches!(sub.try_recv(), Some(SessionEvent::Media(e)) if e.seq == 1));
    }

    #[tokio::test]
    async fn test_control_ops_fail_after_terminal() {
        let s = session();
        assert!(s.write(b"input").await);
        assert!(s.send_signal(10).await);
        assert!(!s.resize(10, 10).await);

        assert!(s.cancel().await);
        assert!(!s.cancel().await);
        assert!(!s.kill().await);
        assert!(!s.write(b"more").await);
        assert!(!s.send_signal(10).await);
        assert_eq!(s.status(), SessionStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_wait_sees_exit() {
        let s = session();
        assert_eq!(s.wait(Duration::from_millis(30)).await, None);
        assert!(s.kill().await);
        assert_eq!(s.wait(Duration::from_millis(30)).await, Some(137));
    }

    #[tokio::test]
    async fn test_release_is_once_and_closes_subscribers() {
        let s = session();
        let mut sub = s.subscribe();
        s.claim_terminal(SessionStatus::Cancelled);

        assert!(s.release().await);
        assert!(!s.release().await);
        assert_eq!(s.return_code(), Some(137));

        match sub.recv().await {
            Some(SessionEvent::Exited { status, return_code }) => {
                assert_eq!(status, SessionStatus::Cancelled);
                assert_eq!(return_code, Some(137));
            }
            other => panic!("expected exit event, got {other:?}"),
        }
        assert_eq!(sub.recv().await, None);
    }
}
