//! Per-session output reader loop.
//!
//! One task per session moves process output into the session buffer
//! until the session stops running, then settles the final status. The
//! loop yields after every iteration so many sessions share the runtime
//! fairly.

use std::sync::Arc;
use std::time::Duration;

use protocol::SessionStatus;
use tokio::task::JoinHandle;

use super::backend::{BackendOutput, ReadChunk};
use super::decode::Utf8Decoder;
use super::state::Session;

/// Timing knobs for the reader loop.
#[derive(Debug, Clone, Copy)]
pub struct ReaderSettings {
    /// Longest wait for output before re-checking liveness.
    pub poll_interval: Duration,
    /// How long to wait for the process to exit once the loop ends, and
    /// again after escalating a cancel to a kill.
    pub exit_grace: Duration,
}

/// Starts the reader loop for `session` on the current runtime.
pub fn spawn_reader_loop(
    session: Arc<Session>,
    output: BackendOutput,
    settings: ReaderSettings,
) -> JoinHandle<()> {
    tokio::spawn(run_reader_loop(session, output, settings))
}

async fn run_reader_loop(session: Arc<Session>, mut output: BackendOutput, settings: ReaderSettings) {
    let mut decoder = Utf8Decoder::new();
    let mut exit_code = None;

    tracing::debug!(session_id = %session.id(), "Reader loop started");

    while session.is_running() {
        if let Some(code) = session.try_wait().await {
            // Output written just before exit may still be in flight.
            drain(&session, &mut output, &mut decoder, settings.poll_interval).await;
            exit_code = Some(code);
            break;
        }

        match output.read_chunk(settings.poll_interval).await {
            ReadChunk::Data(bytes) => append(&session, &mut decoder, &bytes),
            ReadChunk::Idle => {}
            ReadChunk::Eof => {
                tracing::debug!(session_id = %session.id(), "Output stream ended");
                break;
            }
        }

        tokio::task::yield_now().await;
    }

    let tail = decoder.finish();
    if !tail.is_empty() {
        session.append_output(tail);
    }

    let mut code = match exit_code {
        Some(code) => Some(code),
        None => wait_for_exit(&session, settings).await,
    };

    if code.is_none() && session.status() == SessionStatus::Cancelled {
        tracing::warn!(
            session_id = %session.id(),
            "Process ignored cancellation, escalating to kill"
        );
        session.force_stop().await;
        code = session.wait(settings.exit_grace).await;
    }

    let status = session.finish(code);
    tracing::info!(
        session_id = %session.id(),
        status = %status,
        return_code = ?code,
        "Session finished"
    );

    session.close_subscribers();
}

/// Waits for the process after its output stream has ended.
///
/// A running session only settles on an observed exit: a process can close
/// its output and keep running, and it stays controllable until it exits.
/// Once a cancel or kill has claimed the session the wait is bounded.
async fn wait_for_exit(session: &Session, settings: ReaderSettings) -> Option<i32> {
    while session.is_running() {
        if let Some(code) = session.try_wait().await {
            return Some(code);
        }
        tokio::time::sleep(settings.poll_interval).await;
    }

    session.wait(settings.exit_grace).await
}

/// Reads until the stream ends or stays quiet for one interval.
async fn drain(
    session: &Session,
    output: &mut BackendOutput,
    decoder: &mut Utf8Decoder,
    interval: Duration,
) {
    loop {
        match output.read_chunk(interval).await {
            ReadChunk::Data(bytes) => append(session, decoder, &bytes),
            ReadChunk::Idle | ReadChunk::Eof => break,
        }
    }
}

fn append(session: &Session, decoder: &mut Utf8Decoder, bytes: &[u8]) {
    let text = decoder.decode(bytes);
    if !text.is_empty() {
        session.append_output(text);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::session::backend::{spawn, SpawnRequest};
    use crate::session::state::SessionLimits;
    use protocol::{BackendKind, SessionEvent};
    use std::path::Path;

    fn settings() -> ReaderSettings {
        ReaderSettings {
            poll_interval: Duration::from_millis(20),
            exit_grace: Duration::from_millis(500),
        }
    }

    fn start(kind: BackendKind, script: &str) -> Arc<Session> {
        let request = SpawnRequest {
            argv: vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()],
            cwd: std::env::temp_dir(),
            env: Vec::new(),
            rows: 24,
            cols: 80,
            read_chunk_size: 4096,
        };
        let spawned = spawn(kind, &request).unwrap();
        let session = Arc::new(Session::new(
            Path::new("/tmp"),
            script,
            spawned.backend,
            SessionLimits {
                output_buffer_cap: 1000,
                media_buffer_cap: 10,
                subscriber_capacity: 1024,
            },
        ));
        let handle = spawn_reader_loop(Arc::clone(&session), spawned.output, settings());
        session.set_reader(handle);
        session
    }

    async fn wait_terminal(session: &Session) {
        for _ in 0..300 {
            if session.status().is_terminal() && !session.reader_active() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("session did not finish: {:?}", session.status());
    }

    fn full_output(session: &Session) -> String {
        session.output_since(0).into_iter().map(|e| e.text).collect()
    }

    #[tokio::test]
    async fn test_completed_session_keeps_all_output() {
        let session = start(BackendKind::Pipe, "for i in 1 2 3; do echo line$i; done");
        wait_terminal(&session).await;

        assert_eq!(session.status(), SessionStatus::Completed);
        assert_eq!(session.return_code(), Some(0));
        let text = full_output(&session);
        assert!(text.contains("line1") && text.contains("line3"), "got {text:?}");
    }

    #[tokio::test]
    async fn test_failed_session_records_code() {
        let session = start(BackendKind::Pty, "echo boom; exit 4");
        wait_terminal(&session).await;

        assert_eq!(session.status(), SessionStatus::Failed);
        assert_eq!(session.return_code(), Some(4));
        assert!(full_output(&session).contains("boom"));
    }

    #[tokio::test]
    async fn test_subscriber_sees_output_then_exit() {
        let session = start(BackendKind::Pipe, "sleep 0.2; echo streamed");
        let mut sub = session.subscribe();

        let mut saw_output = false;
        loop {
            match sub.recv().await {
                Some(SessionEvent::Output(entry)) => saw_output |= entry.text.contains("streamed"),
                Some(SessionEvent::Exited { status, .. }) => {
                    assert_eq!(status, SessionStatus::Completed);
                    break;
                }
                Some(SessionEvent::Media(_)) => {}
                None => panic!("stream ended without exit event"),
            }
        }
        assert!(saw_output);
        assert_eq!(sub.recv().await, None);
    }

    #[tokio::test]
    async fn test_closed_output_keeps_session_running() {
        let session = start(BackendKind::Pipe, "exec >/dev/null 2>&1; sleep 30");

        // Longer than exit_grace: the stream has ended but the process lives on.
        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(session.status(), SessionStatus::Running);
        assert_eq!(session.return_code(), None);
        assert!(session.reader_active());

        assert!(session.kill().await);
        wait_terminal(&session).await;
        assert_eq!(session.status(), SessionStatus::Killed);
        assert_eq!(session.return_code(), Some(128 + 9));
    }

    #[tokio::test]
    async fn test_closed_output_then_exit_completes() {
        let session = start(BackendKind::Pipe, "exec >/dev/null 2>&1; sleep 0.8; exit 6");
        wait_terminal(&session).await;

        assert_eq!(session.status(), SessionStatus::Failed);
        assert_eq!(session.return_code(), Some(6));
    }

    #[tokio::test]
    async fn test_cancel_escalates_when_term_is_ignored() {
        let session = start(BackendKind::Pipe, "trap '' TERM; echo ready; sleep 30");
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(session.cancel().await);
        wait_terminal(&session).await;

        assert_eq!(session.status(), SessionStatus::Cancelled);
        assert_eq!(session.return_code(), Some(128 + 9));
    }
}
