//! Process backends.
//!
//! A backend owns one spawned child process and the OS handles attached to
//! it. Two variants exist: [`PtyBackend`] attaches the child to a
//! pseudo-terminal, [`PipeBackend`] to plain stdin/stdout/stderr pipes.
//! Callers never branch on the variant; they go through [`ProcessBackend`].
//!
//! Output is not read through the trait. Each backend starts dedicated
//! blocking reader threads at spawn time that push bounded chunks into a
//! channel; the receiving half is returned as [`BackendOutput`] and is
//! owned exclusively by the session's reader loop.

mod pipe;
mod pty;

use std::io::{self, Read};
use std::path::PathBuf;
use std::time::Duration;

use protocol::BackendKind;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::BackendPreference;

pub use pipe::PipeBackend;
pub use pty::PtyBackend;

/// Chunks buffered between a reader thread and the reader loop.
const OUTPUT_CHANNEL_CAPACITY: usize = 64;

/// Errors that can occur while spawning a session process.
#[derive(Error, Debug)]
pub enum SpawnError {
    /// The argument vector was empty.
    #[error("empty command line")]
    EmptyCommand,

    /// Failed to allocate the pseudo-terminal pair.
    #[error("failed to open PTY: {0}")]
    OpenPty(String),

    /// The OS refused to start the program.
    #[error("failed to spawn {program}: {reason}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Underlying error message.
        reason: String,
    },

    /// The session limit has been reached.
    #[error("too many sessions: limit is {limit}")]
    TooManySessions {
        /// Configured maximum.
        limit: usize,
    },

    /// I/O error while wiring up the process.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Everything a backend needs to start a child process.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    /// Program followed by its arguments.
    pub argv: Vec<String>,
    /// Working directory (already validated).
    pub cwd: PathBuf,
    /// Variables layered on top of the inherited environment.
    pub env: Vec<(String, String)>,
    /// Initial terminal rows (PTY only).
    pub rows: u16,
    /// Initial terminal columns (PTY only).
    pub cols: u16,
    /// Maximum bytes per read.
    pub read_chunk_size: usize,
}

/// Result of a single bounded read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadChunk {
    /// Raw bytes produced by the process.
    Data(Vec<u8>),
    /// Nothing arrived within the wait; try again.
    Idle,
    /// Every output stream has ended.
    Eof,
}

/// Receiving half of a backend's output channel.
pub struct BackendOutput {
    rx: mpsc::Receiver<Vec<u8>>,
}

impl BackendOutput {
    pub(crate) fn channel() -> (mpsc::Sender<Vec<u8>>, Self) {
        let (tx, rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        (tx, Self { rx })
    }

    /// Waits up to `wait` for the next chunk.
    ///
    /// `Eof` is reported once all reader threads have finished and every
    /// buffered chunk has been taken.
    pub async fn read_chunk(&mut self, wait: Duration) -> ReadChunk {
        match tokio::time::timeout(wait, self.rx.recv()).await {
            Ok(Some(data)) => ReadChunk::Data(data),
            Ok(None) => ReadChunk::Eof,
            Err(_) => ReadChunk::Idle,
        }
    }
}

/// Control surface of a spawned child process.
///
/// Every method is fail-soft: faults are reported as `false`/`None` or an
/// `io::Error` and never panic.
pub trait ProcessBackend: Send {
    /// Which process model this is.
    fn kind(&self) -> BackendKind;

    /// OS process id of the child, if known.
    fn pid(&self) -> Option<u32>;

    /// Writes input to the child.
    fn write(&mut self, data: &[u8]) -> io::Result<()>;

    /// Changes the terminal size. Only meaningful for PTY backends.
    fn resize(&mut self, _rows: u16, _cols: u16) -> bool {
        false
    }

    /// Delivers a raw signal number to the child's process group.
    fn signal(&mut self, signal: i32) -> bool;

    /// Asks the child to shut down gracefully.
    fn terminate(&mut self) -> bool;

    /// Stops the child immediately.
    fn kill(&mut self) -> bool;

    /// Returns the exit code if the child has exited.
    fn try_wait(&mut self) -> Option<i32>;

    /// Kills the child if still alive and reaps it. Called exactly once.
    fn release(&mut self);
}

/// A freshly spawned process: its control handle and its output stream.
pub struct SpawnedProcess {
    /// Control handle shared by the session's control operations.
    pub backend: Box<dyn ProcessBackend>,
    /// Output stream owned by the reader loop.
    pub output: BackendOutput,
}

/// Picks the concrete backend for a preference on this platform.
pub fn select_backend(preference: BackendPreference) -> BackendKind {
    match preference {
        BackendPreference::Pty => BackendKind::Pty,
        BackendPreference::Pipe => BackendKind::Pipe,
        BackendPreference::Auto if cfg!(unix) => BackendKind::Pty,
        BackendPreference::Auto => BackendKind::Pipe,
    }
}

/// Spawns `request` with the chosen backend.
pub fn spawn(kind: BackendKind, request: &SpawnRequest) -> Result<SpawnedProcess, SpawnError> {
    if request.argv.is_empty() {
        return Err(SpawnError::EmptyCommand);
    }

    match kind {
        BackendKind::Pty => {
            let (backend, output) = PtyBackend::spawn(request)?;
            Ok(SpawnedProcess {
                backend: Box::new(backend),
                output,
            })
        }
        BackendKind::Pipe => {
            let (backend, output) = PipeBackend::spawn(request)?;
            Ok(SpawnedProcess {
                backend: Box::new(backend),
                output,
            })
        }
    }
}

/// Starts a named thread that copies `reader` into `tx` in bounded chunks.
///
/// The thread ends on end-of-stream, on a read error (a closed PTY reports
/// `EIO`), or once the receiving side has been dropped.
pub(crate) fn spawn_reader_thread<R>(
    name: &str,
    mut reader: R,
    chunk_size: usize,
    tx: mpsc::Sender<Vec<u8>>,
) -> io::Result<()>
where
    R: Read + Send + 'static,
{
    let thread_name = name.to_string();
    std::thread::Builder::new()
        .name(thread_name.clone())
        .spawn(move || {
            let mut buffer = vec![0u8; chunk_size.max(1)];
            loop {
                match reader.read(&mut buffer) {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.blocking_send(buffer[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        tracing::trace!(thread = %thread_name, error = %e, "Output stream closed");
                        break;
                    }
                }
            }
        })?;
    Ok(())
}

/// Maps a std exit status to a single code; signal deaths become `128 + n`.
pub(crate) fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }

    -1
}

/// Sends `signal` to the process group led by `pid`, falling back to the
/// process itself when it is not a group leader.
#[cfg(unix)]
pub(crate) fn signal_group(pid: Option<u32>, signal: i32) -> bool {
    use nix::sys::signal::{kill, killpg, Signal};
    use nix::unistd::Pid;

    let Some(pid) = pid else {
        return false;
    };
    let Ok(signal) = Signal::try_from(signal) else {
        tracing::debug!(signal, "Unknown signal number");
        return false;
    };

    let pid = Pid::from_raw(pid as i32);
    killpg(pid, signal).is_ok() || kill(pid, signal).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_select_backend() {
        assert_eq!(select_backend(BackendPreference::Pty), BackendKind::Pty);
        assert_eq!(select_backend(BackendPreference::Pipe), BackendKind::Pipe);
        if cfg!(unix) {
            assert_eq!(select_backend(BackendPreference::Auto), BackendKind::Pty);
        } else {
            assert_eq!(select_backend(BackendPreference::Auto), BackendKind::Pipe);
        }
    }

    #[test]
    fn test_spawn_rejects_empty_argv() {
        let request = SpawnRequest {
            argv: Vec::new(),
            cwd: std::env::temp_dir(),
            env: Vec::new(),
            rows: 24,
            cols: 80,
            read_chunk_size: 4096,
        };
        assert!(matches!(
            spawn(BackendKind::Pipe, &request),
            Err(SpawnError::EmptyCommand)
        ));
    }

    #[tokio::test]
    async fn test_reader_thread_chunks_then_eof() {
        let (tx, mut output) = BackendOutput::channel();
        let data = b"abcdefghij".to_vec();
        spawn_reader_thread("test-reader", Cursor::new(data), 4, tx).unwrap();

        let mut collected = Vec::new();
        loop {
            match output.read_chunk(Duration::from_millis(500)).await {
                ReadChunk::Data(chunk) => {
                    assert!(chunk.len() <= 4);
                    collected.extend(chunk);
                }
                ReadChunk::Idle => panic!("reader stalled"),
                ReadChunk::Eof => break,
            }
        }
        assert_eq!(collected, b"abcdefghij");
    }

    #[tokio::test]
    async fn test_read_chunk_idle_when_nothing_arrives() {
        let (_tx, mut output) = BackendOutput::channel();
        let chunk = output.read_chunk(Duration::from_millis(10)).await;
        assert_eq!(chunk, ReadChunk::Idle);
    }
}
