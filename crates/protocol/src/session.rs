//! Session data model shared between the daemon and its clients.
//!
//! Every type here is plain data: the daemon owns the live state and hands
//! out these snapshots and entries to pollers and subscribers.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle status of a session.
///
/// A session starts `Running` and moves exactly once into one of the
/// terminal states, which are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// The process is alive and its output is being captured.
    Running,
    /// The process exited with code 0.
    Completed,
    /// The process exited with a nonzero code (or an unknown one).
    Failed,
    /// Termination was requested gracefully by a caller.
    Cancelled,
    /// The process was forcibly stopped by a caller.
    Killed,
}

impl SessionStatus {
    /// Returns true for the absorbing states.
    pub fn is_terminal(self) -> bool {
        !matches!(self, SessionStatus::Running)
    }

    /// Classifies a natural process exit.
    pub fn from_exit_code(code: Option<i32>) -> Self {
        match code {
            Some(0) => SessionStatus::Completed,
            _ => SessionStatus::Failed,
        }
    }

    /// Returns the lowercase wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Running => "running",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Cancelled => "cancelled",
            SessionStatus::Killed => "killed",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Which process model backs a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Child attached to a pseudo-terminal.
    Pty,
    /// Child attached to plain stdin/stdout/stderr pipes.
    Pipe,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Pty => f.pad("pty"),
            BackendKind::Pipe => f.pad("pipe"),
        }
    }
}

/// A point-in-time view of one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    /// Unique session identifier.
    pub id: String,
    /// Directory the process was started in (after any fallback).
    pub workspace: String,
    /// The command string as supplied by the caller.
    pub command: String,
    /// Current lifecycle status.
    pub status: SessionStatus,
    /// Creation time in Unix epoch milliseconds.
    pub created_at: u64,
    /// Exit code, once the process has been observed to exit.
    pub return_code: Option<i32>,
    /// Process model backing the session.
    pub backend: BackendKind,
    /// OS process id of the child, if known.
    pub pid: Option<u32>,
    /// Highest output sequence number assigned so far (0 = none yet).
    pub latest_seq: u64,
}

/// One decoded chunk of process output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputEntry {
    /// Per-session sequence number, starting at 1.
    pub seq: u64,
    /// Output text; invalid byte sequences are replaced with U+FFFD.
    pub text: String,
}

/// A structured event attached to a session alongside its text output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaEvent {
    /// Free-form event kind, e.g. `"image"` or `"progress"`.
    pub kind: String,
    /// Event payload.
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl MediaEvent {
    /// Creates a media event.
    pub fn new(kind: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }
}

/// A retained media event with its sequence number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaEntry {
    /// Per-session media sequence number, starting at 1.
    pub seq: u64,
    /// The event itself.
    pub event: MediaEvent,
}

/// A live notification pushed to session subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// New output was appended to the buffer.
    Output(OutputEntry),
    /// A media event was appended to the media buffer.
    Media(MediaEntry),
    /// The session finished; no further events follow.
    Exited {
        /// Final status.
        status: SessionStatus,
        /// Exit code, if the process was observed to exit.
        return_code: Option<i32>,
    },
}
