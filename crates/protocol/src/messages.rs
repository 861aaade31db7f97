//! IPC message types for client-daemon communication.
//!
//! Each request maps onto one session-manager operation. Control requests
//! answer with [`Response::Ack`] carrying the boolean result of the operation;
//! only `Create` can produce an error describing a spawn failure.

use serde::{Deserialize, Serialize};

use crate::session::{MediaEntry, MediaEvent, OutputEntry, SessionEvent, SessionSnapshot, SessionStatus};

/// Requests that can be sent to the daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    /// Check if the daemon is alive.
    Ping,
    /// Request the daemon to stop gracefully.
    Stop,
    /// List every session known to the daemon.
    ListSessions,
    /// Fetch a single session snapshot.
    GetSession {
        /// Session to look up.
        session_id: String,
    },
    /// Spawn a new session.
    Create {
        /// Working directory; falls back to the home directory if unusable.
        workspace: String,
        /// Command to run; empty starts an interactive login shell.
        command: String,
    },
    /// Write input to a running session.
    Write {
        /// Target session.
        session_id: String,
        /// Input text, written verbatim.
        data: String,
    },
    /// Resize a running PTY session.
    Resize {
        /// Target session.
        session_id: String,
        /// New row count.
        rows: u16,
        /// New column count.
        cols: u16,
    },
    /// Deliver a signal to a running session.
    Signal {
        /// Target session.
        session_id: String,
        /// Signal number (e.g. 2 for SIGINT).
        signal: i32,
    },
    /// Request graceful termination.
    Cancel {
        /// Target session.
        session_id: String,
    },
    /// Force termination.
    Kill {
        /// Target session.
        session_id: String,
    },
    /// Fetch retained output with a sequence number greater than `since`.
    BufferSince {
        /// Target session.
        session_id: String,
        /// Last sequence number already seen (0 = everything retained).
        since: u64,
    },
    /// Fetch retained media events with a sequence number greater than `since`.
    MediaSince {
        /// Target session.
        session_id: String,
        /// Last media sequence number already seen.
        since: u64,
    },
    /// Attach a structured media event to a running session.
    PublishMedia {
        /// Target session.
        session_id: String,
        /// Event to publish.
        event: MediaEvent,
    },
    /// Turn this connection into a live event stream for a session.
    Subscribe {
        /// Target session.
        session_id: String,
    },
    /// Release a finished session.
    Cleanup {
        /// Target session.
        session_id: String,
    },
}

/// Responses sent from the daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Response {
    /// Response to a Ping request.
    Pong,
    /// Acknowledgment that the daemon is stopping.
    Stopping,
    /// A session was spawned.
    Created {
        /// New session id.
        session_id: String,
        /// Initial status (always running).
        status: SessionStatus,
    },
    /// Snapshot of every session.
    Sessions {
        /// One entry per session.
        sessions: Vec<SessionSnapshot>,
    },
    /// Snapshot of one session, if it exists.
    Session {
        /// The session, or None if unknown.
        session: Option<SessionSnapshot>,
    },
    /// Boolean result of a control operation.
    Ack {
        /// Whether the operation was accepted.
        ok: bool,
    },
    /// Output entries answering `BufferSince`.
    Output {
        /// Entries in sequence order.
        entries: Vec<OutputEntry>,
    },
    /// Media entries answering `MediaSince`.
    Media {
        /// Entries in sequence order.
        entries: Vec<MediaEntry>,
    },
    /// Result of `PublishMedia`.
    MediaPublished {
        /// Assigned sequence number, or None if rejected.
        seq: Option<u64>,
    },
    /// The connection is now streaming events for this session.
    Subscribed {
        /// Session being followed.
        session_id: String,
    },
    /// A live session event (only after `Subscribed`).
    Event(SessionEvent),
    /// An error occurred processing the request.
    Error {
        /// Human-readable error message.
        message: String,
    },
}
