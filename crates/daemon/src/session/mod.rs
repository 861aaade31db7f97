//! Session management module.
//!
//! This module spawns child processes behind a PTY or plain pipes, records
//! their output in bounded sequence-numbered buffers, fans events out to
//! live subscribers and tracks each session through its lifecycle.
//!
//! ```text
//! create ──► backend::spawn ──► Session ◄── control ops (write, resize,
//!                 │                ▲           signal, cancel, kill)
//!          reader threads          │
//!                 │           reader loop ──► OutputBuffer ──► SubscriberHub
//!                 └── chunks ──────┘
//! ```

pub mod backend;
pub mod buffer;
pub mod decode;
pub mod environment;
pub mod manager;
pub mod multiplexer;
pub mod reader;
pub mod signal;
pub mod state;

pub use backend::{ProcessBackend, SpawnError};
pub use buffer::OutputBuffer;
pub use manager::{SessionManager, SessionRegistry};
pub use multiplexer::{SubscriberHub, SubscriberId, Subscription};
pub use signal::parse_signal;
pub use state::{Session, SessionId};
