//! # TermHub Daemon Library
//!
//! This crate runs shell commands and interactive shells as managed
//! sessions, records their output and serves them to local clients.
//!
//! ## Overview
//!
//! - **Process backends**: each session runs behind a pseudo-terminal or
//!   plain pipes, chosen per platform or by configuration
//! - **Output history**: bounded, sequence-numbered output and media rings
//!   that clients poll with a `since` cursor
//! - **Live events**: non-blocking fan-out of output, media and exit events
//!   to subscribers
//! - **Lifecycle**: running, then exactly one of completed, failed,
//!   cancelled or killed
//! - **IPC**: newline-delimited JSON over a Unix socket
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                    IPC server (ipc)                       │
//! ├──────────────────────────────────────────────────────────┤
//! │                 SessionRegistry (session)                 │
//! │  ┌────────────┐  ┌──────────────┐  ┌──────────────────┐  │
//! │  │ Shell      │  │ Session      │  │ Reader loop      │  │
//! │  │ resolver   │  │ buffer + hub │  │ (one per session)│  │
//! │  └────────────┘  └──────────────┘  └──────────────────┘  │
//! ├──────────────────────────────────────────────────────────┤
//! │            Process backends: PTY │ pipes                  │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::path::Path;
//!
//! use daemon::session::{SessionManager, SessionRegistry};
//! use daemon::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::default();
//!     let registry = SessionRegistry::from_config(&config);
//!
//!     let session = registry.create(Path::new("/tmp"), "echo hello").await?;
//!     let output = registry.buffer_since(&session.id, 0);
//!     println!("{} entries so far", output.len());
//!
//!     registry.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`session`]: Process sessions, buffers and the registry
//! - [`shell`]: Shell detection and argv construction
//! - [`ipc`]: Unix socket server and client

pub mod config;
#[cfg(unix)]
pub mod ipc;
pub mod session;
pub mod shell;

// Re-export protocol for convenience
pub use protocol;

// Re-export config types for convenience
pub use config::Config;

// Re-export session types for convenience
pub use session::{
    parse_signal, Session, SessionId, SessionManager, SessionRegistry, SpawnError, Subscription,
};

// Re-export shell types for convenience
pub use shell::ShellResolver;
