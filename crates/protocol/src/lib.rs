//! # TermHub Protocol Library
//!
//! Shared data types for the TermHub process/terminal session manager.
//!
//! ## Overview
//!
//! The daemon owns live sessions; everything that crosses its boundary is
//! described here:
//!
//! - **Session Model**: status, snapshots, output/media entries and live events
//! - **IPC Messages**: request/response enums, one request per manager operation
//! - **Line Codec**: newline-delimited JSON framing used on the local socket
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{decode_line, encode_line, Request};
//!
//! let line = encode_line(&Request::BufferSince {
//!     session_id: "3f2a".to_string(),
//!     since: 0,
//! })
//! .unwrap();
//!
//! let request: Request = decode_line(&line).unwrap();
//! assert!(matches!(request, Request::BufferSince { since: 0, .. }));
//! ```
//!
//! ## Modules
//!
//! - [`session`]: Session data model
//! - [`messages`]: IPC request/response definitions
//! - [`framing`]: JSON line codec
//! - [`error`]: Error types

pub mod error;
pub mod framing;
pub mod messages;
pub mod session;

pub use error::{ProtocolError, Result};
pub use framing::{decode_line, encode_line, MAX_LINE_LENGTH};
pub use messages::{Request, Response};
pub use session::{
    BackendKind, MediaEntry, MediaEvent, OutputEntry, SessionEvent, SessionSnapshot,
    SessionStatus,
};
