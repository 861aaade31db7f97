//! Unix Domain Socket IPC module for CLI-daemon communication.
//!
//! The IPC system uses the newline-delimited JSON codec from the
//! `protocol` crate. Each message is a single JSON object followed by a
//! newline. A connection carries any number of request/response pairs; a
//! `Subscribe` request turns the connection into a one-way stream of
//! `Response::Event` lines that ends after the session's `Exited` event.
//!
//! ## Socket Path
//!
//! - Configured: `daemon.socket_path` (or `TERMHUB_SOCKET`)
//! - Primary: `$XDG_RUNTIME_DIR/termhub/daemon.sock`
//! - Fallback: `/tmp/termhub-$UID/daemon.sock`
//!
//! ## Example
//!
//! ```rust,no_run
//! use daemon::ipc::{get_socket_path, IpcClient};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut client = IpcClient::connect(&get_socket_path()).await?;
//!
//!     if client.ping().await? {
//!         println!("Daemon is running");
//!     }
//!
//!     Ok(())
//! }
//! ```

mod client;
mod handler;
mod server;

pub use client::IpcClient;
pub use handler::{handle_connection, serve};
pub use server::{IpcConnection, IpcError, IpcServer};

use std::path::PathBuf;

use protocol::{ProtocolError, MAX_LINE_LENGTH};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::config::Config;

/// Get the default socket path for IPC communication.
///
/// 1. If `$XDG_RUNTIME_DIR` is set: `$XDG_RUNTIME_DIR/termhub/daemon.sock`
/// 2. Otherwise: `/tmp/termhub-$UID/daemon.sock`
pub fn get_socket_path() -> PathBuf {
    match std::env::var("XDG_RUNTIME_DIR") {
        Ok(runtime_dir) if !runtime_dir.is_empty() => {
            PathBuf::from(runtime_dir).join("termhub").join("daemon.sock")
        }
        _ => {
            let uid = nix::unistd::getuid().as_raw();
            PathBuf::from(format!("/tmp/termhub-{}", uid)).join("daemon.sock")
        }
    }
}

/// Socket path for `config`: the configured path if any, else the default.
pub fn socket_path_for(config: &Config) -> PathBuf {
    config
        .daemon
        .socket_path
        .clone()
        .unwrap_or_else(get_socket_path)
}

/// Reads one newline-terminated frame.
///
/// Returns `None` on a clean end of stream. A frame longer than
/// [`MAX_LINE_LENGTH`] is rejected without buffering the rest of it.
pub(crate) async fn read_frame<R>(reader: &mut R) -> Result<Option<String>, IpcError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let limit = MAX_LINE_LENGTH as u64 + 1;
    let bytes_read = reader.take(limit).read_line(&mut line).await?;

    if bytes_read == 0 {
        return Ok(None);
    }

    if bytes_read > MAX_LINE_LENGTH {
        return Err(IpcError::Protocol(ProtocolError::LineTooLong {
            size: bytes_read,
            max: MAX_LINE_LENGTH,
        }));
    }

    Ok(Some(line))
}
