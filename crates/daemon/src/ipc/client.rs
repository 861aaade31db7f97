//! IPC Client for communicating with the daemon via Unix Domain Sockets.
//!
//! The client connects to the daemon's Unix socket and sends commands,
//! receiving responses in a request-response pattern. After
//! [`subscribe`](IpcClient::subscribe) the connection only carries events.

use std::io;
use std::path::Path;
use std::time::Duration;

use protocol::{
    decode_line, encode_line, MediaEntry, MediaEvent, OutputEntry, Request, Response,
    SessionEvent, SessionSnapshot,
};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use super::read_frame;
use super::server::IpcError;

/// Default timeout for client operations in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 5;

/// A client for communicating with the daemon via IPC.
pub struct IpcClient {
    reader: BufReader<tokio::io::ReadHalf<UnixStream>>,
    writer: tokio::io::WriteHalf<UnixStream>,
    timeout: Duration,
}

impl IpcClient {
    /// Connect to the daemon at the specified socket path.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established.
    /// This typically indicates that the daemon is not running.
    pub async fn connect(path: &Path) -> Result<Self, IpcError> {
        Self::connect_with_timeout(path, Duration::from_secs(DEFAULT_TIMEOUT_SECS)).await
    }

    /// Connect to the daemon with a custom timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established.
    pub async fn connect_with_timeout(path: &Path, timeout: Duration) -> Result<Self, IpcError> {
        let stream = tokio::time::timeout(timeout, UnixStream::connect(path))
            .await
            .map_err(|_| timed_out("connection timed out"))??;

        let (read_half, write_half) = tokio::io::split(stream);

        Ok(Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            timeout,
        })
    }

    /// Set the timeout for operations.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Send a request to the daemon and wait for a response.
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be sent, the response cannot
    /// be read or parsed, or the operation times out.
    pub async fn send(&mut self, request: Request) -> Result<Response, IpcError> {
        tokio::time::timeout(self.timeout, self.send_internal(request))
            .await
            .map_err(|_| timed_out("operation timed out"))?
    }

    /// Internal send implementation without timeout.
    async fn send_internal(&mut self, request: Request) -> Result<Response, IpcError> {
        let line = encode_line(&request)?;
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;

        self.read_response()
            .await?
            .ok_or_else(|| IpcError::Io(io::Error::new(io::ErrorKind::UnexpectedEof, "daemon closed connection")))
    }

    async fn read_response(&mut self) -> Result<Option<Response>, IpcError> {
        match read_frame(&mut self.reader).await? {
            Some(line) => Ok(Some(decode_line(&line)?)),
            None => Ok(None),
        }
    }

    /// Sends `request` and turns an error response into [`IpcError::Daemon`].
    async fn call(&mut self, request: Request) -> Result<Response, IpcError> {
        match self.send(request).await? {
            Response::Error { message } => Err(IpcError::Daemon(message)),
            other => Ok(other),
        }
    }

    async fn ack(&mut self, request: Request) -> Result<bool, IpcError> {
        match self.call(request).await? {
            Response::Ack { ok } => Ok(ok),
            other => Err(unexpected(other)),
        }
    }

    /// Send a ping request to check if the daemon is responsive.
    ///
    /// Returns `true` if the daemon responds with a Pong.
    pub async fn ping(&mut self) -> Result<bool, IpcError> {
        let response = self.send(Request::Ping).await?;
        Ok(matches!(response, Response::Pong))
    }

    /// Request the daemon to stop.
    pub async fn stop(&mut self) -> Result<bool, IpcError> {
        let response = self.call(Request::Stop).await?;
        Ok(matches!(response, Response::Stopping))
    }

    /// Spawn a new session.
    pub async fn create(&mut self, workspace: &str, command: &str) -> Result<String, IpcError> {
        let request = Request::Create {
            workspace: workspace.to_string(),
            command: command.to_string(),
        };
        match self.call(request).await? {
            Response::Created { session_id, .. } => Ok(session_id),
            other => Err(unexpected(other)),
        }
    }

    /// List all sessions.
    pub async fn list_sessions(&mut self) -> Result<Vec<SessionSnapshot>, IpcError> {
        match self.call(Request::ListSessions).await? {
            Response::Sessions { sessions } => Ok(sessions),
            other => Err(unexpected(other)),
        }
    }

    /// Fetch one session.
    pub async fn get_session(&mut self, session_id: &str) -> Result<Option<SessionSnapshot>, IpcError> {
        let request = Request::GetSession {
            session_id: session_id.to_string(),
        };
        match self.call(request).await? {
            Response::Session { session } => Ok(session),
            other => Err(unexpected(other)),
        }
    }

    /// Write input to a session.
    pub async fn write(&mut self, session_id: &str, data: &str) -> Result<bool, IpcError> {
        self.ack(Request::Write {
            session_id: session_id.to_string(),
            data: data.to_string(),
        })
        .await
    }

    /// Resize a PTY session.
    pub async fn resize(&mut self, session_id: &str, rows: u16, cols: u16) -> Result<bool, IpcError> {
        self.ack(Request::Resize {
            session_id: session_id.to_string(),
            rows,
            cols,
        })
        .await
    }

    /// Deliver a signal to a session.
    pub async fn signal(&mut self, session_id: &str, signal: i32) -> Result<bool, IpcError> {
        self.ack(Request::Signal {
            session_id: session_id.to_string(),
            signal,
        })
        .await
    }

    /// Cancel a session.
    pub async fn cancel(&mut self, session_id: &str) -> Result<bool, IpcError> {
        self.ack(Request::Cancel {
            session_id: session_id.to_string(),
        })
        .await
    }

    /// Kill a session.
    pub async fn kill(&mut self, session_id: &str) -> Result<bool, IpcError> {
        self.ack(Request::Kill {
            session_id: session_id.to_string(),
        })
        .await
    }

    /// Release a finished session.
    pub async fn cleanup(&mut self, session_id: &str) -> Result<bool, IpcError> {
        self.ack(Request::Cleanup {
            session_id: session_id.to_string(),
        })
        .await
    }

    /// Fetch output entries newer than `since`.
    pub async fn buffer_since(&mut self, session_id: &str, since: u64) -> Result<Vec<OutputEntry>, IpcError> {
        let request = Request::BufferSince {
            session_id: session_id.to_string(),
            since,
        };
        match self.call(request).await? {
            Response::Output { entries } => Ok(entries),
            other => Err(unexpected(other)),
        }
    }

    /// Fetch media entries newer than `since`.
    pub async fn media_since(&mut self, session_id: &str, since: u64) -> Result<Vec<MediaEntry>, IpcError> {
        let request = Request::MediaSince {
            session_id: session_id.to_string(),
            since,
        };
        match self.call(request).await? {
            Response::Media { entries } => Ok(entries),
            other => Err(unexpected(other)),
        }
    }

    /// Attach a media event to a running session.
    pub async fn publish_media(&mut self, session_id: &str, event: MediaEvent) -> Result<Option<u64>, IpcError> {
        let request = Request::PublishMedia {
            session_id: session_id.to_string(),
            event,
        };
        match self.call(request).await? {
            Response::MediaPublished { seq } => Ok(seq),
            other => Err(unexpected(other)),
        }
    }

    /// Turns this connection into an event stream for `session_id`.
    ///
    /// Read the events with [`next_event`](Self::next_event).
    pub async fn subscribe(&mut self, session_id: &str) -> Result<(), IpcError> {
        let request = Request::Subscribe {
            session_id: session_id.to_string(),
        };
        match self.call(request).await? {
            Response::Subscribed { .. } => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Waits for the next streamed event, without a timeout.
    ///
    /// Returns `None` once the daemon closes the stream.
    pub async fn next_event(&mut self) -> Result<Option<SessionEvent>, IpcError> {
        match self.read_response().await? {
            Some(Response::Event(event)) => Ok(Some(event)),
            Some(Response::Error { message }) => Err(IpcError::Daemon(message)),
            Some(other) => Err(unexpected(other)),
            None => Ok(None),
        }
    }
}

fn timed_out(message: &str) -> IpcError {
    IpcError::Io(io::Error::new(io::ErrorKind::TimedOut, message.to_string()))
}

fn unexpected(response: Response) -> IpcError {
    IpcError::UnexpectedResponse(format!("{response:?}"))
}
