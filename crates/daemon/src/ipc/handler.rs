//! Request dispatch from IPC connections to the session registry.

use std::path::Path;
use std::sync::Arc;

use protocol::{Request, Response};
use tokio_util::sync::CancellationToken;

use super::server::{IpcConnection, IpcError, IpcServer};
use crate::session::{SessionManager, SessionRegistry};

/// Accepts connections until `shutdown` is cancelled.
///
/// Each connection is served on its own task.
pub async fn serve(
    server: IpcServer,
    registry: Arc<SessionRegistry>,
    shutdown: CancellationToken,
) -> Result<(), IpcError> {
    tracing::info!(path = %server.path().display(), "Listening for IPC connections");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!("IPC server stopping");
                return Ok(());
            }
            accepted = server.accept() => {
                match accepted {
                    Ok(conn) => {
                        let registry = Arc::clone(&registry);
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(conn, registry, shutdown).await {
                                tracing::debug!(error = %e, "IPC connection ended with error");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to accept IPC connection");
                    }
                }
            }
        }
    }
}

/// Serves requests on one connection until the client disconnects.
///
/// A malformed request is answered with an error response and the
/// connection stays open.
pub async fn handle_connection(
    mut conn: IpcConnection,
    registry: Arc<SessionRegistry>,
    shutdown: CancellationToken,
) -> Result<(), IpcError> {
    loop {
        let request = match conn.read_request().await {
            Ok(Some(request)) => request,
            Ok(None) => return Ok(()),
            Err(IpcError::Protocol(e)) => {
                tracing::debug!(error = %e, "Rejected malformed request");
                conn.send_response(&Response::Error {
                    message: e.to_string(),
                })
                .await?;
                continue;
            }
            Err(e) => return Err(e),
        };

        if let Request::Subscribe { session_id } = request {
            return stream_events(conn, &registry, &session_id, &shutdown).await;
        }

        let response = dispatch(&registry, request, &shutdown).await;
        conn.send_response(&response).await?;
    }
}

/// Executes one request/response operation.
pub async fn dispatch(
    registry: &SessionRegistry,
    request: Request,
    shutdown: &CancellationToken,
) -> Response {
    match request {
        Request::Ping => Response::Pong,
        Request::Stop => {
            tracing::info!("Stop requested over IPC");
            shutdown.cancel();
            Response::Stopping
        }
        Request::ListSessions => Response::Sessions {
            sessions: registry.list_sessions(),
        },
        Request::GetSession { session_id } => Response::Session {
            session: registry.get(&session_id),
        },
        Request::Create { workspace, command } => {
            match registry.create(Path::new(&workspace), &command).await {
                Ok(snapshot) => Response::Created {
                    session_id: snapshot.id,
                    status: snapshot.status,
                },
                Err(e) => Response::Error {
                    message: e.to_string(),
                },
            }
        }
        Request::Write { session_id, data } => Response::Ack {
            ok: registry.write(&session_id, data.as_bytes()).await,
        },
        Request::Resize {
            session_id,
            rows,
            cols,
        } => Response::Ack {
            ok: registry.resize(&session_id, rows, cols).await,
        },
        Request::Signal { session_id, signal } => Response::Ack {
            ok: registry.send_signal(&session_id, signal).await,
        },
        Request::Cancel { session_id } => Response::Ack {
            ok: registry.cancel(&session_id).await,
        },
        Request::Kill { session_id } => Response::Ack {
            ok: registry.kill(&session_id).await,
        },
        Request::Cleanup { session_id } => Response::Ack {
            ok: registry.cleanup_session(&session_id).await,
        },
        Request::BufferSince { session_id, since } => Response::Output {
            entries: registry.buffer_since(&session_id, since),
        },
        Request::MediaSince { session_id, since } => Response::Media {
            entries: registry.media_since(&session_id, since),
        },
        Request::PublishMedia { session_id, event } => Response::MediaPublished {
            seq: registry.publish_media(&session_id, event),
        },
        Request::Subscribe { session_id } => Response::Error {
            message: format!("subscribe to {session_id} must be the last request on a connection"),
        },
    }
}

async fn stream_events(
    mut conn: IpcConnection,
    registry: &SessionRegistry,
    session_id: &str,
    shutdown: &CancellationToken,
) -> Result<(), IpcError> {
    let Some(mut subscription) = registry.subscribe(session_id) else {
        conn.send_response(&Response::Error {
            message: format!("unknown session: {session_id}"),
        })
        .await?;
        return Ok(());
    };

    conn.send_response(&Response::Subscribed {
        session_id: session_id.to_string(),
    })
    .await?;

    tracing::debug!(session_id = %session_id, subscriber_id = subscription.id(), "Streaming events");

    let result = loop {
        tokio::select! {
            _ = shutdown.cancelled() => break Ok(()),
            event = subscription.recv() => match event {
                Some(event) => {
                    if let Err(e) = conn.send_response(&Response::Event(event)).await {
                        break Err(e);
                    }
                }
                None => break Ok(()),
            },
        }
    };

    registry.unsubscribe(session_id, subscription.id());
    result
}
