//! Connection state machine
//!
//! Accepted → TlsHandshake → Authenticating → Ready ↔ Dispatching → Closing → Closed
//!
//! TLS (when enabled) completes before any application byte is read. The
//! first frame must authenticate; nothing is dispatched otherwise. Once
//! ready, every frame runs as its own task and replies go out through a
//! single writer, so responses may complete out of order.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use buildmaster_protocol::{decode_payload, Request, Response, RpcError};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{sleep, Instant};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::Shared;

/// Bound on flushing queued replies once a connection is closing.
const WRITER_DRAIN: Duration = Duration::from_secs(5);

/// Connection lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Accepted,
    TlsHandshake,
    Authenticating,
    /// Authenticated, nothing in flight
    Ready,
    /// Authenticated, at least one request in flight
    Dispatching,
    Closing,
    Closed,
}

impl ConnectionState {
    /// Check if transition from this state to target is valid
    pub fn can_transition_to(&self, target: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, target) {
            (Accepted, TlsHandshake) => true,
            (Accepted, Authenticating) => true,
            (TlsHandshake, Authenticating) => true,
            (Authenticating, Ready) => true,
            (Ready, Dispatching) => true,
            (Dispatching, Ready) => true,

            (Closing, Closed) => true,
            (Closing, _) | (Closed, _) => false,
            (_, Closing) => true,

            _ => false,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self, ConnectionState::Ready | ConnectionState::Dispatching)
    }
}

/// Why a connection ended
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("invalid connection state transition from {from:?} to {to:?}")]
    InvalidTransition {
        from: ConnectionState,
        to: ConnectionState,
    },

    #[error("TLS handshake failed: {0}")]
    Handshake(String),

    #[error("{phase} timed out after {after_ms}ms")]
    Timeout { phase: &'static str, after_ms: u64 },

    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("peer closed the connection")]
    ClosedByPeer,

    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConnectionError {
    fn timeout(phase: &'static str, after: Duration) -> Self {
        Self::Timeout {
            phase,
            after_ms: after.as_millis() as u64,
        }
    }
}

type FramedIo<S> = Framed<S, LengthDelimitedCodec>;

/// One client connection.
#[derive(Debug)]
pub struct Connection {
    peer: SocketAddr,
    tls: bool,
    state: ConnectionState,
    last_activity: Instant,
}

impl Connection {
    pub fn new(peer: SocketAddr, tls: bool) -> Self {
        Self {
            peer,
            tls,
            state: ConnectionState::Accepted,
            last_activity: Instant::now(),
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Transition to a new state
    pub fn transition(&mut self, next: ConnectionState) -> Result<(), ConnectionError> {
        if !self.state.can_transition_to(next) {
            return Err(ConnectionError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        tracing::trace!(from = ?self.state, to = ?next, "connection state");
        self.state = next;
        Ok(())
    }

    /// Move to `Closed`, through `Closing` if not already there.
    fn close(&mut self) {
        if self.state != ConnectionState::Closing {
            let _ = self.transition(ConnectionState::Closing);
        }
        let _ = self.transition(ConnectionState::Closed);
    }

    async fn drive(
        &mut self,
        stream: TcpStream,
        shared: &Arc<Shared>,
        shutdown: &CancellationToken,
    ) -> Result<(), ConnectionError> {
        let Some(acceptor) = shared.acceptor.clone() else {
            return self.session(stream, shared, shutdown).await;
        };

        self.transition(ConnectionState::TlsHandshake)?;
        let limit = shared.settings.tls_handshake_timeout;
        let tls_stream = match tokio::time::timeout(limit, acceptor.accept(stream)).await {
            Ok(Ok(tls_stream)) => tls_stream,
            Ok(Err(e)) => return Err(ConnectionError::Handshake(e.to_string())),
            Err(_) => return Err(ConnectionError::timeout("TLS handshake", limit)),
        };
        self.session(tls_stream, shared, shutdown).await
    }

    async fn session<S>(
        &mut self,
        io: S,
        shared: &Arc<Shared>,
        shutdown: &CancellationToken,
    ) -> Result<(), ConnectionError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let codec = LengthDelimitedCodec::builder()
            .max_frame_length(shared.settings.max_frame_bytes)
            .new_codec();
        let mut framed = Framed::new(io, codec);

        self.transition(ConnectionState::Authenticating)?;
        self.authenticate(&mut framed, shared).await?;
        self.transition(ConnectionState::Ready)?;
        tracing::debug!("authenticated");

        self.serve_requests(framed, shared, shutdown).await
    }

    /// Read exactly one frame and require it to be a valid credential.
    async fn authenticate<S>(&mut self, framed: &mut FramedIo<S>, shared: &Shared) -> Result<(), ConnectionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let limit = shared.settings.auth_timeout;
        let frame = match tokio::time::timeout(limit, framed.next()).await {
            Ok(Some(Ok(frame))) => frame,
            Ok(Some(Err(e))) => return Err(ConnectionError::Io(e)),
            Ok(None) => return Err(ConnectionError::ClosedByPeer),
            Err(_) => {
                reject(framed, String::new(), limit).await;
                return Err(ConnectionError::timeout("authentication", limit));
            }
        };
        self.last_activity = Instant::now();

        let (id, verified) = match decode_payload::<Request>(&frame) {
            Ok(request) => {
                let verified = request.token().is_some_and(|token| shared.verifier.verify(token));
                (request.id, verified)
            }
            Err(_) => (String::new(), false),
        };

        if !verified {
            reject(framed, id, limit).await;
            return Err(ConnectionError::AuthenticationFailed);
        }

        let reply = Response::success(
            id,
            json!({ "authenticated": true, "instance_id": shared.ctx.instance_id() }),
        );
        write_response(framed, &reply).await
    }

    async fn serve_requests<S>(
        &mut self,
        framed: FramedIo<S>,
        shared: &Arc<Shared>,
        shutdown: &CancellationToken,
    ) -> Result<(), ConnectionError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let settings = &shared.settings;
        let (mut sink, mut frames) = framed.split();
        let (tx, mut rx) = mpsc::channel::<Response>(settings.max_in_flight * 2 + 1);

        let mut writer = tokio::spawn(
            async move {
                while let Some(response) = rx.recv().await {
                    let payload = match serde_json::to_vec(&response) {
                        Ok(payload) => payload,
                        Err(e) => {
                            tracing::error!(error = %e, "failed to encode response");
                            continue;
                        }
                    };
                    if let Err(e) = sink.send(Bytes::from(payload)).await {
                        tracing::debug!(error = %e, "write failed");
                        break;
                    }
                }
                let _ = sink.close().await;
            }
            .in_current_span(),
        );

        let mut in_flight = JoinSet::new();
        let idle = sleep(settings.idle_timeout);
        tokio::pin!(idle);

        let result = loop {
            tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),

                _ = &mut idle, if in_flight.is_empty() => {
                    tracing::info!(idle_ms = self.last_activity.elapsed().as_millis() as u64, "closing idle connection");
                    break Err(ConnectionError::timeout("idle connection", settings.idle_timeout));
                }

                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            tracing::error!("dispatch task panicked");
                        }
                    }
                    self.touch(idle.as_mut(), settings.idle_timeout);
                    if in_flight.is_empty() {
                        if let Err(e) = self.transition(ConnectionState::Ready) {
                            break Err(e);
                        }
                    }
                }

                frame = frames.next(), if in_flight.len() < settings.max_in_flight => {
                    let frame = match frame {
                        Some(Ok(frame)) => frame,
                        Some(Err(e)) => break Err(ConnectionError::Io(e)),
                        None => break Ok(()),
                    };
                    self.touch(idle.as_mut(), settings.idle_timeout);

                    let request = match decode_payload::<Request>(&frame) {
                        Ok(request) => request,
                        Err(e) => {
                            tracing::debug!(error = %e, "malformed frame");
                            let _ = tx.send(Response::error("", RpcError::invalid_request(e.to_string()))).await;
                            continue;
                        }
                    };

                    if self.state == ConnectionState::Ready {
                        if let Err(e) = self.transition(ConnectionState::Dispatching) {
                            break Err(e);
                        }
                    }
                    let shared = Arc::clone(shared);
                    let tx = tx.clone();
                    in_flight.spawn(
                        async move {
                            let response = shared.dispatcher.dispatch(&shared.ctx, request).await;
                            let _ = tx.send(response).await;
                        }
                        .in_current_span(),
                    );
                }
            }
        };

        let _ = self.transition(ConnectionState::Closing);
        if !in_flight.is_empty() {
            tracing::debug!(aborted = in_flight.len(), "aborting in-flight requests");
        }
        in_flight.abort_all();
        drop(tx);
        if tokio::time::timeout(WRITER_DRAIN, &mut writer).await.is_err() {
            writer.abort();
        }
        result
    }

    fn touch(&mut self, idle: std::pin::Pin<&mut tokio::time::Sleep>, idle_timeout: Duration) {
        self.last_activity = Instant::now();
        idle.reset(self.last_activity + idle_timeout);
    }
}

async fn write_response<S>(framed: &mut FramedIo<S>, response: &Response) -> Result<(), ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let payload = serde_json::to_vec(response)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    framed.send(Bytes::from(payload)).await?;
    Ok(())
}

/// Best-effort AUTHENTICATION_FAILED reply.
async fn reject<S>(framed: &mut FramedIo<S>, id: String, limit: Duration)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let reply = Response::error(id, RpcError::authentication_failed());
    let _ = tokio::time::timeout(limit, write_response(framed, &reply)).await;
}

/// Run one accepted connection to completion.
pub(crate) async fn serve(stream: TcpStream, peer: SocketAddr, shared: Arc<Shared>, shutdown: CancellationToken) {
    let mut conn = Connection::new(peer, shared.acceptor.is_some());
    tracing::debug!(tls = conn.tls, "connection accepted");

    match conn.drive(stream, &shared, &shutdown).await {
        Ok(()) => tracing::debug!("connection closed"),
        Err(ConnectionError::AuthenticationFailed) => {
            tracing::warn!(peer = %conn.peer(), "authentication failed, closing connection")
        }
        Err(e @ ConnectionError::Handshake(_)) => tracing::info!(error = %e, "connection closed"),
        Err(e) => tracing::debug!(error = %e, "connection closed"),
    }
    conn.close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionState::*;

    #[test]
    fn test_happy_path_transitions() {
        let mut conn = Connection::new("127.0.0.1:1".parse().unwrap(), true);
        for next in [TlsHandshake, Authenticating, Ready, Dispatching, Ready, Closing, Closed] {
            conn.transition(next).unwrap();
        }
        assert_eq!(conn.state(), Closed);
    }

    #[test]
    fn test_cannot_skip_authentication() {
        assert!(!Accepted.can_transition_to(Ready));
        assert!(!TlsHandshake.can_transition_to(Dispatching));
        assert!(!Authenticating.can_transition_to(Dispatching));
    }

    #[test]
    fn test_closing_is_one_way() {
        assert!(Authenticating.can_transition_to(Closing));
        assert!(!Closing.can_transition_to(Ready));
        assert!(!Closed.can_transition_to(Closing));
        assert!(!Closing.can_transition_to(Closing));
    }

    #[test]
    fn test_close_from_any_open_state() {
        let mut conn = Connection::new("127.0.0.1:1".parse().unwrap(), false);
        conn.transition(Authenticating).unwrap();
        conn.close();
        assert_eq!(conn.state(), Closed);
    }

    #[test]
    fn test_authenticated_states() {
        assert!(Ready.is_authenticated());
        assert!(Dispatching.is_authenticated());
        assert!(!Authenticating.is_authenticated());
    }
}
