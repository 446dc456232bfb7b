//! WebSocket connection handler.
//!
//! One WebSocket connection carries exactly one session:
//!
//! 1. accept the upgrade and wait (bounded by the upload timeout) for a
//!    single binary message,
//! 2. hand the payload to [`run_session`],
//! 3. forward every event the session emits to the peer as it happens,
//! 4. close the socket.
//!
//! Each connection runs as its own task with its own [`Session`]; the only
//! state connections share is the read-only [`SessionConfig`].

use crate::config::{ServerConfig, SessionConfig};
use crate::convert::{run_session, Session, SessionState, TerminalOutcome};
use crate::error::{Phase, SessionError};
use crate::stream::{forward_events, PeerLiveness, PeerMonitor};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};
use tungstenite::error::CapacityError;
use uuid::Uuid;

/// Headroom above `max_upload_bytes` the WebSocket layer accepts, so that
/// slightly oversized uploads still reach validation and get a proper
/// `FATAL` frame instead of a protocol-level close.
const UPLOAD_FRAME_SLACK: usize = 1024 * 1024;

/// Build the router serving the conversion WebSocket on `route`.
///
/// Mount it into a larger application or serve it directly.
pub fn router(route: &str, config: Arc<SessionConfig>) -> Router {
    Router::new()
        .route(route, get(ws_upgrade_handler))
        .with_state(config)
}

async fn ws_upgrade_handler(
    ws: WebSocketUpgrade,
    State(config): State<Arc<SessionConfig>>,
) -> impl IntoResponse {
    let limit = config.max_upload_bytes.saturating_add(UPLOAD_FRAME_SLACK);
    ws.max_message_size(limit)
        .max_frame_size(limit)
        .on_upgrade(move |socket| handle_connection(socket, config))
}

/// Run one session over an accepted WebSocket.
pub async fn handle_connection(socket: WebSocket, config: Arc<SessionConfig>) {
    let id = Uuid::new_v4();
    let span = info_span!("session", %id);
    async move {
        info!("Client connected");
        let outcome = drive_connection(id, socket, &config).await;
        match &outcome {
            TerminalOutcome::Completed { bytes, chunks } => {
                info!("Delivered {} bytes in {} chunks", bytes, chunks)
            }
            TerminalOutcome::Failed(e) => info!("Session failed: {}", e),
            TerminalOutcome::Disconnected => info!("Client disconnected early"),
        }
    }
    .instrument(span)
    .await
}

async fn drive_connection(id: Uuid, socket: WebSocket, config: &SessionConfig) -> TerminalOutcome {
    let (mut ws_tx, ws_rx) = socket.split();
    let (monitor, liveness) = PeerLiveness::pair();
    let (events_tx, events_rx) = mpsc::channel(config.event_buffer);
    let mut session = Session::new(id, events_tx, liveness.clone());

    let driver = async move {
        let mut ws_rx = ws_rx;
        session.enter(SessionState::Receiving);
        let upload = receive_upload(&mut ws_rx, config.max_upload_bytes);
        let received = tokio::time::timeout(config.upload_timeout(), upload)
            .await
            .unwrap_or(Err(SessionError::Timeout {
                phase: Phase::Upload,
                secs: config.upload_timeout_secs,
            }));

        let payload = match received {
            Ok(payload) => payload,
            Err(e) => return (session.abort(e).await, None),
        };
        info!("Received upload: {} bytes", payload.len());

        let watcher = tokio::spawn(watch_for_close(ws_rx, monitor));
        let outcome = run_session(&mut session, &payload, config).await;
        (outcome, Some(watcher))
    };

    let forwarder = forward_events(events_rx, &mut ws_tx, &liveness);
    let ((outcome, watcher), frames) = tokio::join!(driver, forwarder);
    debug!("Forwarded {} frames", frames);

    if let Err(e) = ws_tx.close().await {
        debug!("Close handshake failed: {}", e);
    }
    if let Some(watcher) = watcher {
        watcher.abort();
    }
    outcome
}

/// Wait for the single binary upload.
///
/// Pings and pongs are skipped. A text message is not a valid upload. A
/// message over the socket's size limit is reported as too large; any other
/// close or broken socket means the peer left.
async fn receive_upload(
    ws_rx: &mut SplitStream<WebSocket>,
    max_upload_bytes: usize,
) -> Result<Vec<u8>, SessionError> {
    loop {
        match ws_rx.next().await {
            Some(Ok(Message::Binary(bytes))) => return Ok(bytes.to_vec()),
            Some(Ok(Message::Text(_))) => {
                return Err(SessionError::InvalidFormat {
                    detail: "expected a binary upload, got a text message".to_string(),
                })
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(Message::Close(_))) | None => return Err(SessionError::PeerDisconnected),
            Some(Err(e)) => {
                if let Some(size) = oversized_message(&e) {
                    return Err(SessionError::PayloadTooLarge {
                        size,
                        max: max_upload_bytes,
                    });
                }
                warn!("WebSocket error while receiving upload: {}", e);
                return Err(SessionError::PeerDisconnected);
            }
        }
    }
}

/// Announced size of a message the socket refused for exceeding its limit.
///
/// The socket stays writable after such an error, so the session can still
/// report it.
fn oversized_message(err: &axum::Error) -> Option<usize> {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = source {
        if let Some(ws) = e.downcast_ref::<tungstenite::Error>() {
            return match ws {
                tungstenite::Error::Capacity(CapacityError::MessageTooLong { size, .. }) => {
                    Some(*size)
                }
                _ => None,
            };
        }
        source = e.source();
    }
    None
}

/// Drain the socket after the upload, flagging the peer closed on close or
/// error. Anything else the peer sends is ignored.
async fn watch_for_close(mut ws_rx: SplitStream<WebSocket>, monitor: PeerMonitor) {
    loop {
        match ws_rx.next().await {
            Some(Ok(Message::Close(_))) | None => break,
            Some(Err(e)) => {
                debug!("WebSocket error after upload: {}", e);
                break;
            }
            Some(Ok(_)) => continue,
        }
    }
    monitor.mark_closed();
}

/// A running conversion server.
#[derive(Debug)]
pub struct ConversionServer {
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<std::io::Result<()>>>,
    addr: SocketAddr,
}

impl ConversionServer {
    /// Bind and start serving in a background task.
    pub async fn start(
        server: &ServerConfig,
        config: SessionConfig,
    ) -> Result<Self, std::io::Error> {
        let listener = tokio::net::TcpListener::bind(server.bind).await?;
        let addr = listener.local_addr()?;
        let app = router(&server.route, Arc::new(config));
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        info!("Conversion server listening on ws://{}{}", addr, server.route);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.await;
                })
                .await
        });

        Ok(Self {
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
            addr,
        })
    }

    /// Actual bound address (useful with port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Serve until `signal` resolves, then shut down gracefully.
    pub async fn run_until(mut self, signal: impl Future<Output = ()>) -> std::io::Result<()> {
        signal.await;
        self.stop().await
    }

    /// Stop accepting connections and wait for in-flight sessions.
    pub async fn stop(&mut self) -> std::io::Result<()> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        match self.handle.take() {
            Some(handle) => {
                let result = handle
                    .await
                    .map_err(|e| std::io::Error::other(format!("server task: {e}")))?;
                info!("Conversion server stopped");
                result
            }
            None => Ok(()),
        }
    }
}
