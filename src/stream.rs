//! Streaming delivery: event forwarding, peer liveness, artifact chunking.
//!
//! ## One ordered path to the peer
//!
//! Every frame a session produces, from the first `PROGRESS: 5` to the
//! final `MARKDOWN_CONTENT_END`, travels through the session's single
//! bounded `mpsc` channel and is written by [`forward_events`]. Nothing
//! else writes to the socket while a session runs, so frames reach the peer
//! in exactly the order the orchestrator emitted them.
//!
//! ## Liveness
//!
//! Once the upload has arrived, the connection handler keeps reading the
//! socket only to notice a close; [`PeerMonitor::mark_closed`] flips the
//! shared flag that [`PeerLiveness`] exposes. The forwarder stops as soon as
//! the flag flips, and the session checks it before every emit, so a
//! departed peer ends transmission early without an error frame.

use crate::config::SessionConfig;
use crate::convert::{Artifact, Session, SessionState};
use crate::error::SessionError;
use crate::protocol::SessionEvent;
use axum::extract::ws::Message;
use futures::{Sink, SinkExt};
use tokio::sync::{mpsc, watch};
use tracing::debug;

/// Characters of the artifact echoed in the pre-delivery log line.
const PREVIEW_CHARS: usize = 100;

/// Write side of a peer's liveness flag.
#[derive(Debug)]
pub struct PeerMonitor {
    tx: watch::Sender<bool>,
}

impl PeerMonitor {
    /// Record that the peer has gone away. Idempotent.
    pub fn mark_closed(&self) {
        self.tx.send_replace(true);
    }
}

/// Read side of a peer's liveness flag.
///
/// Dropping the [`PeerMonitor`] without marking the peer closed leaves the
/// peer considered connected.
#[derive(Debug, Clone)]
pub struct PeerLiveness {
    rx: watch::Receiver<bool>,
}

impl PeerLiveness {
    pub fn pair() -> (PeerMonitor, PeerLiveness) {
        let (tx, rx) = watch::channel(false);
        (PeerMonitor { tx }, PeerLiveness { rx })
    }

    pub fn is_connected(&self) -> bool {
        !*self.rx.borrow()
    }

    /// Resolves once the peer is marked closed.
    pub async fn closed(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|closed| *closed).await.is_err() {
            // Monitor dropped without a close: the peer never goes away.
            std::future::pending::<()>().await;
        }
    }
}

/// Write queued session events to the peer as text frames.
///
/// Returns the number of frames written. Stops after a terminal frame
/// (`FATAL` or `MARKDOWN_CONTENT_END`), when the session drops its sender,
/// when the peer is marked closed, or when a write fails. Dropping
/// `events` on return makes the session's next emit fail with
/// [`SessionError::PeerDisconnected`].
pub async fn forward_events<S>(
    mut events: mpsc::Receiver<SessionEvent>,
    sink: &mut S,
    liveness: &PeerLiveness,
) -> usize
where
    S: Sink<Message> + Unpin,
{
    let mut sent = 0;
    loop {
        let event = tokio::select! {
            biased;
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
            _ = liveness.closed() => break,
        };

        if !liveness.is_connected() {
            break;
        }
        let terminal = event.is_terminal();
        if sink.send(Message::Text(event.encode().into())).await.is_err() {
            debug!("Peer write failed after {} frames", sent);
            break;
        }
        sent += 1;
        if terminal {
            break;
        }
    }
    sent
}

/// Split `text` into chunks of at most `size` bytes, cut on UTF-8 boundaries.
///
/// Concatenating the chunks in order reproduces `text` exactly. Empty text
/// yields no chunks.
pub fn chunk_artifact(text: &str, size: usize) -> Vec<&str> {
    let size = size.max(4);
    let mut chunks = Vec::with_capacity(text.len() / size + 1);
    let mut rest = text;
    while !rest.is_empty() {
        let mut end = size.min(rest.len());
        while !rest.is_char_boundary(end) {
            end -= 1;
        }
        let (chunk, tail) = rest.split_at(end);
        chunks.push(chunk);
        rest = tail;
    }
    chunks
}

/// Announce the artifact and transmit it in paced, indexed chunks.
///
/// Emits `LOG` (size and preview), `DONE`, `MARKDOWN_CONTENT_START`, every
/// `CHUNK`, then `MARKDOWN_CONTENT_END`. Returns the number of chunks sent.
/// Stops with [`SessionError::PeerDisconnected`] as soon as the peer is gone.
pub async fn deliver_artifact(
    session: &mut Session,
    artifact: &Artifact,
    config: &SessionConfig,
) -> Result<usize, SessionError> {
    session
        .log(format!(
            "Received markdown content: {} characters",
            artifact.char_count()
        ))
        .await?;
    session
        .log(format!(
            "First {} chars: {}...",
            PREVIEW_CHARS,
            artifact.preview(PREVIEW_CHARS)
        ))
        .await?;
    session
        .emit(SessionEvent::Done("Parsing completed.".to_string()))
        .await?;

    tokio::time::sleep(config.content_start_delay()).await;

    session.enter(SessionState::Transmitting);
    session.emit(SessionEvent::ContentStart).await?;

    let chunks = chunk_artifact(artifact.as_str(), config.chunk_size);
    let total = chunks.len();
    for (i, data) in chunks.into_iter().enumerate() {
        if !session.liveness().is_connected() {
            debug!("Session {}: peer gone at chunk {}/{}", session.id(), i + 1, total);
            return Err(SessionError::PeerDisconnected);
        }
        session
            .emit(SessionEvent::Chunk {
                index: i + 1,
                total,
                data: data.to_string(),
            })
            .await?;
        if i + 1 < total {
            tokio::time::sleep(config.chunk_delay()).await;
        }
    }

    session.emit(SessionEvent::ContentEnd).await?;
    Ok(total)
}
