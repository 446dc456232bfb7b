//! Conversion orchestration for one session.
//!
//! A session walks a fixed state machine:
//!
//! ```text
//! Idle → Receiving → Validating → Saving → Converting → Reading → Transmitting → Done
//!   └──────────┴───────────┴──────────┴──────────┴──────────┴────────────┴──→ Aborted
//! ```
//!
//! [`Session`] owns the per-session state (id, current state, last progress
//! value, event channel) and nothing else; sessions share no mutable state,
//! so no locks are involved. [`run_session`] drives a received payload from
//! `Validating` to a [`TerminalOutcome`]. The workspace is acquired after
//! validation and released exactly once on every path out of [`convert`].
//!
//! Progress bands owned by the orchestrator:
//!
//! | Band | Phase |
//! |------|-------|
//! | 5–10 | saving the upload |
//! | 15–20 | preparing and launching the converter |
//! | 20–85 | converter output ([`crate::progress::ProgressEstimator`]) |
//! | 90–95 | converter exit, reading the artifact |
//! | 100 | artifact ready |

use crate::config::SessionConfig;
use crate::error::{Phase, SessionError};
use crate::pipeline::input::{estimate_page_count, validate_payload};
use crate::pipeline::process::ConverterCommand;
use crate::pipeline::workspace::Workspace;
use crate::progress::ProgressEstimator;
use crate::protocol::SessionEvent;
use crate::stream::{deliver_artifact, PeerLiveness};
use std::collections::VecDeque;
use std::fmt;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Converter output lines kept for the `ConversionError` detail.
const OUTPUT_TAIL_LINES: usize = 20;

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Receiving,
    Validating,
    Saving,
    Converting,
    Reading,
    Transmitting,
    Done,
    Aborted,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Done | SessionState::Aborted)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Receiving => "receiving",
            SessionState::Validating => "validating",
            SessionState::Saving => "saving",
            SessionState::Converting => "converting",
            SessionState::Reading => "reading",
            SessionState::Transmitting => "transmitting",
            SessionState::Done => "done",
            SessionState::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// How a session ended. Exactly one per session.
#[derive(Debug)]
pub enum TerminalOutcome {
    /// The artifact was delivered in `chunks` chunks.
    Completed { bytes: usize, chunks: usize },
    /// The session failed; a `FATAL:` frame was sent.
    Failed(SessionError),
    /// The peer went away; nothing more was sent.
    Disconnected,
}

/// The converted document, immutable once read from the workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    markdown: String,
}

impl Artifact {
    pub fn new(markdown: impl Into<String>) -> Self {
        Self {
            markdown: markdown.into(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.markdown
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.markdown.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markdown.is_empty()
    }

    /// Number of characters.
    pub fn char_count(&self) -> usize {
        self.markdown.chars().count()
    }

    /// The first `n` characters.
    pub fn preview(&self, n: usize) -> &str {
        match self.markdown.char_indices().nth(n) {
            Some((end, _)) => &self.markdown[..end],
            None => &self.markdown,
        }
    }

    pub fn into_string(self) -> String {
        self.markdown
    }
}

/// Per-session state and the outbound half of its event channel.
#[derive(Debug)]
pub struct Session {
    id: Uuid,
    state: SessionState,
    last_progress: Option<u8>,
    events: mpsc::Sender<SessionEvent>,
    liveness: PeerLiveness,
}

impl Session {
    pub fn new(id: Uuid, events: mpsc::Sender<SessionEvent>, liveness: PeerLiveness) -> Self {
        Self {
            id,
            state: SessionState::Idle,
            last_progress: None,
            events,
            liveness,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Last progress value sent, if any.
    pub fn progress(&self) -> Option<u8> {
        self.last_progress
    }

    pub fn liveness(&self) -> &PeerLiveness {
        &self.liveness
    }

    /// Move to `next`. Terminal states are sticky.
    pub fn enter(&mut self, next: SessionState) {
        if self.state.is_terminal() {
            return;
        }
        debug!("Session {}: {} → {}", self.id, self.state, next);
        self.state = next;
    }

    /// Queue an event for the peer.
    ///
    /// Fails with [`SessionError::PeerDisconnected`] once the peer is gone
    /// or the forwarding side has stopped.
    pub async fn emit(&mut self, event: SessionEvent) -> Result<(), SessionError> {
        if !self.liveness.is_connected() {
            return Err(SessionError::PeerDisconnected);
        }
        self.events
            .send(event)
            .await
            .map_err(|_| SessionError::PeerDisconnected)
    }

    /// Emit `PROGRESS`, suppressing anything not above the last value sent.
    pub async fn report_progress(&mut self, percent: u8) -> Result<(), SessionError> {
        let percent = percent.min(100);
        if self.last_progress.is_some_and(|last| percent <= last) {
            return Ok(());
        }
        self.last_progress = Some(percent);
        self.emit(SessionEvent::Progress(percent)).await
    }

    pub async fn log(&mut self, text: impl Into<String>) -> Result<(), SessionError> {
        self.emit(SessionEvent::log(text)).await
    }

    /// Enter `Aborted`, telling the peer why unless the peer is the reason.
    pub async fn abort(&mut self, error: SessionError) -> TerminalOutcome {
        let from = self.state;
        self.enter(SessionState::Aborted);
        match error.fatal_detail() {
            None => {
                info!("Session {} ended: peer disconnected during {}", self.id, from);
                TerminalOutcome::Disconnected
            }
            Some(detail) => {
                warn!("Session {} failed during {}: {}", self.id, from, error);
                if self.emit(SessionEvent::Fatal(detail)).await.is_err() {
                    debug!("Session {}: peer gone before FATAL could be sent", self.id);
                }
                TerminalOutcome::Failed(error)
            }
        }
    }
}

/// Drive a received payload to its terminal outcome.
///
/// On success the artifact is delivered (`DONE`, chunks,
/// `MARKDOWN_CONTENT_END`); on failure a single `FATAL` frame is emitted
/// unless the peer has disconnected.
pub async fn run_session(
    session: &mut Session,
    payload: &[u8],
    config: &SessionConfig,
) -> TerminalOutcome {
    let artifact = match convert(session, payload, config).await {
        Ok(artifact) => artifact,
        Err(e) => return session.abort(e).await,
    };

    match deliver_artifact(session, &artifact, config).await {
        Ok(chunks) => {
            session.enter(SessionState::Done);
            info!(
                "Session {} completed: {} bytes in {} chunks",
                session.id(),
                artifact.len(),
                chunks
            );
            TerminalOutcome::Completed {
                bytes: artifact.len(),
                chunks,
            }
        }
        Err(e) => session.abort(e).await,
    }
}

/// Validate the payload, run the converter in a fresh workspace, and read
/// back the artifact. Ends at progress 100 on success.
pub async fn convert(
    session: &mut Session,
    payload: &[u8],
    config: &SessionConfig,
) -> Result<Artifact, SessionError> {
    session.enter(SessionState::Validating);
    validate_payload(payload, config)?;

    let mut workspace = Workspace::acquire(
        &config.temp_root(),
        session.id(),
        &config.input_extension,
        &config.target_format,
    )?;

    let result = convert_in_workspace(session, &workspace, payload, config).await;

    if workspace.release() {
        debug!("Session {}: workspace released", session.id());
    }
    result
}

async fn convert_in_workspace(
    session: &mut Session,
    workspace: &Workspace,
    payload: &[u8],
    config: &SessionConfig,
) -> Result<Artifact, SessionError> {
    // ── Saving ───────────────────────────────────────────────────────────
    session.enter(SessionState::Saving);
    session.report_progress(5).await?;
    session.log("Saving PDF file...").await?;
    workspace.write_input(payload).await?;
    session.report_progress(10).await?;

    // ── Launch ───────────────────────────────────────────────────────────
    session.log("Preparing converter command...").await?;
    let command = ConverterCommand::for_workspace(config, workspace);
    session
        .log(format!("Command: {}", command.display()))
        .await?;
    session.report_progress(15).await?;

    session.enter(SessionState::Converting);
    session.log("Starting PDF processing...").await?;
    session.report_progress(20).await?;

    let total_pages = config
        .page_marker_regex()
        .and_then(|_| estimate_page_count(payload));
    let mut estimator = ProgressEstimator::new(
        total_pages,
        config.page_marker_regex(),
        config.estimated_output_lines,
    );
    debug!(
        "Session {}: progress heuristic {:?}",
        session.id(),
        estimator.heuristic()
    );

    let (mut running, mut lines) = command.spawn(config.event_buffer)?;
    let pid = running.id();
    session
        .log(format!("Processing document with {}...", command.program()))
        .await?;

    // ── Converting ───────────────────────────────────────────────────────
    let mut tail: VecDeque<String> = VecDeque::with_capacity(OUTPUT_TAIL_LINES);
    let liveness = session.liveness().clone();
    let work = async {
        while let Some(line) = lines.next().await {
            if let Some(percent) = estimator.observe(&line) {
                session.report_progress(percent).await?;
            }
            session.log(line.as_str()).await?;

            if tail.len() == OUTPUT_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }
        running.wait().await
    };
    // A silent converter must not outlive its peer.
    let outcome = tokio::time::timeout(config.processing_timeout(), async {
        tokio::select! {
            result = work => result,
            _ = liveness.closed() => Err(SessionError::PeerDisconnected),
        }
    })
    .await;

    let status = match outcome {
        Ok(Ok(status)) => {
            debug!(
                "Session {}: converter pid {:?} exited with {} (estimate reached {}%)",
                session.id(),
                pid,
                status,
                estimator.last_emitted()
            );
            status
        }
        Ok(Err(e)) => {
            running.kill();
            return Err(e);
        }
        Err(_) => {
            running.kill();
            return Err(SessionError::Timeout {
                phase: Phase::Conversion,
                secs: config.processing_timeout_secs,
            });
        }
    };

    if !status.success() {
        return Err(SessionError::Conversion {
            code: status.code(),
            output: Vec::from(tail).join("\n"),
        });
    }

    // ── Reading ──────────────────────────────────────────────────────────
    session.enter(SessionState::Reading);
    session.report_progress(90).await?;
    session
        .log(format!("{} processing completed", command.program()))
        .await?;
    session.log("Reading converted markdown file...").await?;
    session.report_progress(95).await?;

    let markdown = workspace.read_output().await?;
    session.report_progress(100).await?;

    Ok(Artifact::new(markdown))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(buffer: usize) -> (Session, mpsc::Receiver<SessionEvent>) {
        let (tx, rx) = mpsc::channel(buffer);
        let (_, liveness) = PeerLiveness::pair();
        (Session::new(Uuid::new_v4(), tx, liveness), rx)
    }

    #[test]
    fn artifact_preview_is_char_safe() {
        let a = Artifact::new("héllo wörld");
        assert_eq!(a.preview(4), "héll");
        assert_eq!(a.preview(100), "héllo wörld");
        assert_eq!(a.char_count(), 11);
        assert_eq!(a.len(), 13);
    }

    #[tokio::test]
    async fn progress_is_monotonic() {
        let (mut s, mut rx) = session(16);
        s.report_progress(10).await.unwrap();
        s.report_progress(5).await.unwrap();
        s.report_progress(10).await.unwrap();
        s.report_progress(20).await.unwrap();
        drop(s);

        let mut seen = Vec::new();
        while let Some(ev) = rx.recv().await {
            seen.push(ev);
        }
        assert_eq!(
            seen,
            vec![SessionEvent::Progress(10), SessionEvent::Progress(20)]
        );
    }

    #[tokio::test]
    async fn emit_fails_once_receiver_is_gone() {
        let (mut s, rx) = session(1);
        drop(rx);
        let err = s.log("anyone there?").await.unwrap_err();
        assert!(err.is_peer_disconnect());
    }

    #[tokio::test]
    async fn terminal_state_is_sticky() {
        let (mut s, _rx) = session(4);
        s.enter(SessionState::Converting);
        let outcome = s
            .abort(SessionError::Internal("test".into()))
            .await;
        assert!(matches!(outcome, TerminalOutcome::Failed(_)));
        s.enter(SessionState::Done);
        assert_eq!(s.state(), SessionState::Aborted);
    }

    #[tokio::test]
    async fn abort_sends_fatal_except_on_disconnect() {
        let (mut s, mut rx) = session(4);
        s.abort(SessionError::InvalidFormat {
            detail: "bad".into(),
        })
        .await;
        assert!(matches!(rx.recv().await, Some(SessionEvent::Fatal(_))));

        let (mut s, mut rx) = session(4);
        let outcome = s.abort(SessionError::PeerDisconnected).await;
        assert!(matches!(outcome, TerminalOutcome::Disconnected));
        drop(s);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn invalid_payload_never_creates_workspace() {
        let root = tempfile::tempdir().unwrap();
        let config = SessionConfig::builder()
            .temp_root(root.path())
            .build()
            .unwrap();
        let (mut s, _rx) = session(16);

        let err = convert(&mut s, &[b'x'; 40], &config).await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidFormat { .. }));
        assert_eq!(s.state(), SessionState::Validating);
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn oversized_payload_rejected_before_workspace() {
        let root = tempfile::tempdir().unwrap();
        let config = SessionConfig::builder()
            .temp_root(root.path())
            .max_upload_bytes(8)
            .build()
            .unwrap();
        let (mut s, _rx) = session(16);

        let err = convert(&mut s, b"%PDF-1.7 too long", &config)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::PayloadTooLarge { .. }));
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn launch_failure_releases_workspace() {
        let root = tempfile::tempdir().unwrap();
        let config = SessionConfig::builder()
            .temp_root(root.path())
            .converter_binary("definitely-not-a-real-converter-binary")
            .build()
            .unwrap();
        let (mut s, _rx) = session(64);

        let err = convert(&mut s, b"%PDF-1.7", &config).await.unwrap_err();
        assert!(matches!(err, SessionError::Launch { .. }));
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }
}
