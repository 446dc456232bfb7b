//! Error types for the edgequake-pdf2md-ws library.
//!
//! Every failure a conversion session can hit is a [`SessionError`]. The
//! variants mirror the session's pipeline phases so the connection handler
//! can translate each one into exactly one `FATAL:` frame:
//!
//! * **Input** — the upload is too large, is not a PDF, or never arrived.
//! * **Process** — the converter could not be launched, exited non-zero,
//!   or ran past the processing deadline.
//! * **Workspace** — the scratch directory could not be created, written,
//!   or did not contain the expected output.
//!
//! Two variants are special. [`SessionError::PeerDisconnected`] is a clean
//! early termination: the peer is gone, so no frame is sent.
//! [`SessionError::WorkspaceCleanup`] is only ever logged; a failed
//! `rm -rf` must never mask the primary outcome of a session.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// The pipeline phase a deadline applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Waiting for the binary payload after the connection was accepted.
    Upload,
    /// Running the external converter.
    Conversion,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Upload => f.write_str("upload"),
            Phase::Conversion => f.write_str("conversion"),
        }
    }
}

/// All errors a conversion session can end with.
#[derive(Debug, Error)]
pub enum SessionError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// The upload exceeds the configured maximum size.
    #[error("Payload too large: {size} bytes (maximum is {max} bytes)")]
    PayloadTooLarge { size: usize, max: usize },

    /// The upload does not look like the expected input format.
    #[error("Invalid input format: {detail}")]
    InvalidFormat { detail: String },

    /// A phase ran past its wall-clock deadline.
    #[error("Timed out during {phase} after {secs}s")]
    Timeout { phase: Phase, secs: u64 },

    // ── Process errors ────────────────────────────────────────────────────
    /// The converter binary could not be spawned (missing, not executable).
    #[error("Failed to launch converter '{binary}': {source}")]
    Launch {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    /// The converter exited with a non-zero status.
    #[error("Converter failed with {}\n{output}", exit_description(.code))]
    Conversion { code: Option<i32>, output: String },

    /// The converter exited cleanly but produced no output file.
    #[error("Converted file was not created at '{}'", .path.display())]
    ArtifactMissing { path: PathBuf },

    // ── Workspace errors ──────────────────────────────────────────────────
    /// The workspace could not be created or written.
    #[error("Workspace I/O failed ({context}): {source}")]
    Workspace {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// Removing the workspace failed. Logged, never sent to the peer.
    #[error("Failed to clean up workspace '{}': {source}", .path.display())]
    WorkspaceCleanup {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Connection ────────────────────────────────────────────────────────
    /// The peer went away. Ends the session without a frame.
    #[error("Peer disconnected")]
    PeerDisconnected,

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

fn exit_description(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {code}"),
        None => "termination by signal".to_string(),
    }
}

impl SessionError {
    /// `true` when the session ended because the peer went away.
    pub fn is_peer_disconnect(&self) -> bool {
        matches!(self, SessionError::PeerDisconnected)
    }

    /// Text for the `FATAL:` frame, or `None` when no frame must be sent.
    pub fn fatal_detail(&self) -> Option<String> {
        match self {
            SessionError::PeerDisconnected => None,
            other => Some(other.to_string()),
        }
    }
}
