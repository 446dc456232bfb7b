//! Pipeline stages for one conversion session.
//!
//! Each submodule owns exactly one concern of turning an uploaded payload
//! into a Markdown artifact, so each can be tested without a socket.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ workspace ──▶ process ──▶ workspace
//! (validate) (write upload) (run converter) (read artifact, release)
//! ```
//!
//! 1. [`input`]     — size and magic-byte checks on the raw upload, plus a
//!    cheap page-count hint for progress estimation
//! 2. [`workspace`] — the per-session scratch directory; removed on every
//!    exit path
//! 3. [`process`]   — launch the external converter, stream its output
//!    line by line, wait for or kill it

pub mod input;
pub mod process;
pub mod workspace;
