//! # edgequake-pdf2md-ws
//!
//! Convert PDF documents to Markdown over a WebSocket, with live progress.
//!
//! ## Why this crate?
//!
//! Document converters such as `docling` are slow, chatty command-line
//! programs. Running them behind a plain HTTP request leaves the caller
//! staring at a spinner for minutes. This crate wraps the converter in a
//! WebSocket session instead: the client uploads one PDF, then watches
//! `PROGRESS`/`LOG` frames while the converter works, and finally receives
//! the Markdown in ordered, indexed chunks.
//!
//! ## Session Overview
//!
//! ```text
//! client ── binary PDF ──▶ server
//!  │
//!  ├─ 1. Receive   one binary message, bounded by the upload timeout
//!  ├─ 2. Validate  size limit + `%PDF` magic bytes
//!  ├─ 3. Stage     write `input.pdf` into a fresh temp workspace
//!  ├─ 4. Convert   run `docling input.pdf --to md`, stream its output
//!  ├─ 5. Read      load `input.md` from the workspace
//!  ├─ 6. Deliver   DONE, MARKDOWN_CONTENT_START, CHUNK:i:n:…, MARKDOWN_CONTENT_END
//!  └─ 7. Cleanup   workspace removed on every path, success or not
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_pdf2md_ws::{ConversionServer, ServerConfig, SessionConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let session = SessionConfig::builder()
//!         .converter_binary("docling")
//!         .processing_timeout_secs(600)
//!         .build()?;
//!     let server = ConversionServer::start(&ServerConfig::default(), session).await?;
//!     eprintln!("listening on port {}", server.port());
//!     server
//!         .run_until(async {
//!             let _ = tokio::signal::ctrl_c().await;
//!         })
//!         .await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Wire Protocol
//!
//! See [`protocol`] for the frame table. Every session ends with exactly one
//! of `FATAL: …`, `MARKDOWN_CONTENT_END`, or a silent close when the client
//! left first.
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `pdf2md-ws` binary (clap + anyhow + tracing-subscriber) |
//!
//! Disable `cli` when embedding the router in another axum application:
//! ```toml
//! edgequake-pdf2md-ws = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod convert;
pub mod error;
pub mod pipeline;
pub mod progress;
pub mod protocol;
pub mod server;
pub mod stream;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{ServerConfig, SessionConfig, SessionConfigBuilder};
pub use convert::{convert, run_session, Artifact, Session, SessionState, TerminalOutcome};
pub use error::{Phase, SessionError};
pub use protocol::SessionEvent;
pub use server::{handle_connection, router, ConversionServer};
pub use stream::{chunk_artifact, deliver_artifact, forward_events, PeerLiveness, PeerMonitor};
