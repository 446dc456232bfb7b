//! Per-session scratch directories.
//!
//! Each session gets a freshly named directory under the temp root holding
//! exactly one input file and, once the converter succeeds, one output file.
//! The directory is a `tempfile::TempDir`, so even a panicking session
//! removes it on drop. The orchestrator still calls [`Workspace::release`]
//! explicitly on every exit path: unlike drop, `release` reports cleanup
//! failures through `tracing` instead of swallowing them.

use crate::error::SessionError;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, warn};
use uuid::Uuid;

/// Exclusively owned scratch directory for one session.
#[derive(Debug)]
pub struct Workspace {
    dir: Option<TempDir>,
    path: PathBuf,
    input_name: String,
    output_name: String,
}

impl Workspace {
    /// Create a uniquely named directory under `root`.
    ///
    /// The directory name embeds the session id followed by a random
    /// suffix, so two sessions can never collide even with equal ids.
    pub fn acquire(
        root: &Path,
        session_id: Uuid,
        input_extension: &str,
        output_extension: &str,
    ) -> Result<Self, SessionError> {
        let dir = tempfile::Builder::new()
            .prefix(&format!("pdf2md_{}_", session_id.simple()))
            .tempdir_in(root)
            .map_err(|source| SessionError::Workspace {
                context: format!("create workspace under '{}'", root.display()),
                source,
            })?;
        let path = dir.path().to_path_buf();
        debug!("Acquired workspace {}", path.display());

        Ok(Self {
            dir: Some(dir),
            path,
            input_name: format!("input.{input_extension}"),
            output_name: format!("input.{output_extension}"),
        })
    }

    /// Directory the converter runs in.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File name of the saved upload, relative to [`Self::path`].
    pub fn input_name(&self) -> &str {
        &self.input_name
    }

    /// Path the converter is expected to write its result to.
    pub fn output_path(&self) -> PathBuf {
        self.path.join(&self.output_name)
    }

    /// Persist the upload as the workspace's single input file.
    pub async fn write_input(&self, bytes: &[u8]) -> Result<(), SessionError> {
        let path = self.path.join(&self.input_name);
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|source| SessionError::Workspace {
                context: format!("write '{}'", path.display()),
                source,
            })?;
        debug!("Saved {} bytes to {}", bytes.len(), path.display());
        Ok(())
    }

    /// Read the converter's output file.
    ///
    /// A missing file means the converter exited cleanly without producing
    /// anything; that is reported as [`SessionError::ArtifactMissing`].
    pub async fn read_output(&self) -> Result<String, SessionError> {
        let path = self.output_path();
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SessionError::ArtifactMissing { path });
            }
            Err(source) => {
                return Err(SessionError::Workspace {
                    context: format!("read '{}'", path.display()),
                    source,
                });
            }
        };

        match String::from_utf8(bytes) {
            Ok(text) => Ok(text),
            Err(e) => {
                warn!(
                    "Output {} is not valid UTF-8; replacing invalid sequences",
                    path.display()
                );
                Ok(String::from_utf8_lossy(e.as_bytes()).into_owned())
            }
        }
    }

    /// Recursively remove the workspace.
    ///
    /// Returns `true` if this call removed the directory. Later calls are
    /// no-ops returning `false`. Failures are logged and never propagated.
    pub fn release(&mut self) -> bool {
        let Some(dir) = self.dir.take() else {
            return false;
        };
        match dir.close() {
            Ok(()) => {
                debug!("Released workspace {}", self.path.display());
                true
            }
            Err(source) => {
                let err = SessionError::WorkspaceCleanup {
                    path: self.path.clone(),
                    source,
                };
                warn!("{err}");
                true
            }
        }
    }
}
