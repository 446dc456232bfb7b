//! Configuration types for WebSocket conversion sessions.
//!
//! Every knob a session reads lives in [`SessionConfig`], built once at
//! process start via its [`SessionConfigBuilder`] and shared read-only by all
//! sessions. Core logic never looks at the environment; the binary maps
//! environment variables and flags onto the builder.
//!
//! [`ServerConfig`] holds the listener settings that only the connection
//! layer cares about.

use crate::error::SessionError;
use regex::Regex;
use serde::Serialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Smallest accepted artifact chunk, in bytes.
///
/// A chunk must be able to hold any UTF-8 scalar (4 bytes) so chunking
/// always makes progress; 16 keeps frame overhead sane.
pub const MIN_CHUNK_SIZE: usize = 16;

/// Configuration for a conversion session.
///
/// Built via [`SessionConfig::builder()`] or using
/// [`SessionConfig::default()`].
///
/// # Example
/// ```rust
/// use edgequake_pdf2md_ws::SessionConfig;
///
/// let config = SessionConfig::builder()
///     .converter_binary("docling")
///     .max_upload_bytes(10 * 1024 * 1024)
///     .chunk_size(8192)
///     .build()
///     .unwrap();
/// assert_eq!(config.chunk_size, 8192);
/// ```
#[derive(Debug, Clone, Serialize)]
pub struct SessionConfig {
    /// External converter executable, resolved through `PATH`. Default: `docling`.
    pub converter_binary: String,

    /// Value passed to the converter's `--to` flag. Default: `md`.
    ///
    /// Also used as the extension of the expected output file.
    pub target_format: String,

    /// Extension given to the saved upload. Default: `pdf`.
    pub input_extension: String,

    /// Magic bytes every upload must start with. Default: `%PDF`.
    pub input_magic: Vec<u8>,

    /// Pass `-vv` to the converter. Default: false.
    ///
    /// Verbose converters print one line per processed page, which gives
    /// the progress heuristics far more signal to work with.
    pub verbose_converter: bool,

    /// Largest accepted upload in bytes. Default: 50 MiB.
    pub max_upload_bytes: usize,

    /// Deadline for the binary upload to arrive, in seconds. Default: 60.
    pub upload_timeout_secs: u64,

    /// Deadline for the converter to exit, in seconds. Default: 300.
    pub processing_timeout_secs: u64,

    /// Artifact chunk size in bytes. Default: 4096.
    ///
    /// Chunks are cut on UTF-8 boundaries, so a chunk may be up to three
    /// bytes shorter than this.
    pub chunk_size: usize,

    /// Pause between artifact chunks, in milliseconds. Default: 50.
    pub chunk_delay_ms: u64,

    /// Pause between `DONE` and `MARKDOWN_CONTENT_START`, in milliseconds. Default: 200.
    pub content_start_delay_ms: u64,

    /// Directory that session workspaces are created under.
    /// If None, uses the platform temp directory.
    pub temp_root: Option<PathBuf>,

    /// Expected number of converter output lines for the line-based
    /// progress heuristic. Default: 50.
    pub estimated_output_lines: usize,

    /// Regex matching a "page completed" line in converter output.
    ///
    /// Page-based progress is used only when this is set and the upload's
    /// page count can be estimated; otherwise every output line advances
    /// the line-based heuristic.
    pub page_marker: Option<String>,

    #[serde(skip)]
    page_marker_regex: Option<Regex>,

    /// Capacity of the per-session event channel. Default: 256.
    pub event_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            converter_binary: "docling".to_string(),
            target_format: "md".to_string(),
            input_extension: "pdf".to_string(),
            input_magic: b"%PDF".to_vec(),
            verbose_converter: false,
            max_upload_bytes: 50 * 1024 * 1024,
            upload_timeout_secs: 60,
            processing_timeout_secs: 300,
            chunk_size: 4096,
            chunk_delay_ms: 50,
            content_start_delay_ms: 200,
            temp_root: None,
            estimated_output_lines: 50,
            page_marker: None,
            page_marker_regex: None,
            event_buffer: 256,
        }
    }
}

impl SessionConfig {
    /// Create a new builder for `SessionConfig`.
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder {
            config: Self::default(),
        }
    }

    /// Root directory for session workspaces.
    pub fn temp_root(&self) -> PathBuf {
        self.temp_root.clone().unwrap_or_else(std::env::temp_dir)
    }

    /// Compiled page-completion marker, if one is configured.
    pub fn page_marker_regex(&self) -> Option<&Regex> {
        self.page_marker_regex.as_ref()
    }

    pub fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.upload_timeout_secs)
    }

    pub fn processing_timeout(&self) -> Duration {
        Duration::from_secs(self.processing_timeout_secs)
    }

    pub fn chunk_delay(&self) -> Duration {
        Duration::from_millis(self.chunk_delay_ms)
    }

    pub fn content_start_delay(&self) -> Duration {
        Duration::from_millis(self.content_start_delay_ms)
    }
}

/// Builder for [`SessionConfig`].
#[derive(Debug)]
pub struct SessionConfigBuilder {
    config: SessionConfig,
}

impl SessionConfigBuilder {
    pub fn converter_binary(mut self, binary: impl Into<String>) -> Self {
        self.config.converter_binary = binary.into();
        self
    }

    pub fn target_format(mut self, format: impl Into<String>) -> Self {
        self.config.target_format = format.into();
        self
    }

    pub fn input_extension(mut self, ext: impl Into<String>) -> Self {
        self.config.input_extension = ext.into();
        self
    }

    pub fn input_magic(mut self, magic: impl Into<Vec<u8>>) -> Self {
        self.config.input_magic = magic.into();
        self
    }

    pub fn verbose_converter(mut self, v: bool) -> Self {
        self.config.verbose_converter = v;
        self
    }

    pub fn max_upload_bytes(mut self, n: usize) -> Self {
        self.config.max_upload_bytes = n;
        self
    }

    pub fn upload_timeout_secs(mut self, secs: u64) -> Self {
        self.config.upload_timeout_secs = secs;
        self
    }

    pub fn processing_timeout_secs(mut self, secs: u64) -> Self {
        self.config.processing_timeout_secs = secs;
        self
    }

    pub fn chunk_size(mut self, n: usize) -> Self {
        self.config.chunk_size = n.max(MIN_CHUNK_SIZE);
        self
    }

    pub fn chunk_delay_ms(mut self, ms: u64) -> Self {
        self.config.chunk_delay_ms = ms;
        self
    }

    pub fn content_start_delay_ms(mut self, ms: u64) -> Self {
        self.config.content_start_delay_ms = ms;
        self
    }

    pub fn temp_root(mut self, dir: impl AsRef<Path>) -> Self {
        self.config.temp_root = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn estimated_output_lines(mut self, n: usize) -> Self {
        self.config.estimated_output_lines = n.max(1);
        self
    }

    pub fn page_marker(mut self, pattern: impl Into<String>) -> Self {
        self.config.page_marker = Some(pattern.into());
        self
    }

    pub fn event_buffer(mut self, n: usize) -> Self {
        self.config.event_buffer = n.max(1);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(mut self) -> Result<SessionConfig, SessionError> {
        let c = &self.config;
        if c.converter_binary.trim().is_empty() {
            return Err(SessionError::InvalidConfig(
                "Converter binary must not be empty".into(),
            ));
        }
        if c.target_format.trim().is_empty() {
            return Err(SessionError::InvalidConfig(
                "Target format must not be empty".into(),
            ));
        }
        if c.max_upload_bytes == 0 {
            return Err(SessionError::InvalidConfig(
                "Maximum upload size must be ≥ 1 byte".into(),
            ));
        }
        if c.upload_timeout_secs == 0 || c.processing_timeout_secs == 0 {
            return Err(SessionError::InvalidConfig(
                "Timeouts must be ≥ 1 second".into(),
            ));
        }
        if c.chunk_size < MIN_CHUNK_SIZE {
            return Err(SessionError::InvalidConfig(format!(
                "Chunk size must be ≥ {MIN_CHUNK_SIZE} bytes, got {}",
                c.chunk_size
            )));
        }

        self.config.page_marker_regex = match self.config.page_marker.as_deref() {
            Some(pattern) => Some(Regex::new(pattern).map_err(|e| {
                SessionError::InvalidConfig(format!("Invalid page marker '{pattern}': {e}"))
            })?),
            None => None,
        };

        Ok(self.config)
    }
}

/// Listener settings for the WebSocket server.
#[derive(Debug, Clone, Serialize)]
pub struct ServerConfig {
    /// Socket address to bind. Default: `0.0.0.0:8000`.
    pub bind: SocketAddr,
    /// Route the conversion WebSocket is served on. Default: `/ws/parse-pdf`.
    pub route: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 8000)),
            route: "/ws/parse-pdf".to_string(),
        }
    }
}
