//! CLI binary for edgequake-pdf2md-ws.
//!
//! A thin shim over the library crate that maps flags and environment
//! variables onto `SessionConfig`/`ServerConfig` and serves until Ctrl-C.

use anyhow::{Context, Result};
use clap::Parser;
use edgequake_pdf2md_ws::{ConversionServer, ServerConfig, SessionConfig};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

const AFTER_HELP: &str = r#"EXAMPLES:
  Serve on the default port with docling from PATH:
    pdf2md-ws

  Use a specific converter build and a longer processing timeout:
    DOCLING_CMD=/opt/docling/bin/docling pdf2md-ws --processing-timeout 900

  Show the effective configuration without starting the server:
    pdf2md-ws --print-config

PROTOCOL:
  Connect to ws://HOST:PORT/ws/parse-pdf, send the PDF as one binary
  message, then read text frames until FATAL or MARKDOWN_CONTENT_END.
"#;

/// Serve PDF-to-Markdown conversions over WebSocket.
#[derive(Parser, Debug)]
#[command(
    name = "pdf2md-ws",
    version,
    about = "Serve PDF-to-Markdown conversions over WebSocket with live progress",
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Interface to bind.
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    host: IpAddr,

    /// Port to listen on (0 picks a free port).
    #[arg(short, long, env = "PORT", default_value_t = 8000)]
    port: u16,

    /// WebSocket route path.
    #[arg(long, env = "PDF2MD_ROUTE", default_value = "/ws/parse-pdf")]
    route: String,

    /// Converter executable.
    #[arg(long, env = "DOCLING_CMD", default_value = "docling")]
    converter: String,

    /// Converter output format (`--to` value and output file extension).
    #[arg(long, env = "PDF2MD_TARGET_FORMAT", default_value = "md")]
    target_format: String,

    /// Pass `-vv` to the converter for chattier progress output.
    #[arg(long, env = "PDF2MD_VERBOSE_CONVERTER")]
    verbose_converter: bool,

    /// Maximum accepted upload size in bytes.
    #[arg(long, env = "PDF2MD_MAX_UPLOAD_BYTES", default_value_t = 50 * 1024 * 1024)]
    max_upload_bytes: usize,

    /// Seconds to wait for the upload after connecting.
    #[arg(long, env = "PDF2MD_UPLOAD_TIMEOUT", default_value_t = 60)]
    upload_timeout: u64,

    /// Seconds the converter may run before it is killed.
    #[arg(long, env = "PDF2MD_PROCESSING_TIMEOUT", default_value_t = 300)]
    processing_timeout: u64,

    /// Artifact chunk size in bytes.
    #[arg(long, env = "PDF2MD_CHUNK_SIZE", default_value_t = 4096)]
    chunk_size: usize,

    /// Pause between chunks in milliseconds.
    #[arg(long, env = "PDF2MD_CHUNK_DELAY_MS", default_value_t = 50)]
    chunk_delay_ms: u64,

    /// Regex matching one "page finished" line of converter output.
    #[arg(long, env = "PDF2MD_PAGE_MARKER")]
    page_marker: Option<String>,

    /// Directory session workspaces are created in (default: system temp).
    #[arg(long, env = "PDF2MD_TEMP_DIR")]
    temp_dir: Option<PathBuf>,

    /// Print the effective configuration as JSON and exit.
    #[arg(long)]
    print_config: bool,

    /// Enable debug logging.
    #[arg(short, long, env = "PDF2MD_VERBOSE")]
    verbose: bool,
}

impl Cli {
    fn session_config(&self) -> Result<SessionConfig> {
        let mut builder = SessionConfig::builder()
            .converter_binary(&self.converter)
            .target_format(&self.target_format)
            .verbose_converter(self.verbose_converter)
            .max_upload_bytes(self.max_upload_bytes)
            .upload_timeout_secs(self.upload_timeout)
            .processing_timeout_secs(self.processing_timeout)
            .chunk_size(self.chunk_size)
            .chunk_delay_ms(self.chunk_delay_ms);
        if let Some(marker) = &self.page_marker {
            builder = builder.page_marker(marker);
        }
        if let Some(dir) = &self.temp_dir {
            builder = builder.temp_root(dir);
        }
        builder.build().context("Invalid session configuration")
    }

    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind: SocketAddr::new(self.host, self.port),
            route: self.route.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let session = cli.session_config()?;
    let server = cli.server_config();

    if cli.print_config {
        let dump = serde_json::json!({ "server": server, "session": session });
        println!(
            "{}",
            serde_json::to_string_pretty(&dump).context("Failed to serialise configuration")?
        );
        return Ok(());
    }

    info!(
        "Converter: {} (upload timeout {}s, processing timeout {}s)",
        session.converter_binary, session.upload_timeout_secs, session.processing_timeout_secs
    );

    let running = ConversionServer::start(&server, session)
        .await
        .with_context(|| format!("Failed to bind {}", server.bind))?;

    running
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Shutdown requested");
        })
        .await
        .context("Server terminated with an error")?;

    Ok(())
}
