//! External converter process: spawn, stream output lines, wait or kill.
//!
//! ## Output readers
//!
//! The converter writes unstructured progress to stdout and stderr. Each
//! pipe gets its own reader task; both push every line into one bounded
//! `tokio::sync::mpsc` channel per session, which the orchestrator drains
//! as an ordered [`OutputLines`] stream. The channel is FIFO, so lines from
//! one pipe arrive in exactly the order the converter printed them; the two
//! pipes interleave in the order their lines were read.
//!
//! A bounded channel gives natural backpressure: if the peer is slow, the
//! reader waits, the pipe fills, and the converter blocks on its writes.
//!
//! The child is spawned with `kill_on_drop`, so a session that is torn
//! down on any path never leaves a converter running.

use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::pipeline::workspace::Workspace;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

/// Lazy, finite stream of converter output lines.
///
/// Ends once both stdout and stderr have reached EOF, or the process was
/// killed.
pub type OutputLines = ReceiverStream<String>;

/// The converter invocation for one session.
#[derive(Debug, Clone)]
pub struct ConverterCommand {
    program: String,
    args: Vec<String>,
    workdir: PathBuf,
}

impl ConverterCommand {
    /// `<binary> [-vv] <input-file> --to <target-format>`, run in the workspace.
    pub fn for_workspace(config: &SessionConfig, workspace: &Workspace) -> Self {
        let mut args = Vec::with_capacity(4);
        if config.verbose_converter {
            args.push("-vv".to_string());
        }
        args.push(workspace.input_name().to_string());
        args.push("--to".to_string());
        args.push(config.target_format.clone());

        Self {
            program: config.converter_binary.clone(),
            args,
            workdir: workspace.path().to_path_buf(),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Human-readable command line for logs.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Launch the converter and start its output readers.
    ///
    /// `buffer` bounds the number of lines in flight between the reader
    /// tasks and the consumer.
    pub fn spawn(&self, buffer: usize) -> Result<(RunningConversion, OutputLines), SessionError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .current_dir(&self.workdir)
            .env("PYTHONUNBUFFERED", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SessionError::Launch {
                binary: self.program.clone(),
                source,
            })?;

        debug!("Spawned converter pid {:?}: {}", child.id(), self.display());

        let (tx, rx) = mpsc::channel(buffer.max(1));
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_line_reader(stdout, "stdout", tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_line_reader(stderr, "stderr", tx));
        }

        Ok((RunningConversion { child, readers }, ReceiverStream::new(rx)))
    }
}

/// Handle to a launched converter.
///
/// Dropping the handle kills a process that is still running.
#[derive(Debug)]
pub struct RunningConversion {
    child: Child,
    readers: Vec<JoinHandle<()>>,
}

impl RunningConversion {
    /// OS process id, or `None` once the process has been reaped.
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Wait for the converter to exit.
    ///
    /// Cancel-safe: dropping the future leaves the process running.
    pub async fn wait(&mut self) -> Result<ExitStatus, SessionError> {
        self.child
            .wait()
            .await
            .map_err(|e| SessionError::Internal(format!("waiting for converter: {e}")))
    }

    /// Signal the converter to terminate and stop its output readers.
    ///
    /// Does not wait; the runtime reaps the process once the handle drops.
    pub fn kill(&mut self) {
        let pid = self.child.id();
        match self.child.start_kill() {
            Ok(()) => debug!("Killed converter pid {:?}", pid),
            Err(e) => debug!("Kill of converter pid {:?} skipped: {}", pid, e),
        }
        // A grandchild may still hold the pipes open.
        for reader in &self.readers {
            reader.abort();
        }
    }
}

fn spawn_line_reader<R>(stream: R, pipe: &'static str, tx: mpsc::Sender<String>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::with_capacity(256);
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let lines = split_output(&String::from_utf8_lossy(&buf));
                    for line in lines {
                        if tx.send(line).await.is_err() {
                            // Consumer gone; the session is tearing down.
                            return;
                        }
                    }
                }
                Err(e) => {
                    debug!("Converter {} read failed: {}", pipe, e);
                    break;
                }
            }
        }
    })
}

/// Split a raw chunk of converter output into display lines.
///
/// Progress bars redraw with bare `\r`, so carriage returns split lines too.
/// Blank lines are dropped and trailing whitespace trimmed.
pub fn split_output(raw: &str) -> Vec<String> {
    raw.split(['\r', '\n'])
        .map(str::trim_end)
        .filter(|line| !line.trim().is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;
    use std::time::Duration;

    #[test]
    fn split_output_handles_carriage_returns() {
        assert_eq!(
            split_output("10%|#   \r55%|####  \r100%|######\n"),
            vec!["10%|#", "55%|####", "100%|######"]
        );
        assert_eq!(split_output("line\r\n"), vec!["line"]);
        assert!(split_output("   \n").is_empty());
    }

    #[test]
    fn command_line_shape() {
        let root = tempfile::tempdir().unwrap();
        let ws = Workspace::acquire(root.path(), uuid::Uuid::new_v4(), "pdf", "md").unwrap();

        let plain = SessionConfig::default();
        let cmd = ConverterCommand::for_workspace(&plain, &ws);
        assert_eq!(cmd.program(), "docling");
        assert_eq!(cmd.args(), ["input.pdf", "--to", "md"]);
        assert_eq!(cmd.workdir(), ws.path());
        assert_eq!(cmd.display(), "docling input.pdf --to md");

        let verbose = SessionConfig::builder().verbose_converter(true).build().unwrap();
        let cmd = ConverterCommand::for_workspace(&verbose, &ws);
        assert_eq!(cmd.args(), ["-vv", "input.pdf", "--to", "md"]);
    }

    #[tokio::test]
    async fn missing_binary_is_launch_error() {
        let root = tempfile::tempdir().unwrap();
        let ws = Workspace::acquire(root.path(), uuid::Uuid::new_v4(), "pdf", "md").unwrap();
        let config = SessionConfig::builder()
            .converter_binary("definitely-not-a-real-converter-binary")
            .build()
            .unwrap();
        let err = ConverterCommand::for_workspace(&config, &ws)
            .spawn(8)
            .unwrap_err();
        assert!(matches!(err, SessionError::Launch { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn streams_lines_in_order_then_exits() {
        let cmd = ConverterCommand {
            program: "sh".into(),
            args: vec!["-c".into(), "echo one; echo two; echo three; exit 4".into()],
            workdir: std::env::temp_dir(),
        };
        let (mut running, lines) = cmd.spawn(1).unwrap();
        let collected: Vec<String> = lines.collect().await;
        assert_eq!(collected, vec!["one", "two", "three"]);

        let status = running.wait().await.unwrap();
        assert_eq!(status.code(), Some(4));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stderr_is_merged_into_stream() {
        let cmd = ConverterCommand {
            program: "sh".into(),
            args: vec!["-c".into(), "echo warning >&2".into()],
            workdir: std::env::temp_dir(),
        };
        let (mut running, lines) = cmd.spawn(4).unwrap();
        let collected: Vec<String> = lines.collect().await;
        assert_eq!(collected, vec!["warning"]);
        assert!(running.wait().await.unwrap().success());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn kill_ends_output_stream() {
        let cmd = ConverterCommand {
            program: "sh".into(),
            args: vec!["-c".into(), "echo started; exec sleep 30".into()],
            workdir: std::env::temp_dir(),
        };
        let (mut running, mut lines) = cmd.spawn(4).unwrap();
        assert_eq!(lines.next().await.as_deref(), Some("started"));

        assert!(running.id().is_some());
        running.kill();
        let rest = tokio::time::timeout(Duration::from_secs(5), lines.next())
            .await
            .expect("stream should close after kill");
        assert!(rest.is_none());

        let status = tokio::time::timeout(Duration::from_secs(5), running.wait())
            .await
            .expect("killed converter exits promptly")
            .unwrap();
        assert!(!status.success());
        assert!(running.id().is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn wait_returns_cached_status() {
        let cmd = ConverterCommand {
            program: "sh".into(),
            args: vec!["-c".into(), "exit 0".into()],
            workdir: std::env::temp_dir(),
        };
        let (mut running, lines) = cmd.spawn(4).unwrap();
        let collected: Vec<String> = lines.collect().await;
        assert!(collected.is_empty());
        assert!(running.wait().await.unwrap().success());
        // Waiting again returns the cached status.
        assert!(running.wait().await.unwrap().success());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn dropping_handle_kills_converter() {
        let cmd = ConverterCommand {
            program: "sh".into(),
            args: vec!["-c".into(), "echo started; exec sleep 30".into()],
            workdir: std::env::temp_dir(),
        };
        let (running, mut lines) = cmd.spawn(4).unwrap();
        assert_eq!(lines.next().await.as_deref(), Some("started"));

        drop(running);
        // The killed process closes its pipes, which ends the stream.
        let rest = tokio::time::timeout(Duration::from_secs(5), lines.next())
            .await
            .expect("stream should close once the converter is gone");
        assert!(rest.is_none());
    }
}
