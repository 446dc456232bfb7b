//! Session events and their text-frame encoding.
//!
//! The orchestrator speaks in [`SessionEvent`]s and never formats wire text
//! itself. [`SessionEvent::encode`] is the only place the text protocol
//! lives:
//!
//! | Event | Frame |
//! |-------|-------|
//! | `Progress(p)` | `PROGRESS: <p>` |
//! | `Log(text)` | `LOG: <text>` |
//! | `Fatal(text)` | `FATAL: <text>` |
//! | `Done(text)` | `DONE: <text>` |
//! | `ContentStart` | `MARKDOWN_CONTENT_START` |
//! | `Chunk { index, total, data }` | `CHUNK:<index>:<total>:<data>` |
//! | `ContentEnd` | `MARKDOWN_CONTENT_END` |
//!
//! Free text in `LOG`, `FATAL` and `DONE` frames has its line terminators
//! escaped as a literal `\n` and backslashes doubled, so one event is always
//! one line of text no matter how the peer splits frames and the escaping
//! can be undone exactly. Chunk data is sent verbatim: chunks must
//! concatenate back into the exact artifact.

pub const CONTENT_START: &str = "MARKDOWN_CONTENT_START";
pub const CONTENT_END: &str = "MARKDOWN_CONTENT_END";

/// One unit of the session narrative sent to the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Monotonic completion percentage, 0–100.
    Progress(u8),
    /// Human-readable status line.
    Log(String),
    /// Unrecoverable error; terminal.
    Fatal(String),
    /// Conversion succeeded; artifact transmission follows.
    Done(String),
    /// Start of artifact transmission.
    ContentStart,
    /// One artifact chunk, 1-based `index` of `total`.
    Chunk {
        index: usize,
        total: usize,
        data: String,
    },
    /// End of artifact transmission.
    ContentEnd,
}

impl SessionEvent {
    pub fn log(text: impl Into<String>) -> Self {
        SessionEvent::Log(text.into())
    }

    /// `true` for events after which nothing else is sent.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionEvent::Fatal(_) | SessionEvent::ContentEnd)
    }

    /// Serialise to a single wire frame.
    pub fn encode(&self) -> String {
        match self {
            SessionEvent::Progress(p) => format!("PROGRESS: {}", (*p).min(100)),
            SessionEvent::Log(text) => format!("LOG: {}", escape_line_breaks(text)),
            SessionEvent::Fatal(text) => format!("FATAL: {}", escape_line_breaks(text)),
            SessionEvent::Done(text) => format!("DONE: {}", escape_line_breaks(text)),
            SessionEvent::ContentStart => CONTENT_START.to_string(),
            SessionEvent::Chunk { index, total, data } => {
                format!("CHUNK:{index}:{total}:{data}")
            }
            SessionEvent::ContentEnd => CONTENT_END.to_string(),
        }
    }
}

/// Double every backslash and replace CR, LF and CRLF with a literal `\n`.
pub fn escape_line_breaks(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\r' => {
                if chars.peek() == Some(&'\n') {
                    chars.next();
                }
                out.push_str("\\n");
            }
            '\n' => out.push_str("\\n"),
            other => out.push(other),
        }
    }
    out
}
