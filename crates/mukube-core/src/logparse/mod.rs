//! Log normalisation module.
//!
//! The supervised daemons write two distinct text formats to their pipes:
//! etcd's own format and the klog format shared by the Kubernetes binaries.
//! This module reassembles the raw byte chunks into lines, parses each line
//! into a structured record and re-emits it through the supervisor's own
//! log stream so all daemons end up in one coherent log.
//!
//! Unparseable lines are never dropped: they are re-emitted as warnings
//! carrying the raw text. Two known-noisy etcd lines are dropped silently.

pub mod etcd;
pub mod klog;

use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Mutex};

use chrono::NaiveDateTime;

use crate::process::OutputHandler;

/// Severity of a parsed log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Debug output.
    Debug,
    /// Informational output.
    Info,
    /// Notices are re-emitted as info.
    Notice,
    /// Warnings.
    Warning,
    /// Errors.
    Error,
    /// Critical/severe conditions, re-emitted as errors.
    Critical,
}

impl Severity {
    /// The level this severity is re-emitted at.
    #[must_use]
    pub const fn level(&self) -> tracing::Level {
        match self {
            Self::Debug => tracing::Level::DEBUG,
            Self::Info | Self::Notice => tracing::Level::INFO,
            Self::Warning => tracing::Level::WARN,
            Self::Error | Self::Critical => tracing::Level::ERROR,
        }
    }
}

/// One structured record extracted from a daemon log line.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    /// Timestamp as printed by the daemon, when parseable.
    pub timestamp: Option<NaiveDateTime>,
    /// Line severity.
    pub severity: Severity,
    /// Emitting component, when the format carries one.
    pub component: Option<String>,
    /// Source location (`file.go:123`), when the format carries one.
    pub location: Option<String>,
    /// The message itself.
    pub message: String,
}

/// Outcome of parsing one line.
#[derive(Debug, Clone, PartialEq)]
pub enum LineOutcome {
    /// The line parsed into a structured record.
    Record(LogRecord),
    /// The line is known noise and must not be emitted at all.
    Dropped,
    /// The line did not match the dialect; emit the raw text as a warning.
    Unparsed,
}

/// The two dialects spoken by the supervised daemons.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogDialect {
    /// etcd's `<ts> <sev> | <component>: <message>` format.
    Etcd,
    /// The klog `L MMDD hh:mm:ss.uuuuuu pid file:line] message` format.
    Klog,
}

impl LogDialect {
    /// Parse one complete line according to this dialect.
    #[must_use]
    pub fn parse(&self, line: &str) -> LineOutcome {
        match self {
            Self::Etcd => etcd::parse_line(line),
            Self::Klog => klog::parse_line(line),
        }
    }
}

/// Line reassembler.
///
/// Buffers incoming byte chunks and invokes the handler once per complete
/// line (including the trailing newline). One lock guards both the buffer
/// append and the drain, so interleaved chunks from the two pipes of one
/// daemon preserve their byte order.
pub struct LineAssembler {
    inner: Mutex<AssemblerInner>,
}

struct AssemblerInner {
    buf: Vec<u8>,
    handler: Box<dyn FnMut(&str) + Send>,
}

impl LineAssembler {
    /// Create an assembler that feeds complete lines to `handler`.
    #[must_use]
    pub fn new(handler: impl FnMut(&str) + Send + 'static) -> Self {
        Self {
            inner: Mutex::new(AssemblerInner {
                buf: Vec::new(),
                handler: Box::new(handler),
            }),
        }
    }

    /// Append `data` and drain every complete line.
    pub fn handle_data(&self, data: &[u8]) {
        let mut inner = self.inner.lock().expect("log assembler lock poisoned");
        inner.buf.extend_from_slice(data);

        while let Some(pos) = inner.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = inner.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line).into_owned();
            (inner.handler)(&line);
        }
    }
}

impl std::fmt::Debug for LineAssembler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LineAssembler").finish_non_exhaustive()
    }
}

/// Per-application logger.
///
/// Re-emits parsed records through the supervisor's log stream, tagged with
/// the application name so output from all daemons can be told apart.
#[derive(Debug)]
pub struct AppLogger {
    app: String,
}

impl AppLogger {
    /// Emit a parsed record at its mapped level.
    pub fn emit(&self, record: &LogRecord) {
        let component = record.component.as_deref().unwrap_or("");
        let location = record.location.as_deref().unwrap_or("");
        match record.severity.level() {
            tracing::Level::DEBUG => {
                tracing::debug!(app = %self.app, component, location, "{}", record.message);
            }
            tracing::Level::WARN => {
                tracing::warn!(app = %self.app, component, location, "{}", record.message);
            }
            tracing::Level::ERROR => {
                tracing::error!(app = %self.app, component, location, "{}", record.message);
            }
            _ => {
                tracing::info!(app = %self.app, component, location, "{}", record.message);
            }
        }
    }

    /// Emit a line that did not parse, as a warning holding the raw text.
    pub fn emit_raw(&self, line: &str) {
        tracing::warn!(app = %self.app, "{}", line.trim_end_matches(['\r', '\n']));
    }
}

/// Process-wide registry of per-application loggers, keyed by name so that
/// all lines from the same application share one logger.
static LOGGERS: LazyLock<Mutex<HashMap<String, Arc<AppLogger>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// Fetch (creating if necessary) the logger for application `name`.
#[must_use]
pub fn logger_for(name: &str) -> Arc<AppLogger> {
    let mut loggers = LOGGERS.lock().expect("logger registry lock poisoned");
    Arc::clone(loggers.entry(name.to_string()).or_insert_with(|| {
        Arc::new(AppLogger {
            app: name.to_string(),
        })
    }))
}

/// Complete per-daemon pipeline: byte chunks in, structured log events out.
#[derive(Debug)]
pub struct LogPipeline {
    assembler: LineAssembler,
}

impl LogPipeline {
    /// Build the pipeline for application `app` speaking `dialect`.
    #[must_use]
    pub fn new(app: &str, dialect: LogDialect) -> Arc<Self> {
        let logger = logger_for(app);
        let assembler = LineAssembler::new(move |line| match dialect.parse(line) {
            LineOutcome::Record(record) => logger.emit(&record),
            LineOutcome::Dropped => {}
            LineOutcome::Unparsed => logger.emit_raw(line),
        });
        Arc::new(Self { assembler })
    }

    /// Feed one chunk of daemon output.
    pub fn handle_data(&self, data: &[u8]) {
        self.assembler.handle_data(data);
    }

    /// An output handler suitable for the child-process wrapper.
    #[must_use]
    pub fn output_handler(self: &Arc<Self>) -> OutputHandler {
        let pipeline = Arc::clone(self);
        Arc::new(move |chunk: &[u8]| pipeline.handle_data(chunk))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn collecting_assembler() -> (LineAssembler, Arc<Mutex<Vec<String>>>) {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&lines);
        let assembler = LineAssembler::new(move |line: &str| {
            sink.lock().unwrap().push(line.to_string());
        });
        (assembler, lines)
    }

    #[test]
    fn test_single_chunk() {
        let (assembler, lines) = collecting_assembler();
        assembler.handle_data(b"one\ntwo\n");
        assert_eq!(*lines.lock().unwrap(), vec!["one\n", "two\n"]);
    }

    #[test]
    fn test_partial_lines_buffered() {
        let (assembler, lines) = collecting_assembler();
        assembler.handle_data(b"par");
        assert!(lines.lock().unwrap().is_empty());
        assembler.handle_data(b"tial\nrest");
        assert_eq!(*lines.lock().unwrap(), vec!["partial\n"]);
        assembler.handle_data(b"\n");
        assert_eq!(*lines.lock().unwrap(), vec!["partial\n", "rest\n"]);
    }

    #[test]
    fn test_byte_by_byte_matches_whole_feed() {
        let input = b"2018-08-12 16:18:18.718670 I | etcdmain: etcd Version: 3.3.9\nplain line\n";

        let (whole, whole_lines) = collecting_assembler();
        whole.handle_data(input);

        let (split, split_lines) = collecting_assembler();
        for byte in input {
            split.handle_data(&[*byte]);
        }

        assert_eq!(*whole_lines.lock().unwrap(), *split_lines.lock().unwrap());
    }

    #[test]
    fn test_registry_returns_same_logger() {
        let a = logger_for("registry-test-app");
        let b = logger_for("registry-test-app");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_pipeline_counts_lines_once() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        let assembler = LineAssembler::new(|_line| {
            CALLS.fetch_add(1, Ordering::SeqCst);
        });
        assembler.handle_data(b"a\nb\nc\n");
        assert_eq!(CALLS.load(Ordering::SeqCst), 3);
    }
}
