//! Error types for the benchmarking core.
//!
//! Following the teacher's convention (see `collector/pg_collector/mod.rs`'s
//! `PgCollectError`, `util/time_parser.rs`'s `TimeParseError`): plain enums with a
//! hand-written `Display` and `std::error::Error` impl, no `anyhow`/`thiserror`.

use std::fmt;

/// A fatal, process-ending error: configuration, first-connect, or a fatal
/// runtime condition in a worker.
#[derive(Debug)]
pub enum BenchError {
    /// Mutually exclusive flags, out-of-range numeric arguments, etc.
    Config(String),
    /// A script or expression failed to parse.
    Parse(ScriptParseError),
    /// The first connection attempt (bootstrap, or first client on startup) failed.
    Connect(String),
    /// Any other fatal condition (log file open failure, wait() failure, ...).
    Fatal(String),
}

impl fmt::Display for BenchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BenchError::Config(msg) => write!(f, "configuration error: {msg}"),
            BenchError::Parse(e) => write!(f, "{e}"),
            BenchError::Connect(msg) => write!(f, "connection error: {msg}"),
            BenchError::Fatal(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for BenchError {}

impl From<ScriptParseError> for BenchError {
    fn from(e: ScriptParseError) -> Self {
        BenchError::Parse(e)
    }
}

/// A script or expression parse error, reported with file/line/column and a caret
/// (spec §7: "Parse errors... fatal, reported with file, line, column, and a caret").
#[derive(Debug, Clone)]
pub struct ScriptParseError {
    pub file: String,
    pub line: usize,
    pub col: usize,
    pub message: String,
    /// The offending source line, for the caret diagnostic.
    pub source_line: String,
}

impl ScriptParseError {
    pub fn new(
        file: impl Into<String>,
        line: usize,
        col: usize,
        source_line: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            file: file.into(),
            line,
            col,
            message: message.into(),
            source_line: source_line.into(),
        }
    }
}

impl fmt::Display for ScriptParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{}:{}:{}: {}",
            self.file, self.line, self.col, self.message
        )?;
        writeln!(f, "    {}", self.source_line)?;
        write!(f, "    {}^", " ".repeat(self.col.saturating_sub(1)))
    }
}

impl std::error::Error for ScriptParseError {}

/// A non-fatal error raised while stepping one client's script.
///
/// Per spec §7 ("Script runtime errors"): increments `err_count`, the client stays
/// alive, and execution continues with the next command. Never escapes the worker.
#[derive(Debug, Clone)]
pub enum ClientError {
    UndefinedVariable(String),
    DivisionByZero,
    InvalidRandomRange { min: i64, max: i64 },
    RangeOverflow,
    ShellNonInteger(String),
    ShellFailed(String),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::UndefinedVariable(name) => {
                write!(f, "undefined variable \"{name}\"")
            }
            ClientError::DivisionByZero => write!(f, "division by zero"),
            ClientError::InvalidRandomRange { min, max } => {
                write!(f, "empty or invalid range, min({min}) is not less than max({max})")
            }
            ClientError::RangeOverflow => write!(f, "random range too wide, overflows i64"),
            ClientError::ShellNonInteger(out) => {
                write!(f, "shell command did not return an integer: {out:?}")
            }
            ClientError::ShellFailed(msg) => write!(f, "shell command failed: {msg}"),
        }
    }
}

impl std::error::Error for ClientError {}
