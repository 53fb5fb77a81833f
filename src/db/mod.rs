//! The database surface the core consumes (spec §6): connect, dispatch
//! (simple/extended/prepared), a socket for multiplexing, non-blocking
//! consume-input, busy check, get-result, clear-result, error message, status
//! code. Everything downstream of `DbConnection` (the worker scheduler, the
//! client state machine) only ever talks to this trait.

mod mock;
mod wire;

pub use mock::MockConnection;
pub use wire::WireConnection;

use std::fmt;

/// Keyword/value connection parameters (`host`, `port`, `user`, `password`,
/// `dbname`), mirroring libpq's `PQconnectdbParams`.
#[derive(Debug, Clone)]
pub struct ConnParams {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    pub dbname: String,
}

#[derive(Debug, Clone)]
pub enum DbError {
    Connect(String),
    Io(String),
    Protocol(String),
}

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DbError::Connect(m) => write!(f, "connection failed: {m}"),
            DbError::Io(m) => write!(f, "i/o error: {m}"),
            DbError::Protocol(m) => write!(f, "protocol error: {m}"),
        }
    }
}

impl std::error::Error for DbError {}

/// Result status of a completed query cycle (libpq's `PQresultStatus`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultStatus {
    CommandOk,
    TuplesOk,
    EmptyQuery,
    NonFatalError,
    FatalError,
}

impl ResultStatus {
    pub fn is_ok(self) -> bool {
        matches!(self, ResultStatus::CommandOk | ResultStatus::TuplesOk | ResultStatus::EmptyQuery)
    }
}

/// The outcome of one drained query cycle.
#[derive(Debug, Clone)]
pub struct QueryResult {
    pub status: ResultStatus,
    pub rows: usize,
    /// The first column of the first row, parsed as `i64`, when there was one
    /// (used only by the coordinator's scale bootstrap and `init`'s
    /// `select count(*)` — the core's hot path never reads query contents).
    pub scalar: Option<i64>,
}

/// The non-blocking, libpq-shaped connection surface the core requires.
///
/// Exactly one query cycle may be outstanding at a time: a `send_*` call must be
/// followed by `consume_input`/`is_busy`/`get_result`/`clear_result` before the
/// next `send_*`. Implementations never block past the initial `connect`.
pub trait DbConnection: Send {
    /// Opens a connection; may legitimately block (spec §4.5 step 4: "accumulate
    /// the open cost into `conn_time`" — the one place a blocking cost is
    /// expected and measured).
    fn connect(params: &ConnParams) -> Result<Self, DbError>
    where
        Self: Sized;

    /// Dispatches `sql` as a simple-protocol query (text substituted already).
    fn send_simple_query(&mut self, sql: &str) -> Result<(), DbError>;

    /// Dispatches `sql` with `$1..$N` parameters bound out-of-line (extended
    /// query protocol, unnamed statement/portal).
    fn send_extended_query(&mut self, sql: &str, params: &[String]) -> Result<(), DbError>;

    /// One-time `PREPARE name AS sql` for a client that has not yet prepared
    /// this statement. May block briefly (amortized over the whole run).
    fn prepare(&mut self, name: &str, sql: &str) -> Result<(), DbError>;

    /// Dispatches a previously-`prepare`d statement by name with bound params.
    fn send_prepared_query(&mut self, name: &str, params: &[String]) -> Result<(), DbError>;

    /// Bulk-loads `rows` into `table` via the fast `COPY ... FROM STDIN` path
    /// (used only by the initialization collaborator, off the benchmarking hot
    /// path — SPEC_FULL.md §6 addendum).
    fn copy_in(&mut self, table: &str, rows: &mut dyn Iterator<Item = String>) -> Result<(), DbError>;

    /// A one-shot blocking query, used by the coordinator's scale bootstrap and
    /// by `init` — never called from a worker's hot loop.
    fn blocking_query(&mut self, sql: &str) -> Result<QueryResult, DbError>;

    /// Registers this connection's socket with an `mio::Poll` for readiness.
    fn register(&mut self, registry: &mio::Registry, token: mio::Token) -> Result<(), DbError>;
    fn deregister(&mut self, registry: &mio::Registry) -> Result<(), DbError>;

    /// Non-blocking: reads and buffers whatever bytes are currently available.
    fn consume_input(&mut self) -> Result<(), DbError>;

    /// True while the current query cycle has not reached `ReadyForQuery`.
    fn is_busy(&self) -> bool;

    /// Pops the result of the current query cycle once `is_busy()` is false.
    fn get_result(&mut self) -> Option<QueryResult>;

    /// Discards any buffered result state, readying the connection for the next
    /// `send_*` call.
    fn clear_result(&mut self);

    fn error_message(&self) -> Option<&str>;
}
