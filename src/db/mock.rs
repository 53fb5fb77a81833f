//! An in-memory stand-in for `DbConnection`, in the spirit of the teacher's
//! `collector::mock::MockFs` (fixed canned responses instead of real I/O), used
//! by the client/worker/stats tests in lieu of a live server.

use std::collections::VecDeque;

use super::{ConnParams, DbConnection, DbError, QueryResult, ResultStatus};

/// One scripted outcome for a `send_*` call: either a result to hand back once
/// `busy_polls` `consume_input` calls have elapsed, or a fatal protocol error.
#[derive(Debug, Clone)]
pub struct MockResponse {
    pub result: Result<QueryResult, String>,
    /// How many `consume_input` calls before `is_busy()` goes false, letting
    /// tests exercise a worker's poll loop instead of completing instantly.
    pub busy_polls: usize,
}

impl MockResponse {
    pub fn ok(status: ResultStatus, rows: usize) -> Self {
        Self {
            result: Ok(QueryResult { status, rows, scalar: None }),
            busy_polls: 0,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            result: Err(message.into()),
            busy_polls: 0,
        }
    }

    pub fn after_polls(mut self, n: usize) -> Self {
        self.busy_polls = n;
        self
    }

    /// Sets the first-column scalar a `blocking_query` caller would read (used
    /// to script the coordinator's `select count(*)` bootstrap in tests).
    pub fn with_scalar(mut self, value: i64) -> Self {
        if let Ok(qr) = &mut self.result {
            qr.scalar = Some(value);
        }
        self
    }
}

pub struct MockConnection {
    pub params: ConnParams,
    /// Canned outcomes, consumed one per `send_*` call in order. A connection
    /// that runs out of responses returns `CommandOk`/0 rows by default.
    responses: VecDeque<MockResponse>,
    /// Every `sql`/statement name a `send_*` call was given, for assertions.
    pub sent: Vec<String>,
    polls_remaining: usize,
    pending: Option<QueryResult>,
    last_error: Option<String>,
    fail_connect: bool,
    prepared: Vec<String>,
}

impl MockConnection {
    /// Pre-seeds the responses a not-yet-constructed connection will return,
    /// used as `db::mock::with_responses(vec![...])` followed by `connect`.
    pub fn with_responses(responses: Vec<MockResponse>) -> Self {
        Self {
            params: ConnParams {
                host: "mock".into(),
                port: 0,
                user: "mock".into(),
                password: None,
                dbname: "mock".into(),
            },
            responses: responses.into(),
            sent: Vec::new(),
            polls_remaining: 0,
            pending: None,
            last_error: None,
            fail_connect: false,
            prepared: Vec::new(),
        }
    }

    pub fn fail_to_connect() -> Self {
        let mut c = Self::with_responses(Vec::new());
        c.fail_connect = true;
        c
    }

    fn begin(&mut self, tag: impl Into<String>) {
        self.sent.push(tag.into());
        self.last_error = None;
        self.pending = None;
        match self.responses.pop_front() {
            Some(resp) => {
                self.polls_remaining = resp.busy_polls;
                match resp.result {
                    Ok(qr) => self.pending = Some(qr),
                    Err(msg) => self.last_error = Some(msg),
                }
            }
            None => {
                self.polls_remaining = 0;
                self.pending = Some(QueryResult { status: ResultStatus::CommandOk, rows: 0, scalar: None });
            }
        }
    }
}

impl DbConnection for MockConnection {
    fn connect(params: &ConnParams) -> Result<Self, DbError> {
        if params.host == "mock-unreachable" {
            return Err(DbError::Connect("connection refused".into()));
        }
        let mut c = Self::with_responses(Vec::new());
        c.params = params.clone();
        Ok(c)
    }

    fn send_simple_query(&mut self, sql: &str) -> Result<(), DbError> {
        self.begin(sql);
        Ok(())
    }

    fn send_extended_query(&mut self, sql: &str, params: &[String]) -> Result<(), DbError> {
        self.begin(format!("{sql} /* params={params:?} */"));
        Ok(())
    }

    fn prepare(&mut self, name: &str, sql: &str) -> Result<(), DbError> {
        self.prepared.push(name.to_string());
        self.begin(format!("PREPARE {name} AS {sql}"));
        self.pending = Some(QueryResult { status: ResultStatus::CommandOk, rows: 0, scalar: None });
        Ok(())
    }

    fn send_prepared_query(&mut self, name: &str, params: &[String]) -> Result<(), DbError> {
        self.begin(format!("EXECUTE {name} /* params={params:?} */"));
        Ok(())
    }

    fn copy_in(&mut self, table: &str, rows: &mut dyn Iterator<Item = String>) -> Result<(), DbError> {
        let n = rows.count();
        self.begin(format!("COPY {table} ({n} rows)"));
        Ok(())
    }

    fn blocking_query(&mut self, sql: &str) -> Result<QueryResult, DbError> {
        self.begin(sql);
        self.pending
            .take()
            .ok_or_else(|| DbError::Protocol(self.last_error.clone().unwrap_or_default()))
    }

    fn register(&mut self, _registry: &mio::Registry, _token: mio::Token) -> Result<(), DbError> {
        Ok(())
    }

    fn deregister(&mut self, _registry: &mio::Registry) -> Result<(), DbError> {
        Ok(())
    }

    fn consume_input(&mut self) -> Result<(), DbError> {
        if self.polls_remaining > 0 {
            self.polls_remaining -= 1;
        }
        Ok(())
    }

    fn is_busy(&self) -> bool {
        self.polls_remaining > 0
    }

    fn get_result(&mut self) -> Option<QueryResult> {
        if self.is_busy() {
            return None;
        }
        self.pending.take()
    }

    fn clear_result(&mut self) {
        self.pending = None;
    }

    fn error_message(&self) -> Option<&str> {
        self.last_error.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_response_is_command_ok() {
        let mut c = MockConnection::with_responses(Vec::new());
        c.send_simple_query("BEGIN;").unwrap();
        assert!(!c.is_busy());
        let r = c.get_result().unwrap();
        assert_eq!(r.status, ResultStatus::CommandOk);
    }

    #[test]
    fn scripted_error_surfaces_via_error_message() {
        let mut c = MockConnection::with_responses(vec![MockResponse::error("deadlock detected")]);
        c.send_simple_query("UPDATE ...").unwrap();
        assert!(!c.is_busy());
        assert!(c.get_result().is_none());
        assert_eq!(c.error_message(), Some("deadlock detected"));
    }

    #[test]
    fn busy_polls_delay_completion() {
        let mut c = MockConnection::with_responses(vec![
            MockResponse::ok(ResultStatus::TuplesOk, 1).after_polls(2),
        ]);
        c.send_simple_query("SELECT 1;").unwrap();
        assert!(c.is_busy());
        c.consume_input().unwrap();
        assert!(c.is_busy());
        c.consume_input().unwrap();
        assert!(!c.is_busy());
        assert_eq!(c.get_result().unwrap().rows, 1);
    }

    #[test]
    fn connect_failure_is_reported() {
        let params = ConnParams {
            host: "mock-unreachable".into(),
            port: 0,
            user: "u".into(),
            password: None,
            dbname: "d".into(),
        };
        assert!(MockConnection::connect(&params).is_err());
    }
}
