//! Client state machine (spec §3 `ClientState`, §4.5). One `ClientState` is
//! owned by exactly one worker and stepped only by that worker (spec §5).

use std::collections::HashSet;

use crate::db::{ConnParams, DbConnection};
use crate::error::ClientError;
use crate::rand::Lcg48;
use crate::script::{CommandKind, DistKind, MetaVerb, QueryMode, ScriptFile};
use crate::shell;
use crate::throttle;
use crate::variables::{substitute_arg, Variables};

/// Config shared by every client a worker owns (spec §6 CLI surface, trimmed
/// to what `step()` needs).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub query_mode: QueryMode,
    pub target_txn_count: Option<u64>,
    pub per_transaction_connections: bool,
    pub per_statement_latency: bool,
    pub rate: Option<RateConfig>,
}

#[derive(Debug, Clone, Copy)]
pub struct RateConfig {
    pub per_worker_delay_us: f64,
    pub latency_limit_us: Option<i64>,
}

/// What happened during one `step()` call, for the worker to fold into its
/// counters and logging pipeline (spec §4.8/§4.9); `None` fields mean "nothing
/// to report this step".
#[derive(Debug, Default)]
pub struct StepOutcome {
    pub completed_txn: Option<CompletedTxn>,
    pub skip_events: usize,
    pub became_done: bool,
    pub aborted: bool,
    /// `(command_num, elapsed_us)`, present only when `cfg.per_statement_latency`
    /// is set and a SQL command's result was just drained (spec §4.5 step 3).
    pub stmt_latency: Option<(usize, i64)>,
    /// Microseconds newly spent opening a connection this step, to fold into
    /// the worker's `conn_time` total (spec §4.5 step 4).
    pub conn_time_us: i64,
}

/// Distinguishes a script-level problem (undefined variable, bad bind value —
/// §7 "script runtime errors", client stays alive) from a transport failure
/// (§7 "query errors"/"connection errors", client aborts).
enum DispatchError {
    Client(ClientError),
    Connection,
}

impl From<ClientError> for DispatchError {
    fn from(e: ClientError) -> Self {
        DispatchError::Client(e)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CompletedTxn {
    pub latency_us: i64,
    pub late: bool,
    pub lag_us: Option<i64>,
    pub file_idx: usize,
}

/// One simulated client (spec §3 `ClientState`).
pub struct ClientState<C: DbConnection> {
    pub id: usize,
    conn: Option<C>,
    pub file_idx: usize,
    pub state_idx: usize,
    pub listen: bool,
    pub sleeping: bool,
    pub throttling: bool,
    pub is_throttled: bool,
    pub txn_scheduled_us: i64,
    pub txn_begin_us: i64,
    pub stmt_begin_us: i64,
    pub variables: Variables,
    prepared: HashSet<usize>,
    pub txn_count: u64,
    pub err_count: u64,
    pub done: bool,
    /// Set by a mid-run connection or query error (spec §7: "aborts the
    /// affected client... decrements the live-clients total"). Distinct from
    /// `done`: a client that reached its transaction target finished
    /// successfully, one that aborted never will, but both stop being
    /// scheduled — `is_done()` reports true for either.
    aborted: bool,
    /// Lag credited on wake from a throttle sleep, held until the transaction
    /// it belongs to completes (spec §4.4 "when a sleeping client wakes...").
    pending_lag: Option<i64>,
}

impl<C: DbConnection> ClientState<C> {
    /// A fresh client, seeded with the automatic `:scale` variable (mirroring
    /// the original driver's implicit client variable of the same name).
    pub fn new(id: usize, scale: i64) -> Self {
        let mut variables = Variables::new();
        variables.set("scale", scale.to_string());
        Self {
            id,
            conn: None,
            file_idx: 0,
            state_idx: 0,
            listen: false,
            sleeping: false,
            throttling: false,
            is_throttled: false,
            txn_scheduled_us: 0,
            txn_begin_us: 0,
            stmt_begin_us: 0,
            variables,
            prepared: HashSet::new(),
            txn_count: 0,
            err_count: 0,
            done: false,
            aborted: false,
            pending_lag: None,
        }
    }

    /// True once the client has either reached its transaction target or
    /// permanently aborted (spec §7); in both cases the scheduler stops
    /// stepping it.
    pub fn is_done(&self) -> bool {
        self.done || self.aborted
    }

    /// True only for a permanent connection/query abort, never for a client
    /// that finished its assigned transactions (spec §7 "live-clients total").
    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    /// Registers this client's connection socket with the worker's poll
    /// instance under `token`, if a connection is currently open.
    pub fn register(&mut self, registry: &mio::Registry, token: mio::Token) {
        if let Some(conn) = self.conn.as_mut() {
            let _ = conn.register(registry, token);
        }
    }

    pub fn deregister(&mut self, registry: &mio::Registry) {
        if let Some(conn) = self.conn.as_mut() {
            let _ = conn.deregister(registry);
        }
    }

    pub fn has_connection(&self) -> bool {
        self.conn.is_some()
    }

    /// True while a readiness-wait should include this client's socket (spec
    /// §4.7 step 1): not sleeping, and the next command is SQL with a
    /// dispatched-but-undrained query.
    pub fn awaits_socket(&self, scripts: &[ScriptFile]) -> bool {
        if self.sleeping || self.is_done() {
            return false;
        }
        self.listen && matches!(self.current_command(scripts).map(|c| &c.kind), Some(CommandKind::Sql { .. }))
    }

    pub fn next_is_meta(&self, scripts: &[ScriptFile]) -> bool {
        !self.sleeping
            && !self.is_done()
            && matches!(self.current_command(scripts).map(|c| &c.kind), Some(CommandKind::Meta(_)))
    }

    fn current_command<'a>(&self, scripts: &'a [ScriptFile]) -> Option<&'a crate::script::Command> {
        scripts[self.file_idx].commands.get(self.state_idx)
    }

    /// One iteration of the per-step algorithm (spec §4.5). `now_us` and
    /// `pick_file_idx` are closures so the worker controls the clock and file
    /// selection without `ClientState` owning a `Lcg48` (workers own the RNG,
    /// not clients — spec §3 `WorkerState::prng_state`).
    #[allow(clippy::too_many_arguments)]
    pub fn step(
        &mut self,
        scripts: &[ScriptFile],
        cfg: &ClientConfig,
        conn_params: &ConnParams,
        rng: &mut Lcg48,
        now_us: impl Fn() -> i64,
        terminating: bool,
    ) -> StepOutcome {
        let mut out = StepOutcome::default();

        // Step 1: enter the rate-limiter delay for a fresh transaction.
        if let Some(rate) = &cfg.rate {
            if !self.is_throttled {
                let mut skips = 0;
                let scheduled = throttle::advance_trigger(
                    rng,
                    rate.per_worker_delay_us,
                    rate.latency_limit_us,
                    &mut self.txn_scheduled_us,
                    &now_us,
                    || skips += 1,
                );
                out.skip_events = skips;
                self.txn_scheduled_us = scheduled;
                self.is_throttled = true;
                self.sleeping = true;
                self.throttling = true;
                return out;
            }
        }

        // Step 2: honor an open sleep (either the throttle delay or `\sleep`).
        if self.sleeping {
            let now = now_us();
            if now >= self.txn_scheduled_us {
                self.sleeping = false;
                if self.throttling {
                    let lag = throttle::wake_lag_us(now, self.txn_scheduled_us);
                    self.throttling = false;
                    self.pending_lag = Some(lag);
                }
            } else {
                return out;
            }
        }

        // Step 3: drain a dispatched query.
        if self.listen {
            let now = now_us();
            let is_last = self.state_idx + 1 >= scripts[self.file_idx].commands.len();
            let command = &scripts[self.file_idx].commands[self.state_idx];
            if matches!(command.kind, CommandKind::Sql { .. }) {
                let Some(conn) = self.conn.as_mut() else {
                    out.aborted = true;
                    self.reset_for_abort();
                    return out;
                };
                if conn.consume_input().is_err() || conn.is_busy() {
                    return out;
                }
                let result = conn.get_result();
                conn.clear_result();
                let status_ok = result.as_ref().map(|r| r.status.is_ok()).unwrap_or(false);

                if cfg.per_statement_latency {
                    out.stmt_latency = Some((command.command_num, now - self.stmt_begin_us));
                }

                if is_last {
                    let latency = now - self.txn_scheduled_us;
                    let late = cfg
                        .rate
                        .and_then(|r| r.latency_limit_us)
                        .is_some_and(|limit| latency > limit);
                    out.completed_txn = Some(CompletedTxn {
                        latency_us: latency,
                        late,
                        lag_us: self.pending_lag.take(),
                        file_idx: self.file_idx,
                    });
                }

                if !status_ok {
                    out.aborted = true;
                    self.reset_for_abort();
                    return out;
                }

                self.state_idx += 1;
                self.listen = false;

                if self.state_idx >= scripts[self.file_idx].commands.len() {
                    if cfg.per_transaction_connections {
                        self.conn = None;
                    }
                    self.txn_count += 1;
                    let reached_target = cfg.target_txn_count.is_some_and(|n| self.txn_count >= n);
                    if reached_target || terminating {
                        self.done = true;
                        out.became_done = true;
                        return out;
                    }
                    self.state_idx = 0;
                    self.is_throttled = false;
                    self.file_idx = (rng.uniform(0, scripts.len() as i64 - 1).unwrap_or(0)) as usize;
                    return out;
                }
            }
        }

        // Step 4: open a connection lazily.
        if self.conn.is_none() {
            let open_start = now_us();
            match C::connect(conn_params) {
                Ok(conn) => {
                    self.conn = Some(conn);
                    out.conn_time_us = now_us() - open_start;
                }
                Err(_) => {
                    out.aborted = true;
                    self.reset_for_abort();
                    return out;
                }
            }
        }

        let Some(command) = self.current_command(scripts).cloned() else {
            self.done = true;
            out.became_done = true;
            return out;
        };

        // Starting a new transaction records txn_begin_us regardless of which
        // kind of command opens it; when rate limiting is off there is no
        // throttle trigger to set txn_scheduled_us, so mirror it here (spec
        // §4.5 "starting a new transaction... records txn_begin_us").
        if self.state_idx == 0 {
            self.txn_begin_us = now_us();
            if cfg.rate.is_none() {
                self.txn_scheduled_us = self.txn_begin_us;
            }
        }

        match command.kind {
            CommandKind::Sql { sql_text, params, prepared_name } => {
                self.stmt_begin_us = now_us();
                match self.dispatch_sql(cfg.query_mode, &sql_text, &params, &prepared_name) {
                    Ok(()) => self.listen = true,
                    Err(DispatchError::Client(_)) => {
                        // Undefined variable/bad bind value: a script runtime
                        // error (spec §7), client stays alive.
                        self.err_count += 1;
                    }
                    Err(DispatchError::Connection) => {
                        // The send itself failed: treat like a connection error
                        // (spec §7 "Query errors" / "Connection errors").
                        out.aborted = true;
                        self.reset_for_abort();
                    }
                }
            }
            CommandKind::Meta(verb) => match self.dispatch_meta(&verb, rng, terminating) {
                Ok(()) => {
                    // A `sleep` just armed `txn_scheduled_us`/`sleeping`; let the
                    // scheduler revisit this client instead of advancing past it.
                    if self.sleeping {
                        return out;
                    }
                    let now = now_us();
                    let is_last = self.state_idx + 1 >= scripts[self.file_idx].commands.len();
                    if is_last {
                        // End-of-script is always end-of-transaction, even when the
                        // last command is a meta-command (spec §9 Open Question).
                        let latency = now - self.txn_scheduled_us;
                        let late = cfg
                            .rate
                            .and_then(|r| r.latency_limit_us)
                            .is_some_and(|limit| latency > limit);
                        out.completed_txn = Some(CompletedTxn {
                            latency_us: latency,
                            late,
                            lag_us: self.pending_lag.take(),
                            file_idx: self.file_idx,
                        });
                    }
                    self.state_idx += 1;
                    if self.state_idx >= scripts[self.file_idx].commands.len() {
                        if cfg.per_transaction_connections {
                            self.conn = None;
                        }
                        self.txn_count += 1;
                        let reached_target = cfg.target_txn_count.is_some_and(|n| self.txn_count >= n);
                        if reached_target || terminating {
                            self.done = true;
                            out.became_done = true;
                            return out;
                        }
                        self.state_idx = 0;
                        self.is_throttled = false;
                        self.file_idx = (rng.uniform(0, scripts.len() as i64 - 1).unwrap_or(0)) as usize;
                    }
                }
                Err(_) => {
                    self.err_count += 1;
                    self.state_idx += 1;
                }
            },
        }

        out
    }

    fn reset_for_abort(&mut self) {
        self.conn = None;
        self.listen = false;
        self.sleeping = false;
        self.state_idx = 0;
        self.is_throttled = false;
        self.aborted = true;
    }

    fn dispatch_sql(
        &mut self,
        mode: QueryMode,
        sql_text: &str,
        params: &[String],
        prepared_name: &str,
    ) -> Result<(), DispatchError> {
        let conn = self.conn.as_mut().expect("connection opened before dispatch");
        match mode {
            QueryMode::Simple => {
                let literal = substitute_sql_literal(sql_text, &self.variables);
                conn.send_simple_query(&literal).map_err(|_| DispatchError::Connection)
            }
            QueryMode::Extended => {
                let values = resolve_params(params, &self.variables)?;
                conn.send_extended_query(sql_text, &values).map_err(|_| DispatchError::Connection)
            }
            QueryMode::Prepared => {
                let values = resolve_params(params, &self.variables)?;
                if self.prepared.insert(self.file_idx) {
                    conn.prepare(prepared_name, sql_text).map_err(|_| DispatchError::Connection)?;
                }
                conn.send_prepared_query(prepared_name, &values).map_err(|_| DispatchError::Connection)
            }
        }
    }

    fn dispatch_meta(&mut self, verb: &MetaVerb, rng: &mut Lcg48, terminating: bool) -> Result<(), ClientError> {
        match verb {
            MetaVerb::Set { var, expr } => {
                let value = expr.eval(&self.variables)?;
                self.variables.set(var.clone(), value.to_string());
                Ok(())
            }
            MetaVerb::SetRandom { var, min_tok, max_tok, dist } => {
                let min = resolve_i64_token(min_tok, &self.variables)?;
                let max = resolve_i64_token(max_tok, &self.variables)?;
                let drawn = match dist.kind {
                    DistKind::Uniform => rng.uniform(min, max),
                    DistKind::Gaussian | DistKind::Exponential => {
                        let threshold_tok = dist
                            .threshold_tok
                            .as_deref()
                            .ok_or(ClientError::InvalidRandomRange { min, max })?;
                        let theta: f64 = substitute_arg(&self.variables, threshold_tok)?
                            .parse()
                            .map_err(|_| ClientError::InvalidRandomRange { min, max })?;
                        if dist.kind == DistKind::Gaussian {
                            rng.gaussian(min, max, theta)
                        } else {
                            rng.exponential(min, max, theta)
                        }
                    }
                };
                let value = drawn.ok_or(ClientError::InvalidRandomRange { min, max })?;
                self.variables.set(var.clone(), value.to_string());
                Ok(())
            }
            MetaVerb::Sleep { amount_tok, unit } => {
                let amount = resolve_i64_token(amount_tok, &self.variables)?;
                self.txn_scheduled_us += amount.wrapping_mul(unit.factor_us());
                self.sleeping = true;
                Ok(())
            }
            MetaVerb::SetShell { var, cmd, args } => {
                let resolved_args = resolve_string_args(args, &self.variables)?;
                let value = shell::run_capturing_integer(cmd, &resolved_args)?;
                self.variables.set(var.clone(), value.to_string());
                Ok(())
            }
            MetaVerb::Shell { cmd, args } => {
                let resolved_args = resolve_string_args(args, &self.variables)?;
                shell::run_ignoring_output(cmd, &resolved_args, terminating)
            }
        }
    }
}

fn resolve_i64_token(tok: &str, vars: &Variables) -> Result<i64, ClientError> {
    let resolved = substitute_arg(vars, tok)?;
    resolved.parse::<i64>().map_err(|_| ClientError::UndefinedVariable(tok.to_string()))
}

fn resolve_string_args(args: &[String], vars: &Variables) -> Result<Vec<String>, ClientError> {
    args.iter().map(|a| substitute_arg(vars, a)).collect()
}

fn resolve_params(params: &[String], vars: &Variables) -> Result<Vec<String>, ClientError> {
    params
        .iter()
        .map(|name| vars.get(name).map(str::to_string).ok_or_else(|| ClientError::UndefinedVariable(name.clone())))
        .collect()
}

/// Simple-protocol literal substitution (spec §8: "`:name` with no match is
/// left textually unchanged in SQL" — unlike meta-command arguments, an
/// undefined variable here is not an error).
fn substitute_sql_literal(sql: &str, vars: &Variables) -> String {
    let mut out = String::with_capacity(sql.len());
    let chars: Vec<char> = sql.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        if chars[i] != ':' {
            out.push(chars[i]);
            i += 1;
            continue;
        }
        let start = i + 1;
        let mut end = start;
        while end < chars.len() && (chars[end].is_ascii_alphanumeric() || chars[end] == '_') {
            end += 1;
        }
        if end > start {
            let name: String = chars[start..end].iter().collect();
            match vars.get(&name) {
                Some(value) => out.push_str(value),
                None => {
                    out.push(':');
                    out.push_str(&name);
                }
            }
            i = end;
        } else {
            out.push(':');
            i += 1;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MockConnection;
    use crate::script::parse_script_source;

    fn base_cfg(mode: QueryMode) -> ClientConfig {
        ClientConfig {
            query_mode: mode,
            target_txn_count: Some(1),
            per_transaction_connections: false,
            per_statement_latency: false,
            rate: None,
        }
    }

    fn conn_params() -> ConnParams {
        ConnParams {
            host: "mock".into(),
            port: 0,
            user: "u".into(),
            password: None,
            dbname: "d".into(),
        }
    }

    #[test]
    fn division_by_zero_increments_err_count_and_continues() {
        let (script, _) = parse_script_source("t", "\\set x 10 / 0\nSELECT 1;", QueryMode::Simple, 0).unwrap();
        let scripts = vec![script];
        let mut client: ClientState<MockConnection> = ClientState::new(0, 1);
        let cfg = base_cfg(QueryMode::Simple);
        let params = conn_params();
        let mut rng = Lcg48::from_halves(1, 2, 3);

        // First step: \set fails (division by zero), err_count increments, advances past it.
        let out = client.step(&scripts, &cfg, &params, &mut rng, || 0, false);
        assert_eq!(client.err_count, 1);
        assert!(!out.aborted);
        assert_eq!(client.state_idx, 1);
        assert!(client.variables.get("x").is_none());
    }

    #[test]
    fn simple_mode_substitutes_and_completes_transaction() {
        let (script, _) = parse_script_source(
            "t",
            "\\set aid 7\nSELECT abalance FROM pgbench_accounts WHERE aid = :aid;",
            QueryMode::Simple,
            0,
        )
        .unwrap();
        let scripts = vec![script];
        let mut client: ClientState<MockConnection> = ClientState::new(0, 1);
        let cfg = base_cfg(QueryMode::Simple);
        let params = conn_params();
        let mut rng = Lcg48::from_halves(4, 5, 6);

        // \set aid 7
        client.step(&scripts, &cfg, &params, &mut rng, || 0, false);
        assert_eq!(client.variables.get("aid"), Some("7"));

        // Dispatch the SQL command: opens a connection, sends the query.
        let out = client.step(&scripts, &cfg, &params, &mut rng, || 100, false);
        assert!(!out.aborted);
        assert!(client.listen);

        // Drain it: the mock connection completes immediately by default.
        let out = client.step(&scripts, &cfg, &params, &mut rng, || 200, false);
        assert!(out.completed_txn.is_some());
        assert!(out.became_done);
        assert!(client.is_done());
    }

    #[test]
    fn failed_connection_aborts_client_without_killing_the_process() {
        let (script, _) = parse_script_source("t", "SELECT 1;", QueryMode::Simple, 0).unwrap();
        let scripts = vec![script];
        let mut client: ClientState<MockConnection> = ClientState::new(0, 1);
        let cfg = base_cfg(QueryMode::Simple);
        let mut params = conn_params();
        params.host = "mock-unreachable".into();
        let mut rng = Lcg48::from_halves(1, 1, 1);

        let out = client.step(&scripts, &cfg, &params, &mut rng, || 0, false);
        assert!(out.aborted);
        assert!(!client.listen);
        assert!(client.is_aborted());
        // Permanently removed from the live set (spec §7), not retried.
        assert!(client.is_done());
    }

    #[test]
    fn rate_limited_client_sleeps_then_completes_on_schedule() {
        let (script, _) = parse_script_source("t", "SELECT 1;", QueryMode::Simple, 0).unwrap();
        let scripts = vec![script];
        let mut client: ClientState<MockConnection> = ClientState::new(0, 1);
        let mut cfg = base_cfg(QueryMode::Simple);
        cfg.rate = Some(RateConfig { per_worker_delay_us: 10_000.0, latency_limit_us: None });
        let params = conn_params();
        let mut rng = Lcg48::from_halves(1, 2, 3);

        // First step only enters the throttle delay; no command has run yet.
        let out = client.step(&scripts, &cfg, &params, &mut rng, || 0, false);
        assert_eq!(out.skip_events, 0);
        assert!(client.sleeping);
        let scheduled = client.txn_scheduled_us;

        // Still before the scheduled instant: no progress.
        let out = client.step(&scripts, &cfg, &params, &mut rng, || scheduled - 1, false);
        assert!(out.completed_txn.is_none());
        assert!(client.sleeping);

        // At the scheduled instant: wakes, dispatches, then drains to completion.
        client.step(&scripts, &cfg, &params, &mut rng, || scheduled, false);
        assert!(!client.sleeping);
        let out = client.step(&scripts, &cfg, &params, &mut rng, || scheduled + 50, false);
        assert!(out.completed_txn.is_some());
        assert!(client.is_done());
    }

    #[test]
    fn latency_limit_skips_transactions_that_fall_too_far_behind() {
        let (script, _) = parse_script_source("t", "SELECT 1;", QueryMode::Simple, 0).unwrap();
        let scripts = vec![script];
        let mut client: ClientState<MockConnection> = ClientState::new(0, 1);
        let mut cfg = base_cfg(QueryMode::Simple);
        cfg.target_txn_count = Some(1);
        // A huge per-worker delay combined with a tiny latency limit and a
        // clock that has already moved far ahead forces the scheduler to
        // skip one or more slots before it finds one within the limit.
        cfg.rate = Some(RateConfig { per_worker_delay_us: 1_000_000.0, latency_limit_us: Some(100) });
        let params = conn_params();
        let mut rng = Lcg48::from_halves(4, 5, 6);

        let out = client.step(&scripts, &cfg, &params, &mut rng, || 10_000_000, false);
        assert!(out.skip_events > 0, "expected at least one skipped slot");
        assert!(client.sleeping);
        assert!(client.txn_scheduled_us >= 10_000_000 - 100);
    }

    #[test]
    fn prepared_mode_prepares_once_per_file() {
        let (script, _) = parse_script_source(
            "t",
            "SELECT abalance FROM pgbench_accounts WHERE aid = :aid;",
            QueryMode::Prepared,
            0,
        )
        .unwrap();
        let scripts = vec![script];
        let mut client: ClientState<MockConnection> = ClientState::new(0, 1);
        client.variables.set("aid", "1");
        let mut cfg = base_cfg(QueryMode::Prepared);
        cfg.target_txn_count = Some(2);
        let params = conn_params();
        let mut rng = Lcg48::from_halves(9, 9, 9);

        // Transaction 1: dispatch (opens conn + PREPARE + EXECUTE), then drain.
        client.step(&scripts, &cfg, &params, &mut rng, || 0, false);
        client.step(&scripts, &cfg, &params, &mut rng, || 1, false);
        // Transaction 2: dispatch again, should not re-PREPARE.
        client.step(&scripts, &cfg, &params, &mut rng, || 2, false);
        client.step(&scripts, &cfg, &params, &mut rng, || 3, false);

        assert_eq!(client.txn_count, 2);
        assert!(client.is_done());
    }
}
