//! Thread-per-worker scheduler (spec §3 `WorkerState`, §4.7). One `run_worker`
//! call is the entire body of one OS thread: it owns a slice of clients, a
//! derived PRNG, and (optionally) a log writer, and loops the readiness-wait
//! algorithm until every client it owns is done or the run is terminating.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use mio::{Events, Poll, Token};

use crate::client::{ClientConfig, ClientState};
use crate::db::{ConnParams, DbConnection};
use crate::logfile::{LogEntry, Logger};
use crate::rand::Lcg48;
use crate::script::ScriptFile;
use crate::stats::{ProgressTracker, WorkerCounters};
use crate::termination::TerminationFlag;

/// Upper bound on a pure socket wait, so a missed or coalesced readiness
/// notification cannot wedge a worker that still has live clients.
const HEARTBEAT_US: i64 = 50_000;

/// Everything a worker needs that does not change across its clients (spec §6
/// CLI surface, trimmed to what the scheduler loop itself consumes).
pub struct WorkerConfig {
    pub tid: usize,
    pub client: ClientConfig,
    pub conn_params: ConnParams,
    /// `-P`: print a progress line this often. `None` means final-report only
    /// (SPEC_FULL.md §4.9 addendum: no `-P` means no progress ticks).
    pub progress_interval_s: Option<f64>,
}

pub struct WorkerOutput {
    pub counters: WorkerCounters,
}

/// Runs the scheduler loop for one worker thread to completion (spec §4.7
/// steps 1–6). `progress` is called on tid 0 each time a progress tick fires;
/// it is a plain callback rather than a channel so the coordinator decides how
/// to render it (teacher pattern: callers own presentation, collaborators
/// only compute).
pub fn run_worker<C: DbConnection>(
    mut clients: Vec<ClientState<C>>,
    scripts: &[ScriptFile],
    cfg: &WorkerConfig,
    mut rng: Lcg48,
    termination: &TerminationFlag,
    mut logger: Option<Logger>,
    mut progress: impl FnMut(&WorkerCounters, f64),
) -> WorkerOutput {
    let start = Instant::now();
    let now_us = || start.elapsed().as_micros() as i64;

    let mut poll = Poll::new().expect("mio poll creation");
    let mut events = Events::with_capacity(clients.len().max(1));
    let mut registered: HashSet<usize> = HashSet::new();
    let mut counters = WorkerCounters::default();
    let mut progress_tracker = cfg.progress_interval_s.map(|_| ProgressTracker::new(0.0));
    let mut next_progress_us = cfg.progress_interval_s.map(|p| (p * 1_000_000.0) as i64);

    while !clients.iter().all(ClientState::is_done) {
        let terminating = termination.is_set();

        // Step 1: build the readable-set and keep socket registration current.
        let mut readable_ids: Vec<usize> = Vec::new();
        let mut to_register: Vec<usize> = Vec::new();
        let mut to_deregister: Vec<usize> = Vec::new();
        for client in &clients {
            let wants_socket = client.awaits_socket(scripts);
            let is_registered = registered.contains(&client.id);
            if wants_socket && !is_registered {
                to_register.push(client.id);
            } else if !wants_socket && is_registered {
                to_deregister.push(client.id);
            }
            if wants_socket {
                readable_ids.push(client.id);
            }
        }
        for id in to_register {
            client_register(&mut clients, id, poll.registry());
            registered.insert(id);
        }
        for id in to_deregister {
            client_deregister(&mut clients, id, poll.registry());
            registered.remove(&id);
        }

        // Step 2: bound min_wait by sleeping clients and meta-ready clients.
        let now = now_us();
        let mut min_wait_us: i64 = i64::MAX;
        let mut has_meta_ready_client = false;
        for client in &clients {
            if client.is_done() {
                continue;
            }
            if client.next_is_meta(scripts) {
                min_wait_us = 0;
                has_meta_ready_client = true;
                break;
            }
            if client.sleeping {
                min_wait_us = min_wait_us.min((client.txn_scheduled_us - now).max(0));
            }
        }
        if readable_ids.is_empty() && !has_meta_ready_client && min_wait_us == i64::MAX {
            // Nothing sleeping, nothing to read, nothing META: every remaining
            // client is ready to be stepped immediately (fresh transaction or
            // about to open a connection).
            min_wait_us = 0;
        } else if !readable_ids.is_empty() {
            // Bound even a pure socket wait: guards against a missed edge-
            // triggered readiness notification wedging the worker forever.
            min_wait_us = min_wait_us.min(HEARTBEAT_US);
        }

        // Step 3: tid 0 bounds the wait by the next progress tick.
        if cfg.tid == 0 {
            if let Some(next) = next_progress_us {
                min_wait_us = min_wait_us.min((next - now).max(0));
            }
        }

        // Step 4: wait.
        let timeout = Duration::from_micros(min_wait_us.max(0) as u64);
        let mut ready_tokens: HashSet<usize> = HashSet::new();
        if !readable_ids.is_empty() {
            match poll.poll(&mut events, Some(timeout)) {
                Ok(()) => {
                    for ev in events.iter() {
                        ready_tokens.insert(ev.token().0);
                    }
                    // A heartbeat timeout (no events at all) falls back to a
                    // direct, non-blocking check of every socket-awaiting
                    // client rather than waiting out another full interval.
                    if ready_tokens.is_empty() {
                        ready_tokens.extend(readable_ids.iter().copied());
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(_) => {}
            }
        } else {
            std::thread::sleep(timeout);
        }

        // Step 5: step every client whose socket is ready, whose next command
        // is META, or whose sleep has elapsed.
        for client in &mut clients {
            if client.is_done() {
                continue;
            }
            let now = now_us();
            let socket_ready = client.awaits_socket(scripts) && ready_tokens.contains(&client.id);
            let meta_ready = client.next_is_meta(scripts);
            let sleep_elapsed = client.sleeping && now >= client.txn_scheduled_us;
            let fresh = !client.awaits_socket(scripts) && !client.sleeping;
            if !(socket_ready || meta_ready || sleep_elapsed || fresh) {
                continue;
            }

            let out = client.step(scripts, &cfg.client, &cfg.conn_params, &mut rng, now_us, terminating);

            counters.conn_time_us += out.conn_time_us;
            if let Some((command_num, elapsed_us)) = out.stmt_latency {
                counters.record_stmt_latency(command_num, elapsed_us);
            }
            if out.skip_events > 0 {
                counters.throttle_latency_skipped += out.skip_events as u64;
                if let Some(log) = logger.as_mut() {
                    for _ in 0..out.skip_events {
                        let entry = LogEntry {
                            client_id: client.id,
                            txn_count: client.txn_count,
                            latency_us: None,
                            file_idx: client.file_idx,
                            now_s: now / 1_000_000,
                            now_us_frac: now % 1_000_000,
                            lag_us: None,
                        };
                        let draw = rng.next_f64();
                        let _ = log.record(&entry, draw);
                    }
                }
            }
            if let Some(txn) = out.completed_txn {
                counters.record_transaction(txn.latency_us, txn.late);
                if let Some(lag) = txn.lag_us {
                    counters.record_lag(lag);
                }
                if let Some(log) = logger.as_mut() {
                    let entry = LogEntry {
                        client_id: client.id,
                        txn_count: client.txn_count,
                        latency_us: Some(txn.latency_us),
                        file_idx: txn.file_idx,
                        now_s: now / 1_000_000,
                        now_us_frac: now % 1_000_000,
                        lag_us: txn.lag_us,
                    };
                    let draw = rng.next_f64();
                    let _ = log.record(&entry, draw);
                }
            }
            if out.aborted {
                tracing::warn!(client_id = client.id, "client aborted after a connection or query error");
            }
            if registered.contains(&client.id) && !client.awaits_socket(scripts) {
                client_deregister_single(client, poll.registry());
                registered.remove(&client.id);
            }
        }

        // Step 6: tid 0 progress reporting.
        if cfg.tid == 0 {
            if let (Some(tracker), Some(next)) = (progress_tracker.as_mut(), next_progress_us) {
                let now = now_us();
                if now >= next {
                    let report = tracker.tick(&counters, now as f64 / 1_000_000.0, cfg.client.rate.is_some());
                    progress(&counters, report.tps);
                    let interval_us = (cfg.progress_interval_s.unwrap() * 1_000_000.0) as i64;
                    let mut advanced = next;
                    while advanced <= now {
                        advanced += interval_us;
                    }
                    next_progress_us = Some(advanced);
                }
            }
        }
    }

    for client in &mut clients {
        if registered.remove(&client.id) {
            client_deregister_single(client, poll.registry());
        }
    }
    if let Some(mut log) = logger {
        let _ = log.finish();
    }

    // Script-runtime errors and permanent aborts are tallied once, off the
    // hot path, from each client's own counters (spec §7).
    counters.err_count = clients.iter().map(|c| c.err_count).sum();
    counters.clients_aborted = clients.iter().filter(|c| c.is_aborted()).count() as u64;

    WorkerOutput { counters }
}

fn client_register<C: DbConnection>(clients: &mut [ClientState<C>], id: usize, registry: &mio::Registry) {
    if let Some(client) = clients.iter_mut().find(|c| c.id == id) {
        client.register(registry, Token(id));
    }
}

fn client_deregister<C: DbConnection>(clients: &mut [ClientState<C>], id: usize, registry: &mio::Registry) {
    if let Some(client) = clients.iter_mut().find(|c| c.id == id) {
        client.deregister(registry);
    }
}

fn client_deregister_single<C: DbConnection>(client: &mut ClientState<C>, registry: &mio::Registry) {
    client.deregister(registry);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MockConnection;
    use crate::script::{parse_script_source, QueryMode};

    fn scripts_with(sql: &str) -> Vec<ScriptFile> {
        let (script, _) = parse_script_source("t", sql, QueryMode::Simple, 0).unwrap();
        vec![script]
    }

    fn conn_params() -> ConnParams {
        ConnParams { host: "localhost".into(), port: 5432, user: "bench".into(), password: None, dbname: "bench".into() }
    }

    #[test]
    fn worker_runs_all_clients_to_completion() {
        let scripts = scripts_with("SELECT 1;");
        let clients: Vec<ClientState<MockConnection>> =
            (0..3).map(|i| ClientState::new(i, 1)).collect();
        let cfg = WorkerConfig {
            tid: 0,
            client: ClientConfig {
                query_mode: QueryMode::Simple,
                target_txn_count: Some(1),
                per_transaction_connections: false,
                per_statement_latency: false,
                rate: None,
            },
            conn_params: conn_params(),
            progress_interval_s: None,
        };
        let rng = Lcg48::from_halves(1, 2, 3);
        let termination = TerminationFlag::new();
        let out = run_worker(clients, &scripts, &cfg, rng, &termination, None, |_, _| {});
        assert_eq!(out.counters.txn_count, 3);
        assert_eq!(out.counters.err_count, 0);
    }

    #[test]
    fn worker_honors_termination_flag_between_transactions() {
        let scripts = scripts_with("SELECT 1;");
        let clients: Vec<ClientState<MockConnection>> = vec![ClientState::new(0, 1)];
        let cfg = WorkerConfig {
            tid: 0,
            client: ClientConfig {
                query_mode: QueryMode::Simple,
                target_txn_count: None,
                per_transaction_connections: false,
                per_statement_latency: false,
                rate: None,
            },
            conn_params: conn_params(),
            progress_interval_s: None,
        };
        let rng = Lcg48::from_halves(4, 5, 6);
        let termination = TerminationFlag::new();
        termination.set();
        let out = run_worker(clients, &scripts, &cfg, rng, &termination, None, |_, _| {});
        assert_eq!(out.counters.txn_count, 1);
    }
}
