//! Ties the rest of the crate into a single run (spec §2 dataflow, §5
//! concurrency model): parses scripts, splits clients across worker threads,
//! spawns and joins them, merges their counters, and prints the final report.
//! Grounded in the teacher's `main.rs` top-level wiring: build config, spawn
//! collectors, join, render — just one flat function here instead of a
//! collector-per-target fan-out.

use std::sync::Arc;

use tracing::info;

use crate::cli::{Config, ScriptSource};
use crate::client::{ClientConfig, ClientState, RateConfig};
use crate::db::{ConnParams, DbConnection};
use crate::error::BenchError;
use crate::logfile::{log_file_name, LogMode, Logger};
use crate::rand::Lcg48;
use crate::script::{builtin_script_source, parse_script_source, BuiltinScript, ScriptFile};
use crate::stats::{build_final_report, FinalReport, WorkerCounters};
use crate::termination::TerminationFlag;
use crate::throttle::per_worker_delay_us;
use crate::worker::{run_worker, WorkerConfig};

/// Reads and parses every script named by `cfg.scripts`, either from disk
/// (`-f`) or from the matching built-in source text (spec §4.1 addendum).
pub fn load_scripts(cfg: &Config) -> Result<Vec<ScriptFile>, BenchError> {
    let sources: Vec<(String, String)> = match &cfg.scripts {
        ScriptSource::Files(paths) => paths
            .iter()
            .map(|p| {
                std::fs::read_to_string(p)
                    .map(|s| (p.clone(), s))
                    .map_err(|e| BenchError::Fatal(format!("reading script {p}: {e}")))
            })
            .collect::<Result<_, _>>()?,
        ScriptSource::Builtin(b) => vec![(b.file_name().to_string(), builtin_script_source(*b).to_string())],
    };

    let mut scripts = Vec::with_capacity(sources.len());
    let mut command_num = 0;
    for (name, source) in &sources {
        let (script, next) = parse_script_source(name, source, cfg.query_mode, command_num)?;
        command_num = next;
        scripts.push(script);
    }
    Ok(scripts)
}

/// One-shot `select count(*) from pgbench_branches` used to recover the scale
/// factor when neither `-i` nor `-s` was given (SPEC_FULL.md §6 addendum).
pub fn bootstrap_scale<C: DbConnection>(conn_params: &ConnParams) -> Result<i64, BenchError> {
    let mut conn = C::connect(conn_params).map_err(|e| BenchError::Connect(e.to_string()))?;
    let result = conn
        .blocking_query("select count(*) from pgbench_branches")
        .map_err(|e| BenchError::Connect(e.to_string()))?;
    result
        .scalar
        .ok_or_else(|| BenchError::Fatal("could not read scale from pgbench_branches".into()))
}

/// Splits `clients` ids as evenly as possible across `jobs` workers, mirroring
/// the original driver's `nclients / nthreads` with the remainder spread over
/// the first few threads (spec §5 "a worker owns a contiguous share of the
/// client ids").
fn split_clients(clients: usize, jobs: usize) -> Vec<usize> {
    let base = clients / jobs;
    let extra = clients % jobs;
    (0..jobs).map(|j| base + usize::from(j < extra)).collect()
}

/// Builds every per-worker `Logger`, named `pgbench_log.<pid>[.<tid>]` (spec
/// §4.8); `tid` is omitted from the name when there is exactly one worker.
fn make_logger(mode: &LogMode, pid: u32, tid: usize, jobs: usize) -> Result<Logger, BenchError> {
    let path = log_file_name(std::path::Path::new("."), pid, (jobs > 1).then_some(tid));
    Logger::create(&path, mode.clone()).map_err(|e| BenchError::Fatal(format!("opening {}: {e}", path.display())))
}

/// Runs the full benchmark described by `cfg` and returns the final report.
pub fn run<C: DbConnection + 'static>(cfg: &Config) -> Result<FinalReport, BenchError> {
    let scripts = Arc::new(load_scripts(cfg)?);

    let scale = if cfg.scale.is_some() {
        cfg.scale.unwrap()
    } else {
        bootstrap_scale::<C>(&cfg.conn_params)?
    };
    info!(scale, clients = cfg.clients, jobs = cfg.jobs, "starting benchmark run");

    let rate_cfg = cfg.rate_tps.map(|tps| RateConfig {
        per_worker_delay_us: per_worker_delay_us(tps, cfg.jobs),
        latency_limit_us: cfg.latency_limit_us,
    });
    let client_cfg = ClientConfig {
        query_mode: cfg.query_mode,
        target_txn_count: cfg.target_txn_count,
        per_transaction_connections: cfg.per_transaction_connection,
        per_statement_latency: cfg.per_statement_latency,
        rate: rate_cfg,
    };

    let termination = TerminationFlag::new();
    termination.install_ctrlc_handler();
    if let Some(dur) = cfg.duration_s {
        termination.spawn_duration_timer(std::time::Duration::from_secs(dur));
    }

    let per_worker_counts = split_clients(cfg.clients, cfg.jobs);
    let pid = std::process::id();
    let mut coordinator_rng = Lcg48::from_halves(
        (pid & 0xFFFF) as u16,
        ((pid >> 16) & 0xFFFF) as u16,
        0x5A5A,
    );

    let mut next_client_id = 0usize;
    let mut handles = Vec::with_capacity(cfg.jobs);
    let start = std::time::Instant::now();

    for (tid, &count) in per_worker_counts.iter().enumerate() {
        let clients: Vec<ClientState<C>> = (0..count)
            .map(|_| {
                let id = next_client_id;
                next_client_id += 1;
                let mut client = ClientState::new(id, scale);
                for (name, value) in &cfg.defines {
                    client.variables.set(name.clone(), value.clone());
                }
                client
            })
            .collect();

        let logger = match &cfg.log_mode {
            Some(mode) => Some(make_logger(mode, pid, tid, cfg.jobs)?),
            None => None,
        };

        let worker_cfg = WorkerConfig {
            tid,
            client: client_cfg.clone(),
            conn_params: cfg.conn_params.clone(),
            progress_interval_s: cfg.progress_interval_s.map(|s| s as f64),
        };
        let rng = Lcg48::derive(&mut coordinator_rng, tid);
        let scripts = Arc::clone(&scripts);
        let termination = termination.clone();

        handles.push(std::thread::spawn(move || {
            run_worker(clients, &scripts, &worker_cfg, rng, &termination, logger, |counters, tps| {
                if tid == 0 {
                    info!(
                        txn_count = counters.txn_count,
                        tps, err_count = counters.err_count, "progress"
                    );
                }
            })
        }));
    }

    let mut totals = WorkerCounters::default();
    for handle in handles {
        let output = handle.join().map_err(|_| BenchError::Fatal("a worker thread panicked".into()))?;
        totals.merge(&output.counters);
    }

    let elapsed_s = start.elapsed().as_secs_f64();
    let transaction_type = match &cfg.scripts {
        ScriptSource::Files(paths) if paths.len() == 1 => paths[0].clone(),
        ScriptSource::Files(_) => "multiple scripts".to_string(),
        ScriptSource::Builtin(b) => b.file_name().to_string(),
    };

    let report = build_final_report(
        transaction_type,
        scale,
        cfg.query_mode,
        cfg.clients,
        cfg.jobs,
        cfg.target_txn_count,
        &totals,
        elapsed_s,
        cfg.rate_tps.is_some(),
        &scripts,
    );

    if totals.clients_aborted > 0 {
        tracing::warn!(clients_aborted = totals.clients_aborted, "some clients aborted during the run");
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MockConnection;

    fn base_cfg() -> Config {
        Config {
            clients: 4,
            jobs: 2,
            target_txn_count: Some(1),
            duration_s: None,
            query_mode: crate::script::QueryMode::Simple,
            scripts: ScriptSource::Builtin(BuiltinScript::SelectOnly),
            defines: vec![],
            per_statement_latency: false,
            rate_tps: None,
            latency_limit_us: None,
            log_mode: None,
            progress_interval_s: None,
            per_transaction_connection: false,
            scale: Some(1),
            initialize: false,
            init_steps: "dtgvpf".to_string(),
            no_index: false,
            no_fk: false,
            conn_params: ConnParams {
                host: "mock".into(),
                port: 0,
                user: "u".into(),
                password: None,
                dbname: "d".into(),
            },
        }
    }

    #[test]
    fn split_clients_spreads_remainder_over_first_workers() {
        assert_eq!(split_clients(10, 3), vec![4, 3, 3]);
        assert_eq!(split_clients(4, 4), vec![1, 1, 1, 1]);
        assert_eq!(split_clients(4, 2), vec![2, 2]);
    }

    #[test]
    fn end_to_end_run_against_mock_reaches_target_txn_count() {
        let cfg = base_cfg();
        let report = run::<MockConnection>(&cfg).unwrap();
        assert_eq!(report.observed_txns, 4);
        assert_eq!(report.num_clients, 4);
        assert_eq!(report.num_threads, 2);
    }

    #[test]
    fn single_client_single_worker_run_completes() {
        let mut cfg = base_cfg();
        cfg.clients = 1;
        cfg.jobs = 1;
        cfg.defines = vec![("foo".to_string(), "42".to_string())];
        let report = run::<MockConnection>(&cfg).unwrap();
        assert_eq!(report.observed_txns, 1);
        assert_eq!(report.num_threads, 1);
    }
}
