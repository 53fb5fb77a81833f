//! Command-line surface (spec §6) and the validation pass that turns raw
//! `Args` into a resolved `Config`, in the style of the teacher's
//! `rpglotd::Args` + `parse_size`/rotation-config validation.

use clap::Parser;
use tracing::Level;
use tracing_subscriber::EnvFilter;

use crate::db::ConnParams;
use crate::error::BenchError;
use crate::logfile::LogMode;
use crate::script::QueryMode;

/// A TPC-B-like relational database benchmarking driver.
#[derive(Parser, Debug)]
#[command(name = "sqlbench", about = "A TPC-B-like relational database benchmarking driver", version)]
pub struct Args {
    /// Number of simulated clients.
    #[arg(short = 'c', long = "clients", default_value_t = 1)]
    pub clients: usize,

    /// Number of worker threads.
    #[arg(short = 'j', long = "jobs", default_value_t = 1)]
    pub jobs: usize,

    /// Number of transactions per client. Mutually exclusive with `-T`.
    #[arg(short = 't', long = "transactions")]
    pub transactions: Option<u64>,

    /// Benchmark duration in seconds. Mutually exclusive with `-t`.
    #[arg(short = 'T', long = "duration")]
    pub duration: Option<u64>,

    /// Query submission protocol.
    #[arg(short = 'M', long = "protocol", default_value = "simple")]
    pub protocol: String,

    /// Script file(s); may repeat, up to 128 (spec §6).
    #[arg(short = 'f', long = "file")]
    pub file: Vec<String>,

    /// Define a startup variable as `name=value`; may repeat.
    #[arg(short = 'D', long = "define")]
    pub define: Vec<String>,

    /// Report per-statement latency timing.
    #[arg(short = 'r', long = "per-statement-latency")]
    pub per_statement_latency: bool,

    /// Target transaction rate in transactions per second.
    #[arg(short = 'R', long = "rate")]
    pub rate: Option<f64>,

    /// Latency limit in milliseconds; late transactions are skipped.
    #[arg(short = 'L', long = "latency-limit")]
    pub latency_limit_ms: Option<f64>,

    /// Write a per-worker transaction log.
    #[arg(short = 'l', long = "log")]
    pub log: bool,

    /// Raw-log sampling rate in `(0, 1]`; requires `-l`.
    #[arg(long = "sampling-rate")]
    pub sampling_rate: Option<f64>,

    /// Aggregate-log bucket width in seconds; requires `-l`, requires
    /// `duration % interval == 0`.
    #[arg(long = "aggregate-interval")]
    pub aggregate_interval: Option<i64>,

    /// Print a progress line this often, in seconds.
    #[arg(short = 'P', long = "progress")]
    pub progress: Option<u64>,

    /// Open and close a fresh connection for every transaction.
    #[arg(short = 'C', long = "connect")]
    pub per_transaction_connection: bool,

    /// Use the simple-update built-in (skip teller/branch updates).
    #[arg(short = 'N', long = "skip-some-updates")]
    pub skip_some_updates: bool,

    /// Use the select-only built-in.
    #[arg(short = 'S', long = "select-only")]
    pub select_only: bool,

    /// Scale factor; read from the server when omitted and not initializing.
    #[arg(short = 's', long = "scale")]
    pub scale: Option<i64>,

    /// Run the initialization-mode collaborator instead of benchmarking.
    #[arg(short = 'i', long = "initialize")]
    pub initialize: bool,

    /// Init-steps letters (`d`,`t`,`g`,`G`,`v`,`p`,`f`); default is all.
    #[arg(long = "init-steps")]
    pub init_steps: Option<String>,

    /// Skip primary/foreign key creation during initialization.
    #[arg(long = "no-index")]
    pub no_index: bool,
    #[arg(long = "no-fk")]
    pub no_fk: bool,

    #[arg(short = 'h', long = "host", default_value = "localhost")]
    pub host: String,
    #[arg(short = 'p', long = "port", default_value_t = 5432)]
    pub port: u16,
    #[arg(short = 'U', long = "username", default_value = "postgres")]
    pub username: String,
    #[arg(long = "password")]
    pub password: Option<String>,
    #[arg(long = "dbname", default_value = "postgres")]
    pub dbname: String,

    /// Increase logging verbosity (`-v` debug, `-vv` trace).
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Quiet mode: only errors.
    #[arg(short = 'q', long = "quiet")]
    pub quiet: bool,
}

/// Source of the scripts a run executes: either file paths or a built-in.
#[derive(Debug, Clone)]
pub enum ScriptSource {
    Files(Vec<String>),
    Builtin(crate::script::BuiltinScript),
}

/// The fully validated, resolved runtime configuration (SPEC_FULL.md §3
/// addendum `Config`).
#[derive(Debug, Clone)]
pub struct Config {
    pub clients: usize,
    pub jobs: usize,
    pub target_txn_count: Option<u64>,
    pub duration_s: Option<u64>,
    pub query_mode: QueryMode,
    pub scripts: ScriptSource,
    pub defines: Vec<(String, String)>,
    pub per_statement_latency: bool,
    pub rate_tps: Option<f64>,
    pub latency_limit_us: Option<i64>,
    pub log_mode: Option<LogMode>,
    pub progress_interval_s: Option<u64>,
    pub per_transaction_connection: bool,
    pub scale: Option<i64>,
    pub initialize: bool,
    pub init_steps: String,
    pub no_index: bool,
    pub no_fk: bool,
    pub conn_params: ConnParams,
}

/// Validates raw CLI args into a `Config` (spec §7 "Configuration errors...
/// fatal at startup").
pub fn validate(args: Args) -> Result<Config, BenchError> {
    if args.transactions.is_some() && args.duration.is_some() {
        return Err(BenchError::Config("-t and -T are mutually exclusive".into()));
    }
    if args.clients == 0 {
        return Err(BenchError::Config("-c must be at least 1".into()));
    }
    if args.jobs == 0 {
        return Err(BenchError::Config("-j must be at least 1".into()));
    }
    if args.jobs > args.clients {
        return Err(BenchError::Config("-j cannot exceed -c".into()));
    }

    let query_mode = match args.protocol.as_str() {
        "simple" => QueryMode::Simple,
        "extended" => QueryMode::Extended,
        "prepared" => QueryMode::Prepared,
        other => return Err(BenchError::Config(format!("unknown -M protocol '{other}'"))),
    };

    let builtin_count = [args.skip_some_updates, args.select_only].iter().filter(|b| **b).count();
    if builtin_count > 1 {
        return Err(BenchError::Config("-N and -S are mutually exclusive".into()));
    }
    if !args.file.is_empty() && builtin_count > 0 {
        return Err(BenchError::Config("-f cannot be combined with -N/-S".into()));
    }
    if args.file.len() > 128 {
        return Err(BenchError::Config("at most 128 -f script files are allowed".into()));
    }
    let scripts = if !args.file.is_empty() {
        ScriptSource::Files(args.file.clone())
    } else if args.skip_some_updates {
        ScriptSource::Builtin(crate::script::BuiltinScript::SimpleUpdate)
    } else if args.select_only {
        ScriptSource::Builtin(crate::script::BuiltinScript::SelectOnly)
    } else {
        ScriptSource::Builtin(crate::script::BuiltinScript::TpcbLike)
    };

    let mut defines = Vec::new();
    for d in &args.define {
        let (name, value) = d
            .split_once('=')
            .ok_or_else(|| BenchError::Config(format!("-D '{d}' is not in name=value form")))?;
        defines.push((name.to_string(), value.to_string()));
    }

    if args.rate.is_some_and(|r| r <= 0.0) {
        return Err(BenchError::Config("-R must be positive".into()));
    }
    if args.latency_limit_ms.is_some() && args.rate.is_none() {
        return Err(BenchError::Config("-L requires -R".into()));
    }
    let latency_limit_us = args.latency_limit_ms.map(|ms| (ms * 1000.0) as i64);

    if args.sampling_rate.is_some() && !args.log {
        return Err(BenchError::Config("--sampling-rate requires -l".into()));
    }
    if args.aggregate_interval.is_some() && !args.log {
        return Err(BenchError::Config("--aggregate-interval requires -l".into()));
    }
    if args.sampling_rate.is_some() && args.aggregate_interval.is_some() {
        return Err(BenchError::Config(
            "--sampling-rate and --aggregate-interval are mutually exclusive".into(),
        ));
    }
    if let Some(sample) = args.sampling_rate
        && !(0.0..=1.0).contains(&sample)
    {
        return Err(BenchError::Config("--sampling-rate must be in (0, 1]".into()));
    }
    if let (Some(interval), Some(duration)) = (args.aggregate_interval, args.duration)
        && interval > 0
        && duration % (interval as u64) != 0
    {
        return Err(BenchError::Config("-T must be a multiple of --aggregate-interval".into()));
    }
    let log_mode = if args.log {
        Some(match args.aggregate_interval {
            Some(interval) => LogMode::Aggregate { interval_s: interval },
            None => LogMode::Raw { sample: args.sampling_rate.unwrap_or(1.0) },
        })
    } else {
        None
    };

    if args.initialize && (args.transactions.is_some() || args.duration.is_some() || args.rate.is_some()) {
        return Err(BenchError::Config("-i cannot be combined with benchmarking-only options".into()));
    }

    let target_txn_count = args.transactions.or(if args.duration.is_none() && !args.initialize {
        Some(10)
    } else {
        None
    });

    Ok(Config {
        clients: args.clients,
        jobs: args.jobs,
        target_txn_count,
        duration_s: args.duration,
        query_mode,
        scripts,
        defines,
        per_statement_latency: args.per_statement_latency,
        rate_tps: args.rate,
        latency_limit_us,
        log_mode,
        progress_interval_s: args.progress,
        per_transaction_connection: args.per_transaction_connection,
        scale: args.scale,
        initialize: args.initialize,
        init_steps: args.init_steps.unwrap_or_else(|| "dtgvpf".to_string()),
        no_index: args.no_index,
        no_fk: args.no_fk,
        conn_params: ConnParams {
            host: args.host,
            port: args.port,
            user: args.username,
            password: args.password,
            dbname: args.dbname,
        },
    })
}

/// Initializes the tracing subscriber (teacher's `init_logging` pattern,
/// `rpglotd/src/main.rs`): `-v`/`-vv`/`-q` select the level, `RUST_LOG` still
/// overrides via `EnvFilter`.
pub fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("sqlbench={level}").parse().unwrap());

    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args() -> Args {
        Args {
            clients: 1,
            jobs: 1,
            transactions: None,
            duration: None,
            protocol: "simple".into(),
            file: vec![],
            define: vec![],
            per_statement_latency: false,
            rate: None,
            latency_limit_ms: None,
            log: false,
            sampling_rate: None,
            aggregate_interval: None,
            progress: None,
            per_transaction_connection: false,
            skip_some_updates: false,
            select_only: false,
            scale: None,
            initialize: false,
            init_steps: None,
            no_index: false,
            no_fk: false,
            host: "localhost".into(),
            port: 5432,
            username: "bench".into(),
            password: None,
            dbname: "bench".into(),
            verbose: 0,
            quiet: false,
        }
    }

    #[test]
    fn transactions_and_duration_are_mutually_exclusive() {
        let mut args = base_args();
        args.transactions = Some(10);
        args.duration = Some(5);
        assert!(validate(args).is_err());
    }

    #[test]
    fn jobs_cannot_exceed_clients() {
        let mut args = base_args();
        args.clients = 1;
        args.jobs = 2;
        assert!(validate(args).is_err());
    }

    #[test]
    fn latency_limit_requires_rate() {
        let mut args = base_args();
        args.latency_limit_ms = Some(10.0);
        assert!(validate(args).is_err());
    }

    #[test]
    fn sampling_rate_requires_log_flag() {
        let mut args = base_args();
        args.sampling_rate = Some(0.5);
        assert!(validate(args).is_err());
    }

    #[test]
    fn select_only_picks_the_builtin_script() {
        let mut args = base_args();
        args.select_only = true;
        let cfg = validate(args).unwrap();
        assert!(matches!(cfg.scripts, ScriptSource::Builtin(crate::script::BuiltinScript::SelectOnly)));
    }

    #[test]
    fn defines_are_split_on_equals() {
        let mut args = base_args();
        args.define = vec!["foo=bar".into()];
        let cfg = validate(args).unwrap();
        assert_eq!(cfg.defines, vec![("foo".to_string(), "bar".to_string())]);
    }

    #[test]
    fn default_run_targets_ten_transactions() {
        let args = base_args();
        let cfg = validate(args).unwrap();
        assert_eq!(cfg.target_txn_count, Some(10));
    }
}
