//! `sqlbench` entry point (spec §6): parse args, validate into a `Config`,
//! then dispatch to either the initialization collaborator or the benchmark
//! coordinator. Exit code 0 on success; 1 on any parse, connection, or fatal
//! runtime error (spec §6 "Exit codes").

use clap::Parser;
use tracing::{error, info};

use sqlbench::cli::{self, Args};
use sqlbench::db::{DbConnection, WireConnection};
use sqlbench::{coordinator, init};

fn main() {
    let args = Args::parse();
    cli::init_logging(args.verbose, args.quiet);

    let cfg = match cli::validate(args) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    };

    let result = if cfg.initialize {
        WireConnection::connect(&cfg.conn_params)
            .map_err(|e| sqlbench::error::BenchError::Connect(e.to_string()))
            .and_then(|mut conn| {
                init::run(&mut conn, &cfg).map_err(|e| sqlbench::error::BenchError::Fatal(e.to_string()))
            })
            .map(|()| {
                info!("initialization complete");
            })
    } else {
        coordinator::run::<WireConnection>(&cfg).map(|report| {
            print_report(&report);
        })
    };

    if let Err(e) = result {
        error!("{e}");
        std::process::exit(1);
    }
}

fn print_report(report: &sqlbench::stats::FinalReport) {
    println!("transaction type: {}", report.transaction_type);
    println!("scaling factor: {}", report.scale);
    println!("query mode: {:?}", report.query_mode);
    println!("number of clients: {}", report.num_clients);
    println!("number of threads: {}", report.num_threads);
    if let Some(expected) = report.expected_txns {
        println!("number of transactions per client: {expected}");
    }
    println!("number of transactions actually processed: {}", report.observed_txns);
    if report.skipped > 0 {
        println!("number of transactions skipped: {} ({:.3}%)", report.skipped, report.skipped_pct);
    }
    if report.late > 0 {
        println!("number of transactions above the latency limit: {} ({:.3}%)", report.late, report.late_pct);
    }
    println!("latency average = {:.3} ms", report.latency_avg_ms);
    println!("latency stddev = {:.3} ms", report.latency_stddev_ms);
    if let Some(lag) = report.avg_lag_ms {
        println!("rate limit schedule lag: avg {lag:.3} ms");
    }
    println!("tps = {:.6} (including connections establishing)", report.tps_including_connect);
    println!("tps = {:.6} (excluding connections establishing)", report.tps_excluding_connect);

    if !report.stmt_latencies.is_empty() {
        let multi_file = report.stmt_latencies.iter().any(|s| s.file_idx != report.stmt_latencies[0].file_idx);
        let mut last_file = usize::MAX;
        for stmt in &report.stmt_latencies {
            if stmt.file_idx != last_file {
                if multi_file {
                    println!("statement latencies in milliseconds, file {}:", stmt.file_idx + 1);
                } else {
                    println!("statement latencies in milliseconds:");
                }
                last_file = stmt.file_idx;
            }
            println!("\t{:.6}\t{}", stmt.avg_ms, stmt.raw_line);
        }
    }
}
