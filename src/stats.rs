//! Aggregate counters (spec §3 `WorkerState`/`AggVals`) and the progress/final
//! report math (spec §4.9). Plain running sums, no cross-worker access: each
//! worker owns one `WorkerCounters` and, if aggregate logging is enabled, one
//! live `AggVals` bucket; the coordinator only reads these after `join`.

/// One open aggregate-log bucket (spec §3 `AggVals`, §4.8 aggregate mode).
#[derive(Debug, Clone, Copy)]
pub struct AggVals {
    pub start_time_s: i64,
    pub cnt: u64,
    pub skipped: u64,
    pub min_lat: i64,
    pub max_lat: i64,
    pub sum_lat: i64,
    pub sum_sq_lat: f64,
    pub min_lag: i64,
    pub max_lag: i64,
    pub sum_lag: i64,
    pub sum_sq_lag: f64,
}

impl AggVals {
    pub fn new(start_time_s: i64) -> Self {
        Self {
            start_time_s,
            cnt: 0,
            skipped: 0,
            min_lat: i64::MAX,
            max_lat: i64::MIN,
            sum_lat: 0,
            sum_sq_lat: 0.0,
            min_lag: i64::MAX,
            max_lag: i64::MIN,
            sum_lag: 0,
            sum_sq_lag: 0.0,
        }
    }

    pub fn record_latency(&mut self, latency_us: i64) {
        self.cnt += 1;
        self.sum_lat += latency_us;
        self.sum_sq_lat += (latency_us as f64) * (latency_us as f64);
        self.min_lat = self.min_lat.min(latency_us);
        self.max_lat = self.max_lat.max(latency_us);
    }

    pub fn record_lag(&mut self, lag_us: i64) {
        self.sum_lag += lag_us;
        self.sum_sq_lag += (lag_us as f64) * (lag_us as f64);
        self.min_lag = self.min_lag.min(lag_us);
        self.max_lag = self.max_lag.max(lag_us);
    }

    pub fn record_skip(&mut self) {
        self.skipped += 1;
    }

    pub fn is_empty(&self) -> bool {
        self.cnt == 0 && self.skipped == 0
    }

    /// A fresh empty bucket opening at `start_time_s`, used when the
    /// aggregate writer has to fast-forward through quiet buckets (spec
    /// §4.8: "open empty buckets until the current bucket contains `now`").
    pub fn reopen(start_time_s: i64) -> Self {
        Self::new(start_time_s)
    }
}

/// Per-worker running counters (spec §3 `WorkerState` aggregated counters),
/// merged by the coordinator only after every worker thread has joined.
#[derive(Debug, Clone, Default)]
pub struct WorkerCounters {
    pub txn_count: u64,
    pub err_count: u64,
    pub latency_sum_us: i64,
    pub latency_sq_sum_us2: f64,
    pub throttle_lag_sum: i64,
    pub throttle_lag_max: i64,
    pub throttle_latency_skipped: u64,
    pub latency_late: u64,
    pub conn_time_us: i64,
    /// Clients permanently removed from the live set by a connection or
    /// query error (spec §7), tallied once a worker's clients all finish.
    pub clients_aborted: u64,
    /// `-r`: per-command `(elapsed_us sum, exec count)`, keyed by
    /// `Command::command_num` (spec §3 `exec_elapsed`/`exec_count`).
    pub stmt_stats: std::collections::BTreeMap<usize, (i64, u64)>,
}

impl WorkerCounters {
    pub fn record_transaction(&mut self, latency_us: i64, late: bool) {
        self.txn_count += 1;
        self.latency_sum_us += latency_us;
        self.latency_sq_sum_us2 += (latency_us as f64) * (latency_us as f64);
        if late {
            self.latency_late += 1;
        }
    }

    pub fn record_lag(&mut self, lag_us: i64) {
        self.throttle_lag_sum += lag_us;
        self.throttle_lag_max = self.throttle_lag_max.max(lag_us);
    }

    /// Folds one command's drained latency into its running sum/count (`-r`,
    /// spec §3 `exec_elapsed`/`exec_count`).
    pub fn record_stmt_latency(&mut self, command_num: usize, elapsed_us: i64) {
        let entry = self.stmt_stats.entry(command_num).or_insert((0, 0));
        entry.0 += elapsed_us;
        entry.1 += 1;
    }

    /// Folds another worker's final counters into this one (used by the
    /// coordinator after all workers have returned — spec §5 "the coordinator
    /// reads worker counters only after join").
    pub fn merge(&mut self, other: &WorkerCounters) {
        self.txn_count += other.txn_count;
        self.err_count += other.err_count;
        self.latency_sum_us += other.latency_sum_us;
        self.latency_sq_sum_us2 += other.latency_sq_sum_us2;
        self.throttle_lag_sum += other.throttle_lag_sum;
        self.throttle_lag_max = self.throttle_lag_max.max(other.throttle_lag_max);
        self.throttle_latency_skipped += other.throttle_latency_skipped;
        self.latency_late += other.latency_late;
        self.conn_time_us += other.conn_time_us;
        self.clients_aborted += other.clients_aborted;
        for (&command_num, &(sum, count)) in &other.stmt_stats {
            let entry = self.stmt_stats.entry(command_num).or_insert((0, 0));
            entry.0 += sum;
            entry.1 += count;
        }
    }

    pub fn avg_latency_ms(&self) -> f64 {
        if self.txn_count == 0 {
            return 0.0;
        }
        (self.latency_sum_us as f64 / self.txn_count as f64) / 1000.0
    }

    pub fn latency_stddev_ms(&self) -> f64 {
        if self.txn_count == 0 {
            return 0.0;
        }
        let n = self.txn_count as f64;
        let mean = self.latency_sum_us as f64 / n;
        let variance = (self.latency_sq_sum_us2 / n - mean * mean).max(0.0);
        variance.sqrt() / 1000.0
    }

    pub fn avg_lag_ms(&self) -> f64 {
        if self.txn_count == 0 {
            return 0.0;
        }
        (self.throttle_lag_sum as f64 / self.txn_count as f64) / 1000.0
    }
}

/// Tracks the previous tick's counters so each progress line (spec §4.9)
/// reports only the delta since the last one.
pub struct ProgressTracker {
    last: WorkerCounters,
    last_time_s: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct ProgressReport {
    pub elapsed_s: f64,
    pub tps: f64,
    pub avg_latency_ms: f64,
    pub latency_stddev_ms: f64,
    pub avg_lag_ms: Option<f64>,
    pub skipped_since_last: Option<u64>,
}

impl ProgressTracker {
    pub fn new(start_time_s: f64) -> Self {
        Self {
            last: WorkerCounters::default(),
            last_time_s: start_time_s,
        }
    }

    pub fn tick(&mut self, current: &WorkerCounters, now_s: f64, rate_limited: bool) -> ProgressReport {
        let dt = (now_s - self.last_time_s).max(f64::EPSILON);
        let dtxn = current.txn_count.saturating_sub(self.last.txn_count);
        let dlat_sum = current.latency_sum_us - self.last.latency_sum_us;
        let dlat_sq = current.latency_sq_sum_us2 - self.last.latency_sq_sum_us2;
        let dskip = current
            .throttle_latency_skipped
            .saturating_sub(self.last.throttle_latency_skipped);
        let dlag_sum = current.throttle_lag_sum - self.last.throttle_lag_sum;

        let (avg_latency_ms, latency_stddev_ms) = if dtxn > 0 {
            let n = dtxn as f64;
            let mean = dlat_sum as f64 / n;
            let variance = (dlat_sq / n - mean * mean).max(0.0);
            (mean / 1000.0, variance.sqrt() / 1000.0)
        } else {
            (0.0, 0.0)
        };

        let report = ProgressReport {
            elapsed_s: now_s,
            tps: dtxn as f64 / dt,
            avg_latency_ms,
            latency_stddev_ms,
            avg_lag_ms: rate_limited.then(|| {
                if dtxn > 0 {
                    (dlag_sum as f64 / dtxn as f64) / 1000.0
                } else {
                    0.0
                }
            }),
            skipped_since_last: rate_limited.then_some(dskip),
        };

        self.last = current.clone();
        self.last_time_s = now_s;
        report
    }
}

/// One command's averaged drained latency (`-r`), in the order the original
/// prints them: grouped by script file, then by position within the file.
#[derive(Debug, Clone)]
pub struct StmtLatency {
    pub file_idx: usize,
    pub raw_line: String,
    pub avg_ms: f64,
}

/// The end-of-run summary (spec §4.9 "Final report").
#[derive(Debug, Clone)]
pub struct FinalReport {
    pub transaction_type: String,
    pub scale: i64,
    pub query_mode: crate::script::QueryMode,
    pub num_clients: usize,
    pub num_threads: usize,
    pub expected_txns: Option<u64>,
    pub observed_txns: u64,
    pub skipped: u64,
    pub skipped_pct: f64,
    pub late: u64,
    pub late_pct: f64,
    pub latency_avg_ms: f64,
    pub latency_stddev_ms: f64,
    pub avg_lag_ms: Option<f64>,
    pub tps_including_connect: f64,
    pub tps_excluding_connect: f64,
    /// Empty unless `-r` was given; see `StmtLatency`.
    pub stmt_latencies: Vec<StmtLatency>,
}

#[allow(clippy::too_many_arguments)]
pub fn build_final_report(
    transaction_type: impl Into<String>,
    scale: i64,
    query_mode: crate::script::QueryMode,
    num_clients: usize,
    num_threads: usize,
    expected_txns: Option<u64>,
    counters: &WorkerCounters,
    elapsed_s: f64,
    rate_limited: bool,
    scripts: &[crate::script::ScriptFile],
) -> FinalReport {
    let observed = counters.txn_count;
    let denom = (observed + counters.throttle_latency_skipped).max(1) as f64;
    let conn_time_s = counters.conn_time_us as f64 / 1_000_000.0;
    let excl_elapsed = (elapsed_s - conn_time_s).max(f64::EPSILON);

    let mut stmt_latencies = Vec::new();
    for (file_idx, script) in scripts.iter().enumerate() {
        for command in &script.commands {
            if let Some(&(sum_us, count)) = counters.stmt_stats.get(&command.command_num) {
                if count > 0 {
                    stmt_latencies.push(StmtLatency {
                        file_idx,
                        raw_line: command.raw_line.clone(),
                        avg_ms: (sum_us as f64 / count as f64) / 1000.0,
                    });
                }
            }
        }
    }

    FinalReport {
        transaction_type: transaction_type.into(),
        scale,
        query_mode,
        num_clients,
        num_threads,
        expected_txns,
        observed_txns: observed,
        skipped: counters.throttle_latency_skipped,
        skipped_pct: 100.0 * counters.throttle_latency_skipped as f64 / denom,
        late: counters.latency_late,
        late_pct: 100.0 * counters.latency_late as f64 / (observed.max(1) as f64),
        latency_avg_ms: counters.avg_latency_ms(),
        latency_stddev_ms: counters.latency_stddev_ms(),
        avg_lag_ms: rate_limited.then(|| counters.avg_lag_ms()),
        tps_including_connect: observed as f64 / elapsed_s.max(f64::EPSILON),
        tps_excluding_connect: observed as f64 / excl_elapsed,
        stmt_latencies,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::QueryMode;

    #[test]
    fn avg_and_stddev_over_known_samples() {
        let mut c = WorkerCounters::default();
        for lat in [100_000i64, 200_000, 300_000] {
            c.record_transaction(lat, false);
        }
        assert!((c.avg_latency_ms() - 200.0).abs() < 1e-9);
        // population stddev of [100,200,300] (ms) is sqrt(((100)^2+0+(100)^2)/3) = 81.6497
        assert!((c.latency_stddev_ms() - 81.6497).abs() < 1e-2);
    }

    #[test]
    fn merge_sums_and_maxes() {
        let mut a = WorkerCounters {
            txn_count: 5,
            throttle_lag_max: 10,
            ..Default::default()
        };
        let b = WorkerCounters {
            txn_count: 3,
            throttle_lag_max: 40,
            ..Default::default()
        };
        a.merge(&b);
        assert_eq!(a.txn_count, 8);
        assert_eq!(a.throttle_lag_max, 40);
    }

    #[test]
    fn progress_tracker_reports_deltas_only() {
        let mut tracker = ProgressTracker::new(0.0);
        let mut c = WorkerCounters::default();
        c.record_transaction(50_000, false);
        c.record_transaction(50_000, false);
        let r1 = tracker.tick(&c, 1.0, false);
        assert_eq!(r1.tps, 2.0);
        c.record_transaction(50_000, false);
        let r2 = tracker.tick(&c, 2.0, false);
        assert_eq!(r2.tps, 1.0);
    }

    #[test]
    fn final_report_percentages() {
        let mut c = WorkerCounters::default();
        for _ in 0..9 {
            c.record_transaction(10_000, false);
        }
        c.throttle_latency_skipped = 1;
        c.latency_late = 2;
        let report = build_final_report("tpcb-like", 10, QueryMode::Simple, 1, 1, None, &c, 10.0, false, &[]);
        assert_eq!(report.observed_txns, 9);
        assert!((report.skipped_pct - 10.0).abs() < 1e-6);
    }

    #[test]
    fn per_statement_latencies_are_averaged_and_ordered_by_script_position() {
        let (script, _) =
            crate::script::parse_script_source("t", "SELECT 1;\nSELECT 2;", QueryMode::Simple, 0).unwrap();
        let scripts = vec![script];
        let mut c = WorkerCounters::default();
        c.record_stmt_latency(0, 1_000);
        c.record_stmt_latency(0, 3_000);
        c.record_stmt_latency(1, 2_000);
        let report = build_final_report("t", 1, QueryMode::Simple, 1, 1, None, &c, 1.0, false, &scripts);
        assert_eq!(report.stmt_latencies.len(), 2);
        assert!((report.stmt_latencies[0].avg_ms - 2.0).abs() < 1e-9);
        assert!((report.stmt_latencies[1].avg_ms - 2.0).abs() < 1e-9);
    }
}
