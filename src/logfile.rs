//! Per-worker transaction log (spec §4.8). Raw mode writes one line per
//! completed or skipped transaction; aggregate mode buckets them into
//! `I`-second windows. The two modes are mutually exclusive, matching the
//! worker's own log handle, which owns exactly one writer for its lifetime.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

use crate::stats::AggVals;

#[derive(Debug, Clone)]
pub enum LogMode {
    /// Raw per-transaction lines, optionally sampled with probability `sample`.
    Raw { sample: f64 },
    /// Bucketed aggregate lines, `interval_s` seconds wide.
    Aggregate { interval_s: i64 },
}

/// One entry handed to the logger after a `ClientState::step` reports a
/// completed transaction or a skipped one (spec §4.8's raw-mode line shape).
pub struct LogEntry {
    pub client_id: usize,
    pub txn_count: u64,
    pub latency_us: Option<i64>,
    pub file_idx: usize,
    pub now_s: i64,
    pub now_us_frac: i64,
    pub lag_us: Option<i64>,
}

/// Builds the file name for worker `tid` of process `pid` (spec §4.8: "Each
/// worker owns an independent log file named `pgbench_log.<pid>[.<tid>]`").
/// `tid` is `None` when there is exactly one worker thread.
pub fn log_file_name(dir: &std::path::Path, pid: u32, tid: Option<usize>) -> PathBuf {
    match tid {
        Some(t) => dir.join(format!("pgbench_log.{pid}.{t}")),
        None => dir.join(format!("pgbench_log.{pid}")),
    }
}

pub struct Logger {
    writer: BufWriter<File>,
    mode: LogMode,
    bucket: Option<AggVals>,
}

impl Logger {
    pub fn create(path: &std::path::Path, mode: LogMode) -> io::Result<Self> {
        let file = File::create(path)?;
        Ok(Self { writer: BufWriter::new(file), mode, bucket: None })
    }

    /// Records a completed transaction, using `sample_draw` (a `0.0..1.0`
    /// value from the worker's own PRNG) to decide raw-mode admission.
    pub fn record(&mut self, entry: &LogEntry, sample_draw: f64) -> io::Result<()> {
        match self.mode.clone() {
            LogMode::Raw { sample } => {
                if sample_draw <= sample {
                    self.write_raw(entry)?;
                }
                Ok(())
            }
            LogMode::Aggregate { interval_s } => self.record_aggregate(entry, interval_s),
        }
    }

    fn write_raw(&mut self, entry: &LogEntry) -> io::Result<()> {
        match (entry.latency_us, entry.lag_us) {
            (Some(lat), Some(lag)) => writeln!(
                self.writer,
                "{} {} {} {} {} {} {}",
                entry.client_id, entry.txn_count, lat, entry.file_idx, entry.now_s, entry.now_us_frac, lag
            ),
            (Some(lat), None) => writeln!(
                self.writer,
                "{} {} {} {} {} {}",
                entry.client_id, entry.txn_count, lat, entry.file_idx, entry.now_s, entry.now_us_frac
            ),
            (None, _) => writeln!(
                self.writer,
                "{} {} skipped {} {} {}",
                entry.client_id, entry.txn_count, entry.file_idx, entry.now_s, entry.now_us_frac
            ),
        }
    }

    fn record_aggregate(&mut self, entry: &LogEntry, interval_s: i64) -> io::Result<()> {
        let bucket_start = (entry.now_s / interval_s) * interval_s;
        let needs_flush = match &self.bucket {
            Some(b) => b.start_time_s != bucket_start,
            None => true,
        };
        if needs_flush {
            self.flush_bucket_up_to(bucket_start, interval_s)?;
        }
        let bucket = self.bucket.get_or_insert_with(|| AggVals::new(bucket_start));
        match entry.latency_us {
            Some(lat) => {
                bucket.record_latency(lat);
                if let Some(lag) = entry.lag_us {
                    bucket.record_lag(lag);
                }
            }
            None => bucket.record_skip(),
        }
        Ok(())
    }

    /// Flushes the current bucket (if any) and opens empty buckets until one
    /// starting at `target_start` exists (spec §4.8: "open empty buckets
    /// until the current bucket contains `now`").
    fn flush_bucket_up_to(&mut self, target_start: i64, interval_s: i64) -> io::Result<()> {
        loop {
            match self.bucket.take() {
                Some(b) if b.start_time_s == target_start => {
                    self.bucket = Some(b);
                    return Ok(());
                }
                Some(b) => {
                    self.write_bucket(&b)?;
                    self.bucket = Some(AggVals::reopen(b.start_time_s + interval_s));
                }
                None => {
                    self.bucket = Some(AggVals::reopen(target_start));
                    return Ok(());
                }
            }
        }
    }

    fn write_bucket(&mut self, b: &AggVals) -> io::Result<()> {
        if b.is_empty() {
            return Ok(());
        }
        let min_lat = if b.cnt == 0 { 0 } else { b.min_lat };
        let max_lat = if b.cnt == 0 { 0 } else { b.max_lat };
        if b.sum_lag != 0 || b.min_lag != i64::MAX {
            writeln!(
                self.writer,
                "{} {} {} {} {} {} {} {} {} {} {}",
                b.start_time_s,
                b.cnt,
                b.sum_lat,
                b.sum_sq_lat,
                min_lat,
                max_lat,
                b.sum_lag,
                b.sum_sq_lag,
                b.min_lag,
                b.max_lag,
                b.skipped,
            )
        } else {
            writeln!(
                self.writer,
                "{} {} {} {} {} {} {}",
                b.start_time_s, b.cnt, b.sum_lat, b.sum_sq_lat, min_lat, max_lat, b.skipped,
            )
        }
    }

    /// Flushes any still-open aggregate bucket; called once when the worker
    /// finishes (spec §4.8 implies buckets only flush on rollover or exit).
    pub fn finish(&mut self) -> io::Result<()> {
        if let Some(b) = self.bucket.take() {
            self.write_bucket(&b)?;
        }
        self.writer.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(client_id: usize, txn_count: u64, latency_us: Option<i64>, now_s: i64) -> LogEntry {
        LogEntry { client_id, txn_count, latency_us, file_idx: 0, now_s, now_us_frac: 0, lag_us: None }
    }

    #[test]
    fn file_name_includes_tid_when_given() {
        let dir = tempdir().unwrap();
        assert_eq!(
            log_file_name(dir.path(), 123, Some(2)),
            dir.path().join("pgbench_log.123.2")
        );
        assert_eq!(log_file_name(dir.path(), 123, None), dir.path().join("pgbench_log.123"));
    }

    #[test]
    fn raw_mode_writes_one_line_per_transaction() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log");
        let mut logger = Logger::create(&path, LogMode::Raw { sample: 1.0 }).unwrap();
        logger.record(&entry(0, 1, Some(1000), 10), 0.0).unwrap();
        logger.record(&entry(0, 2, Some(2000), 11), 0.0).unwrap();
        logger.finish().unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);
        assert!(contents.lines().next().unwrap().contains("1000"));
    }

    #[test]
    fn raw_mode_sampling_skips_draws_above_threshold() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log");
        let mut logger = Logger::create(&path, LogMode::Raw { sample: 0.1 }).unwrap();
        logger.record(&entry(0, 1, Some(1000), 10), 0.5).unwrap();
        logger.record(&entry(0, 2, Some(2000), 10), 0.05).unwrap();
        logger.finish().unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 1);
        assert!(contents.contains("2000"));
    }

    #[test]
    fn aggregate_mode_rolls_bucket_on_boundary_crossing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log");
        let mut logger = Logger::create(&path, LogMode::Aggregate { interval_s: 5 }).unwrap();
        logger.record(&entry(0, 1, Some(1000), 0), 0.0).unwrap();
        logger.record(&entry(0, 2, Some(3000), 7), 0.0).unwrap();
        logger.finish().unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("0 1 1000"));
        assert!(lines[1].starts_with("5 1 3000"));
    }

    #[test]
    fn skipped_transaction_records_without_latency() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log");
        let mut logger = Logger::create(&path, LogMode::Raw { sample: 1.0 }).unwrap();
        logger.record(&entry(0, 1, None, 10), 0.0).unwrap();
        logger.finish().unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("skipped"));
    }
}
