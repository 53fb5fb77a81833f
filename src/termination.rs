//! Process-wide termination flag (spec §2.7, §5, §9): a single shared boolean,
//! set by an optional duration timer and/or Ctrl-C, read by every worker
//! between transactions and during the latency-limit skip loop. Grounded in
//! the teacher's `running: Arc<AtomicBool>` + `ctrlc::set_handler` wiring in
//! `crates/rpglotd/src/main.rs`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::info;

/// The one cross-worker value written after workers start (spec §9 "Global
/// process state"). Cloned cheaply into each worker and into the Ctrl-C
/// handler.
#[derive(Clone)]
pub struct TerminationFlag(Arc<AtomicBool>);

impl TerminationFlag {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Installs a Ctrl-C handler that sets this flag. Failure to install is
    /// logged, not fatal — the run proceeds without graceful Ctrl-C handling.
    pub fn install_ctrlc_handler(&self) {
        let flag = self.clone();
        if let Err(e) = ctrlc::set_handler(move || {
            info!("received interrupt, finishing in-flight transactions");
            flag.set();
        }) {
            tracing::warn!("failed to install Ctrl-C handler: {e}");
        }
    }

    /// Spawns a one-shot background thread that sets the flag after `dur`
    /// elapses (the `-T` duration timer). Returns its join handle so the
    /// coordinator can await it if it wants, though the workers' own exit is
    /// what actually ends the run.
    pub fn spawn_duration_timer(&self, dur: Duration) -> JoinHandle<()> {
        let flag = self.clone();
        std::thread::spawn(move || {
            std::thread::sleep(dur);
            flag.set();
        })
    }
}

impl Default for TerminationFlag {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_unset() {
        let flag = TerminationFlag::new();
        assert!(!flag.is_set());
    }

    #[test]
    fn clone_shares_state() {
        let flag = TerminationFlag::new();
        let other = flag.clone();
        other.set();
        assert!(flag.is_set());
    }

    #[test]
    fn duration_timer_eventually_sets_flag() {
        let flag = TerminationFlag::new();
        let handle = flag.spawn_duration_timer(Duration::from_millis(20));
        handle.join().unwrap();
        assert!(flag.is_set());
    }
}
