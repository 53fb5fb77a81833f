//! Rate limiter and latency-limit skip logic (spec §4.4).

use crate::rand::Lcg48;

/// Computed once from `-R`/`-j` at startup (spec §4.4: "the coordinator
/// computes `base_delay_us = 10^6 / R` and, for `T` workers, each worker uses
/// `per_worker_delay_us = base_delay_us * T`").
pub fn per_worker_delay_us(target_tps: f64, num_workers: usize) -> f64 {
    (1_000_000.0 / target_tps) * num_workers as f64
}

/// Draws however many Poisson steps are needed to clear a latency-limit
/// backlog, invoking `on_skip` once per skipped slot, and returns the final
/// `throttle_trigger_us` to use as `txn_scheduled_us` (spec §4.4). `now_us` is
/// re-read on every iteration since the loop may outlast a single instant
/// ("terminates when the trigger is no longer late or wall-clock has moved").
pub fn advance_trigger(
    rng: &mut Lcg48,
    per_worker_delay_us: f64,
    latency_limit_us: Option<i64>,
    trigger_us: &mut i64,
    mut now_us: impl FnMut() -> i64,
    mut on_skip: impl FnMut(),
) -> i64 {
    loop {
        let wait = rng.poisson(per_worker_delay_us);
        *trigger_us += wait;
        if let Some(limit) = latency_limit_us {
            if *trigger_us < now_us() - limit {
                on_skip();
                continue;
            }
        }
        break;
    }
    *trigger_us
}

/// Lag accounting for a client waking from a throttled sleep (spec §4.4: "when
/// a sleeping client wakes, `lag = now - txn_scheduled_us`...").
pub fn wake_lag_us(now_us: i64, txn_scheduled_us: i64) -> i64 {
    now_us - txn_scheduled_us
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_worker_delay_scales_with_worker_count() {
        assert_eq!(per_worker_delay_us(100.0, 1), 10_000.0);
        assert_eq!(per_worker_delay_us(100.0, 4), 40_000.0);
    }

    #[test]
    fn advance_trigger_without_latency_limit_draws_once() {
        let mut rng = Lcg48::from_halves(1, 2, 3);
        let mut trigger = 0i64;
        let mut skips = 0;
        let result = advance_trigger(&mut rng, 10_000.0, None, &mut trigger, || 0, || skips += 1);
        assert_eq!(result, trigger);
        assert_eq!(skips, 0);
    }

    #[test]
    fn advance_trigger_counts_skips_until_caught_up() {
        let mut rng = Lcg48::from_halves(7, 8, 9);
        let mut trigger = -1_000_000i64; // far behind
        let mut skips = 0;
        let now = 0i64;
        let result = advance_trigger(&mut rng, 1_000.0, Some(100), &mut trigger, || now, || skips += 1);
        assert!(skips > 0);
        assert!(result >= now - 100);
    }

    #[test]
    fn wake_lag_is_nonnegative_when_late() {
        assert_eq!(wake_lag_us(1_000, 900), 100);
    }
}
