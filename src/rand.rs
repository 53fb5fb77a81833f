//! Per-worker-thread random sources (spec §4.3).
//!
//! All draws use a per-worker 48-bit LCG returning a double in `[0,1)`, matching
//! the original `pg_erand48`-based generator in `pgbench.c`: each worker seeds its
//! own `[u16; 3]` state from the coordinator's PRNG, so draws across workers are
//! independent and reproducible from a single run seed.

const LCG_MULT: u64 = 0x5DEECE66D;
const LCG_ADD: u64 = 0xB;
const LCG_MASK: u64 = (1 << 48) - 1;

/// Per-worker PRNG state: three 16-bit halves, as spec §3 `WorkerState::prng_state`.
#[derive(Debug, Clone, Copy)]
pub struct Lcg48 {
    state: u64,
}

impl Lcg48 {
    /// Seeds from three 16-bit halves (as handed out by the coordinator).
    pub fn from_halves(h0: u16, h1: u16, h2: u16) -> Self {
        let seed = (h0 as u64) | ((h1 as u64) << 16) | ((h2 as u64) << 32);
        Self { state: seed & LCG_MASK }
    }

    /// Derives a fresh worker seed from a coordinator-level LCG, matching
    /// `pgbench.c`'s per-thread seeding from the overall `-R`/default random seed.
    pub fn derive(coordinator: &mut Lcg48, tid: usize) -> Self {
        let mut h = [0u16; 3];
        for slot in h.iter_mut() {
            *slot = (coordinator.next_raw() & 0xFFFF) as u16;
        }
        // Perturb with the thread index so identical coordinator states handed to
        // different workers don't collide.
        h[0] ^= (tid as u16).wrapping_mul(0x9E37);
        Self::from_halves(h[0], h[1], h[2])
    }

    fn next_raw(&mut self) -> u64 {
        self.state = (self.state.wrapping_mul(LCG_MULT).wrapping_add(LCG_ADD)) & LCG_MASK;
        self.state
    }

    /// A draw in `[0, 1)`.
    pub fn next_f64(&mut self) -> f64 {
        let r = self.next_raw();
        (r as f64) / ((LCG_MASK + 1) as f64)
    }

    /// Uniform `[min, max]`: `min + floor((max - min + 1) * draw)`.
    pub fn uniform(&mut self, min: i64, max: i64) -> Option<i64> {
        if max < min {
            return None;
        }
        let span = (max - min).checked_add(1)?;
        let draw = self.next_f64();
        min.checked_add((span as f64 * draw) as i64)
    }

    /// Exponential `(min, max, theta)`, `theta > 0`.
    /// `cut = e^{-theta}`, `u = 1 - draw`, `r = -ln(cut + (1-cut)*u) / theta`,
    /// result `min + floor((max - min + 1) * r)`.
    pub fn exponential(&mut self, min: i64, max: i64, theta: f64) -> Option<i64> {
        if max < min || theta <= 0.0 {
            return None;
        }
        let span = (max - min).checked_add(1)? as f64;
        let cut = (-theta).exp();
        let u = 1.0 - self.next_f64();
        let r = -((cut + (1.0 - cut) * u).ln()) / theta;
        min.checked_add((span * r) as i64)
    }

    /// Gaussian `(min, max, theta)`, `theta >= 2.0`.
    /// Box-Muller, rejection-sampled to `theta`; same final `[0,1)` -> `[min,max]`
    /// scaling as `uniform`.
    pub fn gaussian(&mut self, min: i64, max: i64, theta: f64) -> Option<i64> {
        if max < min || theta < 2.0 {
            return None;
        }
        let span = (max - min).checked_add(1)? as f64;
        let z = loop {
            let d1 = 1.0 - self.next_f64();
            let d2 = 1.0 - self.next_f64();
            let z = (-2.0 * d1.ln()).sqrt() * (2.0 * std::f64::consts::PI * d2).sin();
            if z >= -theta && z < theta {
                break z;
            }
        };
        let unit = (z + theta) / (2.0 * theta);
        min.checked_add((span * unit) as i64)
    }

    /// Poisson-ish interarrival draw centered on `center_us`:
    /// `floor(-ln(1 - draw) * center + 0.5)`.
    pub fn poisson(&mut self, center_us: f64) -> i64 {
        let draw = self.next_f64();
        (-((1.0 - draw).ln()) * center_us + 0.5).floor() as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_rejects_bad_range() {
        let mut r = Lcg48::from_halves(1, 2, 3);
        assert!(r.uniform(10, 5).is_none());
    }

    #[test]
    fn uniform_stays_in_range() {
        let mut r = Lcg48::from_halves(11, 22, 33);
        for _ in 0..10_000 {
            let v = r.uniform(1, 100).unwrap();
            assert!((1..=100).contains(&v));
        }
    }

    #[test]
    fn gaussian_rejects_low_theta() {
        let mut r = Lcg48::from_halves(1, 2, 3);
        assert!(r.gaussian(1, 100, 1.0).is_none());
    }

    #[test]
    fn gaussian_stays_in_range_and_centers() {
        let mut r = Lcg48::from_halves(7, 13, 99);
        let n = 200_000;
        let mut sum = 0i64;
        for _ in 0..n {
            let v = r.gaussian(1, 100, 3.0).unwrap();
            assert!((1..=100).contains(&v));
            sum += v;
        }
        let mean = sum as f64 / n as f64;
        assert!((mean - 50.5).abs() < 1.0);
    }

    #[test]
    fn poisson_centers_on_target() {
        let mut r = Lcg48::from_halves(5, 9, 17);
        let n = 200_000;
        let mut sum = 0.0;
        for _ in 0..n {
            sum += r.poisson(1000.0) as f64;
        }
        let mean = sum / n as f64;
        assert!((mean - 1000.0).abs() / 1000.0 < 0.02);
    }

    proptest::proptest! {
        #[test]
        fn uniform_draws_always_in_range(min in -1000i64..1000, span in 0i64..10_000, h0: u16, h1: u16, h2: u16) {
            let max = min + span;
            let mut r = Lcg48::from_halves(h0, h1, h2);
            let v = r.uniform(min, max).unwrap();
            proptest::prop_assert!(v >= min && v <= max);
        }
    }
}
