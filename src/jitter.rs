//! Randomized spreading of retry delays.
//!
//! `Proportional(f)` draws uniformly from `[d*(1-f), d*(1+f)]` at millisecond precision, so
//! tenants that fail together do not retry in lockstep. The queue uses `f = 0.3`.
//!
//! Deterministic RNGs can be injected through [`Jitter::apply_with_rng`].

use rand::{rng, Rng};
use std::time::Duration;

/// Jitter strategy for backoff delays.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Jitter {
    /// Use the backoff delay exactly.
    None,
    /// Uniform within `±fraction` of the delay.
    Proportional(f64),
}

impl Jitter {
    /// `±fraction` jitter; `fraction` must lie in `[0, 1]`.
    pub fn proportional(fraction: f64) -> Result<Self, &'static str> {
        if !fraction.is_finite() || !(0.0..=1.0).contains(&fraction) {
            return Err("jitter fraction must be within [0, 1]");
        }
        Ok(Jitter::Proportional(fraction))
    }

    pub fn apply(&self, delay: Duration) -> Duration {
        self.apply_with_rng(delay, &mut rng())
    }

    pub fn apply_with_rng<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        match *self {
            Jitter::None => delay,
            Jitter::Proportional(fraction) => {
                let millis = delay.as_millis().min(u64::MAX as u128) as u64;
                let spread = (millis as f64 * fraction).floor() as u64;
                if spread == 0 {
                    return Duration::from_millis(millis);
                }
                let low = millis.saturating_sub(spread);
                let high = millis.saturating_add(spread);
                Duration::from_millis(rng.random_range(low..=high))
            }
        }
    }

    /// Inclusive bounds a jittered `delay` can fall into.
    pub fn bounds(&self, delay: Duration) -> (Duration, Duration) {
        match *self {
            Jitter::None => (delay, delay),
            Jitter::Proportional(fraction) => {
                let millis = delay.as_millis().min(u64::MAX as u128) as u64;
                let spread = (millis as f64 * fraction).floor() as u64;
                (
                    Duration::from_millis(millis.saturating_sub(spread)),
                    Duration::from_millis(millis.saturating_add(spread)),
                )
            }
        }
    }
}

impl Default for Jitter {
    fn default() -> Self {
        Jitter::Proportional(0.3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn none_is_identity() {
        let d = Duration::from_millis(1234);
        assert_eq!(Jitter::None.apply(d), d);
    }

    #[test]
    fn proportional_stays_in_bounds() {
        let jitter = Jitter::proportional(0.3).unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        let delay = Duration::from_millis(2000);
        let (low, high) = jitter.bounds(delay);
        assert_eq!(low, Duration::from_millis(1400));
        assert_eq!(high, Duration::from_millis(2600));

        let mut saw_below = false;
        let mut saw_above = false;
        for _ in 0..500 {
            let d = jitter.apply_with_rng(delay, &mut rng);
            assert!(d >= low && d <= high, "{:?} outside [{:?}, {:?}]", d, low, high);
            saw_below |= d < delay;
            saw_above |= d > delay;
        }
        assert!(saw_below && saw_above);
    }

    #[test]
    fn tiny_delays_are_not_jittered() {
        let jitter = Jitter::Proportional(0.3);
        assert_eq!(jitter.apply(Duration::from_millis(1)), Duration::from_millis(1));
        assert_eq!(jitter.apply(Duration::ZERO), Duration::ZERO);
    }

    #[test]
    fn rejects_out_of_range_fraction() {
        assert!(Jitter::proportional(1.5).is_err());
        assert!(Jitter::proportional(-0.1).is_err());
        assert!(Jitter::proportional(f64::NAN).is_err());
        assert_eq!(Jitter::proportional(0.0), Ok(Jitter::Proportional(0.0)));
    }
}
