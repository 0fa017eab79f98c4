//! Per-channel randomized systematic sampling
//!
//! After every accepted record a skip count is drawn uniformly from
//! `[0, 2 * rate - 2]`. Its mean is `rate - 1`, so one record in `rate` is
//! accepted over the long run while the gaps do not lock onto periodic
//! traffic.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[derive(Debug, Clone)]
pub struct SamplingEvaluator {
    rate: u32,
    counter: u32,
    rng: StdRng,
}

impl SamplingEvaluator {
    /// `rate == 0` disables sampling. The generator is seeded once from OS
    /// entropy.
    pub fn new(rate: u32) -> Self {
        Self::with_rng(rate, StdRng::from_entropy())
    }

    /// Deterministic evaluator, for reproducible runs.
    pub fn with_seed(rate: u32, seed: u64) -> Self {
        Self::with_rng(rate, StdRng::seed_from_u64(seed))
    }

    fn with_rng(rate: u32, rng: StdRng) -> Self {
        Self {
            rate,
            counter: 0,
            rng,
        }
    }

    pub fn rate(&self) -> u32 {
        self.rate
    }

    /// Records still to be skipped before the next one is accepted.
    pub fn pending_skips(&self) -> u32 {
        self.counter
    }

    /// Returns `true` when the current record should be accounted.
    pub fn accept(&mut self) -> bool {
        if self.rate == 0 {
            return true;
        }
        if self.counter > 0 {
            self.counter -= 1;
            return false;
        }
        self.counter = if self.rate > 1 {
            self.rng.gen_range(0..=2 * (self.rate - 1))
        } else {
            0
        };
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accepted(eval: &mut SamplingEvaluator, n: usize) -> usize {
        (0..n).filter(|_| eval.accept()).count()
    }

    #[test]
    fn test_rate_zero_accepts_everything() {
        let mut eval = SamplingEvaluator::with_seed(0, 1);
        assert_eq!(accepted(&mut eval, 1000), 1000);
    }

    #[test]
    fn test_rate_one_accepts_everything() {
        let mut eval = SamplingEvaluator::with_seed(1, 1);
        assert_eq!(accepted(&mut eval, 1000), 1000);
    }

    #[test]
    fn test_accept_ratio_converges() {
        for rate in [2u32, 10, 100] {
            let mut eval = SamplingEvaluator::with_seed(rate, 42);
            let n = 1_000_000;
            let got = accepted(&mut eval, n) as f64;
            let expected = n as f64 / f64::from(rate);
            let err = (got - expected).abs() / expected;
            assert!(err < 0.05, "rate {}: got {}, expected {}", rate, got, expected);
        }
    }

    #[test]
    fn test_first_record_is_accepted_then_skips_drawn() {
        let mut eval = SamplingEvaluator::with_seed(5, 7);
        assert!(eval.accept());
        assert!(eval.pending_skips() <= 8);
    }
}
