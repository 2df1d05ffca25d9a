//! Single-series running statistics.
//!
//! Welford's recurrence keeps mean and the sum of squared differences (M2)
//! in O(1) memory, so the accumulator can sit on an unbounded tick stream
//! without ever holding history.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OnlineStats {
    count: u64,
    mean: f64,
    /// M2: running sum of squared differences from the mean.
    sum_sq_diff: f64,
}

impl OnlineStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds one observation into the accumulator.
    pub fn update(&mut self, x: f64) {
        self.count += 1;
        let delta = x - self.mean;
        self.mean += delta / self.count as f64;
        let delta2 = x - self.mean;
        self.sum_sq_diff += delta * delta2;
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// Sample variance (n - 1). Zero until two observations exist.
    pub fn variance(&self) -> f64 {
        if self.count < 2 {
            return 0.0;
        }
        // M2 can dip a hair below zero on constant input.
        (self.sum_sq_diff / (self.count - 1) as f64).max(0.0)
    }

    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }

    /// Distance of `x` from the running mean in standard deviations.
    ///
    /// Returns exactly `0.0` while the deviation is zero; that is the
    /// "no signal" value, not an error.
    pub fn z_score(&self, x: f64) -> f64 {
        let std = self.std_dev();
        if std > 0.0 { (x - self.mean) / std } else { 0.0 }
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(500))]
        #[test]
        fn mean_tracks_arithmetic_mean(values in prop::collection::vec(-1e6..1e6f64, 1..200)) {
            let mut s = OnlineStats::new();
            for v in &values {
                s.update(*v);
            }

            let expected = values.iter().sum::<f64>() / values.len() as f64;
            let tol = 1e-9 * expected.abs().max(1.0) * values.len() as f64;
            prop_assert!((s.mean() - expected).abs() <= tol,
                "mean {} != {}", s.mean(), expected);
            prop_assert_eq!(s.count(), values.len() as u64);
            prop_assert!(s.variance() >= 0.0);
        }

        #[test]
        fn order_only_affects_rounding(values in prop::collection::vec(-1e4..1e4f64, 2..100)) {
            let mut forward = OnlineStats::new();
            let mut backward = OnlineStats::new();
            for v in &values {
                forward.update(*v);
            }
            for v in values.iter().rev() {
                backward.update(*v);
            }

            let scale = forward.std_dev().max(1.0);
            prop_assert!((forward.mean() - backward.mean()).abs() <= 1e-9 * scale * values.len() as f64);
            prop_assert!((forward.std_dev() - backward.std_dev()).abs() <= 1e-7 * scale);
        }

        #[test]
        fn z_score_zero_iff_no_deviation(values in prop::collection::vec(-1e3..1e3f64, 0..50), probe in -1e3..1e3f64) {
            let mut s = OnlineStats::new();
            for v in &values {
                s.update(*v);
            }
            if s.std_dev() == 0.0 {
                prop_assert_eq!(s.z_score(probe), 0.0);
            } else {
                prop_assert!(s.z_score(probe).is_finite());
            }
        }
    }
}
