//! Summary statistics over a measurement sample, including a bootstrap 95%
//! confidence interval of the mean.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub const DEFAULT_BOOTSTRAP_REPLICATES: usize = 1000;

#[derive(Debug, Clone, PartialEq)]
pub struct SampleSummary {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    /// Sample standard deviation (N-1 denominator).
    pub stddev: f64,
    pub median: f64,
    pub num_samples: usize,
    pub bci95low: f64,
    pub bci95up: f64,
}

/// Summarizes a finite sample, drawing bootstrap resamples from an
/// entropy-seeded RNG. Returns `None` for an empty sample.
pub fn summarize(values: &[f64], replicates: usize) -> Option<SampleSummary> {
    let mut rng = StdRng::from_entropy();
    summarize_with_rng(values, replicates, &mut rng)
}

/// Deterministic variant for tests and reproducible recomputation.
pub fn summarize_with_rng<R: Rng>(
    values: &[f64],
    replicates: usize,
    rng: &mut R,
) -> Option<SampleSummary> {
    if values.is_empty() {
        return None;
    }
    let n = values.len();

    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);

    let mean = values.iter().sum::<f64>() / n as f64;
    let stddev = if n < 2 {
        0.0
    } else {
        let variance =
            values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n as f64 - 1.0);
        variance.sqrt()
    };

    let (bci95low, bci95up) = bootstrap_mean_interval(values, replicates.max(1), rng);

    Some(SampleSummary {
        min: sorted[0],
        max: sorted[n - 1],
        mean,
        stddev,
        median: median_of_sorted(&sorted),
        num_samples: n,
        bci95low,
        bci95up,
    })
}

/// Linear interpolation on the two central order statistics.
fn median_of_sorted(sorted: &[f64]) -> f64 {
    let n = sorted.len();
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    }
}

/// 2.5th/97.5th percentiles (nearest-rank) of the bootstrap distribution of
/// the mean: `replicates` resamples of size |values|, drawn with replacement.
fn bootstrap_mean_interval<R: Rng>(values: &[f64], replicates: usize, rng: &mut R) -> (f64, f64) {
    let n = values.len();
    let mut means = Vec::with_capacity(replicates);
    for _ in 0..replicates {
        let mut sum = 0.0;
        for _ in 0..n {
            sum += values[rng.gen_range(0..n)];
        }
        means.push(sum / n as f64);
    }
    means.sort_by(f64::total_cmp);
    (nearest_rank(&means, 0.025), nearest_rank(&means, 0.975))
}

fn nearest_rank(sorted: &[f64], quantile: f64) -> f64 {
    let idx = ((quantile * sorted.len() as f64).ceil() as usize)
        .saturating_sub(1)
        .min(sorted.len() - 1);
    sorted[idx]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded(values: &[f64], replicates: usize, seed: u64) -> SampleSummary {
        let mut rng = StdRng::seed_from_u64(seed);
        summarize_with_rng(values, replicates, &mut rng).unwrap()
    }

    #[test]
    fn empty_sample_has_no_summary() {
        assert!(summarize(&[], 100).is_none());
    }

    #[test]
    fn constant_sample_collapses_everything() {
        for replicates in [1, 10, 1000] {
            let summary = seeded(&[7.5; 12], replicates, 42);
            assert_eq!(summary.min, 7.5);
            assert_eq!(summary.max, 7.5);
            assert_eq!(summary.mean, 7.5);
            assert_eq!(summary.median, 7.5);
            assert_eq!(summary.stddev, 0.0);
            assert_eq!(summary.bci95low, 7.5);
            assert_eq!(summary.bci95up, 7.5);
            assert_eq!(summary.num_samples, 12);
        }
    }

    #[test]
    fn single_value_sample() {
        let summary = seeded(&[432.2], 1000, 1);
        assert_eq!(summary.mean, 432.2);
        assert_eq!(summary.median, 432.2);
        assert_eq!(summary.min, 432.2);
        assert_eq!(summary.max, 432.2);
        assert_eq!(summary.stddev, 0.0);
        assert_eq!(summary.bci95low, 432.2);
        assert_eq!(summary.bci95up, 432.2);
        assert_eq!(summary.num_samples, 1);
    }

    #[test]
    fn median_interpolates_between_central_order_statistics() {
        let summary = seeded(&[4.0, 1.0, 3.0, 2.0], 10, 3);
        assert_eq!(summary.median, 2.5);

        let summary = seeded(&[5.0, 1.0, 3.0], 10, 3);
        assert_eq!(summary.median, 3.0);
    }

    #[test]
    fn sample_stddev_uses_n_minus_one() {
        // Known case: [100, 105, 110, 115, 120], sample variance = 62.5.
        let summary = seeded(&[100.0, 105.0, 110.0, 115.0, 120.0], 10, 9);
        assert!((summary.mean - 110.0).abs() < 1e-12);
        assert!((summary.stddev - 62.5f64.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn bootstrap_is_deterministic_under_a_fixed_seed() {
        let values = [10.0, 12.0, 9.5, 11.0, 10.5, 13.0, 9.0, 10.8];
        let a = seeded(&values, 1000, 1234);
        let b = seeded(&values, 1000, 1234);
        assert_eq!(a, b);
    }

    #[test]
    fn bootstrap_interval_brackets_the_mean_and_stays_in_range() {
        let values = [10.0, 12.0, 9.5, 11.0, 10.5, 13.0, 9.0, 10.8];
        let summary = seeded(&values, 1000, 7);
        assert!(summary.bci95low <= summary.mean);
        assert!(summary.bci95up >= summary.mean);
        assert!(summary.bci95low >= summary.min);
        assert!(summary.bci95up <= summary.max);
    }

    #[test]
    fn nearest_rank_hits_the_documented_indices() {
        let sorted: Vec<f64> = (1..=1000).map(f64::from).collect();
        assert_eq!(nearest_rank(&sorted, 0.025), 25.0);
        assert_eq!(nearest_rank(&sorted, 0.975), 975.0);
    }
}
