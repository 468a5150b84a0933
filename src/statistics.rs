//! Ranking of key hypotheses from a correlation matrix.
//!
//! Every function takes a matrix indexed by `(hypothesis, sample)`. Undefined coefficients
//! ([`UNDEFINED_CORRELATION`]) are skipped.
use itertools::{Itertools, MinMaxResult};
use ndarray::{Array1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

use crate::{
    distinguishers::cpa::UNDEFINED_CORRELATION,
    util::{argmax_abs, argsort_by, max_abs_per_row},
};

/// Peak of the best hypothesis.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GuessStats {
    /// Hypothesis with the largest correlation magnitude
    pub guess: u8,
    /// Correlation coefficient at the peak, signed
    pub peak: f64,
    /// Sample index of the peak
    pub sample: usize,
}

impl GuessStats {
    /// Returns `true` if no coefficient of the matrix was defined.
    pub fn is_undefined(&self) -> bool {
        self.peak.is_nan()
    }
}

/// Find the hypothesis holding the globally largest correlation magnitude.
///
/// Ties are broken by the lowest hypothesis, then by the lowest sample index.
pub fn guess_stats(corr: ArrayView2<f64>) -> GuessStats {
    let mut best = GuessStats {
        guess: 0,
        peak: UNDEFINED_CORRELATION,
        sample: 0,
    };

    for (guess, row) in corr.axis_iter(Axis(0)).enumerate() {
        let Some((sample, peak)) = argmax_abs(row) else {
            continue;
        };
        if best.is_undefined() || peak.abs() > best.peak.abs() {
            best = GuessStats {
                guess: guess as u8,
                peak,
                sample,
            };
        }
    }

    best
}

/// Compute the minimum and the maximum correlation across hypotheses for every sample.
pub fn guess_envelope(corr: ArrayView2<f64>) -> (Array1<f64>, Array1<f64>) {
    let (min, max): (Vec<f64>, Vec<f64>) = corr
        .axis_iter(Axis(1))
        .map(|column| {
            match column.iter().copied().filter(|x| !x.is_nan()).minmax() {
                MinMaxResult::NoElements => (UNDEFINED_CORRELATION, UNDEFINED_CORRELATION),
                MinMaxResult::OneElement(x) => (x, x),
                MinMaxResult::MinMax(min, max) => (min, max),
            }
        })
        .unzip();

    (Array1::from_vec(min), Array1::from_vec(max))
}

/// Return the sample indices where the leading hypothesis exceeds the runner-up by more than
/// `threshold` in correlation magnitude.
pub fn divergence_indices(corr: ArrayView2<f64>, threshold: f64) -> Vec<usize> {
    corr.axis_iter(Axis(1))
        .enumerate()
        .filter_map(|(sample, column)| {
            let mut magnitudes = column
                .iter()
                .filter(|x| !x.is_nan())
                .map(|x| x.abs())
                .sorted_by(|a, b| b.total_cmp(a));
            let first = magnitudes.next()?;
            let second = magnitudes.next()?;
            (first - second > threshold).then_some(sample)
        })
        .collect()
}

/// Return the largest correlation magnitude of each hypothesis.
pub fn max_corr(corr: ArrayView2<f64>) -> Array1<f64> {
    max_abs_per_row(corr)
}

/// Rank hypotheses by decreasing peak magnitude. Hypotheses without any defined coefficient come
/// last.
pub fn rank(corr: ArrayView2<f64>) -> Array1<usize> {
    let max_corr = max_corr(corr)
        .mapv(|x| if x.is_nan() { f64::NEG_INFINITY } else { x })
        .to_vec();

    Array1::from_vec(argsort_by(&max_corr, |a, b| b.total_cmp(a)))
}

/// Guesses of the attacked bytes after a given number of traces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub num_traces: usize,
    /// Attacked byte positions and their guess
    pub guesses: Vec<(usize, GuessStats)>,
}

/// Tracks how guesses evolve as traces are accumulated.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Statistics {
    history: Vec<Snapshot>,
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the guesses obtained after `num_traces` traces.
    pub fn update(&mut self, num_traces: usize, guesses: Vec<(usize, GuessStats)>) {
        self.history.push(Snapshot {
            num_traces,
            guesses,
        });
    }

    pub fn clear(&mut self) {
        self.history.clear();
    }

    pub fn history(&self) -> &[Snapshot] {
        &self.history
    }

    pub fn last(&self) -> Option<&Snapshot> {
        self.history.last()
    }

    /// Return the number of traces from which every byte guess stopped changing.
    pub fn stable_since(&self) -> Option<usize> {
        let last = self.history.last()?;
        let same = |snapshot: &Snapshot| {
            snapshot
                .guesses
                .iter()
                .map(|(byte, stats)| (byte, stats.guess))
                .eq(last.guesses.iter().map(|(byte, stats)| (byte, stats.guess)))
        };

        self.history
            .iter()
            .rev()
            .take_while(|snapshot| same(*snapshot))
            .last()
            .map(|snapshot| snapshot.num_traces)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array2, array};

    #[test]
    fn test_guess_stats() {
        let corr = array![[0.1, -0.2, 0.3], [0.0, -0.8, 0.1], [0.5, 0.2, f64::NAN]];
        assert_eq!(
            guess_stats(corr.view()),
            GuessStats {
                guess: 1,
                peak: -0.8,
                sample: 1
            }
        );
    }

    #[test]
    fn test_guess_stats_tie() {
        let mut corr = Array2::from_elem((256, 4), 0.1);
        corr[[200, 2]] = 0.9;
        corr[[17, 3]] = -0.9;
        corr[[42, 0]] = 0.9;

        for _ in 0..3 {
            let stats = guess_stats(corr.view());
            assert_eq!(stats.guess, 17);
            assert_eq!(stats.sample, 3);
        }
    }

    #[test]
    fn test_guess_stats_undefined() {
        let corr = Array2::from_elem((256, 4), UNDEFINED_CORRELATION);
        let stats = guess_stats(corr.view());
        assert!(stats.is_undefined());
        assert_eq!(stats.guess, 0);
    }

    #[test]
    fn test_guess_envelope() {
        let corr = array![[0.1, -0.2, f64::NAN], [0.4, 0.3, f64::NAN], [-0.5, 0.0, 0.2]];
        let (min, max) = guess_envelope(corr.view());
        assert_eq!(min, array![-0.5, -0.2, 0.2]);
        assert_eq!(max, array![0.4, 0.3, 0.2]);
    }

    #[test]
    fn test_divergence_indices() {
        let corr = array![[0.9, 0.3, 0.2], [0.1, -0.35, 0.9], [0.2, 0.0, -0.85]];
        assert_eq!(divergence_indices(corr.view(), 0.5), vec![0]);
        assert_eq!(divergence_indices(corr.view(), 0.01), vec![0, 1, 2]);
    }

    #[test]
    fn test_rank() {
        let corr = array![[0.1, 0.2], [f64::NAN, f64::NAN], [-0.9, 0.0], [0.2, 0.0]];
        assert_eq!(rank(corr.view()), array![2, 0, 3, 1]);
    }

    #[test]
    fn test_stable_since() {
        let stats = |guess| GuessStats {
            guess,
            peak: 0.5,
            sample: 0,
        };
        let mut statistics = Statistics::new();
        assert_eq!(statistics.stable_since(), None);

        statistics.update(10, vec![(0, stats(1)), (1, stats(2))]);
        statistics.update(20, vec![(0, stats(3)), (1, stats(2))]);
        statistics.update(30, vec![(0, stats(3)), (1, stats(2))]);
        assert_eq!(statistics.stable_since(), Some(20));

        statistics.clear();
        assert!(statistics.history().is_empty());
    }
}
