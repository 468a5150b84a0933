//! Traces processing algorithms
use ndarray::{Array1, ArrayView1, ArrayView2, Axis, Zip};
use num_traits::AsPrimitive;
use std::ops::Add;

/// Running per-sample mean and variance of a set of traces.
#[derive(Debug, Clone, PartialEq)]
pub struct MeanVar {
    sum: Array1<f64>,
    sum_squares: Array1<f64>,
    count: usize,
}

impl MeanVar {
    /// Creates an empty processor for traces of `size` samples.
    pub fn new(size: usize) -> Self {
        Self {
            sum: Array1::zeros(size),
            sum_squares: Array1::zeros(size),
            count: 0,
        }
    }

    /// Creates a processor holding every row of `traces`.
    pub fn from_traces<T: AsPrimitive<f64>>(traces: ArrayView2<T>) -> Self {
        let mut mean_var = Self::new(traces.ncols());
        for trace in traces.axis_iter(Axis(0)) {
            mean_var.process(trace);
        }

        mean_var
    }

    /// Adds one trace.
    ///
    /// # Panics
    /// Panics if the length of the trace differs from [`MeanVar::size`].
    pub fn process<T: AsPrimitive<f64>>(&mut self, trace: ArrayView1<T>) {
        Zip::from(&mut self.sum)
            .and(&mut self.sum_squares)
            .and(trace)
            .for_each(|sum, sum_squares, &x| {
                let x: f64 = x.as_();
                *sum += x;
                *sum_squares += x * x;
            });

        self.count += 1;
    }

    /// Per-sample mean, NaN while empty.
    pub fn mean(&self) -> Array1<f64> {
        let count = self.count as f64;

        self.sum.mapv(|sum| sum / count)
    }

    /// Per-sample population variance, NaN while empty.
    pub fn var(&self) -> Array1<f64> {
        let count = self.count as f64;

        Zip::from(&self.sum)
            .and(&self.sum_squares)
            .map_collect(|&sum, &sum_squares| {
                let mean = sum / count;
                let var = sum_squares / count - mean * mean;
                if var < 0. { 0. } else { var }
            })
    }

    /// Number of samples per trace.
    pub fn size(&self) -> usize {
        self.sum.len()
    }

    /// Number of traces added.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Two processors can be merged if they handle traces of the same size.
    pub fn is_compatible_with(&self, other: &Self) -> bool {
        self.size() == other.size()
    }
}

impl Add for MeanVar {
    type Output = Self;

    /// Merge two processors as if every trace had been added to one of them.
    ///
    /// # Panics
    /// Panics if the processors are not compatible (see [`MeanVar::is_compatible_with`]).
    fn add(self, rhs: Self) -> Self::Output {
        assert!(
            self.is_compatible_with(&rhs),
            "merging traces of {} and {} samples",
            self.size(),
            rhs.size()
        );

        Self {
            sum: self.sum + rhs.sum,
            sum_squares: self.sum_squares + rhs.sum_squares,
            count: self.count + rhs.count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::MeanVar;
    use ndarray::array;

    #[test]
    fn test_mean_var() {
        let mut processor = MeanVar::new(3);
        processor.process(array![-7i16, 120, 4].view());
        assert_eq!(processor.mean(), array![-7., 120., 4.]);
        assert_eq!(processor.var(), array![0., 0., 0.]);

        processor.process(array![-3i16, 80, 4].view());
        assert_eq!(processor.mean(), array![-5., 100., 4.]);
        assert_eq!(processor.var(), array![4., 400., 0.]);
        assert_eq!(processor.count(), 2);
        assert_eq!(processor.size(), 3);
    }

    #[test]
    fn test_empty() {
        let processor = MeanVar::new(2);
        assert!(processor.mean().iter().all(|x| x.is_nan()));
        assert!(processor.var().iter().all(|x| x.is_nan()));
    }

    #[test]
    fn test_merge() {
        let traces = array![[1., 2.], [3., 6.], [5., 4.], [-1., 0.]];
        let whole = MeanVar::from_traces(traces.view());
        let halves = MeanVar::from_traces(traces.slice(ndarray::s![..1, ..]))
            + MeanVar::from_traces(traces.slice(ndarray::s![1.., ..]));

        assert_eq!(halves, whole);
        assert_eq!(whole.mean(), array![2., 3.]);
        assert_eq!(whole.var(), array![5., 5.]);
        assert!(!whole.is_compatible_with(&MeanVar::new(3)));
    }
}
