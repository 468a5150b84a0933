//! Convenient utility functions.

use std::cmp::Ordering;

use ndarray::{Array1, ArrayView1, ArrayView2, Axis};

#[cfg(feature = "progress_bar")]
use indicatif::{ProgressBar, ProgressStyle};
#[cfg(feature = "progress_bar")]
use std::time::Duration;

/// Creates a [`ProgressBar`] with a predefined default style.
#[cfg(feature = "progress_bar")]
pub fn progress_bar(len: usize) -> ProgressBar {
    let progress_bar = ProgressBar::new(len as u64).with_style(
        ProgressStyle::with_template("{elapsed_precise} {wide_bar} {pos}/{len} ({eta})")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    progress_bar.enable_steady_tick(Duration::new(0, 100000000));
    progress_bar
}

/// Return the index and value of the element of largest magnitude, ignoring NaN.
///
/// The first index wins among equal magnitudes.
pub fn argmax_abs(array: ArrayView1<f64>) -> Option<(usize, f64)> {
    let mut best: Option<(usize, f64)> = None;

    for (i, &x) in array.iter().enumerate() {
        if x.is_nan() {
            continue;
        }
        match best {
            Some((_, b)) if x.abs() <= b.abs() => {}
            _ => best = Some((i, x)),
        }
    }

    best
}

/// Return an array where the i-th element contains the largest magnitude of the i-th row of the
/// input array, or NaN if the row has no defined element.
pub fn max_abs_per_row(arr: ArrayView2<f64>) -> Array1<f64> {
    arr.axis_iter(Axis(0))
        .map(|row| argmax_abs(row).map_or(f64::NAN, |(_, x)| x.abs()))
        .collect()
}

/// Return the indices that would sort the given array with a comparison function.
pub fn argsort_by<T, F>(data: &[T], compare: F) -> Vec<usize>
where
    F: Fn(&T, &T) -> Ordering,
{
    let mut indices: Vec<usize> = (0..data.len()).collect();

    indices.sort_by(|&a, &b| compare(&data[a], &data[b]));

    indices
}

/// Convert a floating point value acquired with a
/// [ChipWhisperer](https://github.com/newaetech/chipwhisperer) to integer.
///
/// # References
/// https://github.com/newaetech/chipwhisperer/blob/918e20d7a6ac7211dac61a70d233872045eb113e/software/chipwhisperer/capture/scopes/cwnano.py#L740-L744
pub fn chipwhisperer_float_to_u16(x: f64) -> u16 {
    debug_assert!((-0.5..=0.5).contains(&x));

    ((x + 1.) * 2048.) as u16
}

#[cfg(test)]
mod tests {
    use super::{argmax_abs, argsort_by, max_abs_per_row};
    use ndarray::array;

    #[test]
    fn test_argmax_abs() {
        assert_eq!(argmax_abs(array![0.1, -0.5, 0.5, f64::NAN].view()), Some((1, -0.5)));
        assert_eq!(argmax_abs(array![f64::NAN, f64::NAN].view()), None);
    }

    #[test]
    fn test_max_abs_per_row() {
        let max = max_abs_per_row(array![[0.1, -0.7], [f64::NAN, f64::NAN]].view());
        assert_eq!(max[0], 0.7);
        assert!(max[1].is_nan());
    }

    #[test]
    fn test_argsort_by() {
        assert_eq!(argsort_by(&[3, 1, 2], |a, b| a.cmp(b)), vec![1, 2, 0]);
    }
}
