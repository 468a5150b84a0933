//! Trace synchronization: cropping, padding and alignment of trace batches.
//!
//! Sample `i` of an aligned batch corresponds to the same cipher event in every trace.
use itertools::interleave;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, s};
use num_traits::AsPrimitive;
use std::ops::Range;

use crate::{Error, processors::MeanVar};

/// Alignment of a trace against a reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncDescriptor {
    /// Shift to apply to the trace, positive values delaying it
    pub offset: isize,
    /// Length of the reference
    pub length: usize,
}

/// Keep only the samples of `window` in every trace.
///
/// # Errors
/// Fails with [`Error::OutOfRange`] if the window ends after any trace.
pub fn crop<T: Clone>(traces: &[Array1<T>], window: Range<usize>) -> Result<Vec<Array1<T>>, Error> {
    traces
        .iter()
        .map(|trace| {
            if window.start > window.end || window.end > trace.len() {
                return Err(Error::OutOfRange {
                    start: window.start,
                    end: window.end,
                    len: trace.len(),
                });
            }
            Ok(trace.slice(s![window.clone()]).to_owned())
        })
        .collect()
}

/// Extend every trace shorter than `length` with `fill`. Longer traces are left untouched.
pub fn pad<T: Clone>(traces: &[Array1<T>], length: usize, fill: T) -> Vec<Array1<T>> {
    traces
        .iter()
        .map(|trace| {
            if trace.len() >= length {
                return trace.clone();
            }
            trace
                .iter()
                .cloned()
                .chain(std::iter::repeat_n(fill.clone(), length - trace.len()))
                .collect()
        })
        .collect()
}

/// Shift a trace by `offset` samples, positive values delaying it.
///
/// The trace keeps its length: samples shifted out are dropped and vacated samples repeat the
/// nearest edge sample.
pub fn adjust<T: Clone>(trace: ArrayView1<T>, offset: isize) -> Array1<T> {
    let len = trace.len() as isize;
    Array1::from_shape_fn(trace.len(), |i| {
        let j = (i as isize).saturating_sub(offset).clamp(0, len - 1);
        trace[j as usize].clone()
    })
}

/// Reference samples on which offsets of up to `max_shift` are scored.
///
/// Edge samples repeated by [`adjust`] never fall in this window, unless the reference is too
/// short to leave a margin of `max_shift` on both sides.
pub fn scoring_window(len: usize, max_shift: usize) -> Range<usize> {
    if len >= 2 * max_shift + 2 {
        max_shift..len - max_shift
    } else {
        0..len
    }
}

/// Compute the Pearson correlation between `reference` and `trace` shifted by `offset`, over the
/// reference samples of `window` that the shifted trace covers.
///
/// Returns `None` if they overlap on less than 2 samples or if either has a null variance on the
/// overlap.
pub fn similarity<T: AsPrimitive<f64>>(
    reference: ArrayView1<T>,
    trace: ArrayView1<T>,
    offset: isize,
    window: Range<usize>,
) -> Option<f64> {
    let start = offset.max(window.start as isize);
    let end = (window.end.min(reference.len()) as isize).min(trace.len() as isize + offset);
    if end - start < 2 {
        return None;
    }

    let (mut sx, mut sy, mut sxx, mut syy, mut sxy) = (0., 0., 0., 0., 0.);
    for i in start..end {
        let x: f64 = reference[i as usize].as_();
        let y: f64 = trace[(i - offset) as usize].as_();
        sx += x;
        sy += y;
        sxx += x * x;
        syy += y * y;
        sxy += x * y;
    }

    let n = (end - start) as f64;
    let var_x = n * sxx - sx * sx;
    let var_y = n * syy - sy * sy;
    if !(var_x > 0. && var_y > 0.) {
        return None;
    }

    let corr = (n * sxy - sx * sy) / f64::sqrt(var_x * var_y);
    corr.is_finite().then_some(corr)
}

/// Find the offset in `-max_shift..=max_shift` aligning `trace` on `reference`.
///
/// Offsets are scored on [`scoring_window`]. Among equally similar offsets, the smallest shift
/// wins, negative before positive.
pub fn find_offset<T: AsPrimitive<f64>>(
    reference: ArrayView1<T>,
    trace: ArrayView1<T>,
    max_shift: usize,
) -> isize {
    let window = scoring_window(reference.len(), max_shift);
    let max_shift = max_shift as isize;
    let candidates = std::iter::once(0).chain(interleave(
        (1..=max_shift).map(|d| -d),
        1..=max_shift,
    ));

    let mut best: Option<(isize, f64)> = None;
    for offset in candidates {
        let Some(score) = similarity(reference, trace, offset, window.clone()) else {
            continue;
        };
        match best {
            Some((_, best_score)) if score <= best_score => {}
            _ => best = Some((offset, score)),
        }
    }

    best.map_or(0, |(offset, _)| offset)
}

/// Total shift bringing `trace` to a position where [`find_offset`] no longer moves it.
///
/// Each accepted step strictly raises the similarity at offset 0, so the search ends.
fn sync_offset<T: AsPrimitive<f64>>(
    reference: ArrayView1<T>,
    trace: ArrayView1<T>,
    max_shift: usize,
) -> isize {
    let window = scoring_window(reference.len(), max_shift);
    let mut total = 0;
    let mut shifted = trace.to_owned();
    let mut score = similarity(reference, shifted.view(), 0, window.clone());

    loop {
        let offset = find_offset(reference, shifted.view(), max_shift);
        if offset == 0 {
            return total;
        }

        let candidate = adjust(trace, total.saturating_add(offset));
        let candidate_score = similarity(reference, candidate.view(), 0, window.clone());
        if candidate_score <= score {
            return total;
        }

        total = total.saturating_add(offset);
        shifted = candidate;
        score = candidate_score;
    }
}

/// Compute the alignment of every trace against `reference`, without applying it.
pub fn sync_descriptors<T: AsPrimitive<f64>>(
    traces: &[Array1<T>],
    reference: ArrayView1<T>,
    max_shift: usize,
) -> Vec<SyncDescriptor> {
    traces
        .iter()
        .map(|trace| SyncDescriptor {
            offset: sync_offset(reference, trace.view(), max_shift),
            length: reference.len(),
        })
        .collect()
}

/// Shift every trace until its correlation with `reference` is maximal within `max_shift`.
///
/// For traces at least as long as the reference, synchronizing an already synchronized batch
/// against the same reference shifts nothing.
pub fn sync<T: AsPrimitive<f64>>(
    traces: &[Array1<T>],
    reference: ArrayView1<T>,
    max_shift: usize,
) -> Vec<Array1<T>> {
    traces
        .iter()
        .zip(sync_descriptors(traces, reference, max_shift))
        .map(|(trace, descriptor)| adjust(trace.view(), descriptor.offset))
        .collect()
}

/// Synchronize traces on `reference`, then bring them to the reference length.
///
/// Short traces are padded with `fill`; long ones are cropped.
pub fn align<T: AsPrimitive<f64>>(
    traces: &[Array1<T>],
    reference: ArrayView1<T>,
    max_shift: usize,
    fill: T,
) -> Result<Array2<T>, Error> {
    let length = reference.len();
    let traces = sync(traces, reference, max_shift);
    let traces = crop(&pad(&traces, length, fill), 0..length)?;

    Ok(Array2::from_shape_fn((traces.len(), length), |(i, j)| {
        traces[i][j]
    }))
}

/// Return the mean trace of an aligned batch, a usual synchronization reference.
pub fn mean_trace<T: AsPrimitive<f64>>(traces: ArrayView2<T>) -> Array1<f64> {
    MeanVar::from_traces(traces).mean()
}
