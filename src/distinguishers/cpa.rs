use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, Zip};
use num_traits::AsPrimitive;
use rayon::prelude::{
    IndexedParallelIterator, IntoParallelIterator, IntoParallelRefIterator, ParallelBridge,
    ParallelIterator,
};
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    iter::zip,
    ops::Add,
    path::Path,
    sync::atomic::{AtomicBool, Ordering},
};

use crate::{
    Error,
    cipher::{CipherModel, Target},
    leakage_model::PowerModel,
    statistics::{self, GuessStats},
    trace::ChannelEntry,
};

/// Number of hypotheses on a key byte.
pub const GUESS_RANGE: usize = 256;

/// Value of a Pearson correlation coefficient whose denominator vanishes.
pub const UNDEFINED_CORRELATION: f64 = f64::NAN;

/// Relative tolerance below which a variance is considered null.
const VARIANCE_EPSILON: f64 = 1e-12;

/// Compute the [`Cpa`] of the given traces using [`CpaProcessor`].
///
/// Batches of `batch_size` traces are accumulated in parallel, then merged.
///
/// # Examples
/// ```
/// use scabox::cipher::Target;
/// use scabox::distinguishers::cpa::cpa;
/// use scabox::leakage_model::{HammingWeight, aes::Aes128};
/// use scabox::trace::{Channel, ChannelEntry};
/// use ndarray::array;
///
/// let traces = array![
///     [77, 137, 51, 91],
///     [72, 61, 91, 83],
///     [39, 49, 52, 23],
///     [26, 114, 63, 45],
///     [30, 8, 97, 91],
///     [13, 68, 7, 45],
/// ];
/// let channel: Channel = (0..6u8)
///     .map(|i| ChannelEntry::new(vec![i * 40; 16], vec![], vec![]))
///     .collect();
/// let cpa = cpa(
///     traces.view(),
///     &channel,
///     Aes128,
///     HammingWeight,
///     Target::first_round(0),
///     &[],
///     2,
/// )
/// .unwrap();
/// assert_eq!(cpa.corr().shape(), &[256, 4]);
/// ```
///
/// # Panics
/// Panic if `batch_size` is 0.
pub fn cpa<T, C, M>(
    traces: ArrayView2<T>,
    channel: impl AsRef<[ChannelEntry]>,
    cipher: C,
    model: M,
    target: Target,
    known_key: &[u8],
    batch_size: usize,
) -> Result<Cpa, Error>
where
    T: AsPrimitive<f64> + Sync,
    C: CipherModel + Clone + Send,
    M: PowerModel + Clone + Send,
{
    assert!(batch_size > 0);

    let channel = channel.as_ref();
    if traces.nrows() != channel.len() {
        return Err(Error::ShapeMismatch(format!(
            "{} traces for {} channel entries",
            traces.nrows(),
            channel.len()
        )));
    }

    let new_processor = || {
        let mut processor = CpaProcessor::new(cipher.clone(), model.clone(), target);
        processor.set_key(known_key);
        processor
    };

    // From benchmarks fold + reduce_with is faster than map + reduce/reduce_with and fold + reduce
    let processor = zip(
        traces.axis_chunks_iter(Axis(0), batch_size),
        channel.chunks(batch_size),
    )
    .par_bridge()
    .try_fold(&new_processor, |mut processor, (trace_batch, entries)| {
        processor.accumulate(trace_batch, entries)?;
        Ok::<_, Error>(processor)
    })
    .try_reduce_with(|a, b| Ok(a + b))
    .unwrap_or_else(|| Ok(new_processor()))?;

    Ok(processor.correlations())
}

/// Result of the CPA[^1] on some traces.
///
/// [^1]: <https://www.iacr.org/archive/ches2004/31560016/31560016.pdf>
#[derive(Debug, Clone)]
pub struct Cpa {
    /// Pearson correlation coefficients, indexed by `(hypothesis, sample)`
    pub(crate) corr: Array2<f64>,
}

impl Cpa {
    /// Return the Pearson correlation coefficients.
    pub fn corr(&self) -> ArrayView2<f64> {
        self.corr.view()
    }

    /// Return the correlation coefficients of a single hypothesis.
    pub fn guess_corr(&self, guess: u8) -> ArrayView1<f64> {
        self.corr.row(guess as usize)
    }

    /// See [`statistics::guess_stats`].
    pub fn guess_stats(&self) -> GuessStats {
        statistics::guess_stats(self.corr.view())
    }

    /// Return the guess with the highest Pearson correlation coefficient magnitude.
    pub fn best_guess(&self) -> u8 {
        self.guess_stats().guess
    }

    /// See [`statistics::guess_envelope`].
    pub fn guess_envelope(&self) -> (Array1<f64>, Array1<f64>) {
        statistics::guess_envelope(self.corr.view())
    }

    /// See [`statistics::divergence_indices`].
    pub fn divergence_indices(&self, threshold: f64) -> Vec<usize> {
        statistics::divergence_indices(self.corr.view(), threshold)
    }

    /// Return the maximum Pearson correlation coefficient magnitude for each guess.
    pub fn max_corr(&self) -> Array1<f64> {
        statistics::max_corr(self.corr.view())
    }

    /// Rank guesses.
    pub fn rank(&self) -> Array1<usize> {
        statistics::rank(self.corr.view())
    }
}

/// Running sums of a CPA session.
///
/// It implements algorithm 4 from [^1].
///
/// [^1]: <https://eprint.iacr.org/2013/794.pdf>
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Accumulator {
    /// Number of samples per trace
    num_samples: usize,
    /// Number of traces processed
    num_traces: usize,
    /// Sum of traces
    sum_traces: Array1<f64>,
    /// Sum of square of traces
    sum_traces2: Array1<f64>,
    /// Sum of predictions per key guess
    guess_sum: Array1<f64>,
    /// Sum of square of predictions per key guess
    guess_sum2: Array1<f64>,
    /// Sum of the products of traces and predictions, per key guess
    cross: Array2<f64>,
}

impl Accumulator {
    pub fn new(num_samples: usize) -> Self {
        Self {
            num_samples,
            num_traces: 0,
            sum_traces: Array1::zeros(num_samples),
            sum_traces2: Array1::zeros(num_samples),
            guess_sum: Array1::zeros(GUESS_RANGE),
            guess_sum2: Array1::zeros(GUESS_RANGE),
            cross: Array2::zeros((GUESS_RANGE, num_samples)),
        }
    }

    pub fn num_samples(&self) -> usize {
        self.num_samples
    }

    pub fn num_traces(&self) -> usize {
        self.num_traces
    }

    /// Add the contribution of a batch of traces and their `(trace, guess)` predictions.
    ///
    /// # Panics
    /// - Panic in debug if `traces.shape()[0] != predictions.shape()[0]`.
    /// - Panic in debug if `traces.shape()[1] != self.num_samples`.
    pub fn update(&mut self, traces: ArrayView2<f64>, predictions: ArrayView2<f64>) {
        debug_assert_eq!(traces.shape()[0], predictions.shape()[0]);
        debug_assert_eq!(traces.shape()[1], self.num_samples);
        debug_assert_eq!(predictions.shape()[1], GUESS_RANGE);

        self.sum_traces += &traces.sum_axis(Axis(0));
        self.sum_traces2 += &traces.mapv(|x| x * x).sum_axis(Axis(0));
        self.guess_sum += &predictions.sum_axis(Axis(0));
        self.guess_sum2 += &predictions.mapv(|x| x * x).sum_axis(Axis(0));

        // Rows of guesses are disjoint, so each one is updated independently.
        Zip::from(self.cross.rows_mut())
            .and(predictions.columns())
            .par_for_each(|mut cross, guess_predictions| {
                cross += &guess_predictions.dot(&traces);
            });

        self.num_traces += traces.shape()[0];
    }

    /// Compute the Pearson correlation coefficients from the running sums.
    pub fn correlations(&self) -> Array2<f64> {
        let mut corr = Array2::from_elem((GUESS_RANGE, self.num_samples), UNDEFINED_CORRELATION);
        if self.num_traces < 2 {
            return corr;
        }

        let n = self.num_traces as f64;
        let var_traces: Vec<Option<f64>> = zip(&self.sum_traces, &self.sum_traces2)
            .map(|(&sum, &sum2)| scaled_variance(n, sum, sum2))
            .collect();

        Zip::from(corr.rows_mut())
            .and(self.cross.rows())
            .and(&self.guess_sum)
            .and(&self.guess_sum2)
            .par_for_each(|mut corr, cross, &sum, &sum2| {
                let Some(var_guess) = scaled_variance(n, sum, sum2) else {
                    return;
                };
                for u in 0..self.num_samples {
                    if let Some(var_trace) = var_traces[u] {
                        let cov = n * cross[u] - self.sum_traces[u] * sum;
                        corr[u] = (cov / f64::sqrt(var_trace * var_guess)).clamp(-1., 1.);
                    }
                }
            });

        corr
    }

    /// Check that every running sum has the length of the session.
    ///
    /// # Errors
    /// Fails with [`Error::ShapeMismatch`] naming the first inconsistent sum.
    pub fn check_shape(&self) -> Result<(), Error> {
        let lengths = [
            ("sum_traces", self.sum_traces.len(), self.num_samples),
            ("sum_traces2", self.sum_traces2.len(), self.num_samples),
            ("guess_sum", self.guess_sum.len(), GUESS_RANGE),
            ("guess_sum2", self.guess_sum2.len(), GUESS_RANGE),
            ("cross rows", self.cross.nrows(), GUESS_RANGE),
            ("cross columns", self.cross.ncols(), self.num_samples),
        ];
        for (name, actual, expected) in lengths {
            if actual != expected {
                return Err(Error::ShapeMismatch(format!(
                    "{name} has length {actual} instead of {expected}"
                )));
            }
        }

        Ok(())
    }

    /// Determine if two [`Accumulator`] are compatible for addition.
    fn is_compatible_with(&self, other: &Self) -> bool {
        self.num_samples == other.num_samples
    }

    /// Save the [`Accumulator`] to a file.
    ///
    /// # Warning
    /// The file format is not stable, it might change between versions.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), Error> {
        let file = File::create(path)?;
        serde_json::to_writer(file, self)?;

        Ok(())
    }

    /// Load an [`Accumulator`] from a file.
    ///
    /// # Errors
    /// Fails with [`Error::ShapeMismatch`] if the running sums disagree with the sample length.
    ///
    /// # Warning
    /// The file format is not stable, it might change between versions.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let file = File::open(path)?;
        let accumulator: Accumulator = serde_json::from_reader(file)?;
        accumulator.check_shape()?;

        Ok(accumulator)
    }
}

impl Add for Accumulator {
    type Output = Self;

    /// Merge two sessions. They need to be compatible to be merged together (see
    /// [`Accumulator::is_compatible_with`]).
    ///
    /// # Panics
    /// Panics in debug if the accumulators are not compatible.
    fn add(self, rhs: Self) -> Self::Output {
        debug_assert!(self.is_compatible_with(&rhs));

        Self {
            num_samples: self.num_samples,
            num_traces: self.num_traces + rhs.num_traces,
            sum_traces: self.sum_traces + rhs.sum_traces,
            sum_traces2: self.sum_traces2 + rhs.sum_traces2,
            guess_sum: self.guess_sum + rhs.guess_sum,
            guess_sum2: self.guess_sum2 + rhs.guess_sum2,
            cross: self.cross + rhs.cross,
        }
    }
}

/// Return `n Σx² - (Σx)²`, or `None` when it is null relatively to `n Σx²`.
fn scaled_variance(n: f64, sum: f64, sum2: f64) -> Option<f64> {
    let var = n * sum2 - sum * sum;
    (var > VARIANCE_EPSILON * n * sum2.abs()).then_some(var)
}

/// A processor that computes the [`Cpa`] of the given traces.
///
/// The sample length of a session is set by the first accumulated batch, unless it is given
/// upfront with [`CpaProcessor::with_num_samples`]. [`CpaProcessor::clear`] keeps it, but an
/// empty session takes the length of the next batch if it was not given upfront.
pub struct CpaProcessor<C, M> {
    cipher: C,
    model: M,
    target: Target,
    known_key: Vec<u8>,
    /// Sample length given upfront
    num_samples: Option<usize>,
    accumulator: Option<Accumulator>,
}

impl<C, M> CpaProcessor<C, M>
where
    C: CipherModel,
    M: PowerModel,
{
    pub fn new(cipher: C, model: M, target: Target) -> Self {
        Self {
            cipher,
            model,
            target,
            known_key: Vec::new(),
            num_samples: None,
            accumulator: None,
        }
    }

    /// Fix the sample length of the sessions.
    pub fn with_num_samples(mut self, num_samples: usize) -> Self {
        self.num_samples = Some(num_samples);
        self.clear();
        self
    }

    /// Select the intermediate value hypotheses are made on. Starts a new session.
    pub fn set_blocks(&mut self, target: Target) {
        self.target = target;
        self.clear();
    }

    /// Set the cipher key used to replay rounds preceding the target. Starts a new session.
    pub fn set_key(&mut self, known_key: &[u8]) {
        self.known_key = known_key.to_vec();
        self.clear();
    }

    /// Replace the power model. Starts a new session.
    pub fn set_model(&mut self, model: M) {
        self.model = model;
        self.clear();
    }

    pub fn target(&self) -> Target {
        self.target
    }

    pub fn known_key(&self) -> &[u8] {
        &self.known_key
    }

    /// Returns the number of traces accumulated in the current session.
    pub fn num_traces(&self) -> usize {
        self.accumulator.as_ref().map_or(0, Accumulator::num_traces)
    }

    /// Returns the sample length of the current session, if already known.
    pub fn num_samples(&self) -> Option<usize> {
        self.accumulator.as_ref().map(Accumulator::num_samples)
    }

    pub fn accumulator(&self) -> Option<&Accumulator> {
        self.accumulator.as_ref()
    }

    /// Continue a session previously saved with [`Accumulator::save`].
    ///
    /// # Errors
    /// Fails with [`Error::ShapeMismatch`] if the accumulator is inconsistent or does not match
    /// the sample length given upfront.
    pub fn resume(&mut self, accumulator: Accumulator) -> Result<(), Error> {
        accumulator.check_shape()?;
        if let Some(num_samples) = self.num_samples {
            if num_samples != accumulator.num_samples() {
                return Err(Error::ShapeMismatch(format!(
                    "accumulator of {} samples for a session of {num_samples} samples",
                    accumulator.num_samples()
                )));
            }
        }
        self.accumulator = Some(accumulator);

        Ok(())
    }

    /// Start a new session of the same sample length.
    pub fn clear(&mut self) {
        self.accumulator = self.num_samples.or(self.num_samples()).map(Accumulator::new);
    }

    /// Sample length batches must have, once fixed upfront or by accumulated traces.
    fn expected_num_samples(&self) -> Option<usize> {
        if self.num_samples.is_some() {
            return self.num_samples;
        }
        self.accumulator
            .as_ref()
            .filter(|accumulator| accumulator.num_traces() > 0)
            .map(Accumulator::num_samples)
    }

    /// Check a batch before it is accumulated.
    pub fn validate<T>(
        &self,
        traces: ArrayView2<T>,
        channel: impl AsRef<[ChannelEntry]>,
    ) -> Result<(), Error> {
        let channel = channel.as_ref();
        if traces.shape()[0] != channel.len() {
            return Err(Error::ShapeMismatch(format!(
                "{} traces for {} channel entries",
                traces.shape()[0],
                channel.len()
            )));
        }

        match self.expected_num_samples() {
            Some(num_samples) if !channel.is_empty() && traces.shape()[1] != num_samples => {
                return Err(Error::ShapeMismatch(format!(
                    "traces of {} samples for a session of {num_samples} samples",
                    traces.shape()[1]
                )));
            }
            _ => {}
        }

        self.cipher.check_target(self.target)?;
        self.cipher.check_key(&self.known_key, self.target.round == 1)?;
        for entry in channel {
            self.cipher.check_block(entry.block(self.target.direction))?;
        }

        Ok(())
    }

    /// Compute the predictions of every guess for the given channel entries.
    fn predictions(&self, channel: &[ChannelEntry]) -> Result<Array2<f64>, Error> {
        let mut predictions = Array2::zeros((channel.len(), GUESS_RANGE));

        predictions
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .zip(channel.par_iter())
            .try_for_each(|(mut row, entry)| {
                let block = entry.block(self.target.direction);
                let byte = self
                    .cipher
                    .target_byte(block, &self.known_key, self.target)?;
                for (guess, prediction) in row.iter_mut().enumerate() {
                    let value = self.cipher.substitute(byte, guess as u8, self.target);
                    *prediction = self.model.predict(value);
                }
                Ok::<_, Error>(())
            })?;

        Ok(predictions)
    }

    fn commit(&mut self, traces: ArrayView2<f64>, predictions: ArrayView2<f64>) {
        let num_samples = traces.shape()[1];
        let mut accumulator = match self.accumulator.take() {
            Some(accumulator) if accumulator.num_samples() == num_samples => accumulator,
            _ => Accumulator::new(num_samples),
        };
        accumulator.update(traces, predictions);
        self.accumulator = Some(accumulator);
    }

    /// Accumulate a batch of traces and their channel entries.
    ///
    /// The batch is fully validated and its predictions computed before the running sums are
    /// touched: on error, the session is left unchanged.
    pub fn accumulate<T>(
        &mut self,
        traces: ArrayView2<T>,
        channel: impl AsRef<[ChannelEntry]>,
    ) -> Result<(), Error>
    where
        T: AsPrimitive<f64>,
    {
        let channel = channel.as_ref();
        self.validate(traces, channel)?;
        if channel.is_empty() {
            return Ok(());
        }

        let predictions = self.predictions(channel)?;
        let traces = traces.mapv(|x| x.as_());
        self.commit(traces.view(), predictions.view());

        tracing::debug!(
            byte = self.target.byte,
            traces = channel.len(),
            total = self.num_traces(),
            "accumulated batch"
        );

        Ok(())
    }

    /// Accumulate traces one by one until `cancel` is raised.
    ///
    /// The contribution of a trace is committed only once it is fully computed, so a cancelled
    /// call leaves a consistent session. Returns the number of traces accumulated.
    pub fn accumulate_cancellable<T>(
        &mut self,
        traces: ArrayView2<T>,
        channel: impl AsRef<[ChannelEntry]>,
        cancel: &AtomicBool,
    ) -> Result<usize, Error>
    where
        T: AsPrimitive<f64>,
    {
        let channel = channel.as_ref();
        self.validate(traces, channel)?;

        let mut count = 0;
        for (trace, entry) in zip(traces.axis_chunks_iter(Axis(0), 1), channel.chunks(1)) {
            if cancel.load(Ordering::Relaxed) {
                tracing::debug!(byte = self.target.byte, count, "accumulation cancelled");
                break;
            }
            let predictions = self.predictions(entry)?;
            let trace = trace.mapv(|x| x.as_());
            self.commit(trace.view(), predictions.view());
            count += 1;
        }

        Ok(count)
    }

    /// Compute the Pearson correlation coefficients of the current session.
    ///
    /// Coefficients are [`UNDEFINED_CORRELATION`] when fewer than 2 traces were accumulated or
    /// when the traces or the predictions have a null variance. The matrix has no column until
    /// the sample length is known.
    pub fn correlations(&self) -> Cpa {
        let corr = match &self.accumulator {
            Some(accumulator) => accumulator.correlations(),
            None => Array2::from_elem((GUESS_RANGE, 0), UNDEFINED_CORRELATION),
        };

        Cpa { corr }
    }
}

impl<C, M> Add for CpaProcessor<C, M>
where
    C: CipherModel,
    M: PowerModel,
{
    type Output = Self;

    /// Merge computations of two [`CpaProcessor`]. Processors need to share the same
    /// configuration, otherwise the result is incoherent.
    ///
    /// # Panics
    /// Panics in debug if the processors are not compatible.
    fn add(self, rhs: Self) -> Self::Output {
        debug_assert_eq!(self.target, rhs.target);
        debug_assert_eq!(self.known_key, rhs.known_key);

        let accumulator = match (self.accumulator, rhs.accumulator) {
            (Some(a), Some(b)) if b.num_traces() == 0 => Some(a),
            (Some(a), Some(b)) if a.num_traces() == 0 => Some(b),
            (Some(a), Some(b)) => Some(a + b),
            (a, b) => a.or(b),
        };

        Self {
            accumulator,
            ..self
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cipher::Direction,
        leakage_model::{HammingWeight, Identity, aes::Aes128, hw},
        trace::Channel,
    };
    use ndarray::{Array2, array, s};
    use ndarray_rand::{
        RandomExt,
        rand::{Rng, SeedableRng, rngs::StdRng},
        rand_distr::Normal,
    };
    use std::sync::atomic::AtomicBool;

    const KEY_BYTE: u8 = 0x2b;

    fn random_channel(rng: &mut StdRng, n: usize) -> Channel {
        (0..n)
            .map(|_| {
                let mut plain = vec![0u8; 16];
                rng.fill(&mut plain[..]);
                ChannelEntry::new(plain, vec![0; 16], vec![])
            })
            .collect()
    }

    /// Traces leaking the Hamming weight of the first round S-box output at `sample`.
    fn leaking_traces(
        rng: &mut StdRng,
        channel: &Channel,
        num_samples: usize,
        sample: usize,
    ) -> Array2<f64> {
        let mut traces = Array2::random_using(
            (channel.len(), num_samples),
            Normal::new(0., 1.).unwrap(),
            rng,
        );
        for (i, entry) in channel.iter().enumerate() {
            let value = crate::leakage_model::aes::sbox(entry.plain[0] ^ KEY_BYTE);
            traces[[i, sample]] += 2. * hw(value as usize) as f64;
        }
        traces
    }

    fn processor() -> CpaProcessor<Aes128, HammingWeight> {
        CpaProcessor::new(Aes128, HammingWeight, Target::first_round(0))
    }

    fn assert_close(a: ArrayView2<f64>, b: ArrayView2<f64>) {
        assert_eq!(a.shape(), b.shape());
        for (x, y) in a.iter().zip(b.iter()) {
            if x.is_nan() || y.is_nan() {
                assert!(x.is_nan() && y.is_nan());
            } else {
                assert!((x - y).abs() <= 1e-9 * x.abs().max(y.abs()).max(1e-12));
            }
        }
    }

    #[test]
    fn test_recover_key_byte() {
        let mut rng = StdRng::seed_from_u64(0);
        let channel = random_channel(&mut rng, 200);
        let traces = leaking_traces(&mut rng, &channel, 500, 250);

        let mut processor = processor();
        processor.accumulate(traces.view(), &channel).unwrap();
        let stats = processor.correlations().guess_stats();

        assert_eq!(stats.guess, KEY_BYTE);
        assert!(stats.peak.abs() > 0.5);
        assert!(stats.sample.abs_diff(250) <= 1);
    }

    #[test]
    fn test_streaming_equivalence() {
        let mut rng = StdRng::seed_from_u64(1);
        let channel = random_channel(&mut rng, 120);
        let traces = leaking_traces(&mut rng, &channel, 40, 10);

        let mut whole = processor();
        whole.accumulate(traces.view(), &channel).unwrap();

        let mut streamed = processor();
        for range in [0..7, 7..8, 8..64, 64..120] {
            streamed
                .accumulate(
                    traces.slice(s![range.clone(), ..]),
                    channel.slice(range.clone()),
                )
                .unwrap();
        }
        assert_eq!(streamed.num_traces(), 120);
        assert_close(
            whole.correlations().corr(),
            streamed.correlations().corr(),
        );

        // Batches submitted in another order
        let mut reordered = processor();
        for range in [64..120, 0..64] {
            reordered
                .accumulate(
                    traces.slice(s![range.clone(), ..]),
                    channel.slice(range.clone()),
                )
                .unwrap();
        }
        assert_close(
            whole.correlations().corr(),
            reordered.correlations().corr(),
        );

        let parallel = cpa(
            traces.view(),
            &channel,
            Aes128,
            HammingWeight,
            Target::first_round(0),
            &[],
            16,
        )
        .unwrap();
        assert_close(whole.correlations().corr(), parallel.corr());
    }

    #[test]
    fn test_correlation_bounds() {
        let mut rng = StdRng::seed_from_u64(2);
        let channel = random_channel(&mut rng, 50);
        let traces = leaking_traces(&mut rng, &channel, 20, 3);

        let mut processor = CpaProcessor::new(Aes128, Identity, Target::first_round(0));
        processor.accumulate(traces.view(), &channel).unwrap();
        assert!(
            processor
                .correlations()
                .corr()
                .iter()
                .all(|x| x.is_nan() || (-1. ..=1.).contains(x))
        );
    }

    #[test]
    fn test_shape_mismatch() {
        let mut rng = StdRng::seed_from_u64(3);
        let channel = random_channel(&mut rng, 10);
        let traces = leaking_traces(&mut rng, &channel, 8, 0);

        let mut processor = processor();
        processor
            .accumulate(traces.slice(s![..5, ..]), channel.slice(0..5))
            .unwrap();
        let before = processor.accumulator().cloned();

        let result = processor.accumulate(traces.view(), channel.slice(0..9));
        assert!(matches!(result, Err(Error::ShapeMismatch(_))));
        assert_eq!(processor.accumulator().cloned(), before);

        let result = processor.accumulate(traces.slice(s![.., ..7]), &channel);
        assert!(matches!(result, Err(Error::ShapeMismatch(_))));
        assert_eq!(processor.num_traces(), 5);
    }

    #[test]
    fn test_invalid_block_leaves_state() {
        let mut rng = StdRng::seed_from_u64(4);
        let mut channel = random_channel(&mut rng, 4);
        let traces = leaking_traces(&mut rng, &channel, 8, 0);
        channel.push(ChannelEntry::new(vec![0; 15], vec![], vec![]));
        let traces = ndarray::concatenate![Axis(0), traces, Array2::<f64>::zeros((1, 8))];

        let mut processor = processor();
        let result = processor.accumulate(traces.view(), &channel);
        assert!(matches!(result, Err(Error::InvalidBlockLength { .. })));
        assert_eq!(processor.num_traces(), 0);
        assert!(processor.accumulator().is_none());
    }

    #[test]
    fn test_zero_traces() {
        let mut processor = processor().with_num_samples(6);
        let corr = processor.correlations();
        assert_eq!(corr.corr().shape(), &[256, 6]);
        assert!(corr.corr().iter().all(|x| x.is_nan()));

        let mut rng = StdRng::seed_from_u64(5);
        let channel = random_channel(&mut rng, 1);
        processor
            .accumulate(Array2::<f64>::ones((1, 6)).view(), &channel)
            .unwrap();
        assert!(processor.correlations().corr().iter().all(|x| x.is_nan()));

        processor.clear();
        assert_eq!(processor.num_traces(), 0);
        assert!(processor.correlations().corr().iter().all(|x| x.is_nan()));
        assert!(processor.correlations().guess_stats().is_undefined());
    }

    #[test]
    fn test_constant_samples() {
        let traces = array![[1.5, 3.], [1.5, 4.], [1.5, 2.], [1.5, 7.]];
        let channel: Channel = [0x00u8, 0x55, 0xaa, 0xff]
            .iter()
            .map(|&p| ChannelEntry::new(vec![p; 16], vec![], vec![]))
            .collect();

        let mut processor = processor();
        processor.accumulate(traces.view(), &channel).unwrap();
        let corr = processor.correlations();
        assert!(corr.corr().column(0).iter().all(|x| x.is_nan()));
        assert!(corr.corr().column(1).iter().any(|x| !x.is_nan()));
    }

    #[test]
    fn test_integer_samples() {
        let traces = array![
            [77i16, 137, 51, 91],
            [72, 61, 91, 83],
            [39, 49, 52, 23],
            [26, 114, 63, 45],
            [30, 8, 97, 91],
            [13, 68, 7, 45],
        ];
        let channel: Channel = (0..6u8)
            .map(|i| ChannelEntry::new(vec![i * 40; 16], vec![], vec![]))
            .collect();

        let mut a = processor();
        a.accumulate(traces.view(), &channel).unwrap();
        let mut b = processor();
        b.accumulate(traces.mapv(|x| x as f64).view(), &channel).unwrap();
        assert_close(a.correlations().corr(), b.correlations().corr());
    }

    #[test]
    fn test_cancellation() {
        let mut rng = StdRng::seed_from_u64(6);
        let channel = random_channel(&mut rng, 10);
        let traces = leaking_traces(&mut rng, &channel, 8, 0);

        let mut processor = processor();
        let cancel = AtomicBool::new(false);
        let count = processor
            .accumulate_cancellable(traces.view(), &channel, &cancel)
            .unwrap();
        assert_eq!(count, 10);

        let mut reference = self::processor();
        reference.accumulate(traces.view(), &channel).unwrap();
        assert_close(
            processor.correlations().corr(),
            reference.correlations().corr(),
        );

        cancel.store(true, Ordering::Relaxed);
        let count = processor
            .accumulate_cancellable(traces.view(), &channel, &cancel)
            .unwrap();
        assert_eq!(count, 0);
        assert_eq!(processor.num_traces(), 10);
    }

    #[test]
    fn test_configuration_starts_new_session() {
        let mut rng = StdRng::seed_from_u64(7);
        let channel = random_channel(&mut rng, 10);
        let traces = leaking_traces(&mut rng, &channel, 8, 0);

        let mut processor = processor();
        processor.accumulate(traces.view(), &channel).unwrap();
        processor.set_blocks(Target::new(Direction::Decrypt, 1, 0));
        assert_eq!(processor.num_traces(), 0);

        processor.set_blocks(Target::new(Direction::Encrypt, 2, 0));
        let result = processor.accumulate(traces.view(), &channel);
        assert!(matches!(result, Err(Error::InvalidKeyLength { .. })));

        processor.set_key(&[0; 16]);
        processor.accumulate(traces.view(), &channel).unwrap();
        assert_eq!(processor.num_traces(), 10);
    }

    #[test]
    fn test_save_load_accumulator() {
        let mut rng = StdRng::seed_from_u64(8);
        let channel = random_channel(&mut rng, 10);
        let traces = leaking_traces(&mut rng, &channel, 8, 0);

        let mut processor = processor();
        processor.accumulate(traces.view(), &channel).unwrap();
        let accumulator = processor.accumulator().unwrap();

        let serialized = serde_json::to_string(accumulator).unwrap();
        let restored: Accumulator = serde_json::from_str(&serialized).unwrap();
        assert_eq!(restored.num_traces(), 10);
        assert_eq!(restored.num_samples(), 8);

        let mut resumed = self::processor();
        resumed.resume(restored).unwrap();
        assert_close(
            processor.correlations().corr(),
            resumed.correlations().corr(),
        );
    }

    #[test]
    fn test_inconsistent_accumulator() {
        let mut rng = StdRng::seed_from_u64(9);
        let channel = random_channel(&mut rng, 6);
        let traces = leaking_traces(&mut rng, &channel, 3, 0);

        let mut processor = processor();
        processor.accumulate(traces.view(), &channel).unwrap();
        let accumulator = processor.accumulator().unwrap();
        assert!(accumulator.check_shape().is_ok());

        let mut value = serde_json::to_value(accumulator).unwrap();
        value["num_samples"] = serde_json::json!(5);
        let inconsistent: Accumulator = serde_json::from_value(value.clone()).unwrap();
        assert!(matches!(
            inconsistent.check_shape(),
            Err(Error::ShapeMismatch(_))
        ));

        let mut resumed = self::processor();
        assert!(matches!(
            resumed.resume(inconsistent),
            Err(Error::ShapeMismatch(_))
        ));
        assert!(resumed.accumulator().is_none());

        let path = std::env::temp_dir().join("scabox_inconsistent_accumulator.json");
        std::fs::write(&path, value.to_string()).unwrap();
        let loaded = Accumulator::load(&path);
        std::fs::remove_file(&path).unwrap();
        assert!(matches!(loaded, Err(Error::ShapeMismatch(_))));
    }

    #[test]
    fn test_clear_keeps_sample_length() {
        let mut rng = StdRng::seed_from_u64(10);
        let channel = random_channel(&mut rng, 10);
        let traces = leaking_traces(&mut rng, &channel, 8, 0);

        let mut processor = processor();
        processor.accumulate(traces.view(), &channel).unwrap();
        processor.clear();
        assert_eq!(processor.num_traces(), 0);
        assert_eq!(processor.num_samples(), Some(8));
        let corr = processor.correlations();
        assert_eq!(corr.corr().shape(), &[256, 8]);
        assert!(corr.corr().iter().all(|x| x.is_nan()));

        // An empty session takes the length of its next batch.
        processor
            .accumulate(traces.slice(s![.., ..6]), &channel)
            .unwrap();
        assert_eq!(processor.num_samples(), Some(6));
        assert_eq!(processor.num_traces(), 10);
    }

    #[test]
    fn test_later_round_predictions() {
        let key = [0x2bu8; 16];
        let target = Target::new(Direction::Encrypt, 2, 3);
        let mut rng = StdRng::seed_from_u64(11);
        let channel = random_channel(&mut rng, 4);

        let mut processor = CpaProcessor::new(Aes128, HammingWeight, target);
        processor.set_key(&key);
        let predictions = processor.predictions(channel.as_ref()).unwrap();

        for (row, entry) in predictions.rows().into_iter().zip(channel.iter()) {
            for guess in 0..=255u8 {
                let value = Aes128
                    .intermediate_value(&entry.plain, &key, guess, target)
                    .unwrap();
                assert_eq!(row[guess as usize], HammingWeight.predict(value));
            }
        }
    }
}
