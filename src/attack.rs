//! Key recovery over every byte position of a cipher block.
//!
//! An [`Attack`] feeds chunks of raw traces through cropping, synchronization and one
//! [`CpaProcessor`] per attacked byte, and tracks how the guesses evolve.
use ndarray::{Array1, ArrayView1};
use num_traits::AsPrimitive;
use rayon::prelude::{IntoParallelRefIterator, IntoParallelRefMutIterator, ParallelIterator};
use serde::{Deserialize, Serialize};
use std::{fmt, fs::File, iter::zip, ops::Range, path::Path};

#[cfg(feature = "progress_bar")]
use crate::util::progress_bar;
#[cfg(feature = "progress_bar")]
use indicatif::ProgressIterator;

use crate::{
    Error,
    cipher::{CipherModel, Direction, Target},
    distinguishers::cpa::{Cpa, CpaProcessor},
    leakage_model::Model,
    preprocessors::{align, crop, mean_trace},
    processors::MeanVar,
    statistics::{GuessStats, Statistics},
    trace::ChannelEntry,
};

/// Kind of implementation the traces were acquired from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Hardware cipher core, leaking its last round register.
    Hardware,
    /// Software implementation, leaking its first round S-box lookups.
    #[default]
    Software,
}

impl Mode {
    /// Returns the side of the cipher usually attacked for this kind of implementation.
    pub fn direction(self) -> Direction {
        match self {
            Mode::Hardware => Direction::Decrypt,
            Mode::Software => Direction::Encrypt,
        }
    }
}

/// Parameters of an [`Attack`], usually read from a JSON file.
///
/// Missing fields take their default value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttackConfig {
    pub mode: Mode,
    /// Side of the cipher the targeted round is counted from. Defaults to the usual side of
    /// `mode`.
    pub direction: Option<Direction>,
    /// Number of traces processed between two statistics updates
    pub chunks: usize,
    /// Attacked byte positions
    pub bytes: Vec<usize>,
    /// Targeted round, starting at 1 on the side given by `direction`
    pub round: usize,
    pub power_model: Model,
    /// Largest shift tried when synchronizing traces. 0 disables synchronization.
    pub max_shift: usize,
    /// Samples kept from each raw trace
    pub window: Option<Range<usize>>,
    /// Cipher key in hexadecimal, needed to replay rounds preceding the target
    pub known_key: Option<String>,
}

impl Default for AttackConfig {
    fn default() -> Self {
        Self {
            mode: Mode::default(),
            direction: None,
            chunks: 1000,
            bytes: (0..16).collect(),
            round: 1,
            power_model: Model::default(),
            max_shift: 0,
            window: None,
            known_key: None,
        }
    }
}

impl AttackConfig {
    pub fn direction(&self) -> Direction {
        self.direction.unwrap_or(self.mode.direction())
    }

    pub fn target(&self, byte: usize) -> Target {
        Target::new(self.direction(), self.round, byte)
    }

    /// Decode the known key, empty when not provided.
    pub fn known_key(&self) -> Result<Vec<u8>, Error> {
        match &self.known_key {
            Some(key) => Ok(hex::decode(key)?),
            None => Ok(Vec::new()),
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), Error> {
        let file = File::create(path)?;
        serde_json::to_writer_pretty(file, self)?;

        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let file = File::open(path)?;
        let config = serde_json::from_reader(file)?;

        Ok(config)
    }
}

/// Best guesses of an [`Attack`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyGuess {
    /// Attacked byte positions and their guess
    pub bytes: Vec<(usize, GuessStats)>,
    /// Key bytes of the targeted round, 0 for positions not attacked
    pub round_key: Vec<u8>,
    /// Cipher key, recovered once every position of the round is guessed
    pub key: Option<Vec<u8>>,
}

impl fmt::Display for KeyGuess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "round key {}", hex::encode(&self.round_key))?;
        if let Some(key) = &self.key {
            write!(f, ", cipher key {}", hex::encode(key))?;
        }

        Ok(())
    }
}

/// A multi-byte CPA attack.
pub struct Attack<C> {
    cipher: C,
    config: AttackConfig,
    processors: Vec<CpaProcessor<C, Model>>,
    statistics: Statistics,
    /// Synchronization reference, built from the first chunk
    reference: Option<Array1<f64>>,
    /// Mean and variance of the aligned traces
    leakage: Option<MeanVar>,
}

impl<C> Attack<C>
where
    C: CipherModel + Clone + Send,
{
    /// Create an attack of the given cipher.
    ///
    /// # Errors
    /// Fails if an attacked position or the round lies outside the cipher, or if the known key
    /// is not valid hexadecimal.
    pub fn new(cipher: C, config: AttackConfig) -> Result<Self, Error> {
        let known_key = config.known_key()?;
        let processors = config
            .bytes
            .iter()
            .map(|&byte| {
                let target = config.target(byte);
                cipher.check_target(target)?;

                let mut processor = CpaProcessor::new(cipher.clone(), config.power_model, target);
                processor.set_key(&known_key);
                Ok(processor)
            })
            .collect::<Result<Vec<_>, Error>>()?;

        Ok(Self {
            cipher,
            config,
            processors,
            statistics: Statistics::new(),
            reference: None,
            leakage: None,
        })
    }

    pub fn config(&self) -> &AttackConfig {
        &self.config
    }

    pub fn statistics(&self) -> &Statistics {
        &self.statistics
    }

    /// Returns the synchronization reference, once known.
    pub fn reference(&self) -> Option<ArrayView1<f64>> {
        self.reference.as_ref().map(|reference| reference.view())
    }

    /// Synchronize traces on `reference` instead of a reference built from the first chunk.
    ///
    /// Leakage statistics restart from the next chunk.
    pub fn set_reference(&mut self, reference: Array1<f64>) {
        self.reference = Some(reference);
        self.leakage = None;
    }

    /// Returns the per-sample mean and variance of the traces aligned on the current reference.
    pub fn leakage(&self) -> Option<&MeanVar> {
        self.leakage.as_ref()
    }

    /// Returns the number of traces processed.
    pub fn num_traces(&self) -> usize {
        self.processors
            .first()
            .map_or(0, |processor| processor.num_traces())
    }

    /// Process a chunk of raw traces and record the resulting guesses.
    ///
    /// Traces are cropped to the configured window, then aligned on the reference. On error,
    /// no processor is modified.
    pub fn process<T: AsPrimitive<f64>>(
        &mut self,
        traces: &[Array1<T>],
        channel: impl AsRef<[ChannelEntry]>,
    ) -> Result<(), Error> {
        let channel = channel.as_ref();
        if traces.len() != channel.len() {
            return Err(Error::ShapeMismatch(format!(
                "{} traces for {} channel entries",
                traces.len(),
                channel.len()
            )));
        }
        if traces.is_empty() {
            return Ok(());
        }

        let traces: Vec<Array1<f64>> = traces.iter().map(|trace| trace.mapv(|x| x.as_())).collect();
        let traces = match &self.config.window {
            Some(window) => crop(&traces, window.clone())?,
            None => traces,
        };

        let max_shift = self.config.max_shift;
        let reference = match &self.reference {
            Some(reference) => reference.clone(),
            None => mean_trace(align(&traces, traces[0].view(), max_shift, 0.)?.view()),
        };
        let traces = align(&traces, reference.view(), max_shift, 0.)?;

        for processor in &self.processors {
            processor
                .validate(traces.view(), channel)
                .map_err(|source| Error::BytePosition {
                    byte: processor.target().byte,
                    source: Box::new(source),
                })?;
        }

        self.processors
            .par_iter_mut()
            .try_for_each(|processor| {
                let byte = processor.target().byte;
                processor
                    .accumulate(traces.view(), channel)
                    .map_err(|source| Error::BytePosition {
                        byte,
                        source: Box::new(source),
                    })
            })?;
        self.reference = Some(reference);

        let chunk = MeanVar::from_traces(traces.view());
        self.leakage = Some(match self.leakage.take() {
            Some(leakage) if leakage.is_compatible_with(&chunk) => leakage + chunk,
            _ => chunk,
        });

        let guesses: Vec<(usize, GuessStats)> = self
            .processors
            .par_iter()
            .map(|processor| {
                (
                    processor.target().byte,
                    processor.correlations().guess_stats(),
                )
            })
            .collect();
        self.statistics.update(self.num_traces(), guesses);

        tracing::info!(
            chunk = channel.len(),
            traces = self.num_traces(),
            "processed chunk"
        );

        Ok(())
    }

    /// Process all traces, chunk by chunk, then return the key guess.
    pub fn run<T: AsPrimitive<f64>>(
        &mut self,
        traces: &[Array1<T>],
        channel: impl AsRef<[ChannelEntry]>,
    ) -> Result<KeyGuess, Error> {
        let channel = channel.as_ref();
        if traces.len() != channel.len() {
            return Err(Error::ShapeMismatch(format!(
                "{} traces for {} channel entries",
                traces.len(),
                channel.len()
            )));
        }

        let chunk_size = self.config.chunks.max(1);
        let chunks = zip(traces.chunks(chunk_size), channel.chunks(chunk_size));
        #[cfg(feature = "progress_bar")]
        let chunks = chunks.progress_with(progress_bar(traces.len().div_ceil(chunk_size)));

        for (trace_chunk, channel_chunk) in chunks {
            self.process(trace_chunk, channel_chunk)?;
        }

        let guess = self.key_guess()?;
        tracing::info!(traces = self.num_traces(), %guess, "attack finished");

        Ok(guess)
    }

    /// Returns the correlations of every attacked byte.
    pub fn correlations(&self) -> Vec<(usize, Cpa)> {
        self.processors
            .par_iter()
            .map(|processor| (processor.target().byte, processor.correlations()))
            .collect()
    }

    /// Assemble the best guess of every attacked byte.
    ///
    /// The cipher key is recovered when every byte of the round was attacked and has a defined
    /// guess.
    pub fn key_guess(&self) -> Result<KeyGuess, Error> {
        let bytes: Vec<(usize, GuessStats)> = self
            .correlations()
            .into_iter()
            .map(|(byte, cpa)| (byte, cpa.guess_stats()))
            .collect();

        let mut round_key = vec![0u8; self.cipher.block_size()];
        let mut guessed = vec![false; self.cipher.block_size()];
        for (byte, stats) in &bytes {
            if !stats.is_undefined() {
                round_key[*byte] = stats.guess;
                guessed[*byte] = true;
            }
        }

        let key = if guessed.iter().all(|&g| g) {
            Some(self.cipher.recover_key(
                &round_key,
                self.config.direction(),
                self.config.round,
            )?)
        } else {
            None
        };

        Ok(KeyGuess {
            bytes,
            round_key,
            key,
        })
    }

    /// Forget every processed trace and the synchronization reference.
    pub fn clear(&mut self) {
        for processor in &mut self.processors {
            processor.clear();
        }
        self.statistics.clear();
        self.reference = None;
        self.leakage = None;
    }
}
