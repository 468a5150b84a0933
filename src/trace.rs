use ndarray::Array1;
use serde::{Deserialize, Serialize};

use crate::cipher::Direction;

/// Encryption data associated to a trace.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChannelEntry {
    pub plain: Vec<u8>,
    pub cipher: Vec<u8>,
    /// Cipher key, when known to the acquisition
    pub key: Vec<u8>,
}

impl ChannelEntry {
    pub fn new(plain: Vec<u8>, cipher: Vec<u8>, key: Vec<u8>) -> Self {
        Self { plain, cipher, key }
    }

    /// Returns the block the cipher model starts from in the given direction.
    pub fn block(&self, direction: Direction) -> &[u8] {
        match direction {
            Direction::Encrypt => &self.plain,
            Direction::Decrypt => &self.cipher,
        }
    }
}

/// Encryption data of a batch of traces. Entry `i` belongs to trace `i`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Channel {
    entries: Vec<ChannelEntry>,
}

impl Channel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: ChannelEntry) {
        self.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChannelEntry> {
        self.entries.iter()
    }

    pub fn entries(&self) -> &[ChannelEntry] {
        &self.entries
    }

    /// Return the entries in `range` as a new channel.
    pub fn slice(&self, range: std::ops::Range<usize>) -> Self {
        Self {
            entries: self.entries[range].to_vec(),
        }
    }

    /// Split the channel in chunks of at most `size` entries.
    ///
    /// # Panics
    /// Panics if `size` is 0.
    pub fn chunks(&self, size: usize) -> impl Iterator<Item = &[ChannelEntry]> {
        self.entries.chunks(size)
    }
}

impl AsRef<[ChannelEntry]> for Channel {
    fn as_ref(&self) -> &[ChannelEntry] {
        &self.entries
    }
}

impl From<Vec<ChannelEntry>> for Channel {
    fn from(entries: Vec<ChannelEntry>) -> Self {
        Self { entries }
    }
}

impl FromIterator<ChannelEntry> for Channel {
    fn from_iter<I: IntoIterator<Item = ChannelEntry>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

impl Extend<ChannelEntry> for Channel {
    fn extend<I: IntoIterator<Item = ChannelEntry>>(&mut self, iter: I) {
        self.entries.extend(iter);
    }
}

/// A side channel leakage record associated to its encryption data.
#[derive(Debug, Clone)]
pub struct Trace<T> {
    /// Leakage waveform
    pub leakage: Array1<T>,
    /// Associated encryption data
    pub entry: ChannelEntry,
}

impl<T> Trace<T> {
    pub fn new(leakage: Array1<T>, entry: ChannelEntry) -> Self {
        Self { leakage, entry }
    }

    /// Returns the number of points in the leakage waveform.
    pub fn len(&self) -> usize {
        self.leakage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leakage.is_empty()
    }
}

/// Split records into leakages and their channel.
pub fn unzip<T>(traces: Vec<Trace<T>>) -> (Vec<Array1<T>>, Channel) {
    traces
        .into_iter()
        .map(|trace| (trace.leakage, trace.entry))
        .unzip()
}
