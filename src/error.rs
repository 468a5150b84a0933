use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid block length: expected {expected} bytes, got {actual}")]
    InvalidBlockLength { expected: usize, actual: usize },
    #[error("Invalid key length: expected {expected} bytes, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },
    #[error("Invalid target: round {round}, byte {byte}")]
    InvalidTarget { round: usize, byte: usize },
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),
    #[error("Window {start}..{end} is out of range for a trace of {len} samples")]
    OutOfRange { start: usize, end: usize, len: usize },
    #[error("Key byte {byte} failed")]
    BytePosition {
        byte: usize,
        #[source]
        source: Box<Error>,
    },
    #[error("Invalid hexadecimal key")]
    InvalidHex(#[from] hex::FromHexError),
    #[error("Failed to save/load scabox data")]
    SaveLoadError(#[from] serde_json::Error),
    #[error(transparent)]
    IoError(#[from] io::Error),
}
