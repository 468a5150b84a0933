//! Power models mapping an intermediate value to a predicted leakage.
use serde::{Deserialize, Serialize};

pub mod aes;

pub fn hw(value: usize) -> usize {
    value.count_ones() as usize
}

/// Maps an intermediate byte to a scalar predicted leakage.
///
/// Predictions must be deterministic, since the same model is evaluated for every
/// hypothesis and every trace of a session.
pub trait PowerModel: Sync {
    fn predict(&self, value: u8) -> f64;
}

impl<F> PowerModel for F
where
    F: Fn(u8) -> f64 + Sync,
{
    fn predict(&self, value: u8) -> f64 {
        self(value)
    }
}

/// Number of set bits of the intermediate value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HammingWeight;

impl PowerModel for HammingWeight {
    fn predict(&self, value: u8) -> f64 {
        hw(value as usize) as f64
    }
}

/// The intermediate value itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity;

impl PowerModel for Identity {
    fn predict(&self, value: u8) -> f64 {
        value as f64
    }
}

/// A single bit of the intermediate value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bit(pub u8);

impl PowerModel for Bit {
    fn predict(&self, value: u8) -> f64 {
        ((value >> (self.0 & 7)) & 1) as f64
    }
}

/// Power model selection, for configuration files.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Model {
    #[default]
    HammingWeight,
    Identity,
    Bit(u8),
}

impl PowerModel for Model {
    fn predict(&self, value: u8) -> f64 {
        match *self {
            Model::HammingWeight => HammingWeight.predict(value),
            Model::Identity => Identity.predict(value),
            Model::Bit(bit) => Bit(bit).predict(value),
        }
    }
}
