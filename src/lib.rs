pub mod attack;
pub mod cipher;
pub mod distinguishers;
pub mod error;
pub mod leakage_model;
pub mod preprocessors;
pub mod processors;
pub mod statistics;
pub mod trace;
pub mod util;

pub use crate::error::Error;
