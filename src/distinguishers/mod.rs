//! Distinguishers ranking key hypotheses against side channel traces.
pub mod cpa;
