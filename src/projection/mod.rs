//! Stochastic projection of the Lee-Carter time index
//!
//! - Central path: linear extension of the observed drift
//! - Simulated paths: random walk with drift, one ChaCha stream per path
//! - Bridge: projected rates -> one-year death probabilities -> life tables

mod stochastic;

pub use stochastic::{
    drift_and_sigma, quantile, ConfidenceTables, MortalityProjection, ProjectionChecks,
    ProjectionSummary,
};
