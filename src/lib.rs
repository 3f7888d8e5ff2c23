//! Lee-Carter Engine - stochastic mortality projection from raw death and exposure data
//!
//! This library provides:
//! - Loading and validation of mortality surfaces (HMD files, keyed CSV records)
//! - Whittaker-Henderson graduation of rates in log space
//! - Lee-Carter decomposition with death-count re-estimation of k_t
//! - Random-walk-with-drift projection of k_t with seeded Monte Carlo paths
//! - Bridged life tables (central and confidence bounds) and table comparison

pub mod comparison;
pub mod config;
pub mod data;
pub mod error;
pub mod graduation;
pub mod lee_carter;
pub mod life_table;
pub mod linalg;
pub mod pipeline;
pub mod projection;

// Re-export commonly used types
pub use comparison::MortalityComparison;
pub use config::{DegradationPolicy, PipelineConfig};
pub use data::{HmdSource, MortalityDataset, MortalitySurface};
pub use error::{MortalityError, Result};
pub use graduation::GraduatedRates;
pub use lee_carter::{LeeCarter, ReestimationReport, SolveTier};
pub use life_table::LifeTable;
pub use pipeline::{MortalityPipeline, PipelineOutput};
pub use projection::MortalityProjection;
