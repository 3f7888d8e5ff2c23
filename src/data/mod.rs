//! Mortality data: raw-source loading and the validated (age x year) dataset

mod dataset;
pub mod loader;
mod surface;

pub use dataset::{DatasetSummary, MortalityDataset, RATE_CONSISTENCY_TOLERANCE};
pub use loader::{HmdSource, RawRecord};
pub use surface::MortalitySurface;
