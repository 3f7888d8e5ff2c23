//! Lee-Carter factor model
//!
//! - `model`: SVD decomposition of the log-rate surface into a_x, b_x, k_t
//! - `reestimate`: per-year re-calibration of k_t against observed deaths

mod model;
pub mod reestimate;

pub use model::{FitChecks, FitSummary, GoodnessOfFit, KtTrend, LeeCarter, CONSTRAINT_TOLERANCE};
pub use reestimate::{ReestimationReport, SolveTier, YearSolve};
