//! Whittaker-Henderson graduation of mortality rates
//!
//! Smoothing happens per calendar year over the age axis, in log space.

mod graduated;
pub mod whittaker;

pub use graduated::{roughness, GraduatedRates, GraduationChecks, GraduationSummary};
pub use whittaker::{difference_matrix, whittaker_smooth};
