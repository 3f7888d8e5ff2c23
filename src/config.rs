//! Pipeline configuration
//!
//! Constructed once by the caller and passed by reference to each stage.
//! Every field has a default, so a JSON file only needs to name what it changes.

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use crate::error::{MortalityError, Result};

/// Full configuration for a Dataset -> Graduation -> Lee-Carter -> Projection run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub dataset: DatasetConfig,
    pub graduation: GraduationConfig,
    pub fit: FitConfig,
    pub projection: ProjectionConfig,
}

/// Window, age ceiling and subgroup selection for the raw data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetConfig {
    /// First calendar year (inclusive)
    pub year_min: i32,
    /// Last calendar year (inclusive)
    pub year_max: i32,
    /// Ages above this are folded into it
    pub age_max: i32,
    /// Subgroup selector, e.g. "Male", "Female", "Total"
    pub subgroup: String,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            year_min: 1990,
            year_max: 2023,
            age_max: 100,
            subgroup: "Male".to_string(),
        }
    }
}

/// Whittaker-Henderson settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraduationConfig {
    /// Smooth the raw surface before fitting
    pub enabled: bool,
    /// Smoothing weight (lambda)
    pub lambda: f64,
    /// Order of the difference penalty
    pub diff_order: usize,
    /// Weight ages by exposure; uniform weights otherwise
    pub weight_by_exposure: bool,
}

impl Default for GraduationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            lambda: 1e5,
            diff_order: 2,
            weight_by_exposure: true,
        }
    }
}

/// Lee-Carter fitting settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FitConfig {
    /// Re-estimate k_t against observed death counts
    pub reestimate: bool,
    pub reestimation: ReestimationConfig,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            reestimate: true,
            reestimation: ReestimationConfig::default(),
        }
    }
}

/// What to do when no k reproduces a year's observed deaths
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DegradationPolicy {
    /// Keep the k with the smallest absolute death residual and continue
    #[default]
    BestEffort,
    /// Abort the fit with a NumericalDegeneracy error
    Strict,
}

/// Root-finding settings for the death-count re-estimation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReestimationConfig {
    /// Half-width of the symmetric search interval [-bracket, bracket]
    pub bracket: f64,
    /// Grid points for the sign-change scan
    pub scan_points: usize,
    /// Absolute tolerance on k
    pub tolerance: f64,
    pub max_iterations: usize,
    pub policy: DegradationPolicy,
}

impl Default for ReestimationConfig {
    fn default() -> Self {
        Self {
            bracket: 500.0,
            scan_points: 201,
            tolerance: 1e-12,
            max_iterations: 200,
            policy: DegradationPolicy::BestEffort,
        }
    }
}

/// Random-walk projection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectionConfig {
    /// Years projected beyond the last observed year
    pub horizon: usize,
    pub n_simulations: usize,
    pub seed: u64,
    /// Initial cohort size for bridged life tables
    pub radix: f64,
    pub quantile_low: f64,
    pub quantile_high: f64,
}

impl Default for ProjectionConfig {
    fn default() -> Self {
        Self {
            horizon: 30,
            n_simulations: 1000,
            seed: 42,
            radix: 100_000.0,
            quantile_low: 0.05,
            quantile_high: 0.95,
        }
    }
}

impl PipelineConfig {
    /// Load configuration from a JSON file
    pub fn from_json_path(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let config: Self = serde_json::from_reader(BufReader::new(file))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values no stage could use
    pub fn validate(&self) -> Result<()> {
        self.dataset.validate()?;
        self.graduation.validate()?;
        self.fit.reestimation.validate()?;
        self.projection.validate()
    }
}

impl DatasetConfig {
    pub fn validate(&self) -> Result<()> {
        if self.year_min > self.year_max {
            return Err(MortalityError::invalid_parameter(format!(
                "year_min {} is after year_max {}",
                self.year_min, self.year_max
            )));
        }
        if self.age_max < 0 {
            return Err(MortalityError::invalid_parameter(format!(
                "age_max must be non-negative, got {}",
                self.age_max
            )));
        }
        Ok(())
    }
}

impl GraduationConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.lambda.is_finite() || self.lambda < 0.0 {
            return Err(MortalityError::invalid_parameter(format!(
                "lambda must be finite and >= 0, got {}",
                self.lambda
            )));
        }
        if self.diff_order == 0 {
            return Err(MortalityError::invalid_parameter("diff_order must be >= 1"));
        }
        Ok(())
    }
}

impl ReestimationConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.bracket.is_finite() || self.bracket <= 0.0 {
            return Err(MortalityError::invalid_parameter(format!(
                "re-estimation bracket must be positive, got {}",
                self.bracket
            )));
        }
        if self.scan_points < 2 {
            return Err(MortalityError::invalid_parameter("scan_points must be >= 2"));
        }
        if !(self.tolerance > 0.0) {
            return Err(MortalityError::invalid_parameter("tolerance must be positive"));
        }
        if self.max_iterations == 0 {
            return Err(MortalityError::invalid_parameter("max_iterations must be >= 1"));
        }
        Ok(())
    }
}

impl ProjectionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.horizon == 0 {
            return Err(MortalityError::invalid_parameter("horizon must be >= 1"));
        }
        if self.n_simulations == 0 {
            return Err(MortalityError::invalid_parameter("n_simulations must be >= 1"));
        }
        if !(self.radix > 0.0) || !self.radix.is_finite() {
            return Err(MortalityError::invalid_parameter(format!(
                "radix must be positive, got {}",
                self.radix
            )));
        }
        validate_quantile_pair(self.quantile_low, self.quantile_high)
    }
}

pub(crate) fn validate_quantile_pair(low: f64, high: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&low) || !(0.0..=1.0).contains(&high) || low > high {
        return Err(MortalityError::invalid_parameter(format!(
            "quantiles must satisfy 0 <= low <= high <= 1, got ({}, {})",
            low, high
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.graduation.diff_order, 2);
        assert_eq!(config.projection.horizon, 30);
        assert_eq!(config.fit.reestimation.policy, DegradationPolicy::BestEffort);
    }

    #[test]
    fn test_partial_json_falls_back_to_defaults() {
        let json = r#"{
            "dataset": { "year_min": 2000, "subgroup": "Female" },
            "fit": { "reestimation": { "policy": "Strict" } },
            "projection": { "horizon": 10 }
        }"#;
        let config: PipelineConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.dataset.year_min, 2000);
        assert_eq!(config.dataset.year_max, 2023);
        assert_eq!(config.dataset.subgroup, "Female");
        assert_eq!(config.fit.reestimation.policy, DegradationPolicy::Strict);
        assert!(config.fit.reestimate);
        assert_eq!(config.projection.horizon, 10);
        assert_eq!(config.projection.n_simulations, 1000);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = PipelineConfig::default();
        config.graduation.lambda = -1.0;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.projection.quantile_low = 0.9;
        config.projection.quantile_high = 0.1;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.dataset.year_min = 2030;
        assert!(config.validate().is_err());
    }
}
