//! Graduated (smoothed) mortality surface
//!
//! Each year's age vector is smoothed independently in log space, so the
//! graduated rates are always strictly positive. The raw rates are kept for
//! residual and roughness diagnostics.

use log::{debug, info};
use ndarray::{Array1, Array2, Axis};
use rayon::prelude::*;
use serde::Serialize;

use super::whittaker::{vector_roughness, whittaker_smooth};
use crate::config::GraduationConfig;
use crate::data::MortalitySurface;
use crate::error::{locate, MortalityError, Result};

/// Mean log residual above which `validate` flags a systematic shift
const RESIDUAL_MEAN_TOLERANCE: f64 = 0.1;

/// Whittaker-Henderson graduated rates with the raw surface retained
#[derive(Debug, Clone)]
pub struct GraduatedRates {
    subgroup: String,
    ages: Vec<i32>,
    years: Vec<i32>,
    mx: Array2<f64>,
    raw_mx: Array2<f64>,
    dx: Array2<f64>,
    ex: Array2<f64>,
    lambda: f64,
    diff_order: usize,
}

/// Self-checks on a graduated surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GraduationChecks {
    pub no_nan: bool,
    pub all_positive: bool,
    pub smoother_than_raw: bool,
    pub residual_mean_near_zero: bool,
}

impl GraduationChecks {
    pub fn all_passed(&self) -> bool {
        self.no_nan && self.all_positive && self.smoother_than_raw && self.residual_mean_near_zero
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GraduationSummary {
    pub lambda: f64,
    pub diff_order: usize,
    pub raw_roughness: f64,
    pub graduated_roughness: f64,
    /// Fraction of raw roughness removed (0 when the raw surface is already flat)
    pub roughness_reduction: f64,
    pub residual_mean: f64,
    pub residual_std: f64,
    pub checks: GraduationChecks,
}

/// Sum over years of squared second age-differences of log rates
pub fn roughness(rates: &Array2<f64>) -> f64 {
    let log_rates = rates.mapv(f64::ln);
    log_rates
        .axis_iter(Axis(1))
        .map(|column| vector_roughness(column))
        .sum()
}

impl GraduatedRates {
    /// Smooth every year of `surface`
    ///
    /// Weights are the exposures when `weight_by_exposure` is set, otherwise
    /// uniform. Any year whose system cannot be solved fails the whole
    /// graduation with a NumericalDegeneracy naming that year.
    pub fn new<S: MortalitySurface + ?Sized>(surface: &S, config: &GraduationConfig) -> Result<Self> {
        config.validate()?;
        let raw_mx = surface.rates().clone();
        let log_rates = surface.log_rates();
        let exposures = surface.exposures();
        let years = surface.years();
        let subgroup = surface.subgroup();
        let uniform = Array1::<f64>::ones(surface.ages().len());

        let columns: Vec<Array1<f64>> = (0..years.len())
            .into_par_iter()
            .map(|j| {
                let weights = if config.weight_by_exposure {
                    exposures.column(j).to_owned()
                } else {
                    uniform.clone()
                };
                whittaker_smooth(log_rates.column(j), weights.view(), config.lambda, config.diff_order)
                    .map(|z| z.mapv(f64::exp))
                    .map_err(|e| name_year(e, years[j]).in_subgroup(subgroup))
            })
            .collect::<Result<_>>()?;

        let mut mx = Array2::zeros(raw_mx.raw_dim());
        for (j, column) in columns.into_iter().enumerate() {
            mx.column_mut(j).assign(&column);
        }

        for ((i, j), &rate) in mx.indexed_iter() {
            if !rate.is_finite() || rate <= 0.0 {
                return Err(MortalityError::degeneracy(
                    "graduation",
                    format!(
                        "graduated rate {} at {}, age {}, year {} is not strictly positive",
                        rate,
                        subgroup,
                        surface.ages()[i],
                        years[j]
                    ),
                ));
            }
        }

        let graduated = Self {
            subgroup: subgroup.to_string(),
            ages: surface.ages().to_vec(),
            years: years.to_vec(),
            mx,
            raw_mx,
            dx: surface.deaths().clone(),
            ex: exposures.clone(),
            lambda: config.lambda,
            diff_order: config.diff_order,
        };
        info!(
            "Graduated {} years (lambda = {:e}, order {}): roughness {:.4} -> {:.4}",
            graduated.years.len(),
            graduated.lambda,
            graduated.diff_order,
            graduated.raw_roughness(),
            graduated.roughness()
        );
        Ok(graduated)
    }

    pub fn lambda(&self) -> f64 {
        self.lambda
    }

    pub fn diff_order(&self) -> usize {
        self.diff_order
    }

    pub fn raw_rates(&self) -> &Array2<f64> {
        &self.raw_mx
    }

    pub fn graduated_rate(&self, age: i32, year: i32) -> Result<f64> {
        self.rate(age, year)
    }

    pub fn raw_rate(&self, age: i32, year: i32) -> Result<f64> {
        let row = locate(&self.ages, age, "age")?;
        let col = locate(&self.years, year, "year")?;
        Ok(self.raw_mx[(row, col)])
    }

    /// Per-cell residuals: log(raw) - log(graduated)
    pub fn residuals(&self) -> Array2<f64> {
        self.raw_mx.mapv(f64::ln) - self.mx.mapv(f64::ln)
    }

    pub fn roughness(&self) -> f64 {
        roughness(&self.mx)
    }

    pub fn raw_roughness(&self) -> f64 {
        roughness(&self.raw_mx)
    }

    pub fn roughness_reduction(&self) -> f64 {
        let raw = self.raw_roughness();
        if raw > 0.0 {
            1.0 - self.roughness() / raw
        } else {
            0.0
        }
    }

    pub fn validate(&self) -> GraduationChecks {
        let raw = self.raw_roughness();
        let residual_mean = self.residuals().mean().unwrap_or(0.0);
        let checks = GraduationChecks {
            no_nan: !self.mx.iter().any(|v| v.is_nan()),
            all_positive: self.mx.iter().all(|&v| v > 0.0),
            smoother_than_raw: self.roughness() <= raw * (1.0 + 1e-9) + 1e-12,
            residual_mean_near_zero: residual_mean.abs() < RESIDUAL_MEAN_TOLERANCE,
        };
        debug!("Graduation checks: {:?}", checks);
        checks
    }

    pub fn summary(&self) -> GraduationSummary {
        let residuals = self.residuals();
        GraduationSummary {
            lambda: self.lambda,
            diff_order: self.diff_order,
            raw_roughness: self.raw_roughness(),
            graduated_roughness: self.roughness(),
            roughness_reduction: self.roughness_reduction(),
            residual_mean: residuals.mean().unwrap_or(0.0),
            residual_std: residuals.std(0.0),
            checks: self.validate(),
        }
    }
}

fn name_year(err: MortalityError, year: i32) -> MortalityError {
    match err {
        MortalityError::NumericalDegeneracy { stage, message } => {
            MortalityError::degeneracy(stage, format!("year {}: {}", year, message))
        }
        other => other,
    }
}

impl MortalitySurface for GraduatedRates {
    fn subgroup(&self) -> &str {
        &self.subgroup
    }

    fn ages(&self) -> &[i32] {
        &self.ages
    }

    fn years(&self) -> &[i32] {
        &self.years
    }

    fn rates(&self) -> &Array2<f64> {
        &self.mx
    }

    fn deaths(&self) -> &Array2<f64> {
        &self.dx
    }

    fn exposures(&self) -> &Array2<f64> {
        &self.ex
    }
}
