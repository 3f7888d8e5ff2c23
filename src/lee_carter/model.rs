//! Lee-Carter fit: ln(m_{x,t}) = a_x + b_x * k_t
//!
//! Identifiability constraints after every fit: sum(b_x) = 1 and sum(k_t) = 0.
//! Re-centering k_t always folds the removed mean back into a_x, so the
//! rank-one reconstruction is unchanged by the constraint.

use log::{debug, info, warn};
use ndarray::{Array1, Array2, Axis};
use serde::Serialize;

use super::reestimate::{reestimate_kt, ReestimationReport};
use crate::config::FitConfig;
use crate::data::MortalitySurface;
use crate::error::{locate, MortalityError, Result};
use crate::linalg::DenseSvd;

/// Tolerance on the sum constraints for b_x and k_t
pub const CONSTRAINT_TOLERANCE: f64 = 1e-6;

/// Fitted Lee-Carter parameters
#[derive(Debug, Clone)]
pub struct LeeCarter {
    ages: Vec<i32>,
    years: Vec<i32>,
    ax: Array1<f64>,
    bx: Array1<f64>,
    kt: Array1<f64>,
    explained_variance: f64,
    log_mx: Array2<f64>,
    reestimation: Option<ReestimationReport>,
}

/// Log-space fit statistics
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GoodnessOfFit {
    pub explained_variance: f64,
    pub rmse: f64,
    pub max_abs_error: f64,
    pub mean_abs_error: f64,
}

/// Constraint checks on the fitted parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FitChecks {
    pub bx_sums_to_one: bool,
    pub kt_sums_to_zero: bool,
    pub no_nan: bool,
    /// Diagnostic only: real data normally exceeds 50%
    pub explained_var_reasonable: bool,
}

impl FitChecks {
    pub fn all_passed(&self) -> bool {
        self.bx_sums_to_one && self.kt_sums_to_zero && self.no_nan && self.explained_var_reasonable
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum KtTrend {
    Decreasing,
    Increasing,
}

#[derive(Debug, Clone, Serialize)]
pub struct FitSummary {
    pub n_ages: usize,
    pub n_years: usize,
    pub age_range: (i32, i32),
    pub year_range: (i32, i32),
    pub explained_variance: f64,
    pub rmse: f64,
    pub kt_trend: KtTrend,
    pub kt_range: (f64, f64),
    pub reestimated: bool,
    pub checks: FitChecks,
}

impl LeeCarter {
    /// Fit a_x, b_x, k_t to any mortality surface
    ///
    /// The surface's rates supply the log-rate matrix; its deaths and
    /// exposures are used only when `config.reestimate` is set.
    pub fn fit<S: MortalitySurface + ?Sized>(surface: &S, config: &FitConfig) -> Result<Self> {
        Self::fit_surface(surface, config).map_err(|e| e.in_subgroup(surface.subgroup()))
    }

    fn fit_surface<S: MortalitySurface + ?Sized>(surface: &S, config: &FitConfig) -> Result<Self> {
        let (n_ages, n_years) = surface.shape();
        if n_ages < 2 || n_years < 2 {
            return Err(MortalityError::degeneracy(
                "lee-carter",
                format!("need at least 2 ages and 2 years, got {} x {}", n_ages, n_years),
            ));
        }

        let log_mx = surface.log_rates();
        if log_mx.iter().any(|v| !v.is_finite()) {
            return Err(MortalityError::degeneracy(
                "lee-carter",
                "log rates contain non-finite values",
            ));
        }

        let mut ax = row_means(&log_mx);
        let residual = &log_mx - &ax.view().insert_axis(Axis(1));

        let svd = residual
            .svd_full()
            .map_err(|e| e.into_degeneracy("lee-carter"))?;
        let total: f64 = svd.s.iter().map(|s| s * s).sum();
        if !(total > 0.0) {
            return Err(MortalityError::degeneracy(
                "lee-carter",
                "log rates do not vary over time; nothing to decompose",
            ));
        }
        let explained_variance = svd.s[0] * svd.s[0] / total;

        let mut bx = svd.u.column(0).to_owned();
        let mut kt = svd.vt.row(0).to_owned() * svd.s[0];
        let mut bx_sum = bx.sum();
        if bx_sum.abs() < 1e-12 {
            return Err(MortalityError::degeneracy(
                "lee-carter",
                "age sensitivity sums to zero and cannot be normalized",
            ));
        }
        if bx_sum < 0.0 {
            bx.mapv_inplace(|v| -v);
            kt.mapv_inplace(|v| -v);
            bx_sum = -bx_sum;
        }
        bx /= bx_sum;
        kt *= bx_sum;
        recenter(&mut ax, &bx, &mut kt);

        let reestimation = if config.reestimate {
            let report = reestimate_kt(
                &ax,
                &bx,
                surface.deaths(),
                surface.exposures(),
                surface.years(),
                &config.reestimation,
            )?;
            let degraded = report.degraded().count();
            if degraded > 0 {
                warn!(
                    "k_t re-estimation: {} of {} years needed a fallback tier",
                    degraded, n_years
                );
            }
            kt = report.raw_kt();
            recenter(&mut ax, &bx, &mut kt);
            Some(report)
        } else {
            None
        };

        let model = Self {
            ages: surface.ages().to_vec(),
            years: surface.years().to_vec(),
            ax,
            bx,
            kt,
            explained_variance,
            log_mx,
            reestimation,
        };
        model.check_finite()?;

        info!(
            "Fitted Lee-Carter on {} ages x {} years: explained variance {:.4}{}",
            n_ages,
            n_years,
            explained_variance,
            if model.reestimation.is_some() { ", k_t re-estimated" } else { "" }
        );
        Ok(model)
    }

    /// Build a model from known parameters
    ///
    /// The reference log-rate surface is the model's own reconstruction, so
    /// the explained variance is reported as 1.
    pub fn from_parameters(
        ages: Vec<i32>,
        years: Vec<i32>,
        ax: Array1<f64>,
        bx: Array1<f64>,
        kt: Array1<f64>,
    ) -> Result<Self> {
        if ages.is_empty() || years.is_empty() {
            return Err(MortalityError::invalid_parameter("ages and years must be non-empty"));
        }
        if ax.len() != ages.len() || bx.len() != ages.len() || kt.len() != years.len() {
            return Err(MortalityError::invalid_parameter(format!(
                "parameter lengths (a_x {}, b_x {}, k_t {}) do not match {} ages x {} years",
                ax.len(),
                bx.len(),
                kt.len(),
                ages.len(),
                years.len()
            )));
        }
        for labels in [&ages, &years] {
            if labels.windows(2).any(|w| w[1] != w[0] + 1) {
                return Err(MortalityError::invalid_parameter("ages and years must be consecutive"));
            }
        }

        let log_mx = reconstruct(&ax, &bx, &kt);
        let model = Self {
            ages,
            years,
            ax,
            bx,
            kt,
            explained_variance: 1.0,
            log_mx,
            reestimation: None,
        };
        model.check_finite()?;
        Ok(model)
    }

    fn check_finite(&self) -> Result<()> {
        let finite = |v: &Array1<f64>| v.iter().all(|x| x.is_finite());
        if !(finite(&self.ax) && finite(&self.bx) && finite(&self.kt)) {
            return Err(MortalityError::degeneracy(
                "lee-carter",
                "fitted parameters contain non-finite values",
            ));
        }
        Ok(())
    }

    pub fn ages(&self) -> &[i32] {
        &self.ages
    }

    pub fn years(&self) -> &[i32] {
        &self.years
    }

    /// Age profile a_x over all ages
    pub fn age_profile(&self) -> &Array1<f64> {
        &self.ax
    }

    /// Age sensitivity b_x over all ages
    pub fn sensitivity(&self) -> &Array1<f64> {
        &self.bx
    }

    /// Time index k_t over all years
    pub fn time_index(&self) -> &Array1<f64> {
        &self.kt
    }

    pub fn explained_variance(&self) -> f64 {
        self.explained_variance
    }

    /// Source log-rate surface the model was fitted to
    pub fn log_rates(&self) -> &Array2<f64> {
        &self.log_mx
    }

    pub fn reestimation(&self) -> Option<&ReestimationReport> {
        self.reestimation.as_ref()
    }

    pub fn ax(&self, age: i32) -> Result<f64> {
        Ok(self.ax[locate(&self.ages, age, "age")?])
    }

    pub fn bx(&self, age: i32) -> Result<f64> {
        Ok(self.bx[locate(&self.ages, age, "age")?])
    }

    pub fn kt(&self, year: i32) -> Result<f64> {
        Ok(self.kt[locate(&self.years, year, "year")?])
    }

    /// exp(a_x + b_x * k_t) for one cell
    pub fn fitted_rate(&self, age: i32, year: i32) -> Result<f64> {
        Ok((self.ax(age)? + self.bx(age)? * self.kt(year)?).exp())
    }

    pub fn fitted_log_rates(&self) -> Array2<f64> {
        reconstruct(&self.ax, &self.bx, &self.kt)
    }

    pub fn fitted_rates(&self) -> Array2<f64> {
        self.fitted_log_rates().mapv(f64::exp)
    }

    /// Model-implied deaths for given exposures (ages x years)
    pub fn implied_deaths(&self, exposures: &Array2<f64>) -> Array2<f64> {
        self.fitted_rates() * exposures
    }

    pub fn goodness_of_fit(&self) -> GoodnessOfFit {
        let errors = &self.log_mx - &self.fitted_log_rates();
        let n = errors.len() as f64;
        GoodnessOfFit {
            explained_variance: self.explained_variance,
            rmse: (errors.mapv(|e| e * e).sum() / n).sqrt(),
            max_abs_error: errors.iter().fold(0.0, |m, e| m.max(e.abs())),
            mean_abs_error: errors.mapv(f64::abs).sum() / n,
        }
    }

    pub fn validate(&self) -> FitChecks {
        let all_finite = |v: &Array1<f64>| !v.iter().any(|x| x.is_nan());
        let checks = FitChecks {
            bx_sums_to_one: (self.bx.sum() - 1.0).abs() < CONSTRAINT_TOLERANCE,
            kt_sums_to_zero: self.kt.sum().abs() < CONSTRAINT_TOLERANCE,
            no_nan: all_finite(&self.ax) && all_finite(&self.bx) && all_finite(&self.kt),
            explained_var_reasonable: self.explained_variance > 0.5,
        };
        debug!("Lee-Carter checks: {:?}", checks);
        checks
    }

    pub fn summary(&self) -> FitSummary {
        let n_years = self.kt.len();
        FitSummary {
            n_ages: self.ages.len(),
            n_years,
            age_range: (self.ages[0], self.ages[self.ages.len() - 1]),
            year_range: (self.years[0], self.years[n_years - 1]),
            explained_variance: self.explained_variance,
            rmse: self.goodness_of_fit().rmse,
            kt_trend: if self.kt[n_years - 1] < self.kt[0] {
                KtTrend::Decreasing
            } else {
                KtTrend::Increasing
            },
            kt_range: (
                self.kt.iter().copied().fold(f64::INFINITY, f64::min),
                self.kt.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            ),
            reestimated: self.reestimation.is_some(),
            checks: self.validate(),
        }
    }
}

fn row_means(matrix: &Array2<f64>) -> Array1<f64> {
    matrix.sum_axis(Axis(1)) / matrix.ncols() as f64
}

/// Center k_t on zero and move the offset into a_x
fn recenter(ax: &mut Array1<f64>, bx: &Array1<f64>, kt: &mut Array1<f64>) {
    let offset = kt.sum() / kt.len() as f64;
    kt.mapv_inplace(|k| k - offset);
    ax.scaled_add(offset, bx);
}

fn reconstruct(ax: &Array1<f64>, bx: &Array1<f64>, kt: &Array1<f64>) -> Array2<f64> {
    Array2::from_shape_fn((ax.len(), kt.len()), |(i, t)| ax[i] + bx[i] * kt[t])
}
