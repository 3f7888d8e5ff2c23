//! Random walk with drift for k_t and the bridge to life tables
//!
//! `k_{T+h} = k_T + h * drift + sigma * (Z_1 + ... + Z_h)`, Z ~ N(0, 1)
//!
//! Path `i` draws its innovations from its own ChaCha stream (`seed`, stream `i`),
//! so the simulated matrix is identical however rayon schedules the paths.

use log::{debug, info, warn};
use ndarray::{Array1, Array2, Axis};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;
use rayon::prelude::*;
use serde::Serialize;

use crate::config::{validate_quantile_pair, ProjectionConfig};
use crate::error::{locate, MortalityError, Result};
use crate::lee_carter::LeeCarter;
use crate::life_table::LifeTable;

/// Projected k_t paths for a fitted Lee-Carter model
#[derive(Debug, Clone)]
pub struct MortalityProjection {
    model: LeeCarter,
    drift: f64,
    sigma: f64,
    projected_years: Vec<i32>,
    kt_central: Array1<f64>,
    /// n_simulations x horizon
    kt_simulated: Array2<f64>,
    seed: u64,
    radix: f64,
}

/// Central, optimistic (low k quantile) and pessimistic (high k quantile) tables
#[derive(Debug, Clone)]
pub struct ConfidenceTables {
    pub central: LifeTable,
    pub optimistic: LifeTable,
    pub pessimistic: LifeTable,
}

/// Diagnostic checks; none of them gate the projection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProjectionChecks {
    pub drift_is_negative: bool,
    pub sigma_positive: bool,
    pub central_extends_trend: bool,
    pub no_nan_in_central: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProjectionSummary {
    pub horizon: usize,
    pub n_simulations: usize,
    pub seed: u64,
    pub projected_years: (i32, i32),
    pub drift: f64,
    pub sigma: f64,
    pub kt_central_range: (f64, f64),
    pub checks: ProjectionChecks,
}

impl MortalityProjection {
    /// Estimate drift and volatility from the fitted k_t and simulate
    pub fn new(model: &LeeCarter, config: &ProjectionConfig) -> Result<Self> {
        config.validate()?;
        let kt = model.time_index();
        let (drift, sigma) = drift_and_sigma(kt)?;
        if drift >= 0.0 {
            warn!(
                "k_t drift is {:.6} (non-negative): mortality is not improving over the fitted window",
                drift
            );
        }

        let kt_last = kt[kt.len() - 1];
        let last_year = model.years()[model.years().len() - 1];
        let horizon = config.horizon;

        let projected_years: Vec<i32> = (1..=horizon as i32).map(|h| last_year + h).collect();
        let kt_central: Array1<f64> = (1..=horizon).map(|h| kt_last + h as f64 * drift).collect();
        let kt_simulated =
            simulate_paths(kt_last, drift, sigma, horizon, config.n_simulations, config.seed);

        info!(
            "Projected k_t {}-{}: drift {:.4}, sigma {:.4}, {} paths",
            projected_years[0],
            projected_years[horizon - 1],
            drift,
            sigma,
            config.n_simulations
        );

        Ok(Self {
            model: model.clone(),
            drift,
            sigma,
            projected_years,
            kt_central,
            kt_simulated,
            seed: config.seed,
            radix: config.radix,
        })
    }

    pub fn model(&self) -> &LeeCarter {
        &self.model
    }

    pub fn drift(&self) -> f64 {
        self.drift
    }

    pub fn sigma(&self) -> f64 {
        self.sigma
    }

    pub fn horizon(&self) -> usize {
        self.projected_years.len()
    }

    pub fn n_simulations(&self) -> usize {
        self.kt_simulated.nrows()
    }

    pub fn radix(&self) -> f64 {
        self.radix
    }

    pub fn projected_years(&self) -> &[i32] {
        &self.projected_years
    }

    pub fn central_path(&self) -> &Array1<f64> {
        &self.kt_central
    }

    pub fn simulated_paths(&self) -> &Array2<f64> {
        &self.kt_simulated
    }

    /// Mean of the simulated paths at each horizon
    pub fn simulated_mean(&self) -> Array1<f64> {
        self.kt_simulated.sum_axis(Axis(0)) / self.n_simulations() as f64
    }

    fn year_index(&self, year: i32) -> Result<usize> {
        locate(&self.projected_years, year, "projection year")
    }

    pub fn kt_central(&self, year: i32) -> Result<f64> {
        Ok(self.kt_central[self.year_index(year)?])
    }

    /// Quantile `q` of the simulated k_t at `year`
    pub fn kt_quantile(&self, year: i32, q: f64) -> Result<f64> {
        Ok(self.kt_quantiles(year, &[q])?[0])
    }

    pub fn kt_quantiles(&self, year: i32, qs: &[f64]) -> Result<Vec<f64>> {
        let column = self.kt_simulated.column(self.year_index(year)?).to_vec();
        qs.iter().map(|&q| quantile(&column, q)).collect()
    }

    /// Width of the (q_lo, q_hi) band of simulated k_t at every horizon
    pub fn interval_width(&self, q_lo: f64, q_hi: f64) -> Result<Array1<f64>> {
        validate_quantile_pair(q_lo, q_hi)?;
        self.kt_simulated
            .axis_iter(Axis(1))
            .map(|column| -> Result<f64> {
                let values = column.to_vec();
                Ok(quantile(&values, q_hi)? - quantile(&values, q_lo)?)
            })
            .collect()
    }

    /// Central projected death rate exp(a_x + b_x * k_central)
    pub fn projected_rate(&self, age: i32, year: i32) -> Result<f64> {
        let k = self.kt_central(year)?;
        Ok((self.model.ax(age)? + self.model.bx(age)? * k).exp())
    }

    /// Rates for every age (rows) at each of `kt_values` (columns)
    pub fn projected_surface(&self, kt_values: &Array1<f64>) -> Array2<f64> {
        let (ax, bx) = (self.model.age_profile(), self.model.sensitivity());
        Array2::from_shape_fn((ax.len(), kt_values.len()), |(i, t)| {
            (ax[i] + bx[i] * kt_values[t]).exp()
        })
    }

    /// Quantiles of one cell's simulated death rate
    pub fn rate_interval(&self, age: i32, year: i32, quantiles: (f64, f64)) -> Result<(f64, f64)> {
        validate_quantile_pair(quantiles.0, quantiles.1)?;
        let (ax, bx) = (self.model.ax(age)?, self.model.bx(age)?);
        let rates: Vec<f64> = self
            .kt_simulated
            .column(self.year_index(year)?)
            .iter()
            .map(|k| (ax + bx * k).exp())
            .collect();
        Ok((quantile(&rates, quantiles.0)?, quantile(&rates, quantiles.1)?))
    }

    /// Life table for an arbitrary k value over all model ages
    ///
    /// q_x = 1 - exp(-m_x), terminal q forced to 1, all q clipped to [0, 1].
    pub fn life_table_for_kt(&self, k: f64) -> Result<LifeTable> {
        let (ax, bx) = (self.model.age_profile(), self.model.sensitivity());
        let n = ax.len();
        let qx: Vec<f64> = (0..n)
            .map(|i| {
                if i == n - 1 {
                    1.0
                } else {
                    let m = (ax[i] + bx[i] * k).exp();
                    (1.0 - (-m).exp()).clamp(0.0, 1.0)
                }
            })
            .collect();
        LifeTable::from_qx(self.model.ages().to_vec(), &qx, self.radix)
    }

    /// Central life table for a projected year, optionally restricted to an age range
    pub fn to_life_table(&self, year: i32, age_range: Option<(i32, i32)>) -> Result<LifeTable> {
        let table = self.life_table_for_kt(self.kt_central(year)?)?;
        match age_range {
            Some((start, end)) => table.subset(start, end),
            None => Ok(table),
        }
    }

    /// Central, optimistic and pessimistic tables for a projected year
    pub fn to_life_table_with_ci(&self, year: i32, quantiles: (f64, f64)) -> Result<ConfidenceTables> {
        validate_quantile_pair(quantiles.0, quantiles.1)?;
        let central = self.life_table_for_kt(self.kt_central(year)?)?;
        let bounds = self.kt_quantiles(year, &[quantiles.0, quantiles.1])?;
        debug!(
            "CI tables for {}: k central {:.4}, low {:.4}, high {:.4}",
            year,
            self.kt_central(year)?,
            bounds[0],
            bounds[1]
        );
        Ok(ConfidenceTables {
            central,
            optimistic: self.life_table_for_kt(bounds[0])?,
            pessimistic: self.life_table_for_kt(bounds[1])?,
        })
    }

    pub fn validate(&self) -> ProjectionChecks {
        let kt = self.model.time_index();
        ProjectionChecks {
            drift_is_negative: self.drift < 0.0,
            sigma_positive: self.sigma > 0.0,
            central_extends_trend: self.kt_central[self.horizon() - 1] < kt[kt.len() - 1],
            no_nan_in_central: !self.kt_central.iter().any(|k| k.is_nan()),
        }
    }

    pub fn summary(&self) -> ProjectionSummary {
        let h = self.horizon();
        ProjectionSummary {
            horizon: h,
            n_simulations: self.n_simulations(),
            seed: self.seed,
            projected_years: (self.projected_years[0], self.projected_years[h - 1]),
            drift: self.drift,
            sigma: self.sigma,
            kt_central_range: (self.kt_central[0], self.kt_central[h - 1]),
            checks: self.validate(),
        }
    }
}

/// drift = (k_T - k_1) / (T - 1); sigma = sample std of (diff(k) - drift)
///
/// With only two observed years there is a single innovation and sigma is 0.
pub fn drift_and_sigma(kt: &Array1<f64>) -> Result<(f64, f64)> {
    let n = kt.len();
    if n < 2 {
        return Err(MortalityError::degeneracy(
            "projection",
            format!("drift needs at least 2 years of k_t, got {}", n),
        ));
    }
    let drift = (kt[n - 1] - kt[0]) / (n - 1) as f64;
    if n == 2 {
        warn!("Only two years of k_t: volatility set to 0");
        return Ok((drift, 0.0));
    }

    let innovations: Vec<f64> = kt
        .windows(2)
        .into_iter()
        .map(|w| w[1] - w[0] - drift)
        .collect();
    let mean = innovations.iter().sum::<f64>() / innovations.len() as f64;
    let variance = innovations.iter().map(|e| (e - mean).powi(2)).sum::<f64>()
        / (innovations.len() - 1) as f64;
    Ok((drift, variance.sqrt()))
}

fn simulate_paths(
    kt_last: f64,
    drift: f64,
    sigma: f64,
    horizon: usize,
    n_simulations: usize,
    seed: u64,
) -> Array2<f64> {
    let mut paths = Array2::zeros((n_simulations, horizon));
    paths
        .axis_iter_mut(Axis(0))
        .into_par_iter()
        .enumerate()
        .for_each(|(i, mut path)| {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            rng.set_stream(i as u64);
            let mut walk = 0.0;
            for (h, k) in path.iter_mut().enumerate() {
                let z: f64 = rng.sample(StandardNormal);
                walk += z;
                *k = kt_last + (h + 1) as f64 * drift + sigma * walk;
            }
        });
    paths
}

/// Linear-interpolation sample quantile (type 7)
pub fn quantile(values: &[f64], q: f64) -> Result<f64> {
    if values.is_empty() {
        return Err(MortalityError::invalid_parameter("quantile of an empty sample"));
    }
    if !(0.0..=1.0).contains(&q) {
        return Err(MortalityError::invalid_parameter(format!(
            "quantile must lie in [0, 1], got {}",
            q
        )));
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);

    let position = q * (sorted.len() - 1) as f64;
    let lower = position.floor() as usize;
    let upper = position.ceil() as usize;
    let fraction = position - lower as f64;
    Ok(sorted[lower] + fraction * (sorted[upper] - sorted[lower]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::{assert_abs_diff_eq, assert_relative_eq};

    fn model_with_kt(kt: Array1<f64>) -> LeeCarter {
        let n_ages = 41;
        let ax = Array1::linspace(-7.0, -1.5, n_ages);
        let bx = Array1::from_elem(n_ages, 1.0 / n_ages as f64);
        let years: Vec<i32> = (1990..1990 + kt.len() as i32).collect();
        LeeCarter::from_parameters((60..60 + n_ages as i32).collect(), years, ax, bx, kt).unwrap()
    }

    /// Declining k_t with deterministic year-to-year noise
    fn noisy_model() -> LeeCarter {
        let kt = Array1::from_shape_fn(31, |t| 10.0 - t as f64 + 0.6 * ((t as f64) * 1.7).sin());
        model_with_kt(kt)
    }

    fn config(horizon: usize, n_simulations: usize, seed: u64) -> ProjectionConfig {
        ProjectionConfig {
            horizon,
            n_simulations,
            seed,
            ..ProjectionConfig::default()
        }
    }

    #[test]
    fn test_linear_kt_gives_exact_drift_and_zero_sigma() {
        let model = model_with_kt(Array1::linspace(10.0, -20.0, 31));
        let projection = MortalityProjection::new(&model, &config(10, 100, 42)).unwrap();

        assert_relative_eq!(projection.drift(), -1.0, max_relative = 1e-9);
        assert_abs_diff_eq!(projection.sigma(), 0.0, epsilon = 1e-10);
        assert_abs_diff_eq!(projection.kt_central(2021).unwrap(), -21.0, epsilon = 1e-9);
        for (sim, central) in projection.simulated_mean().iter().zip(projection.central_path()) {
            assert_abs_diff_eq!(*sim, *central, epsilon = 1e-8);
        }
    }

    #[test]
    fn test_projected_years_follow_last_observed() {
        let projection = MortalityProjection::new(&noisy_model(), &config(30, 10, 1)).unwrap();
        assert_eq!(projection.projected_years()[0], 2021);
        assert_eq!(projection.projected_years().len(), 30);
        assert_eq!(projection.central_path().len(), 30);
        assert_eq!(projection.simulated_paths().dim(), (10, 30));
    }

    #[test]
    fn test_simulated_mean_converges_to_central() {
        let n = 2000;
        let projection = MortalityProjection::new(&noisy_model(), &config(30, n, 42)).unwrap();
        let sigma = projection.sigma();
        assert!(sigma > 0.0);

        let mean = projection.simulated_mean();
        for (h, (m, c)) in mean.iter().zip(projection.central_path()).enumerate() {
            let standard_error = sigma * ((h + 1) as f64).sqrt() / (n as f64).sqrt();
            assert!((m - c).abs() < 5.0 * standard_error, "h = {}: {} vs {}", h + 1, m, c);
        }
    }

    #[test]
    fn test_interval_widens_with_horizon() {
        let projection = MortalityProjection::new(&noisy_model(), &config(30, 1000, 42)).unwrap();
        let widths = projection.interval_width(0.05, 0.95).unwrap();
        for pair in [0usize, 4, 9, 19, 29].windows(2) {
            assert!(widths[pair[1]] > widths[pair[0]], "{:?}", widths);
        }
    }

    #[test]
    fn test_reproducible_seed_and_thread_count() {
        let model = noisy_model();
        let a = MortalityProjection::new(&model, &config(15, 200, 7)).unwrap();
        let b = MortalityProjection::new(&model, &config(15, 200, 7)).unwrap();
        assert_eq!(a.simulated_paths(), b.simulated_paths());

        let single = rayon::ThreadPoolBuilder::new().num_threads(1).build().unwrap();
        let c = single
            .install(|| MortalityProjection::new(&model, &config(15, 200, 7)))
            .unwrap();
        assert_eq!(a.simulated_paths(), c.simulated_paths());

        let d = MortalityProjection::new(&model, &config(15, 200, 8)).unwrap();
        assert_ne!(a.simulated_paths(), d.simulated_paths());
    }

    #[test]
    fn test_year_beyond_horizon_is_out_of_range() {
        let projection = MortalityProjection::new(&noisy_model(), &config(5, 50, 42)).unwrap();
        assert!(projection.to_life_table(2025, None).is_ok());
        assert!(matches!(
            projection.to_life_table(2026, None),
            Err(MortalityError::OutOfRange { what: "projection year", requested: 2026, .. })
        ));
        assert!(projection.projected_rate(70, 2020).is_err());
    }

    #[test]
    fn test_bridged_table_properties() {
        let projection = MortalityProjection::new(&noisy_model(), &config(10, 200, 42)).unwrap();
        let table = projection.to_life_table(2030, None).unwrap();

        assert_eq!(table.radix(), 100_000.0);
        assert_eq!(table.q(table.max_age()).unwrap(), 1.0);
        assert!(table.validate().all_passed());
        let l = table.survivors();
        for (i, q) in table.death_probabilities().iter().enumerate().take(l.len() - 1) {
            if *q > 0.0 {
                assert!(l[i + 1] < l[i]);
            }
        }

        // central q matches 1 - exp(-m)
        let m = projection.projected_rate(70, 2030).unwrap();
        assert_relative_eq!(table.q(70).unwrap(), 1.0 - (-m).exp(), max_relative = 1e-12);
    }

    #[test]
    fn test_age_range_subset() {
        let projection = MortalityProjection::new(&noisy_model(), &config(10, 50, 42)).unwrap();
        let table = projection.to_life_table(2025, Some((65, 80))).unwrap();
        assert_eq!(table.min_age(), 65);
        assert_eq!(table.max_age(), 80);
        assert!(projection.to_life_table(2025, Some((50, 80))).is_err());
    }

    #[test]
    fn test_confidence_tables_are_ordered() {
        let projection = MortalityProjection::new(&noisy_model(), &config(20, 1000, 42)).unwrap();
        let tables = projection.to_life_table_with_ci(2040, (0.05, 0.95)).unwrap();

        // b_x > 0: a lower k means lighter mortality and more survivors
        let age = 85;
        let optimistic = tables.optimistic.l(age).unwrap();
        let central = tables.central.l(age).unwrap();
        let pessimistic = tables.pessimistic.l(age).unwrap();
        assert!(optimistic > central && central > pessimistic);
        for table in [&tables.central, &tables.optimistic, &tables.pessimistic] {
            assert!(table.validate().all_passed());
        }

        let (lo, hi) = projection.rate_interval(age, 2040, (0.05, 0.95)).unwrap();
        assert!(lo < projection.projected_rate(age, 2040).unwrap());
        assert!(hi > projection.projected_rate(age, 2040).unwrap());
    }

    #[test]
    fn test_projected_surface_shape() {
        let projection = MortalityProjection::new(&noisy_model(), &config(10, 10, 42)).unwrap();
        let surface = projection.projected_surface(projection.central_path());
        assert_eq!(surface.dim(), (41, 10));
        assert_relative_eq!(surface[(10, 0)], projection.projected_rate(70, 2021).unwrap());
    }

    #[test]
    fn test_positive_drift_is_kept() {
        let model = model_with_kt(Array1::linspace(-5.0, 5.0, 11));
        let projection = MortalityProjection::new(&model, &config(5, 20, 42)).unwrap();
        assert!(projection.drift() > 0.0);
        let checks = projection.validate();
        assert!(!checks.drift_is_negative);
        assert!(!checks.central_extends_trend);
        assert!(checks.no_nan_in_central);
    }

    #[test]
    fn test_summary_and_validation() {
        let projection = MortalityProjection::new(&noisy_model(), &config(30, 100, 42)).unwrap();
        let summary = projection.summary();
        assert_eq!(summary.horizon, 30);
        assert_eq!(summary.projected_years, (2021, 2050));
        let checks = projection.validate();
        assert!(checks.drift_is_negative && checks.sigma_positive);
        assert!(checks.central_extends_trend && checks.no_nan_in_central);
    }

    #[test]
    fn test_quantile_interpolates() {
        let values = [4.0, 1.0, 3.0, 2.0];
        assert_eq!(quantile(&values, 0.0).unwrap(), 1.0);
        assert_eq!(quantile(&values, 1.0).unwrap(), 4.0);
        assert_abs_diff_eq!(quantile(&values, 0.5).unwrap(), 2.5);
        assert_abs_diff_eq!(quantile(&values, 0.1).unwrap(), 1.3, epsilon = 1e-12);
        assert!(quantile(&values, 1.5).is_err());
        assert!(quantile(&[], 0.5).is_err());
    }

    #[test]
    fn test_drift_and_sigma_edge_cases() {
        assert!(drift_and_sigma(&Array1::from(vec![1.0])).is_err());
        let (drift, sigma) = drift_and_sigma(&Array1::from(vec![1.0, -1.0])).unwrap();
        assert_eq!(drift, -2.0);
        assert_eq!(sigma, 0.0);
    }
}
