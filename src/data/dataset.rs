//! Validated mortality dataset: rates, deaths and exposure by age and year
//!
//! Built once from raw keyed records and immutable afterwards. Construction
//! performs every integrity check, so later stages never re-validate:
//! - no NaN or infinite values in any matrix
//! - strictly positive exposure and rates (rates are log-transformed later)
//! - m_{x,t} within 1% of d_{x,t} / L_{x,t}
//!
//! Ages above the ceiling are folded into the ceiling age by summing deaths
//! and exposure and recomputing the rate, never by averaging rates.

use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveDate;
use log::{debug, info};
use ndarray::Array2;
use serde::Serialize;

use super::loader::RawRecord;
use super::surface::MortalitySurface;
use crate::config::DatasetConfig;
use crate::error::{MortalityError, Result};

/// Relative tolerance between the supplied rate and deaths / exposure
pub const RATE_CONSISTENCY_TOLERANCE: f64 = 0.01;

type CellMap = BTreeMap<(i32, i32), f64>;

/// Structured mortality data ready for graduation and Lee-Carter fitting
#[derive(Debug, Clone)]
pub struct MortalityDataset {
    subgroup: String,
    source: String,
    download_date: Option<NaiveDate>,
    ages: Vec<i32>,
    years: Vec<i32>,
    mx: Array2<f64>,
    dx: Array2<f64>,
    ex: Array2<f64>,
}

/// Quick-inspection statistics for a dataset
#[derive(Debug, Clone, Serialize)]
pub struct DatasetSummary {
    pub source: String,
    pub subgroup: String,
    pub shape: (usize, usize),
    pub age_range: (i32, i32),
    pub year_range: (i32, i32),
    pub mx_min: f64,
    pub mx_max: f64,
    pub mx_mean: f64,
    pub download_date: Option<NaiveDate>,
}

impl MortalityDataset {
    /// Build from already-aligned matrices, running the full validation
    pub fn from_matrices(
        subgroup: impl Into<String>,
        ages: Vec<i32>,
        years: Vec<i32>,
        mx: Array2<f64>,
        dx: Array2<f64>,
        ex: Array2<f64>,
    ) -> Result<Self> {
        let dataset = Self {
            subgroup: subgroup.into(),
            source: String::from("matrices"),
            download_date: None,
            ages,
            years,
            mx,
            dx,
            ex,
        };
        dataset.validate()?;
        Ok(dataset)
    }

    /// Build from death counts and exposure; rates are computed as d / L
    ///
    /// Exposure is checked before dividing so a zero cell surfaces as a
    /// data-integrity failure instead of an infinite rate.
    pub fn from_counts(
        subgroup: impl Into<String>,
        ages: Vec<i32>,
        years: Vec<i32>,
        dx: Array2<f64>,
        ex: Array2<f64>,
    ) -> Result<Self> {
        let subgroup = subgroup.into();
        check_labels(&subgroup, &ages, &years)?;
        check_shape(&subgroup, "deaths", &dx, &ages, &years)?;
        check_shape(&subgroup, "exposure", &ex, &ages, &years)?;
        check_finite(&subgroup, "exposure", &ex, &ages, &years)?;
        check_positive_exposure(&subgroup, &ex, &ages, &years)?;

        let mx = &dx / &ex;
        Self::from_matrices(subgroup, ages, years, mx, dx, ex)
    }

    /// Join two separately keyed sources (deaths, exposure) on (year, age)
    ///
    /// Records outside the configured subgroup and year window are ignored;
    /// ages above `age_max` are summed into `age_max` before rates are computed.
    pub fn from_records<D, E>(deaths: D, exposure: E, config: &DatasetConfig) -> Result<Self>
    where
        D: IntoIterator<Item = RawRecord>,
        E: IntoIterator<Item = RawRecord>,
    {
        config.validate()?;
        let dx_cells = capped_sums(deaths, config, "deaths")?;
        let ex_cells = capped_sums(exposure, config, "exposure")?;

        let (ages, years) = axes(&[&dx_cells, &ex_cells]);
        let dx = to_matrix(&dx_cells, &ages, &years, &config.subgroup, "deaths")?;
        let ex = to_matrix(&ex_cells, &ages, &years, &config.subgroup, "exposure")?;

        info!(
            "Joined deaths and exposure for {}: {} ages x {} years",
            config.subgroup,
            ages.len(),
            years.len()
        );
        Self::from_counts(config.subgroup.clone(), ages, years, dx, ex)
    }

    /// Build from a pre-tabulated source giving rates, deaths and exposure
    ///
    /// Rates below the ceiling are taken as supplied; the ceiling rate is
    /// recomputed from the aggregated deaths and exposure.
    pub fn from_tabulated<M, D, E>(
        rates: M,
        deaths: D,
        exposure: E,
        config: &DatasetConfig,
    ) -> Result<Self>
    where
        M: IntoIterator<Item = RawRecord>,
        D: IntoIterator<Item = RawRecord>,
        E: IntoIterator<Item = RawRecord>,
    {
        config.validate()?;
        let dx_cells = capped_sums(deaths, config, "deaths")?;
        let ex_cells = capped_sums(exposure, config, "exposure")?;

        let mut mx_cells = CellMap::new();
        for record in select(rates, config, "rates")? {
            if record.age < config.age_max {
                mx_cells.insert((record.age, record.year), record.value);
            }
        }
        for (&(age, year), &deaths) in dx_cells.range((config.age_max, i32::MIN)..) {
            if let Some(&exposure) = ex_cells.get(&(age, year)) {
                if exposure > 0.0 {
                    mx_cells.insert((age, year), deaths / exposure);
                }
            }
        }

        let (ages, years) = axes(&[&mx_cells, &dx_cells, &ex_cells]);
        let dx = to_matrix(&dx_cells, &ages, &years, &config.subgroup, "deaths")?;
        let ex = to_matrix(&ex_cells, &ages, &years, &config.subgroup, "exposure")?;
        check_positive_exposure(&config.subgroup, &ex, &ages, &years)?;
        let mx = to_matrix(&mx_cells, &ages, &years, &config.subgroup, "rates")?;

        Self::from_matrices(config.subgroup.clone(), ages, years, mx, dx, ex)
    }

    /// Attach a source label and download date for citation
    pub fn with_source(mut self, source: impl Into<String>, download_date: Option<NaiveDate>) -> Self {
        self.source = source.into();
        self.download_date = download_date;
        self
    }

    pub fn subgroup(&self) -> &str {
        &self.subgroup
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn download_date(&self) -> Option<NaiveDate> {
        self.download_date
    }

    pub fn n_ages(&self) -> usize {
        self.ages.len()
    }

    pub fn n_years(&self) -> usize {
        self.years.len()
    }

    pub fn summary(&self) -> DatasetSummary {
        let n = self.mx.len() as f64;
        DatasetSummary {
            source: self.source.clone(),
            subgroup: self.subgroup.clone(),
            shape: self.shape(),
            age_range: (self.ages[0], self.ages[self.ages.len() - 1]),
            year_range: (self.years[0], self.years[self.years.len() - 1]),
            mx_min: self.mx.iter().copied().fold(f64::INFINITY, f64::min),
            mx_max: self.mx.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            mx_mean: self.mx.sum() / n,
            download_date: self.download_date,
        }
    }

    fn validate(&self) -> Result<()> {
        let (ages, years, group) = (&self.ages, &self.years, &self.subgroup);
        check_labels(group, ages, years)?;
        check_shape(group, "rates", &self.mx, ages, years)?;
        check_shape(group, "deaths", &self.dx, ages, years)?;
        check_shape(group, "exposure", &self.ex, ages, years)?;

        check_finite(group, "deaths", &self.dx, ages, years)?;
        check_finite(group, "exposure", &self.ex, ages, years)?;
        check_positive_exposure(group, &self.ex, ages, years)?;
        check_finite(group, "rates", &self.mx, ages, years)?;

        for ((i, j), &rate) in self.mx.indexed_iter() {
            if rate <= 0.0 {
                return Err(MortalityError::data_integrity(
                    cell(group, ages[i], years[j]),
                    format!("non-positive death rate {}", rate),
                ));
            }
        }

        let mut worst = (0.0_f64, 0_usize, 0_usize);
        for ((i, j), &rate) in self.mx.indexed_iter() {
            let recomputed = self.dx[(i, j)] / self.ex[(i, j)];
            let relative_error = (rate - recomputed).abs() / (rate + 1e-12);
            if relative_error > worst.0 {
                worst = (relative_error, i, j);
            }
        }
        if worst.0 > RATE_CONSISTENCY_TOLERANCE {
            let (err, i, j) = worst;
            return Err(MortalityError::data_integrity(
                cell(group, ages[i], years[j]),
                format!(
                    "death rate inconsistent with deaths / exposure (relative error {:.4})",
                    err
                ),
            ));
        }

        debug!(
            "Validated {} dataset: {} ages x {} years",
            group,
            ages.len(),
            years.len()
        );
        Ok(())
    }
}

impl MortalitySurface for MortalityDataset {
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

fn cell(subgroup: &str, age: i32, year: i32) -> String {
    format!("{}, age {}, year {}", subgroup, age, year)
}

/// Records for the configured subgroup and window, failing if either is absent
fn select<I>(records: I, config: &DatasetConfig, source: &str) -> Result<Vec<RawRecord>>
where
    I: IntoIterator<Item = RawRecord>,
{
    let mut subgroup_seen = false;
    let selected: Vec<RawRecord> = records
        .into_iter()
        .filter(|r| r.subgroup == config.subgroup)
        .inspect(|_| subgroup_seen = true)
        .filter(|r| r.year >= config.year_min && r.year <= config.year_max)
        .collect();

    if !subgroup_seen {
        return Err(MortalityError::data_integrity(
            config.subgroup.clone(),
            format!("subgroup not present in {} source", source),
        ));
    }
    if selected.is_empty() {
        return Err(MortalityError::data_integrity(
            config.subgroup.clone(),
            format!(
                "no {} records in years {}-{}",
                source, config.year_min, config.year_max
            ),
        ));
    }
    Ok(selected)
}

/// Sum values per (age, year) with ages above the ceiling folded into it
fn capped_sums<I>(records: I, config: &DatasetConfig, source: &str) -> Result<CellMap>
where
    I: IntoIterator<Item = RawRecord>,
{
    let mut cells = CellMap::new();
    for record in select(records, config, source)? {
        let age = record.age.min(config.age_max);
        *cells.entry((age, record.year)).or_insert(0.0) += record.value;
    }
    Ok(cells)
}

fn axes(maps: &[&CellMap]) -> (Vec<i32>, Vec<i32>) {
    let mut ages = BTreeSet::new();
    let mut years = BTreeSet::new();
    for map in maps {
        for &(age, year) in map.keys() {
            ages.insert(age);
            years.insert(year);
        }
    }
    (ages.into_iter().collect(), years.into_iter().collect())
}

fn to_matrix(
    cells: &CellMap,
    ages: &[i32],
    years: &[i32],
    subgroup: &str,
    source: &str,
) -> Result<Array2<f64>> {
    let mut matrix = Array2::zeros((ages.len(), years.len()));
    for (i, &age) in ages.iter().enumerate() {
        for (j, &year) in years.iter().enumerate() {
            matrix[(i, j)] = *cells.get(&(age, year)).ok_or_else(|| {
                MortalityError::data_integrity(
                    cell(subgroup, age, year),
                    format!("missing {} value", source),
                )
            })?;
        }
    }
    Ok(matrix)
}

fn check_labels(subgroup: &str, ages: &[i32], years: &[i32]) -> Result<()> {
    for (axis, labels) in [("age", ages), ("year", years)] {
        if labels.is_empty() {
            return Err(MortalityError::data_integrity(
                subgroup.to_string(),
                format!("empty {} axis", axis),
            ));
        }
        if let Some(pair) = labels.windows(2).find(|pair| pair[1] != pair[0] + 1) {
            return Err(MortalityError::data_integrity(
                subgroup.to_string(),
                format!("{} axis is not consecutive between {} and {}", axis, pair[0], pair[1]),
            ));
        }
    }
    Ok(())
}

fn check_shape(
    subgroup: &str,
    name: &str,
    matrix: &Array2<f64>,
    ages: &[i32],
    years: &[i32],
) -> Result<()> {
    if matrix.dim() != (ages.len(), years.len()) {
        return Err(MortalityError::data_integrity(
            subgroup.to_string(),
            format!(
                "{} matrix has shape {:?}, expected ({}, {})",
                name,
                matrix.dim(),
                ages.len(),
                years.len()
            ),
        ));
    }
    Ok(())
}

fn check_finite(
    subgroup: &str,
    name: &str,
    matrix: &Array2<f64>,
    ages: &[i32],
    years: &[i32],
) -> Result<()> {
    if let Some(((i, j), value)) = matrix.indexed_iter().find(|(_, v)| !v.is_finite()) {
        return Err(MortalityError::data_integrity(
            cell(subgroup, ages[i], years[j]),
            format!("{} value is {}", name, value),
        ));
    }
    Ok(())
}

fn check_positive_exposure(
    subgroup: &str,
    ex: &Array2<f64>,
    ages: &[i32],
    years: &[i32],
) -> Result<()> {
    if let Some(((i, j), value)) = ex.indexed_iter().find(|&(_, &v)| v <= 0.0) {
        return Err(MortalityError::data_integrity(
            cell(subgroup, ages[i], years[j]),
            format!("non-positive exposure {}", value),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    fn record(year: i32, age: i32, subgroup: &str, value: f64) -> RawRecord {
        RawRecord {
            year,
            age,
            subgroup: subgroup.to_string(),
            value,
        }
    }

    fn config(age_max: i32) -> DatasetConfig {
        DatasetConfig {
            year_min: 2000,
            year_max: 2001,
            age_max,
            subgroup: "Male".to_string(),
        }
    }

    /// Ages 60..=63, years 1999..=2002, plus a Female subgroup that must be ignored
    fn raw_sources() -> (Vec<RawRecord>, Vec<RawRecord>) {
        let mut deaths = Vec::new();
        let mut exposure = Vec::new();
        for year in 1999..=2002 {
            for age in 60..=63 {
                let d = 10.0 + (age - 60) as f64 * 5.0 + (year - 1999) as f64;
                let e = 1000.0 - (age - 60) as f64 * 100.0;
                deaths.push(record(year, age, "Male", d));
                exposure.push(record(year, age, "Male", e));
                deaths.push(record(year, age, "Female", d / 2.0));
                exposure.push(record(year, age, "Female", e));
            }
        }
        (deaths, exposure)
    }

    #[test]
    fn test_from_records_joins_and_filters_window() {
        let (deaths, exposure) = raw_sources();
        let data = MortalityDataset::from_records(deaths, exposure, &config(63)).unwrap();

        assert_eq!(data.ages(), &[60, 61, 62, 63]);
        assert_eq!(data.years(), &[2000, 2001]);
        assert_eq!(data.shape(), (4, 2));

        // age 61, year 2001: d = 10 + 5 + 2, e = 900
        assert_relative_eq!(data.rate(61, 2001).unwrap(), 17.0 / 900.0, epsilon = 1e-15);
    }

    #[test]
    fn test_age_capping_sums_counts_not_rates() {
        let (deaths, exposure) = raw_sources();
        let data = MortalityDataset::from_records(deaths, exposure, &config(62)).unwrap();

        assert_eq!(data.ages(), &[60, 61, 62]);
        // year 2000: ages 62 and 63 folded: d = 21 + 26, e = 800 + 700
        let expected = (21.0 + 26.0) / (800.0 + 700.0);
        assert_relative_eq!(data.rate(62, 2000).unwrap(), expected, epsilon = 1e-15);
        assert_relative_eq!(data.deaths()[(2, 0)], 47.0);
        assert_relative_eq!(data.exposures()[(2, 0)], 1500.0);

        let averaged = (21.0 / 800.0 + 26.0 / 700.0) / 2.0;
        assert!((data.rate(62, 2000).unwrap() - averaged).abs() > 1e-6);
    }

    #[test]
    fn test_tabulated_recomputes_ceiling_rate() {
        let (deaths, exposure) = raw_sources();
        let rates: Vec<RawRecord> = deaths
            .iter()
            .zip(exposure.iter())
            .map(|(d, e)| record(d.year, d.age, &d.subgroup, d.value / e.value))
            .collect();

        let data = MortalityDataset::from_tabulated(rates, deaths, exposure, &config(62)).unwrap();
        let expected = (21.0 + 26.0) / (800.0 + 700.0);
        assert_relative_eq!(data.rate(62, 2000).unwrap(), expected, epsilon = 1e-15);
        assert_relative_eq!(data.rate(60, 2000).unwrap(), 11.0 / 1000.0, epsilon = 1e-15);
    }

    #[test]
    fn test_zero_exposure_is_data_integrity_error() {
        let (deaths, mut exposure) = raw_sources();
        for r in exposure.iter_mut() {
            if r.subgroup == "Male" && r.age == 61 && r.year == 2001 {
                r.value = 0.0;
            }
        }
        match MortalityDataset::from_records(deaths, exposure, &config(63)) {
            Err(MortalityError::DataIntegrity { context, message }) => {
                assert!(context.contains("age 61"), "context: {}", context);
                assert!(context.contains("year 2001"), "context: {}", context);
                assert!(message.contains("exposure"));
            }
            other => panic!("expected DataIntegrity, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_subgroup_and_window() {
        let (deaths, exposure) = raw_sources();
        let mut cfg = config(63);
        cfg.subgroup = "Total".to_string();
        let err = MortalityDataset::from_records(deaths.clone(), exposure.clone(), &cfg).unwrap_err();
        assert!(err.to_string().contains("subgroup not present"));

        let mut cfg = config(63);
        cfg.year_min = 1950;
        cfg.year_max = 1960;
        let err = MortalityDataset::from_records(deaths, exposure, &cfg).unwrap_err();
        assert!(err.to_string().contains("no deaths records"));
    }

    #[test]
    fn test_missing_cell_named() {
        let (mut deaths, exposure) = raw_sources();
        deaths.retain(|r| !(r.subgroup == "Male" && r.age == 62 && r.year == 2000));
        let err = MortalityDataset::from_records(deaths, exposure, &config(63)).unwrap_err();
        let text = err.to_string();
        assert!(text.contains("age 62") && text.contains("year 2000"), "{}", text);
        assert!(text.contains("missing deaths"));
    }

    #[test]
    fn test_nan_and_inconsistency_rejected() {
        let ages = vec![40, 41];
        let years = vec![2000];
        let dx = array![[10.0], [20.0]];
        let ex = array![[1000.0], [1000.0]];

        let mx = array![[f64::NAN], [0.02]];
        let err = MortalityDataset::from_matrices("Total", ages.clone(), years.clone(), mx, dx.clone(), ex.clone())
            .unwrap_err();
        assert!(err.to_string().contains("NaN"));

        let mx = array![[0.0102], [0.025]];
        let err = MortalityDataset::from_matrices("Total", ages.clone(), years.clone(), mx, dx.clone(), ex.clone())
            .unwrap_err();
        assert!(err.to_string().contains("age 41"));

        // within tolerance
        let mx = array![[0.01005], [0.0201]];
        assert!(MortalityDataset::from_matrices("Total", ages, years, mx, dx, ex).is_ok());
    }

    #[test]
    fn test_zero_deaths_give_non_positive_rate() {
        let dx = array![[0.0], [20.0]];
        let ex = array![[1000.0], [1000.0]];
        let err = MortalityDataset::from_counts("Total", vec![40, 41], vec![2000], dx, ex).unwrap_err();
        assert!(matches!(err, MortalityError::DataIntegrity { .. }));
        assert!(err.to_string().contains("non-positive death rate"));
    }

    #[test]
    fn test_accessors_out_of_range() {
        let (deaths, exposure) = raw_sources();
        let data = MortalityDataset::from_records(deaths, exposure, &config(63)).unwrap();

        assert_eq!(data.year_rates(2000).unwrap().len(), 4);
        assert_eq!(data.age_rates(60).unwrap().len(), 2);
        assert!(matches!(data.rate(59, 2000), Err(MortalityError::OutOfRange { .. })));
        assert!(matches!(data.year_rates(2005), Err(MortalityError::OutOfRange { .. })));
        assert!(matches!(data.age_rates(64), Err(MortalityError::OutOfRange { .. })));
    }

    #[test]
    fn test_summary() {
        let (deaths, exposure) = raw_sources();
        let date = NaiveDate::from_ymd_opt(2024, 3, 1);
        let data = MortalityDataset::from_records(deaths, exposure, &config(63))
            .unwrap()
            .with_source("synthetic", date);
        let summary = data.summary();

        assert_eq!(summary.shape, (4, 2));
        assert_eq!(summary.age_range, (60, 63));
        assert_eq!(summary.year_range, (2000, 2001));
        assert!(summary.mx_min > 0.0 && summary.mx_min <= summary.mx_mean);
        assert!(summary.mx_mean <= summary.mx_max);
        assert_eq!(summary.download_date, date);
        assert_eq!(summary.source, "synthetic");
    }
}
