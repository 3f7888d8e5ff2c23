//! Comparison of a projected life table against a benchmark table
//!
//! Only ages present in both tables are compared. The last overlapping age is
//! left out of the ratio and difference, since both tables close there with q = 1.

use serde::Serialize;

use crate::error::{MortalityError, Result};
use crate::life_table::LifeTable;

/// Default age band for the q_x RMSE
pub const DEFAULT_RMSE_AGES: (i32, i32) = (20, 80);

#[derive(Debug, Clone)]
pub struct MortalityComparison<'a> {
    name: String,
    projected: &'a LifeTable,
    benchmark: &'a LifeTable,
    overlap: Vec<i32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComparisonSummary {
    pub name: String,
    /// RMSE over [`DEFAULT_RMSE_AGES`], or the whole overlap when the band misses it
    pub rmse: f64,
    pub max_ratio: f64,
    pub min_ratio: f64,
    pub mean_ratio: f64,
    pub n_ages: usize,
}

impl<'a> MortalityComparison<'a> {
    pub fn new(name: impl Into<String>, projected: &'a LifeTable, benchmark: &'a LifeTable) -> Result<Self> {
        let overlap: Vec<i32> = projected
            .ages()
            .iter()
            .copied()
            .filter(|age| benchmark.ages().binary_search(age).is_ok())
            .collect();

        if overlap.len() < 2 {
            return Err(MortalityError::data_integrity(
                "table comparison",
                format!(
                    "need at least 2 overlapping ages, found {} (projected {}-{}, benchmark {}-{})",
                    overlap.len(),
                    projected.min_age(),
                    projected.max_age(),
                    benchmark.min_age(),
                    benchmark.max_age()
                ),
            ));
        }

        Ok(Self {
            name: name.into(),
            projected,
            benchmark,
            overlap,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn overlap_ages(&self) -> &[i32] {
        &self.overlap
    }

    /// Overlapping ages without the terminal one
    pub fn compared_ages(&self) -> &[i32] {
        &self.overlap[..self.overlap.len() - 1]
    }

    fn q_pairs<'b>(&'b self, ages: &'b [i32]) -> impl Iterator<Item = Result<(f64, f64)>> + 'b {
        ages.iter()
            .map(move |&age| Ok((self.projected.q(age)?, self.benchmark.q(age)?)))
    }

    /// projected q_x / benchmark q_x
    pub fn qx_ratio(&self) -> Result<Vec<f64>> {
        self.q_pairs(self.compared_ages())
            .map(|pair| pair.map(|(p, b)| p / b))
            .collect()
    }

    /// projected q_x - benchmark q_x
    pub fn qx_difference(&self) -> Result<Vec<f64>> {
        self.q_pairs(self.compared_ages())
            .map(|pair| pair.map(|(p, b)| p - b))
            .collect()
    }

    /// Root mean squared q_x difference over overlapping ages in `[age_start, age_end]`
    pub fn rmse(&self, age_start: i32, age_end: i32) -> Result<f64> {
        let ages: Vec<i32> = self
            .overlap
            .iter()
            .copied()
            .filter(|age| (age_start..=age_end).contains(age))
            .collect();
        if ages.is_empty() {
            return Err(MortalityError::invalid_parameter(format!(
                "no overlapping ages in {}-{} (overlap {}-{})",
                age_start,
                age_end,
                self.overlap[0],
                self.overlap[self.overlap.len() - 1]
            )));
        }

        let mut sum = 0.0;
        for pair in self.q_pairs(&ages) {
            let (p, b) = pair?;
            sum += (p - b).powi(2);
        }
        Ok((sum / ages.len() as f64).sqrt())
    }

    pub fn summary(&self) -> Result<ComparisonSummary> {
        let ratios = self.qx_ratio()?;
        let (band_start, band_end) = DEFAULT_RMSE_AGES;
        let first = self.overlap[0];
        let last = self.overlap[self.overlap.len() - 1];
        let rmse = if first <= band_end && last >= band_start {
            self.rmse(band_start, band_end)?
        } else {
            self.rmse(first, last)?
        };
        Ok(ComparisonSummary {
            name: self.name.clone(),
            rmse,
            max_ratio: ratios.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            min_ratio: ratios.iter().copied().fold(f64::INFINITY, f64::min),
            mean_ratio: ratios.iter().sum::<f64>() / ratios.len() as f64,
            n_ages: self.overlap.len(),
        })
    }
}
