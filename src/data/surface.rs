//! Shared view over an (age x year) mortality surface
//!
//! Both the raw dataset and the graduated surface expose the same three
//! aligned matrices, so downstream stages accept either.

use ndarray::{Array1, Array2};

use crate::error::{locate, Result};

/// Three aligned matrices (ages as rows, years as columns) with their labels
pub trait MortalitySurface {
    /// Population subgroup the surface describes (e.g. "Female")
    fn subgroup(&self) -> &str;

    /// Consecutive integer ages (row labels)
    fn ages(&self) -> &[i32];

    /// Consecutive calendar years (column labels)
    fn years(&self) -> &[i32];

    /// Central death rates m_{x,t}
    fn rates(&self) -> &Array2<f64>;

    /// Death counts d_{x,t}
    fn deaths(&self) -> &Array2<f64>;

    /// Exposure in person-years L_{x,t}
    fn exposures(&self) -> &Array2<f64>;

    /// Matrix shape (n_ages, n_years)
    fn shape(&self) -> (usize, usize) {
        (self.ages().len(), self.years().len())
    }

    fn log_rates(&self) -> Array2<f64> {
        self.rates().mapv(f64::ln)
    }

    /// Single rate by age and year
    fn rate(&self, age: i32, year: i32) -> Result<f64> {
        let row = locate(self.ages(), age, "age")?;
        let col = locate(self.years(), year, "year")?;
        Ok(self.rates()[(row, col)])
    }

    /// All rates for one year (vector over ages)
    fn year_rates(&self, year: i32) -> Result<Array1<f64>> {
        let col = locate(self.years(), year, "year")?;
        Ok(self.rates().column(col).to_owned())
    }

    /// All rates for one age (vector over years)
    fn age_rates(&self, age: i32) -> Result<Array1<f64>> {
        let row = locate(self.ages(), age, "age")?;
        Ok(self.rates().row(row).to_owned())
    }
}
