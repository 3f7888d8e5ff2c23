//! Life table value object
//!
//! Built from survivor counts l_x over consecutive ages. Everything else is
//! derived once at construction:
//! - d_x = l_x - l_{x+1}
//! - q_x = d_x / l_x (1 when no survivors remain)
//! - p_x = 1 - q_x
//!
//! At the terminal age everyone dies: d = l, q = 1, p = 0.

use std::io::{Read, Write};
use std::path::Path;

use csv::{Reader, Writer};
use serde::{Deserialize, Serialize};

use crate::error::{locate, MortalityError, Result};

/// Input row for survivor-count CSV files (`age,l_x`)
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
struct SurvivorRow {
    age: i32,
    l_x: f64,
}

/// One age of a life table, as written to CSV
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LifeTableRow {
    pub age: i32,
    pub l_x: f64,
    pub d_x: f64,
    pub q_x: f64,
    pub p_x: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LifeTable {
    ages: Vec<i32>,
    l_x: Vec<f64>,
    d_x: Vec<f64>,
    q_x: Vec<f64>,
    p_x: Vec<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LifeTableChecks {
    pub sum_deaths_equals_l0: bool,
    pub terminal_mortality_is_one: bool,
    pub all_rates_valid: bool,
}

impl LifeTableChecks {
    pub fn all_passed(&self) -> bool {
        self.sum_deaths_equals_l0 && self.terminal_mortality_is_one && self.all_rates_valid
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LifeTableSummary {
    pub min_age: i32,
    pub max_age: i32,
    pub radix: f64,
    /// Curtate expectation of life at the youngest age
    pub curtate_expectancy: f64,
    pub checks: LifeTableChecks,
}

impl LifeTable {
    /// Build from consecutive ages and survivor counts
    pub fn new(ages: Vec<i32>, l_x: Vec<f64>) -> Result<Self> {
        if ages.len() != l_x.len() {
            return Err(MortalityError::data_integrity(
                "life table",
                format!("{} ages but {} survivor counts", ages.len(), l_x.len()),
            ));
        }
        if ages.len() < 2 {
            return Err(MortalityError::data_integrity(
                "life table",
                "a life table needs at least 2 ages",
            ));
        }
        if let Some(w) = ages.windows(2).find(|w| w[1] != w[0] + 1) {
            return Err(MortalityError::data_integrity(
                "life table",
                format!("ages must be consecutive, found {} followed by {}", w[0], w[1]),
            ));
        }
        if let Some((age, l)) = ages.iter().zip(&l_x).find(|(_, l)| !l.is_finite() || **l < 0.0) {
            return Err(MortalityError::data_integrity(
                format!("life table, age {}", age),
                format!("survivor count must be finite and non-negative, got {}", l),
            ));
        }

        let n = ages.len();
        let mut d_x = Vec::with_capacity(n);
        let mut q_x = Vec::with_capacity(n);
        for i in 0..n - 1 {
            let deaths = l_x[i] - l_x[i + 1];
            d_x.push(deaths);
            q_x.push(if l_x[i] > 0.0 { deaths / l_x[i] } else { 1.0 });
        }
        d_x.push(l_x[n - 1]);
        q_x.push(1.0);
        let p_x = q_x.iter().map(|q| 1.0 - q).collect();

        Ok(Self {
            ages,
            l_x,
            d_x,
            q_x,
            p_x,
        })
    }

    /// Build survivors from one-year death probabilities: l_{x+1} = l_x (1 - q_x)
    ///
    /// The terminal q is taken as 1 whatever value is supplied.
    pub fn from_qx(ages: Vec<i32>, q_x: &[f64], radix: f64) -> Result<Self> {
        if q_x.len() != ages.len() {
            return Err(MortalityError::data_integrity(
                "life table",
                format!("{} ages but {} death probabilities", ages.len(), q_x.len()),
            ));
        }
        if let Some((age, q)) = ages.iter().zip(q_x).find(|(_, q)| !(0.0..=1.0).contains(*q)) {
            return Err(MortalityError::data_integrity(
                format!("life table, age {}", age),
                format!("death probability {} outside [0, 1]", q),
            ));
        }

        let mut l_x = Vec::with_capacity(ages.len());
        let mut survivors = radix;
        for q in q_x {
            l_x.push(survivors);
            survivors *= 1.0 - q;
        }
        Self::new(ages, l_x)
    }

    /// Load `age,l_x` rows from a CSV file
    pub fn from_csv<P: AsRef<Path>>(path: P) -> Result<Self> {
        let reader = Reader::from_path(path)?;
        Self::from_csv_reader(reader)
    }

    /// Load `age,l_x` rows from any reader (e.g., string buffer)
    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        Self::from_csv_reader(Reader::from_reader(reader))
    }

    fn from_csv_reader<R: Read>(mut reader: Reader<R>) -> Result<Self> {
        let mut ages = Vec::new();
        let mut l_x = Vec::new();
        for result in reader.deserialize() {
            let row: SurvivorRow = result?;
            ages.push(row.age);
            l_x.push(row.l_x);
        }
        Self::new(ages, l_x)
    }

    /// Write `age,l_x,d_x,q_x,p_x` rows as CSV
    pub fn write_csv<W: Write>(&self, writer: W) -> Result<()> {
        let mut writer = Writer::from_writer(writer);
        for row in self.rows() {
            writer.serialize(row)?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn rows(&self) -> Vec<LifeTableRow> {
        (0..self.ages.len())
            .map(|i| LifeTableRow {
                age: self.ages[i],
                l_x: self.l_x[i],
                d_x: self.d_x[i],
                q_x: self.q_x[i],
                p_x: self.p_x[i],
            })
            .collect()
    }

    /// Table restricted to `[start_age, end_age]`, terminal age re-closed at `end_age`
    pub fn subset(&self, start_age: i32, end_age: i32) -> Result<Self> {
        let start = self.index(start_age)?;
        let end = self.index(end_age)?;
        if end <= start {
            return Err(MortalityError::invalid_parameter(format!(
                "subset needs start age below end age, got {}-{}",
                start_age, end_age
            )));
        }
        Self::new(
            self.ages[start..=end].to_vec(),
            self.l_x[start..=end].to_vec(),
        )
    }

    fn index(&self, age: i32) -> Result<usize> {
        locate(&self.ages, age, "age")
    }

    pub fn l(&self, age: i32) -> Result<f64> {
        Ok(self.l_x[self.index(age)?])
    }

    pub fn d(&self, age: i32) -> Result<f64> {
        Ok(self.d_x[self.index(age)?])
    }

    pub fn q(&self, age: i32) -> Result<f64> {
        Ok(self.q_x[self.index(age)?])
    }

    pub fn p(&self, age: i32) -> Result<f64> {
        Ok(self.p_x[self.index(age)?])
    }

    pub fn min_age(&self) -> i32 {
        self.ages[0]
    }

    pub fn max_age(&self) -> i32 {
        self.ages[self.ages.len() - 1]
    }

    pub fn ages(&self) -> &[i32] {
        &self.ages
    }

    pub fn survivors(&self) -> &[f64] {
        &self.l_x
    }

    pub fn death_probabilities(&self) -> &[f64] {
        &self.q_x
    }

    pub fn radix(&self) -> f64 {
        self.l_x[0]
    }

    /// Curtate expectation of life: sum of l_{x+k} / l_x for k >= 1
    pub fn curtate_expectancy(&self, age: i32) -> Result<f64> {
        let i = self.index(age)?;
        if self.l_x[i] == 0.0 {
            return Ok(0.0);
        }
        Ok(self.l_x[i + 1..].iter().sum::<f64>() / self.l_x[i])
    }

    pub fn validate(&self) -> LifeTableChecks {
        let l0 = self.radix();
        let total_deaths: f64 = self.d_x.iter().sum();
        LifeTableChecks {
            sum_deaths_equals_l0: (total_deaths - l0).abs() <= 1e-9 * l0.max(1.0),
            terminal_mortality_is_one: (self.q_x[self.q_x.len() - 1] - 1.0).abs() < 1e-12,
            all_rates_valid: self.q_x.iter().all(|q| (0.0..=1.0).contains(q)),
        }
    }

    pub fn summary(&self) -> LifeTableSummary {
        LifeTableSummary {
            min_age: self.min_age(),
            max_age: self.max_age(),
            radix: self.radix(),
            curtate_expectancy: self.curtate_expectancy(self.min_age()).unwrap_or(0.0),
            checks: self.validate(),
        }
    }
}
