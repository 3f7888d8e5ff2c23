//! Raw-source loaders producing keyed (year, age, subgroup, value) records
//!
//! Supported layouts:
//! - long-format CSV with header `year,age,subgroup,value`
//! - HMD 1x1 text files (`Mx_1x1_<country>.txt`, `Deaths_1x1_..`, `Exposures_1x1_..`)
//! - INEGI registered deaths (`Anio,Edad,Sexo,Defunciones`) paired with
//!   CONAPO mid-year population (`Anio,Edad,Sexo,Poblacion`) as exposure

use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use csv::Reader;
use log::info;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::dataset::MortalityDataset;
use crate::config::DatasetConfig;
use crate::error::{MortalityError, Result};

/// HMD sex columns, in file order after `Year` and `Age`
pub const HMD_SUBGROUPS: [&str; 3] = ["Female", "Male", "Total"];

/// `Sexo` values used by INEGI and CONAPO
pub const INEGI_SUBGROUPS: [&str; 3] = ["Hombres", "Mujeres", "Total"];

/// One keyed value from an upstream tabular source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub year: i32,
    pub age: i32,
    pub subgroup: String,
    pub value: f64,
}

/// Load long-format records from a CSV file
pub fn load_records<P: AsRef<Path>>(path: P) -> Result<Vec<RawRecord>> {
    let mut reader = Reader::from_path(path)?;
    let mut records = Vec::new();

    for result in reader.deserialize() {
        let record: RawRecord = result?;
        records.push(record);
    }

    Ok(records)
}

/// Load long-format records from any reader (e.g., string buffer)
pub fn load_records_from_reader<R: Read>(reader: R) -> Result<Vec<RawRecord>> {
    let mut csv_reader = Reader::from_reader(reader);
    let mut records = Vec::new();

    for result in csv_reader.deserialize() {
        let record: RawRecord = result?;
        records.push(record);
    }

    Ok(records)
}

/// INEGI deaths row
#[derive(Debug, Clone, Deserialize)]
struct InegiDeathRow {
    #[serde(rename = "Anio")]
    year: i32,
    #[serde(rename = "Edad")]
    age: i32,
    #[serde(rename = "Sexo")]
    sex: String,
    #[serde(rename = "Defunciones")]
    deaths: f64,
}

impl From<InegiDeathRow> for RawRecord {
    fn from(row: InegiDeathRow) -> Self {
        RawRecord { year: row.year, age: row.age, subgroup: row.sex, value: row.deaths }
    }
}

/// CONAPO population row
#[derive(Debug, Clone, Deserialize)]
struct ConapoPopulationRow {
    #[serde(rename = "Anio")]
    year: i32,
    #[serde(rename = "Edad")]
    age: i32,
    #[serde(rename = "Sexo")]
    sex: String,
    #[serde(rename = "Poblacion")]
    population: f64,
}

impl From<ConapoPopulationRow> for RawRecord {
    fn from(row: ConapoPopulationRow) -> Self {
        RawRecord { year: row.year, age: row.age, subgroup: row.sex, value: row.population }
    }
}

fn read_rows<T, R>(reader: R) -> Result<Vec<RawRecord>>
where
    T: DeserializeOwned + Into<RawRecord>,
    R: Read,
{
    let mut csv_reader = Reader::from_reader(reader);
    let mut records = Vec::new();

    for result in csv_reader.deserialize() {
        let row: T = result?;
        records.push(row.into());
    }

    Ok(records)
}

/// Load INEGI registered deaths from a CSV file
pub fn load_inegi_deaths<P: AsRef<Path>>(path: P) -> Result<Vec<RawRecord>> {
    load_inegi_deaths_from_reader(File::open(path)?)
}

/// Load INEGI registered deaths from any reader
pub fn load_inegi_deaths_from_reader<R: Read>(reader: R) -> Result<Vec<RawRecord>> {
    read_rows::<InegiDeathRow, _>(reader)
}

/// Load CONAPO population estimates from a CSV file
pub fn load_conapo_population<P: AsRef<Path>>(path: P) -> Result<Vec<RawRecord>> {
    load_conapo_population_from_reader(File::open(path)?)
}

/// Load CONAPO population estimates from any reader
pub fn load_conapo_population_from_reader<R: Read>(reader: R) -> Result<Vec<RawRecord>> {
    read_rows::<ConapoPopulationRow, _>(reader)
}

/// Build a Mexico dataset from INEGI deaths and CONAPO population
///
/// Population is the exposure, so rates are D / P. `config.subgroup` must be
/// one of [`INEGI_SUBGROUPS`].
pub fn load_inegi<P: AsRef<Path>>(
    deaths_path: P,
    population_path: P,
    config: &DatasetConfig,
) -> Result<MortalityDataset> {
    if !INEGI_SUBGROUPS.contains(&config.subgroup.as_str()) {
        return Err(MortalityError::invalid_parameter(format!(
            "INEGI subgroup must be one of {:?}, got '{}'",
            INEGI_SUBGROUPS, config.subgroup
        )));
    }
    let deaths = load_inegi_deaths(deaths_path)?;
    let population = load_conapo_population(population_path)?;

    let dataset = MortalityDataset::from_records(deaths, population, config)?
        .with_source("INEGI-CONAPO/Mexico", None);
    info!(
        "Loaded INEGI/CONAPO {}: years {}-{}, ages capped at {}",
        config.subgroup, config.year_min, config.year_max, config.age_max
    );
    Ok(dataset)
}

/// Parse an HMD 1x1 text file, keeping one sex column as the subgroup
///
/// Layout: a title line, a blank line, a header line (`Year Age Female Male Total`),
/// then whitespace-separated rows. The open age group is written `110+` and
/// missing values `.`; missing values become NaN so dataset validation names them.
pub fn parse_hmd<R: Read>(reader: R, subgroup: &str) -> Result<Vec<RawRecord>> {
    let column = HMD_SUBGROUPS
        .iter()
        .position(|s| *s == subgroup)
        .ok_or_else(|| {
            MortalityError::invalid_parameter(format!(
                "HMD subgroup must be one of {:?}, got '{}'",
                HMD_SUBGROUPS, subgroup
            ))
        })?
        + 2;

    let mut records = Vec::new();
    for (line_no, line) in BufReader::new(reader).lines().enumerate().skip(3) {
        let line = line?;
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.is_empty() {
            continue;
        }
        if fields.len() < 5 {
            return Err(MortalityError::data_integrity(
                format!("HMD line {}", line_no + 1),
                format!("expected 5 columns, found {}", fields.len()),
            ));
        }

        let year = parse_field::<i32>(fields[0], line_no, "year")?;
        let age = parse_field::<i32>(fields[1].trim_end_matches('+'), line_no, "age")?;
        let value = match fields[column] {
            "." => f64::NAN,
            raw => parse_field::<f64>(raw, line_no, "value")?,
        };

        records.push(RawRecord {
            year,
            age,
            subgroup: subgroup.to_string(),
            value,
        });
    }

    Ok(records)
}

fn parse_field<T: std::str::FromStr>(raw: &str, line_no: usize, what: &str) -> Result<T> {
    raw.parse().map_err(|_| {
        MortalityError::data_integrity(
            format!("HMD line {}", line_no + 1),
            format!("cannot parse {} from '{}'", what, raw),
        )
    })
}

/// Location of one country's HMD 1x1 files
#[derive(Debug, Clone)]
pub struct HmdSource {
    pub data_dir: PathBuf,
    pub country: String,
    pub download_date: Option<NaiveDate>,
}

impl HmdSource {
    pub fn new(data_dir: impl Into<PathBuf>, country: impl Into<String>) -> Self {
        Self {
            data_dir: data_dir.into(),
            country: country.into(),
            download_date: None,
        }
    }

    pub fn with_download_date(mut self, date: NaiveDate) -> Self {
        self.download_date = Some(date);
        self
    }

    fn file(&self, prefix: &str) -> PathBuf {
        self.data_dir
            .join(&self.country)
            .join(format!("{}_1x1_{}.txt", prefix, self.country))
    }

    fn read(&self, prefix: &str, subgroup: &str) -> Result<Vec<RawRecord>> {
        let path = self.file(prefix);
        let file = File::open(&path).map_err(|e| {
            MortalityError::data_integrity(path.display().to_string(), e.to_string())
        })?;
        parse_hmd(file, subgroup)
    }

    /// Load rates, deaths and exposure and build a validated dataset
    pub fn load(&self, config: &DatasetConfig) -> Result<MortalityDataset> {
        let rates = self.read("Mx", &config.subgroup)?;
        let deaths = self.read("Deaths", &config.subgroup)?;
        let exposure = self.read("Exposures", &config.subgroup)?;

        let dataset = MortalityDataset::from_tabulated(rates, deaths, exposure, config)?
            .with_source(format!("HMD/{}", self.country), self.download_date);
        info!(
            "Loaded HMD {} {}: years {}-{}, ages capped at {}",
            self.country, config.subgroup, config.year_min, config.year_max, config.age_max
        );
        Ok(dataset)
    }
}

/// Load a dataset from separate deaths and exposure CSV files
pub fn load_counts_csv<P: AsRef<Path>>(
    deaths_path: P,
    exposure_path: P,
    config: &DatasetConfig,
) -> Result<MortalityDataset> {
    let deaths = load_records(&deaths_path)?;
    let exposure = load_records(&exposure_path)?;
    let source = deaths_path.as_ref().display().to_string();
    Ok(MortalityDataset::from_records(deaths, exposure, config)?.with_source(source, None))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::MortalitySurface;
    use approx::assert_relative_eq;
    use std::io::Write;

    const HMD_DEATHS: &str = "\
United States of America, Deaths (period 1x1)\tLast modified: 01 Jan 2024
\n  Year          Age             Female            Male           Total
  2000           98            100.00            50.00          150.00
  2000           99             80.00            40.00          120.00
  2000          110+            10.00             5.00           15.00
  2001           98            110.00            55.00          165.00
  2001           99             .                44.00          132.00
  2001          110+            12.00             6.00           18.00
";

    #[test]
    fn test_parse_hmd_selects_column_and_open_age() {
        let records = parse_hmd(HMD_DEATHS.as_bytes(), "Male").unwrap();
        assert_eq!(records.len(), 6);
        assert_eq!(records[2].age, 110);
        assert_eq!(records[2].value, 5.0);
        assert_eq!(records[0].subgroup, "Male");

        let female = parse_hmd(HMD_DEATHS.as_bytes(), "Female").unwrap();
        assert!(female[4].value.is_nan());
    }

    #[test]
    fn test_parse_hmd_rejects_unknown_subgroup() {
        assert!(matches!(
            parse_hmd(HMD_DEATHS.as_bytes(), "Hombres"),
            Err(MortalityError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_missing_hmd_value_surfaces_as_nan_error() {
        let deaths = parse_hmd(HMD_DEATHS.as_bytes(), "Female").unwrap();
        let exposure: Vec<RawRecord> = deaths
            .iter()
            .map(|r| RawRecord { value: 1000.0, ..r.clone() })
            .collect();
        let config = DatasetConfig {
            year_min: 2000,
            year_max: 2001,
            age_max: 99,
            subgroup: "Female".to_string(),
        };
        let err = MortalityDataset::from_records(deaths, exposure, &config).unwrap_err();
        let text = err.to_string();
        assert!(text.contains("age 99") && text.contains("year 2001"), "{}", text);
    }

    #[test]
    fn test_load_records_from_reader() {
        let csv = "year,age,subgroup,value\n2000,60,Male,12.5\n2000,61,Male,14.0\n";
        let records = load_records_from_reader(csv.as_bytes()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(
            records[1],
            RawRecord { year: 2000, age: 61, subgroup: "Male".to_string(), value: 14.0 }
        );
    }

    #[test]
    fn test_inegi_and_conapo_columns() {
        let deaths = "Anio,Edad,Sexo,Defunciones\n2000,60,Hombres,12\n2000,60,Mujeres,9\n";
        let records = load_inegi_deaths_from_reader(deaths.as_bytes()).unwrap();
        assert_eq!(
            records[0],
            RawRecord { year: 2000, age: 60, subgroup: "Hombres".to_string(), value: 12.0 }
        );

        let population = "Anio,Edad,Sexo,Poblacion\n2000,60,Mujeres,15000\n";
        let records = load_conapo_population_from_reader(population.as_bytes()).unwrap();
        assert_eq!(records[0].subgroup, "Mujeres");
        assert_eq!(records[0].value, 15000.0);
    }

    #[test]
    fn test_load_inegi_builds_dataset() {
        let dir = std::env::temp_dir().join(format!("lee_carter_inegi_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        let mut deaths = String::from("Anio,Edad,Sexo,Defunciones\n");
        let mut population = String::from("Anio,Edad,Sexo,Poblacion\n");
        for year in 2009..=2011 {
            for age in 98..=101 {
                for sex in INEGI_SUBGROUPS {
                    deaths.push_str(&format!("{},{},{},{}\n", year, age, sex, 20 + age - 98));
                    population.push_str(&format!("{},{},{},{}\n", year, age, sex, 1000));
                }
            }
        }
        let deaths_path = dir.join("defunciones.csv");
        let population_path = dir.join("poblacion.csv");
        std::fs::write(&deaths_path, deaths).unwrap();
        std::fs::write(&population_path, population).unwrap();

        let config = DatasetConfig {
            year_min: 2010,
            year_max: 2011,
            age_max: 99,
            subgroup: "Mujeres".to_string(),
        };
        let data = load_inegi(&deaths_path, &population_path, &config).unwrap();
        assert_eq!(data.ages(), &[98, 99]);
        assert_eq!(data.years(), &[2010, 2011]);
        assert_eq!(data.subgroup(), "Mujeres");
        // ages 99-101 folded into 99
        assert_relative_eq!(data.rate(99, 2010).unwrap(), (21.0 + 22.0 + 23.0) / 3000.0, epsilon = 1e-15);

        let english = DatasetConfig { subgroup: "Female".to_string(), ..config };
        assert!(matches!(
            load_inegi(&deaths_path, &population_path, &english),
            Err(MortalityError::InvalidParameter(_))
        ));

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_hmd_source_loads_bundle() {
        let dir = std::env::temp_dir().join(format!("lee_carter_hmd_{}", std::process::id()));
        let country_dir = dir.join("testland");
        std::fs::create_dir_all(&country_dir).unwrap();

        let header = "Testland, synthetic\n\n  Year  Age  Female  Male  Total\n";
        let mut deaths = String::from(header);
        let mut exposure = String::from(header);
        let mut rates = String::from(header);
        for year in 2000..=2002 {
            for age in 0..=3 {
                let d = 10.0 + age as f64 + year as f64 - 2000.0;
                let e = 1000.0;
                let age_label = if age == 3 { "3+".to_string() } else { age.to_string() };
                deaths.push_str(&format!("{} {} {} {} {}\n", year, age_label, d, d, 2.0 * d));
                exposure.push_str(&format!("{} {} {} {} {}\n", year, age_label, e, e, 2.0 * e));
                rates.push_str(&format!("{} {} {} {} {}\n", year, age_label, d / e, d / e, d / e));
            }
        }
        for (prefix, body) in [("Deaths", &deaths), ("Exposures", &exposure), ("Mx", &rates)] {
            let mut file = File::create(country_dir.join(format!("{}_1x1_testland.txt", prefix))).unwrap();
            file.write_all(body.as_bytes()).unwrap();
        }

        let config = DatasetConfig {
            year_min: 2001,
            year_max: 2002,
            age_max: 2,
            subgroup: "Total".to_string(),
        };
        let date = NaiveDate::from_ymd_opt(2024, 6, 30).unwrap();
        let data = HmdSource::new(&dir, "testland")
            .with_download_date(date)
            .load(&config)
            .unwrap();

        assert_eq!(data.ages(), &[0, 1, 2]);
        assert_eq!(data.years(), &[2001, 2002]);
        assert_eq!(data.source(), "HMD/testland");
        assert_eq!(data.download_date(), Some(date));
        // year 2001, ages 2 and 3 folded: Total deaths 2*(13) + 2*(14), exposure 4000
        assert_relative_eq!(data.rate(2, 2001).unwrap(), (26.0 + 28.0) / 4000.0, epsilon = 1e-15);

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
