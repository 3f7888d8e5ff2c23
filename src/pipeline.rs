//! Pipeline runner: Dataset -> Graduation -> Lee-Carter -> Projection
//!
//! Holds a validated dataset and its configuration, then runs the stages in
//! order. Each stage produces an immutable value consumed by the next.

use log::info;

use crate::config::PipelineConfig;
use crate::data::MortalityDataset;
use crate::error::Result;
use crate::graduation::GraduatedRates;
use crate::lee_carter::{LeeCarter, ReestimationReport};
use crate::life_table::LifeTable;
use crate::projection::{ConfidenceTables, MortalityProjection};

/// Pre-loaded dataset and configuration for repeated runs
///
/// # Example
/// ```ignore
/// let dataset = HmdSource::new("data/hmd", "USA").load(&config.dataset)?;
/// let pipeline = MortalityPipeline::new(dataset, config)?;
///
/// let output = pipeline.run()?;
/// let table = output.life_table(2040)?;
/// ```
#[derive(Debug, Clone)]
pub struct MortalityPipeline {
    dataset: MortalityDataset,
    config: PipelineConfig,
}

/// Every stage's result from one run
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub graduated: Option<GraduatedRates>,
    pub model: LeeCarter,
    pub projection: MortalityProjection,
    quantiles: (f64, f64),
}

impl MortalityPipeline {
    pub fn new(dataset: MortalityDataset, config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { dataset, config })
    }

    /// Run every stage with the stored configuration
    pub fn run(&self) -> Result<PipelineOutput> {
        self.run_with(&self.config)
    }

    /// Run against the stored dataset with a different configuration
    ///
    /// Dataset settings in `config` are ignored; the dataset is already built.
    pub fn run_with(&self, config: &PipelineConfig) -> Result<PipelineOutput> {
        config.validate()?;
        info!(
            "Running pipeline on {} ({} ages x {} years)",
            self.dataset.subgroup(),
            self.dataset.n_ages(),
            self.dataset.n_years()
        );

        let graduated = if config.graduation.enabled {
            Some(GraduatedRates::new(&self.dataset, &config.graduation)?)
        } else {
            None
        };

        let model = match &graduated {
            Some(surface) => LeeCarter::fit(surface, &config.fit)?,
            None => LeeCarter::fit(&self.dataset, &config.fit)?,
        };

        let projection = MortalityProjection::new(&model, &config.projection)?;

        Ok(PipelineOutput {
            graduated,
            model,
            projection,
            quantiles: (config.projection.quantile_low, config.projection.quantile_high),
        })
    }

    pub fn dataset(&self) -> &MortalityDataset {
        &self.dataset
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }
}

impl PipelineOutput {
    pub fn reestimation(&self) -> Option<&ReestimationReport> {
        self.model.reestimation()
    }

    /// Central bridged life table for a projected year
    pub fn life_table(&self, year: i32) -> Result<LifeTable> {
        self.projection.to_life_table(year, None)
    }

    /// Central, optimistic and pessimistic tables at the configured quantiles
    pub fn confidence_tables(&self, year: i32) -> Result<ConfidenceTables> {
        self.projection.to_life_table_with_ci(year, self.quantiles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GraduationConfig, ProjectionConfig};
    use crate::data::MortalitySurface;
    use crate::error::MortalityError;
    use ndarray::Array2;

    fn dataset() -> MortalityDataset {
        let (na, ny) = (30, 25);
        let mx = Array2::from_shape_fn((na, ny), |(i, t)| {
            let (x, s) = (i as f64, t as f64);
            (-6.5 + 0.09 * x - (0.012 + 0.0004 * x) * s + 0.02 * ((x + 3.0 * s) * 0.9).sin()).exp()
        });
        let ex = Array2::from_shape_fn((na, ny), |(i, _)| 60_000.0 - 1500.0 * i as f64);
        let dx = &mx * &ex;
        MortalityDataset::from_matrices("Male", (50..80).collect(), (1995..2020).collect(), mx, dx, ex)
            .unwrap()
    }

    fn config() -> PipelineConfig {
        PipelineConfig {
            projection: ProjectionConfig {
                horizon: 20,
                n_simulations: 300,
                ..ProjectionConfig::default()
            },
            ..PipelineConfig::default()
        }
    }

    #[test]
    fn test_run_with_graduation() {
        let pipeline = MortalityPipeline::new(dataset(), config()).unwrap();
        let output = pipeline.run().unwrap();

        let graduated = output.graduated.as_ref().unwrap();
        assert!(graduated.roughness() <= graduated.raw_roughness());
        assert!(output.model.validate().all_passed());
        assert!(output.reestimation().is_some());
        assert_eq!(output.projection.projected_years()[0], 2020);

        let table = output.life_table(2030).unwrap();
        assert!(table.validate().all_passed());
        assert!(matches!(
            output.life_table(2040),
            Err(MortalityError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_run_without_graduation_fits_raw_surface() {
        let pipeline = MortalityPipeline::new(dataset(), config()).unwrap();
        let raw_config = PipelineConfig {
            graduation: GraduationConfig {
                enabled: false,
                ..GraduationConfig::default()
            },
            ..config()
        };
        let output = pipeline.run_with(&raw_config).unwrap();
        assert!(output.graduated.is_none());
        assert_eq!(output.model.log_rates(), &pipeline.dataset().log_rates());
    }

    #[test]
    fn test_confidence_tables_use_configured_quantiles() {
        let pipeline = MortalityPipeline::new(dataset(), config()).unwrap();
        let output = pipeline.run().unwrap();
        let tables = output.confidence_tables(2035).unwrap();
        assert!(tables.optimistic.l(79).unwrap() > tables.pessimistic.l(79).unwrap());
    }

    #[test]
    fn test_invalid_config_rejected_before_running() {
        let mut bad = config();
        bad.projection.quantile_low = 0.99;
        bad.projection.quantile_high = 0.01;
        assert!(matches!(
            MortalityPipeline::new(dataset(), bad),
            Err(MortalityError::InvalidParameter(_))
        ));
    }
}
