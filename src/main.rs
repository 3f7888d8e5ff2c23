//! Mortality projection CLI
//!
//! Loads a mortality dataset, runs graduation, Lee-Carter fitting and the
//! stochastic projection, then writes the target year's life tables to CSV.

use std::fs::File;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use csv::Writer;
use serde::Serialize;

use lee_carter_engine::data::loader::{load_counts_csv, load_inegi};
use lee_carter_engine::{
    HmdSource, LifeTable, MortalityComparison, MortalityPipeline, MortalitySurface, PipelineConfig,
    SolveTier,
};

#[derive(Parser, Debug)]
#[command(name = "mortality_projection", version, about = "Stochastic Lee-Carter mortality projection")]
struct Cli {
    /// JSON configuration file; defaults apply to anything it omits
    #[arg(long)]
    config: Option<PathBuf>,

    /// HMD data directory containing one folder per country
    #[arg(long, requires = "country")]
    hmd_dir: Option<PathBuf>,

    /// HMD country code, e.g. USA
    #[arg(long)]
    country: Option<String>,

    /// Long-format deaths CSV (year,age,subgroup,value)
    #[arg(long, requires = "exposure", conflicts_with = "hmd_dir")]
    deaths: Option<PathBuf>,

    /// Long-format exposure CSV (year,age,subgroup,value)
    #[arg(long)]
    exposure: Option<PathBuf>,

    /// INEGI deaths CSV (Anio,Edad,Sexo,Defunciones)
    #[arg(
        long,
        requires = "conapo_population",
        conflicts_with_all = ["hmd_dir", "deaths"]
    )]
    inegi_deaths: Option<PathBuf>,

    /// CONAPO population CSV (Anio,Edad,Sexo,Poblacion), used as exposure
    #[arg(long)]
    conapo_population: Option<PathBuf>,

    /// Subgroup override (Male, Female, Total; Hombres, Mujeres, Total for INEGI)
    #[arg(long)]
    subgroup: Option<String>,

    /// Projected year for the life tables (default: last projected year)
    #[arg(long)]
    year: Option<i32>,

    /// Benchmark life table (age,l_x) to compare the central table against
    #[arg(long)]
    benchmark: Option<PathBuf>,

    #[arg(long, default_value = "projected_life_table.csv")]
    output: PathBuf,
}

#[derive(Debug, Serialize)]
struct OutputRow {
    scenario: &'static str,
    age: i32,
    l_x: f64,
    d_x: f64,
    q_x: f64,
    p_x: f64,
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => PipelineConfig::from_json_path(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    if let Some(subgroup) = &cli.subgroup {
        config.dataset.subgroup = subgroup.clone();
    }

    let dataset = if let (Some(dir), Some(country)) = (&cli.hmd_dir, &cli.country) {
        HmdSource::new(dir, country.as_str())
            .load(&config.dataset)
            .with_context(|| format!("Failed to load HMD data for {}", country))?
    } else if let (Some(deaths), Some(exposure)) = (&cli.deaths, &cli.exposure) {
        load_counts_csv(deaths, exposure, &config.dataset)
            .context("Failed to load deaths/exposure CSV")?
    } else if let (Some(deaths), Some(population)) = (&cli.inegi_deaths, &cli.conapo_population) {
        load_inegi(deaths, population, &config.dataset)
            .context("Failed to load INEGI deaths / CONAPO population")?
    } else {
        bail!(
            "Provide --hmd-dir with --country, --deaths with --exposure, \
             or --inegi-deaths with --conapo-population"
        );
    };

    println!("Lee-Carter Engine v{}", env!("CARGO_PKG_VERSION"));
    println!("========================\n");
    let data_summary = dataset.summary();
    println!("Dataset: {} ({})", data_summary.source, data_summary.subgroup);
    println!("  Ages:  {}-{}", data_summary.age_range.0, data_summary.age_range.1);
    println!("  Years: {}-{}", data_summary.year_range.0, data_summary.year_range.1);
    println!("  m_x range: {:.6} - {:.6}", data_summary.mx_min, data_summary.mx_max);
    println!();

    let pipeline = MortalityPipeline::new(dataset, config)?;
    let output = pipeline.run().context("Pipeline run failed")?;

    if let Some(graduated) = &output.graduated {
        let summary = graduated.summary();
        println!("Graduation (lambda = {:e}):", summary.lambda);
        println!("  Roughness reduction: {:.2}%", summary.roughness_reduction * 100.0);
        println!("  Residual mean/std:   {:.6} / {:.6}", summary.residual_mean, summary.residual_std);
    }

    let fit = output.model.summary();
    println!("Lee-Carter fit:");
    println!("  Explained variance: {:.4}", fit.explained_variance);
    println!("  Log RMSE:           {:.6}", fit.rmse);
    println!("  k_t trend:          {:?} ({:.3} to {:.3})", fit.kt_trend, fit.kt_range.0, fit.kt_range.1);
    if let Some(report) = output.reestimation() {
        println!(
            "  Re-estimation:      {} bracket, {} scan, {} best effort (max rel. residual {:.2e})",
            report.count(SolveTier::Bracket),
            report.count(SolveTier::Scan),
            report.count(SolveTier::BestEffort),
            report.max_relative_residual()
        );
    }

    let projection = output.projection.summary();
    println!("Projection:");
    println!("  Years: {}-{}", projection.projected_years.0, projection.projected_years.1);
    println!("  Drift: {:.4}  Sigma: {:.4}", projection.drift, projection.sigma);
    if !projection.checks.drift_is_negative {
        println!("  WARNING: drift is non-negative; mortality is not improving in this window");
    }
    println!();

    let year = cli.year.unwrap_or(projection.projected_years.1);
    let tables = output
        .confidence_tables(year)
        .with_context(|| format!("Failed to build life tables for {}", year))?;

    let file = File::create(&cli.output)
        .with_context(|| format!("Unable to create {}", cli.output.display()))?;
    let mut writer = Writer::from_writer(file);
    for (scenario, table) in [
        ("central", &tables.central),
        ("optimistic", &tables.optimistic),
        ("pessimistic", &tables.pessimistic),
    ] {
        for row in table.rows() {
            writer.serialize(OutputRow {
                scenario,
                age: row.age,
                l_x: row.l_x,
                d_x: row.d_x,
                q_x: row.q_x,
                p_x: row.p_x,
            })?;
        }
    }
    writer.flush()?;
    println!("Life tables for {} written to: {}", year, cli.output.display());

    let ages = pipeline.dataset().ages();
    let mid_age = ages[ages.len() / 2];
    println!(
        "  q_{} central {:.6}  optimistic {:.6}  pessimistic {:.6}",
        mid_age,
        tables.central.q(mid_age)?,
        tables.optimistic.q(mid_age)?,
        tables.pessimistic.q(mid_age)?
    );

    if let Some(path) = &cli.benchmark {
        let benchmark = LifeTable::from_csv(path)
            .with_context(|| format!("Failed to load benchmark table {}", path.display()))?;
        let comparison = MortalityComparison::new("benchmark", &tables.central, &benchmark)?;
        let summary = comparison.summary()?;
        println!("\nComparison against {}:", path.display());
        println!("  Overlapping ages: {}", summary.n_ages);
        println!("  q_x RMSE:         {:.6}", summary.rmse);
        println!(
            "  q_x ratio:        min {:.4}  mean {:.4}  max {:.4}",
            summary.min_ratio, summary.mean_ratio, summary.max_ratio
        );
    }

    Ok(())
}
