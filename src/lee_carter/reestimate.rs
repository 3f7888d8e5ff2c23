//! Re-estimation of k_t against observed death counts
//!
//! For each year t, solve for k:
//!
//! `f(k) = sum_x L_{x,t} * exp(a_x + b_x * k) - sum_x d_{x,t} = 0`
//!
//! With mixed-sign b_x, f is not monotone and the symmetric bracket may hold
//! no sign change. The solver then degrades through three tiers:
//! 1. Brent's method on [-bracket, bracket]
//! 2. A linear scan for the first sign change, refined with Brent
//! 3. The grid point minimizing |f| (best effort, or an error under the strict policy)

use log::{debug, warn};
use ndarray::{Array1, Array2, ArrayView1};
use serde::Serialize;

use crate::config::{DegradationPolicy, ReestimationConfig};
use crate::error::{MortalityError, Result};

/// Which tier of the root finder produced a year's k
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SolveTier {
    /// Brent's method on the full symmetric bracket
    Bracket,
    /// Brent's method inside the first sign change of the scan grid
    Scan,
    /// No sign change anywhere: the grid point with the smallest |residual|
    BestEffort,
}

/// Outcome of one year's solve
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct YearSolve {
    pub year: i32,
    /// Solved k before re-centering
    pub k: f64,
    pub tier: SolveTier,
    /// Implied minus observed deaths at `k`
    pub residual: f64,
    pub observed_deaths: f64,
}

impl YearSolve {
    pub fn relative_residual(&self) -> f64 {
        if self.observed_deaths != 0.0 {
            self.residual / self.observed_deaths
        } else {
            self.residual
        }
    }
}

/// Per-year record of the re-estimation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReestimationReport {
    pub solves: Vec<YearSolve>,
    pub policy: DegradationPolicy,
}

impl ReestimationReport {
    /// Solved k per year, before re-centering
    pub fn raw_kt(&self) -> Array1<f64> {
        self.solves.iter().map(|s| s.k).collect()
    }

    pub fn count(&self, tier: SolveTier) -> usize {
        self.solves.iter().filter(|s| s.tier == tier).count()
    }

    /// Years that did not come out of the primary bracket
    pub fn degraded(&self) -> impl Iterator<Item = &YearSolve> {
        self.solves.iter().filter(|s| s.tier != SolveTier::Bracket)
    }

    pub fn max_relative_residual(&self) -> f64 {
        self.solves
            .iter()
            .map(|s| s.relative_residual().abs())
            .fold(0.0, f64::max)
    }
}

/// Solve every year's k so implied deaths reproduce observed deaths
pub fn reestimate_kt(
    ax: &Array1<f64>,
    bx: &Array1<f64>,
    deaths: &Array2<f64>,
    exposures: &Array2<f64>,
    years: &[i32],
    config: &ReestimationConfig,
) -> Result<ReestimationReport> {
    config.validate()?;
    let mut solves = Vec::with_capacity(years.len());

    for (t, &year) in years.iter().enumerate() {
        let observed = deaths.column(t).sum();
        let residual = DeathResidual {
            ax,
            bx,
            exposures: exposures.column(t),
            observed,
        };
        let solve = solve_year(&residual, year, config)?;
        debug!(
            "Re-estimated k for {}: {:.6} ({:?}, residual {:.3e})",
            year, solve.k, solve.tier, solve.residual
        );
        solves.push(solve);
    }

    Ok(ReestimationReport {
        solves,
        policy: config.policy,
    })
}

struct DeathResidual<'a> {
    ax: &'a Array1<f64>,
    bx: &'a Array1<f64>,
    exposures: ArrayView1<'a, f64>,
    observed: f64,
}

impl DeathResidual<'_> {
    fn eval(&self, k: f64) -> f64 {
        let implied: f64 = self
            .exposures
            .iter()
            .zip(self.ax.iter().zip(self.bx.iter()))
            .map(|(e, (a, b))| e * (a + b * k).exp())
            .sum();
        implied - self.observed
    }
}

fn solve_year(f: &DeathResidual<'_>, year: i32, config: &ReestimationConfig) -> Result<YearSolve> {
    let eval = |k: f64| f.eval(k);
    let solve = |k: f64, tier: SolveTier| YearSolve {
        year,
        k,
        tier,
        residual: f.eval(k),
        observed_deaths: f.observed,
    };

    let (lo, hi) = (-config.bracket, config.bracket);
    if let Some(k) = brent(eval, lo, hi, config.tolerance, config.max_iterations) {
        return Ok(solve(k, SolveTier::Bracket));
    }

    let grid = linspace(lo, hi, config.scan_points);
    let values: Vec<f64> = grid.iter().map(|&k| f.eval(k)).collect();

    for i in 0..grid.len() {
        if values[i] == 0.0 {
            warn!(
                "Year {}: no sign change on [{}, {}]; scan hit a root at grid point k = {}",
                year, lo, hi, grid[i]
            );
            return Ok(solve(grid[i], SolveTier::Scan));
        }
        if i + 1 < grid.len() && values[i] * values[i + 1] < 0.0 {
            if let Some(k) = brent(eval, grid[i], grid[i + 1], config.tolerance, config.max_iterations) {
                warn!(
                    "Year {}: no sign change on [{}, {}]; scan found a root in [{}, {}], k = {:.6}",
                    year,
                    lo,
                    hi,
                    grid[i],
                    grid[i + 1],
                    k
                );
                return Ok(solve(k, SolveTier::Scan));
            }
        }
    }

    let best = values
        .iter()
        .enumerate()
        .filter(|(_, v)| !v.is_nan())
        .min_by(|a, b| a.1.abs().total_cmp(&b.1.abs()))
        .map(|(i, _)| grid[i])
        .ok_or_else(|| {
            MortalityError::degeneracy(
                "re-estimation",
                format!("year {}: death residual is NaN on the whole scan grid", year),
            )
        })?;
    let result = solve(best, SolveTier::BestEffort);

    match config.policy {
        DegradationPolicy::Strict => Err(MortalityError::degeneracy(
            "re-estimation",
            format!(
                "year {}: no k in [{}, {}] reproduces {} observed deaths (closest residual {:.6e} at k = {})",
                year, lo, hi, f.observed, result.residual, best
            ),
        )),
        DegradationPolicy::BestEffort => {
            warn!(
                "Year {}: no root for observed deaths {}; best-effort k = {} leaves residual {:.6e}",
                year, f.observed, best, result.residual
            );
            Ok(result)
        }
    }
}

/// `n` evenly spaced points from `start` to `end` inclusive
pub(crate) fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (end - start) / (n - 1) as f64;
            (0..n)
                .map(|i| if i == n - 1 { end } else { start + step * i as f64 })
                .collect()
        }
    }
}

/// Brent's method for a root of `f` in `[a, b]`
///
/// Returns `None` when the endpoints do not bracket a sign change, when `f`
/// produces NaN, or when `max_iter` iterations do not reach `tol`.
/// Infinite function values are tolerated; the step falls back to bisection.
pub fn brent<F>(f: F, a: f64, b: f64, tol: f64, max_iter: usize) -> Option<f64>
where
    F: Fn(f64) -> f64,
{
    let (mut a, mut b) = (a, b);
    let (mut fa, mut fb) = (f(a), f(b));
    if fa.is_nan() || fb.is_nan() {
        return None;
    }
    if fa == 0.0 {
        return Some(a);
    }
    if fb == 0.0 {
        return Some(b);
    }
    if fa.signum() == fb.signum() {
        return None;
    }

    let (mut c, mut fc) = (b, fb);
    let mut d = b - a;
    let mut e = d;

    for _ in 0..max_iter {
        if fb.signum() == fc.signum() {
            c = a;
            fc = fa;
            d = b - a;
            e = d;
        }
        if fc.abs() < fb.abs() {
            a = b;
            b = c;
            c = a;
            fa = fb;
            fb = fc;
            fc = fa;
        }

        let tol1 = 2.0 * f64::EPSILON * b.abs() + 0.5 * tol;
        let xm = 0.5 * (c - b);
        if xm.abs() <= tol1 || fb == 0.0 {
            return Some(b);
        }

        if e.abs() >= tol1 && fa.abs() > fb.abs() {
            // inverse quadratic interpolation, or secant when only two points are distinct
            let s = fb / fa;
            let (mut p, mut q);
            if a == c {
                p = 2.0 * xm * s;
                q = 1.0 - s;
            } else {
                let q0 = fa / fc;
                let r = fb / fc;
                p = s * (2.0 * xm * q0 * (q0 - r) - (b - a) * (r - 1.0));
                q = (q0 - 1.0) * (r - 1.0) * (s - 1.0);
            }
            if p > 0.0 {
                q = -q;
            } else {
                p = -p;
            }
            let min1 = 3.0 * xm * q - (tol1 * q).abs();
            let min2 = (e * q).abs();
            if p.is_finite() && q.is_finite() && 2.0 * p < min1.min(min2) {
                e = d;
                d = p / q;
            } else {
                d = xm;
                e = d;
            }
        } else {
            d = xm;
            e = d;
        }

        a = b;
        fa = fb;
        b += if d.abs() > tol1 { d } else { tol1.copysign(xm) };
        fb = f(b);
        if fb.is_nan() {
            return None;
        }
    }

    None
}
