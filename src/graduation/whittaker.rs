//! Whittaker-Henderson smoothing of a single log-rate vector
//!
//! Minimizes `sum_x w_x (z_x - m_x)^2 + lambda * sum_x (Delta^h z_x)^2`, whose
//! solution is the linear system `(W + lambda DᵀD) z = W m`.

use ndarray::{Array1, Array2, ArrayView1};

use crate::error::{MortalityError, Result};
use crate::linalg::DenseCholesky;

/// Build the order-`order` difference matrix D of shape (n - order) x n
///
/// Built by composing first differences: D_h = D_1 · D_{h-1}.
/// Rows are `[-1, 1]` for order 1 and `[1, -2, 1]` for order 2.
pub fn difference_matrix(n: usize, order: usize) -> Result<Array2<f64>> {
    if order == 0 || order >= n {
        return Err(MortalityError::invalid_parameter(format!(
            "difference order {} needs more than {} points, got {}",
            order, order, n
        )));
    }

    let mut d = first_difference(n);
    for _ in 1..order {
        d = first_difference(d.nrows()).dot(&d);
    }
    Ok(d)
}

fn first_difference(n: usize) -> Array2<f64> {
    let mut d = Array2::zeros((n - 1, n));
    for i in 0..n - 1 {
        d[(i, i)] = -1.0;
        d[(i, i + 1)] = 1.0;
    }
    d
}

/// Sum of squared order-2 differences of a vector
pub fn vector_roughness(values: ArrayView1<'_, f64>) -> f64 {
    values
        .windows(3)
        .into_iter()
        .map(|w| {
            let d2 = w[2] - 2.0 * w[1] + w[0];
            d2 * d2
        })
        .sum()
}

/// Smooth one vector of log-rates with weights `weights`
///
/// Fails on negative or non-finite weights, on an all-zero weight vector,
/// and whenever the penalized system is not positive definite.
pub fn whittaker_smooth(
    log_rates: ArrayView1<'_, f64>,
    weights: ArrayView1<'_, f64>,
    lambda: f64,
    order: usize,
) -> Result<Array1<f64>> {
    let n = log_rates.len();
    if weights.len() != n {
        return Err(MortalityError::invalid_parameter(format!(
            "weights length {} does not match {} rates",
            weights.len(),
            n
        )));
    }
    if !lambda.is_finite() || lambda < 0.0 {
        return Err(MortalityError::invalid_parameter(format!(
            "lambda must be finite and >= 0, got {}",
            lambda
        )));
    }
    if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
        return Err(MortalityError::degeneracy(
            "graduation",
            "weights must be finite and non-negative",
        ));
    }
    if weights.iter().all(|&w| w == 0.0) {
        return Err(MortalityError::degeneracy("graduation", "all weights are zero"));
    }

    let d = difference_matrix(n, order)?;
    let mut system = d.t().dot(&d) * lambda;
    for i in 0..n {
        system[(i, i)] += weights[i];
    }
    let rhs = &weights * &log_rates;

    let smoothed = system
        .cholesky()
        .map_err(|e| e.into_degeneracy("graduation"))?
        .solve_vec(&rhs);

    if smoothed.iter().any(|v| !v.is_finite()) {
        return Err(MortalityError::degeneracy(
            "graduation",
            "solution contains non-finite values",
        ));
    }
    Ok(smoothed)
}
