//! Bridge between `ndarray` storage and `faer` factorizations
//!
//! The pipeline keeps its surfaces in `ndarray`; the dense SVD of the
//! Lee-Carter residual and the Cholesky solve of the graduation system
//! are delegated to `faer`.

use dyn_stack::{MemBuffer, MemStack};
use faer::diag::{Diag, DiagRef};
use faer::linalg::solvers::{self, Solve};
use faer::linalg::svd::{self, ComputeSvdVectors};
use faer::{get_global_parallelism, Mat, MatRef, Side};
use ndarray::{Array1, Array2, ArrayBase, Data, Ix1, Ix2};
use thiserror::Error;

use crate::error::MortalityError;

#[derive(Debug, Error)]
pub enum LinalgError {
    #[error("SVD failed to converge")]
    SvdNoConvergence,
    #[error("Cholesky factorization failed: {0:?}")]
    Cholesky(solvers::LltError),
}

impl LinalgError {
    pub(crate) fn into_degeneracy(self, stage: &'static str) -> MortalityError {
        MortalityError::degeneracy(stage, self.to_string())
    }
}

fn mat_to_array(mat: MatRef<'_, f64>) -> Array2<f64> {
    Array2::from_shape_fn((mat.nrows(), mat.ncols()), |(i, j)| mat[(i, j)])
}

fn diag_to_array(diag: DiagRef<'_, f64>) -> Array1<f64> {
    let mat = diag.column_vector().as_mat();
    Array1::from_shape_fn(mat.nrows(), |i| mat[(i, 0)])
}

fn to_faer<S: Data<Elem = f64>>(array: &ArrayBase<S, Ix2>) -> Mat<f64> {
    let (rows, cols) = array.dim();
    Mat::from_fn(rows, cols, |i, j| array[(i, j)])
}

fn col_to_faer<S: Data<Elem = f64>>(array: &ArrayBase<S, Ix1>) -> Mat<f64> {
    Mat::from_fn(array.len(), 1, |i, _| array[i])
}

/// Full singular value decomposition `A = U diag(S) Vᵀ`
#[derive(Debug, Clone)]
pub struct SvdParts {
    pub u: Array2<f64>,
    /// Singular values in non-increasing order
    pub s: Array1<f64>,
    pub vt: Array2<f64>,
}

pub trait DenseSvd {
    fn svd_full(&self) -> Result<SvdParts, LinalgError>;
}

impl<S: Data<Elem = f64>> DenseSvd for ArrayBase<S, Ix2> {
    fn svd_full(&self) -> Result<SvdParts, LinalgError> {
        let mat = to_faer(self);
        let (rows, cols) = mat.shape();

        let mut singular = Diag::<f64>::zeros(rows.min(cols));
        let mut u = Mat::<f64>::zeros(rows, rows);
        let mut v = Mat::<f64>::zeros(cols, cols);

        let par = get_global_parallelism();
        let mut mem = MemBuffer::new(svd::svd_scratch::<f64>(
            rows,
            cols,
            ComputeSvdVectors::Full,
            ComputeSvdVectors::Full,
            par,
            Default::default(),
        ));
        let mut stack = MemStack::new(&mut mem);

        svd::svd(
            mat.as_ref(),
            singular.as_mut(),
            Some(u.as_mut()),
            Some(v.as_mut()),
            par,
            &mut stack,
            Default::default(),
        )
        .map_err(|_| LinalgError::SvdNoConvergence)?;

        let v_ref = v.as_ref();
        let vt = Array2::from_shape_fn((v_ref.ncols(), v_ref.nrows()), |(i, j)| v_ref[(j, i)]);

        Ok(SvdParts {
            u: mat_to_array(u.as_ref()),
            s: diag_to_array(singular.as_ref()),
            vt,
        })
    }
}

/// Cholesky factor of a symmetric positive-definite matrix
pub struct CholeskyFactor {
    factor: solvers::Llt<f64>,
}

impl CholeskyFactor {
    pub fn solve_vec(&self, rhs: &Array1<f64>) -> Array1<f64> {
        let rhs_mat = col_to_faer(rhs);
        let sol = self.factor.solve(rhs_mat.as_ref());
        Array1::from_shape_fn(rhs.len(), |i| sol[(i, 0)])
    }
}

pub trait DenseCholesky {
    fn cholesky(&self) -> Result<CholeskyFactor, LinalgError>;
}

impl<S: Data<Elem = f64>> DenseCholesky for ArrayBase<S, Ix2> {
    fn cholesky(&self) -> Result<CholeskyFactor, LinalgError> {
        let mat = to_faer(self);
        let factor = mat
            .as_ref()
            .llt(Side::Lower)
            .map_err(LinalgError::Cholesky)?;
        Ok(CholeskyFactor { factor })
    }
}
