//! Error taxonomy for the mortality pipeline
//!
//! Every stage validates eagerly and fails with one of three kinds:
//! - **DataIntegrity**: raw data is missing, invalid or inconsistent
//! - **OutOfRange**: an age/year/projection year outside what was loaded or computed
//! - **NumericalDegeneracy**: a solver could not produce a finite, valid result

use thiserror::Error;

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, MortalityError>;

/// Errors raised while loading, smoothing, fitting or projecting mortality
#[derive(Debug, Error)]
pub enum MortalityError {
    /// Raw data failed validation. Never silently repaired.
    #[error("Data integrity error ({context}): {message}")]
    DataIntegrity {
        /// Where the problem was found (subgroup, age, year)
        context: String,
        /// What is wrong with it
        message: String,
    },

    /// Requested key lies outside the loaded or computed range
    #[error("{what} {requested} out of range ({min}-{max})")]
    OutOfRange {
        /// Kind of key: "age", "year", "projection year"
        what: &'static str,
        requested: i64,
        min: i64,
        max: i64,
    },

    /// A numerical stage could not produce a finite result
    #[error("Numerical degeneracy in {stage}: {message}")]
    NumericalDegeneracy {
        stage: &'static str,
        message: String,
    },

    /// Configuration value that makes no sense for the computation
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl MortalityError {
    /// Create a DataIntegrity error.
    pub fn data_integrity(context: impl Into<String>, message: impl Into<String>) -> Self {
        Self::DataIntegrity {
            context: context.into(),
            message: message.into(),
        }
    }

    /// Create an OutOfRange error.
    pub fn out_of_range(what: &'static str, requested: i64, min: i64, max: i64) -> Self {
        Self::OutOfRange {
            what,
            requested,
            min,
            max,
        }
    }

    /// Create a NumericalDegeneracy error.
    pub fn degeneracy(stage: &'static str, message: impl Into<String>) -> Self {
        Self::NumericalDegeneracy {
            stage,
            message: message.into(),
        }
    }

    /// Create an InvalidParameter error.
    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        Self::InvalidParameter(message.into())
    }

    /// Prefix a NumericalDegeneracy message with the subgroup it arose in
    pub(crate) fn in_subgroup(self, subgroup: &str) -> Self {
        match self {
            Self::NumericalDegeneracy { stage, message } => Self::NumericalDegeneracy {
                stage,
                message: format!("{}: {}", subgroup, message),
            },
            other => other,
        }
    }
}

/// Find the position of `key` in a sorted label axis, or report the axis range
pub(crate) fn locate(labels: &[i32], key: i32, what: &'static str) -> Result<usize> {
    labels.binary_search(&key).map_err(|_| {
        let min = labels.first().copied().unwrap_or_default();
        let max = labels.last().copied().unwrap_or_default();
        MortalityError::out_of_range(what, key as i64, min as i64, max as i64)
    })
}
