//! Error types for per-cell event detection.

use std::time::Duration;

use thiserror::Error;

/// Reasons a cell, or a single month of a cell, produces no events.
///
/// None of these abort the run; the pipeline records them and moves on.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CellError {
    /// No month with contributions remains after trimming.
    #[error("no contributions in series")]
    EmptySeries,

    /// The curve fit did not converge or had too few observations.
    #[error("curve fit did not converge: {0}")]
    FitDivergence(String),

    /// The curve fit exceeded its time budget.
    #[error("curve fit timed out after {0:?}")]
    FitTimeout(Duration),

    /// Lagged residuals have zero (or undefined) spread.
    #[error("lagged residuals have no spread")]
    DegenerateResidualSpread,

    /// The cumulative count before a flagged month is zero.
    #[error("relative change undefined for a zero prior count")]
    UndefinedRelativeChange,
}

/// Failures reported by the optimizer itself.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FitError {
    #[error("{found} observations for a 4-parameter model")]
    TooFewObservations { found: usize },

    #[error("{0}")]
    Diverged(String),

    #[error("fit cancelled")]
    Cancelled,
}

impl From<FitError> for CellError {
    fn from(err: FitError) -> Self {
        CellError::FitDivergence(err.to_string())
    }
}
