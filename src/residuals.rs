use crate::error::CellError;
use crate::models::{CumulativeSeries, FittedCurve};

/// Normalized lagged residuals of one cell.
///
/// `scores[i]` belongs to month `i + 1` of the trimmed series; the first
/// month has no lagged residual.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedResiduals {
    pub scores: Vec<f64>,
    pub mean: f64,
    pub std_dev: f64,
}

impl NormalizedResiduals {
    /// Score of the month at `index` in the trimmed series.
    pub fn score_for_month(&self, index: usize) -> Option<f64> {
        index.checked_sub(1).and_then(|i| self.scores.get(i).copied())
    }
}

/// Observed minus fitted value, each month evaluated at its own index.
pub fn residuals(series: &CumulativeSeries, curve: &FittedCurve) -> Vec<f64> {
    series
        .points
        .iter()
        .enumerate()
        .map(|(t, point)| point.count as f64 - curve.value_at(t as f64))
        .collect()
}

pub fn lagged(residuals: &[f64]) -> Vec<f64> {
    residuals.windows(2).map(|w| w[1] - w[0]).collect()
}

/// Z-scores of the lagged residuals using the sample standard deviation.
pub fn normalize(lagged: &[f64]) -> Result<NormalizedResiduals, CellError> {
    if lagged.len() < 2 {
        return Err(CellError::DegenerateResidualSpread);
    }

    let n = lagged.len() as f64;
    let mean = lagged.iter().sum::<f64>() / n;
    let variance = lagged.iter().map(|l| (l - mean).powi(2)).sum::<f64>() / (n - 1.0);
    let std_dev = variance.sqrt();
    if !std_dev.is_finite() || std_dev == 0.0 {
        return Err(CellError::DegenerateResidualSpread);
    }

    Ok(NormalizedResiduals {
        scores: lagged.iter().map(|l| (l - mean) / std_dev).collect(),
        mean,
        std_dev,
    })
}

pub fn analyze(
    series: &CumulativeSeries,
    curve: &FittedCurve,
) -> Result<NormalizedResiduals, CellError> {
    normalize(&lagged(&residuals(series, curve)))
}
