//! Logistic growth fitting.
//!
//! Fits `f(t) = a / (1 + b * exp(-k * (t - u)))` to cumulative counts with an
//! unweighted Levenberg-Marquardt least-squares solver. The solver runs on a
//! blocking worker bounded by a wall-clock budget and polls a cancellation
//! flag every iteration, so an abandoned fit stops instead of running on.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;

use crate::error::{CellError, FitError};
use crate::models::{CumulativeSeries, FittedCurve};

pub const PARAMETER_COUNT: usize = 4;

const MAX_ITERATIONS: usize = 5_000;
const COST_TOLERANCE: f64 = 1e-10;
const STEP_TOLERANCE: f64 = 1e-10;
const INITIAL_DAMPING: f64 = 1e-3;
const MIN_DAMPING: f64 = 1e-12;
const MAX_DAMPING: f64 = 1e16;
const MIN_DIAGONAL: f64 = 1e-12;
const MAX_EXPONENT: f64 = 700.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Observation {
    pub t: f64,
    pub y: f64,
}

/// Builds the fit sample from a trimmed series.
///
/// `t` counts months from the start of the whole series; months on or before
/// `cutoff` advance `t` but are left out of the sample.
pub fn observations(series: &CumulativeSeries, cutoff: NaiveDate) -> Vec<Observation> {
    series
        .points
        .iter()
        .enumerate()
        .filter(|(_, point)| point.month > cutoff)
        .map(|(t, point)| Observation {
            t: t as f64,
            y: point.count as f64,
        })
        .collect()
}

/// Fits the curve on a blocking worker, giving up after `budget`.
pub async fn fit_with_timeout(
    observations: Vec<Observation>,
    budget: Duration,
) -> Result<FittedCurve, CellError> {
    if observations.len() < PARAMETER_COUNT {
        return Err(FitError::TooFewObservations {
            found: observations.len(),
        }
        .into());
    }

    tracing::debug!(
        observations = observations.len(),
        "starting curve fit; if this is the last message for a while the fit is stuck"
    );
    run_cancellable(budget, move |cancel| fit_logistic(&observations, cancel))
        .await?
        .map_err(CellError::from)
}

/// Runs `work` on the blocking pool with a time budget.
///
/// On timeout the caller gets `FitTimeout` immediately and the flag handed to
/// `work` is raised; `work` is expected to poll it and return early.
pub async fn run_cancellable<T, F>(budget: Duration, work: F) -> Result<T, CellError>
where
    F: FnOnce(&AtomicBool) -> T + Send + 'static,
    T: Send + 'static,
{
    let cancel = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&cancel);
    let handle = tokio::task::spawn_blocking(move || work(&flag));

    match tokio::time::timeout(budget, handle).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(join_error)) => Err(CellError::FitDivergence(format!(
            "fit worker failed: {join_error}"
        ))),
        Err(_) => {
            cancel.store(true, Ordering::Relaxed);
            Err(CellError::FitTimeout(budget))
        }
    }
}

pub fn fit_logistic(
    observations: &[Observation],
    cancel: &AtomicBool,
) -> Result<FittedCurve, FitError> {
    if observations.len() < PARAMETER_COUNT {
        return Err(FitError::TooFewObservations {
            found: observations.len(),
        });
    }

    let mut params = initial_guess(observations);
    let mut current = cost(&params, observations);
    if !current.is_finite() {
        return Err(FitError::Diverged("initial guess is not finite".to_string()));
    }
    let mut damping = INITIAL_DAMPING;

    for _ in 0..MAX_ITERATIONS {
        if cancel.load(Ordering::Relaxed) {
            return Err(FitError::Cancelled);
        }
        if current == 0.0 {
            return finish(params);
        }

        let (jtj, jtr) = normal_equations(&params, observations);
        loop {
            let mut lhs = jtj;
            for (i, row) in lhs.iter_mut().enumerate() {
                row[i] += damping * jtj[i][i].max(MIN_DIAGONAL);
            }

            if let Some(step) = solve(lhs, jtr) {
                if step_is_negligible(&step, &params) {
                    return finish(params);
                }
                let candidate = add(&params, &step);
                let next = cost(&candidate, observations);
                if next.is_finite() && next < current {
                    let improvement = (current - next) / current;
                    params = candidate;
                    current = next;
                    damping = (damping / 10.0).max(MIN_DAMPING);
                    if improvement < COST_TOLERANCE {
                        return finish(params);
                    }
                    break;
                }
            }

            damping *= 10.0;
            if damping > MAX_DAMPING {
                return Err(FitError::Diverged(
                    "no descent direction at maximum damping".to_string(),
                ));
            }
        }
    }

    Err(FitError::Diverged(format!(
        "no convergence after {MAX_ITERATIONS} iterations"
    )))
}

fn initial_guess(observations: &[Observation]) -> [f64; 4] {
    let first = observations[0];
    let last = observations[observations.len() - 1];
    let y_max = observations.iter().map(|o| o.y).fold(f64::MIN, f64::max);

    // Start at the midpoint of the curve with the ceiling at twice the data.
    let a = (2.0 * y_max).max(1.0);
    let span = (last.t - first.t).max(1.0);
    let slope = ((last.y - first.y) / span).max(0.0);
    let k = (4.0 * slope / a).max(1e-3);
    [a, 1.0, k, last.t]
}

fn growth_term(params: &[f64; 4], t: f64) -> f64 {
    let [_, _, k, u] = *params;
    (-k * (t - u)).clamp(-MAX_EXPONENT, MAX_EXPONENT).exp()
}

fn evaluate(params: &[f64; 4], t: f64) -> f64 {
    params[0] / (1.0 + params[1] * growth_term(params, t))
}

/// Partial derivatives of `f` with respect to `(a, b, k, u)`.
fn gradient(params: &[f64; 4], t: f64) -> [f64; 4] {
    let [a, b, k, u] = *params;
    let e = growth_term(params, t);
    let d = 1.0 + b * e;
    let d2 = d * d;
    [
        1.0 / d,
        -a * e / d2,
        a * b * e * (t - u) / d2,
        -a * b * k * e / d2,
    ]
}

fn cost(params: &[f64; 4], observations: &[Observation]) -> f64 {
    observations
        .iter()
        .map(|o| (o.y - evaluate(params, o.t)).powi(2))
        .sum()
}

fn normal_equations(params: &[f64; 4], observations: &[Observation]) -> ([[f64; 4]; 4], [f64; 4]) {
    let mut jtj = [[0.0; 4]; 4];
    let mut jtr = [0.0; 4];
    for o in observations {
        let residual = o.y - evaluate(params, o.t);
        let g = gradient(params, o.t);
        for i in 0..4 {
            jtr[i] += g[i] * residual;
            for j in 0..4 {
                jtj[i][j] += g[i] * g[j];
            }
        }
    }
    (jtj, jtr)
}

/// Gaussian elimination with partial pivoting.
fn solve(mut lhs: [[f64; 4]; 4], mut rhs: [f64; 4]) -> Option<[f64; 4]> {
    for col in 0..4 {
        let pivot = (col..4).max_by(|&i, &j| lhs[i][col].abs().total_cmp(&lhs[j][col].abs()))?;
        if !lhs[pivot][col].is_finite() || lhs[pivot][col].abs() < f64::MIN_POSITIVE {
            return None;
        }
        lhs.swap(col, pivot);
        rhs.swap(col, pivot);

        for row in col + 1..4 {
            let factor = lhs[row][col] / lhs[col][col];
            for k in col..4 {
                lhs[row][k] -= factor * lhs[col][k];
            }
            rhs[row] -= factor * rhs[col];
        }
    }

    let mut x = [0.0; 4];
    for row in (0..4).rev() {
        let tail: f64 = (row + 1..4).map(|k| lhs[row][k] * x[k]).sum();
        x[row] = (rhs[row] - tail) / lhs[row][row];
    }
    x.iter().all(|v| v.is_finite()).then_some(x)
}

fn add(params: &[f64; 4], step: &[f64; 4]) -> [f64; 4] {
    [
        params[0] + step[0],
        params[1] + step[1],
        params[2] + step[2],
        params[3] + step[3],
    ]
}

fn step_is_negligible(step: &[f64; 4], params: &[f64; 4]) -> bool {
    step.iter()
        .zip(params.iter())
        .all(|(s, p)| s.abs() <= STEP_TOLERANCE * (p.abs() + STEP_TOLERANCE))
}

fn finish(params: [f64; 4]) -> Result<FittedCurve, FitError> {
    if params.iter().all(|p| p.is_finite()) {
        Ok(FittedCurve::from_params(params))
    } else {
        Err(FitError::Diverged("non-finite coefficients".to_string()))
    }
}
