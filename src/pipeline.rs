use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

use crate::config::DetectionConfig;
use crate::detect::{self, EntityEditSource, ScoredCell};
use crate::error::CellError;
use crate::fit;
use crate::models::{CellGeometry, CellId, EventRecord, MonthlyAggregate};
use crate::report::{self, Report};
use crate::residuals;
use crate::series;

/// Runs one cell from raw monthly aggregates to its event list.
pub async fn process_cell<S: EntityEditSource>(
    cell_id: CellId,
    months: Vec<MonthlyAggregate>,
    geometry: Option<&CellGeometry>,
    config: &DetectionConfig,
    source: &S,
) -> Result<Vec<EventRecord>, CellError> {
    let months = series::fill_month_grid(months, config.grid_start, config.grid_end);
    let trimmed = series::trim(&months)?;
    let cumulative = series::cumulative(trimmed);

    let sample = fit::observations(&cumulative, config.cutoff);
    let curve = fit::fit_with_timeout(sample, config.fit_timeout).await?;
    let scored = residuals::analyze(&cumulative, &curve)?;
    tracing::debug!(
        cell = cell_id,
        curve = %curve,
        mean = scored.mean,
        std_dev = scored.std_dev,
        "lagged residuals normalized"
    );

    let cell = ScoredCell {
        cell_id,
        months: trimmed,
        series: &cumulative,
        curve: &curve,
        residuals: &scored,
        geometry,
    };
    Ok(detect::detect_events(&cell, config.threshold, source).await)
}

/// Processes every cell independently and merges the outcomes into one report.
pub async fn run<S: EntityEditSource>(
    cells: BTreeMap<CellId, Vec<MonthlyAggregate>>,
    geometries: &HashMap<CellId, CellGeometry>,
    config: &DetectionConfig,
    source: &S,
) -> Report {
    tracing::info!(cells = cells.len(), "start processing");
    let started = Instant::now();
    let mut outcomes = Vec::with_capacity(cells.len());

    for (cell_id, months) in cells {
        let outcome =
            process_cell(cell_id, months, geometries.get(&cell_id), config, source).await;
        match &outcome {
            Ok(events) => tracing::debug!(cell = cell_id, events = events.len(), "cell processed"),
            Err(err @ CellError::FitDivergence(_)) => {
                tracing::warn!(cell = cell_id, "cell did not converge: {err}")
            }
            Err(err @ CellError::FitTimeout(_)) => {
                tracing::warn!(cell = cell_id, "cell did time out: {err}")
            }
            Err(err) => tracing::debug!(cell = cell_id, "cell skipped: {err}"),
        }
        outcomes.push((cell_id, outcome));
    }

    let report = report::assemble(outcomes);
    tracing::info!(
        events = report.event_count(),
        failures = report.failures.len(),
        minutes = started.elapsed().as_secs_f64() / 60.0,
        "processing finished"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::tests::{FailingEdits, FixedEdits};
    use crate::models::EntityEdits;
    use crate::report::FailureKind;
    use crate::series::tests::months_from;
    use chrono::NaiveDate;

    fn date(year: i32, month: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(year, month, 1).unwrap()
    }

    /// Monthly increments of a logistic curve with one burst of extra edits.
    fn surge_counts(len: usize, surge_at: usize, surge: i64) -> Vec<i64> {
        let cumulative = |t: usize| 1_000.0 / (1.0 + (-0.1 * (t as f64 - 60.0)).exp());
        (0..len)
            .map(|t| {
                let previous = if t == 0 { 0.0 } else { cumulative(t - 1) };
                let monthly = (cumulative(t) - previous).round().max(1.0) as i64;
                if t == surge_at {
                    monthly + surge
                } else {
                    monthly
                }
            })
            .collect()
    }

    fn config() -> DetectionConfig {
        DetectionConfig {
            grid_start: date(2008, 1),
            grid_end: date(2018, 1),
            ..DetectionConfig::default()
        }
    }

    fn input() -> BTreeMap<CellId, Vec<MonthlyAggregate>> {
        let mut cells = BTreeMap::new();
        cells.insert(1, months_from(date(2008, 1), &surge_counts(120, 80, 500)));
        cells.insert(2, months_from(date(2008, 1), &[0, 0, 0, 0]));
        cells.insert(3, months_from(date(2017, 10), &[4, 2, 9]));
        cells
    }

    #[tokio::test]
    async fn detects_surge_in_growth_curve() {
        let source = FixedEdits::new(EntityEdits {
            entities: 5,
            geometry_edits: 3,
            tag_edits: 2,
        });
        let report = run(input(), &HashMap::new(), &config(), &source).await;

        let events = &report.cells[&1];
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].month, date(2014, 9));
        assert!(events[0].normalized_residual > 1.644854);
        assert!(events[0].contribution_delta > 500);
        // No geometry was loaded for the cell, so the follow-up is skipped.
        assert_eq!(events[0].entity_edits, EntityEdits::default());

        assert!(!report.cells.contains_key(&2));
        assert!(!report.cells.contains_key(&3));
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].cell_id, 3);
        assert_eq!(report.failures[0].kind, FailureKind::Divergence);
    }

    #[tokio::test]
    async fn rerun_is_identical() {
        let first = run(input(), &HashMap::new(), &config(), &FailingEdits).await;
        let second = run(input(), &HashMap::new(), &config(), &FailingEdits).await;
        assert_eq!(first, second);
        assert_eq!(first.rows(), second.rows());
        assert_eq!(first.failure_log(), second.failure_log());
    }

    #[tokio::test]
    async fn few_post_cutoff_months_is_a_divergence() {
        let months = months_from(date(2007, 6), &[3, 5, 2, 7, 1, 6]);
        let config = DetectionConfig {
            grid_start: date(2007, 1),
            grid_end: date(2007, 12),
            ..DetectionConfig::default()
        };
        let outcome = process_cell(9, months, None, &config, &FailingEdits).await;
        assert!(matches!(outcome, Err(CellError::FitDivergence(_))));
    }

    #[tokio::test]
    async fn all_zero_cell_is_empty() {
        let months = months_from(date(2010, 1), &[0; 12]);
        let outcome = process_cell(9, months, None, &config(), &FailingEdits).await;
        assert_eq!(outcome, Err(CellError::EmptySeries));
    }

    #[tokio::test]
    async fn mid_month_dates_are_kept() {
        let start = NaiveDate::from_ymd_opt(2008, 1, 15).unwrap();
        let months = months_from(start, &[5; 60]);
        let outcome =
            process_cell(9, months, None, &DetectionConfig::default(), &FailingEdits).await;
        assert_ne!(outcome, Err(CellError::EmptySeries));
    }
}
