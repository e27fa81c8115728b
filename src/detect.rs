use chrono::{Months, NaiveDate};

use crate::error::CellError;
use crate::models::{
    CellGeometry, CellId, CumulativeSeries, EntityEdits, EventRecord, FittedCurve,
    MonthlyAggregate,
};
use crate::residuals::NormalizedResiduals;

/// Half-open time interval `[start, end)` covering one calendar month.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonthWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl MonthWindow {
    pub fn covering(month: NaiveDate) -> Self {
        Self {
            start: month,
            end: month
                .checked_add_months(Months::new(1))
                .unwrap_or(NaiveDate::MAX),
        }
    }
}

/// Follow-up query counting edited entities in one cell during one month.
pub trait EntityEditSource {
    async fn entity_edits(
        &self,
        geometry: &CellGeometry,
        window: MonthWindow,
    ) -> anyhow::Result<EntityEdits>;
}

/// Everything the detector needs about one fitted and scored cell.
pub struct ScoredCell<'a> {
    pub cell_id: CellId,
    /// Trimmed months, aligned with `series` and `residuals`.
    pub months: &'a [MonthlyAggregate],
    pub series: &'a CumulativeSeries,
    pub curve: &'a FittedCurve,
    pub residuals: &'a NormalizedResiduals,
    pub geometry: Option<&'a CellGeometry>,
}

/// Indexes (into the trimmed series) of months whose score is strictly
/// above `threshold`. Month 0 is never returned.
pub fn flagged_months(residuals: &NormalizedResiduals, threshold: f64) -> Vec<usize> {
    residuals
        .scores
        .iter()
        .enumerate()
        .filter(|(_, z)| **z > threshold)
        .map(|(i, _)| i + 1)
        .collect()
}

pub async fn detect_events<S: EntityEditSource>(
    cell: &ScoredCell<'_>,
    threshold: f64,
    source: &S,
) -> Vec<EventRecord> {
    let mut events = Vec::new();

    for index in flagged_months(cell.residuals, threshold) {
        let (Some(month), Some(current), Some(prior), Some(score)) = (
            cell.months.get(index),
            cell.series.points.get(index),
            cell.series.points.get(index - 1),
            cell.residuals.score_for_month(index),
        ) else {
            continue;
        };

        if prior.count == 0 {
            tracing::debug!(
                cell = cell.cell_id,
                month = %month.month,
                "{}",
                CellError::UndefinedRelativeChange
            );
            continue;
        }

        let delta = current.count - prior.count;
        let entity_edits = follow_up(cell, month.month, source).await;

        events.push(EventRecord {
            month: month.month,
            active_users: month.user_counts.len(),
            contributions: month.contributions,
            contribution_delta: delta,
            relative_change: delta as f64 / prior.count as f64,
            max_user_contribution: month.user_counts.values().copied().max().unwrap_or(0),
            curve: *cell.curve,
            type_counts: month.type_counts.clone(),
            entity_edits,
            normalized_residual: score,
        });
    }

    events
}

async fn follow_up<S: EntityEditSource>(
    cell: &ScoredCell<'_>,
    month: NaiveDate,
    source: &S,
) -> EntityEdits {
    let Some(geometry) = cell.geometry else {
        tracing::error!(
            cell = cell.cell_id,
            %month,
            "no geometry for cell; entity edits set to zero"
        );
        return EntityEdits::default();
    };

    match source.entity_edits(geometry, MonthWindow::covering(month)).await {
        Ok(edits) => edits,
        Err(err) => {
            tracing::error!(
                cell = cell.cell_id,
                %month,
                error = %format!("{err:#}"),
                "follow-up query failed; entity edits set to zero"
            );
            EntityEdits::default()
        }
    }
}
