use std::collections::BTreeMap;

use chrono::{Datelike, Months, NaiveDate};

use crate::error::CellError;
use crate::models::{CumulativePoint, CumulativeSeries, MonthlyAggregate};

/// Lays a cell's aggregates onto the monthly grid `[start, end)`.
///
/// Aggregates are keyed by the first day of their calendar month. Months the
/// aggregation did not report become zero-contribution months so that
/// position in the series always tracks calendar time. Aggregates outside the
/// grid, or repeating a month already seen, are dropped with a warning.
pub fn fill_month_grid(
    months: Vec<MonthlyAggregate>,
    start: NaiveDate,
    end: NaiveDate,
) -> Vec<MonthlyAggregate> {
    let mut by_month: BTreeMap<NaiveDate, MonthlyAggregate> = BTreeMap::new();
    let mut duplicates = 0usize;
    for mut aggregate in months {
        aggregate.month = first_of_month(aggregate.month);
        if by_month.contains_key(&aggregate.month) {
            duplicates += 1;
            continue;
        }
        by_month.insert(aggregate.month, aggregate);
    }

    let mut filled = Vec::new();
    let mut month = first_of_month(start);
    while month < end {
        filled.push(
            by_month
                .remove(&month)
                .unwrap_or_else(|| MonthlyAggregate::empty(month)),
        );
        month = match month.checked_add_months(Months::new(1)) {
            Some(next) => next,
            None => break,
        };
    }

    if duplicates > 0 || !by_month.is_empty() {
        tracing::warn!(
            outside_grid = by_month.len(),
            duplicates,
            %start,
            %end,
            "monthly aggregates dropped from grid"
        );
    }
    filled
}

fn first_of_month(date: NaiveDate) -> NaiveDate {
    date.with_day(1).unwrap_or(date)
}

/// Drops zero-contribution months from both ends of the series.
pub fn trim(months: &[MonthlyAggregate]) -> Result<&[MonthlyAggregate], CellError> {
    let first = months
        .iter()
        .position(|m| m.contributions != 0)
        .ok_or(CellError::EmptySeries)?;
    let last = months
        .iter()
        .rposition(|m| m.contributions != 0)
        .ok_or(CellError::EmptySeries)?;
    Ok(&months[first..=last])
}

pub fn cumulative(months: &[MonthlyAggregate]) -> CumulativeSeries {
    let mut total = 0i64;
    let points = months
        .iter()
        .map(|m| {
            total += m.contributions;
            CumulativePoint {
                month: m.month,
                count: total,
            }
        })
        .collect();
    CumulativeSeries { points }
}
