use std::collections::BTreeMap;
use std::fmt::Write;
use std::path::Path;

use anyhow::Context;
use serde::Serialize;

use crate::error::CellError;
use crate::models::{CellId, EventRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Divergence,
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvergenceFailure {
    pub cell_id: CellId,
    pub kind: FailureKind,
}

/// Events of every processed cell plus the cells whose fit failed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Report {
    pub cells: BTreeMap<CellId, Vec<EventRecord>>,
    pub failures: Vec<ConvergenceFailure>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportRow {
    pub id: u64,
    pub cell_id: CellId,
    pub event_nr: u32,
    pub timestamp: String,
    pub users: usize,
    pub contributions: i64,
    pub change: i64,
    pub max_contributions: i64,
    pub edited_entities: i64,
    pub geometry_edits: i64,
    pub tag_edits: i64,
    pub pvalue: f64,
    pub coeffs: String,
    pub type_counts: String,
}

pub fn assemble<I>(outcomes: I) -> Report
where
    I: IntoIterator<Item = (CellId, Result<Vec<EventRecord>, CellError>)>,
{
    let mut report = Report::default();

    for (cell_id, outcome) in outcomes {
        match outcome {
            Ok(events) => {
                report.cells.insert(cell_id, events);
            }
            Err(CellError::DegenerateResidualSpread) => {
                report.cells.insert(cell_id, Vec::new());
            }
            Err(CellError::FitDivergence(_)) => report.failures.push(ConvergenceFailure {
                cell_id,
                kind: FailureKind::Divergence,
            }),
            Err(CellError::FitTimeout(_)) => report.failures.push(ConvergenceFailure {
                cell_id,
                kind: FailureKind::Timeout,
            }),
            Err(CellError::EmptySeries) | Err(CellError::UndefinedRelativeChange) => {}
        }
    }

    report
}

impl Report {
    pub fn event_count(&self) -> usize {
        self.cells.values().map(Vec::len).sum()
    }

    /// Flattens the report in cell order. Ids run across all cells starting
    /// at 0; event numbers restart at 1 for every cell.
    pub fn rows(&self) -> Vec<ReportRow> {
        let mut rows = Vec::with_capacity(self.event_count());
        let mut id = 0u64;

        for (cell_id, events) in self.cells.iter() {
            for (event_nr, event) in (1u32..).zip(events.iter()) {
                rows.push(ReportRow {
                    id,
                    cell_id: *cell_id,
                    event_nr,
                    timestamp: event.month.format("%Y-%m").to_string(),
                    users: event.active_users,
                    contributions: event.contributions,
                    change: event.contribution_delta,
                    max_contributions: event.max_user_contribution,
                    edited_entities: event.entity_edits.entities,
                    geometry_edits: event.entity_edits.geometry_edits,
                    tag_edits: event.entity_edits.tag_edits,
                    pvalue: event.normalized_residual,
                    coeffs: event.curve.to_string(),
                    type_counts: event.type_counts.to_string(),
                });
                id += 1;
            }
        }

        rows
    }

    pub fn failure_log(&self) -> String {
        let mut output = String::new();
        let _ = writeln!(output, "cell_id");
        for failure in &self.failures {
            match failure.kind {
                FailureKind::Divergence => {
                    let _ = writeln!(output, "{}", failure.cell_id);
                }
                FailureKind::Timeout => {
                    let _ = writeln!(output, "timeout;{}", failure.cell_id);
                }
            }
        }
        output
    }

    /// Logs a one-line summary for every event, grouped by cell.
    pub fn log_summary(&self) {
        for (cell_id, events) in self.cells.iter().filter(|(_, e)| !e.is_empty()) {
            tracing::info!(cell = cell_id, events = events.len(), "events for cell");
            for event in events {
                tracing::info!(
                    "{};{};{};{};{:.3};{};{}",
                    event.month.format("%Y-%m"),
                    event.active_users,
                    event.contributions,
                    event.max_user_contribution,
                    event.relative_change,
                    event.type_counts,
                    event.curve
                );
            }
        }
    }
}

pub fn write_events(path: &Path, report: &Report) -> anyhow::Result<usize> {
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b';')
        .from_path(path)
        .with_context(|| format!("failed to create {}", path.display()))?;

    let rows = report.rows();
    if rows.is_empty() {
        writer.write_record([
            "id",
            "cell_id",
            "event_nr",
            "timestamp",
            "users",
            "contributions",
            "change",
            "max_contributions",
            "edited_entities",
            "geometry_edits",
            "tag_edits",
            "pvalue",
            "coeffs",
            "type_counts",
        ])?;
    }
    for row in &rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(rows.len())
}

pub fn write_failure_log(path: &Path, report: &Report) -> anyhow::Result<()> {
    std::fs::write(path, report.failure_log())
        .with_context(|| format!("failed to write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ContributionType, EntityEdits, FittedCurve, TypeCounts};
    use chrono::NaiveDate;
    use std::time::Duration;

    fn event(year: i32, month: u32, residual: f64) -> EventRecord {
        let mut type_counts = TypeCounts::default();
        type_counts.0.insert(ContributionType::Creation, 40);
        type_counts.0.insert(ContributionType::TagChange, 10);
        EventRecord {
            month: NaiveDate::from_ymd_opt(year, month, 1).unwrap(),
            active_users: 3,
            contributions: 50,
            contribution_delta: 50,
            relative_change: 50.0 / 23.0,
            max_user_contribution: 41,
            curve: FittedCurve::from_params([100.0, 1.0, 0.5, 10.0]),
            type_counts,
            entity_edits: EntityEdits {
                entities: 9,
                geometry_edits: 4,
                tag_edits: 2,
            },
            normalized_residual: residual,
        }
    }

    fn sample_report() -> Report {
        assemble(vec![
            (4, Ok(vec![event(2012, 6, 2.5), event(2013, 1, 1.9)])),
            (1, Ok(vec![event(2010, 3, 3.0)])),
            (2, Err(CellError::FitTimeout(Duration::from_secs(60)))),
            (3, Err(CellError::FitDivergence("too few".to_string()))),
            (5, Err(CellError::EmptySeries)),
            (6, Err(CellError::DegenerateResidualSpread)),
            (7, Ok(Vec::new())),
        ])
    }

    #[test]
    fn assembles_cells_and_failures() {
        let report = sample_report();
        assert_eq!(report.cells.keys().copied().collect::<Vec<_>>(), vec![1, 4, 6, 7]);
        assert!(report.cells[&6].is_empty());
        assert_eq!(
            report.failures,
            vec![
                ConvergenceFailure {
                    cell_id: 2,
                    kind: FailureKind::Timeout
                },
                ConvergenceFailure {
                    cell_id: 3,
                    kind: FailureKind::Divergence
                },
            ]
        );
        assert_eq!(report.event_count(), 3);
    }

    #[test]
    fn numbers_events_globally_and_per_cell() {
        let rows = sample_report().rows();
        let ids: Vec<(u64, CellId, u32)> =
            rows.iter().map(|r| (r.id, r.cell_id, r.event_nr)).collect();
        assert_eq!(ids, vec![(0, 1, 1), (1, 4, 1), (2, 4, 2)]);
        assert_eq!(rows[1].timestamp, "2012-06");
        assert_eq!(rows[1].coeffs, "[100, 1, 0.5, 10]");
        assert_eq!(rows[1].type_counts, "{CREATION=40, TAG_CHANGE=10}");
    }

    #[test]
    fn failure_log_marks_timeouts() {
        assert_eq!(sample_report().failure_log(), "cell_id\ntimeout;2\n3\n");
    }

    #[test]
    fn writes_semicolon_separated_report() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mapping_events.csv");

        let written = write_events(&path, &sample_report()).unwrap();
        assert_eq!(written, 3);

        let contents = std::fs::read_to_string(&path).unwrap();
        let mut lines = contents.lines();
        assert_eq!(
            lines.next(),
            Some("id;cell_id;event_nr;timestamp;users;contributions;change;max_contributions;edited_entities;geometry_edits;tag_edits;pvalue;coeffs;type_counts")
        );
        assert_eq!(
            lines.next(),
            Some("0;1;1;2010-03;3;50;50;41;9;4;2;3.0;[100, 1, 0.5, 10];{CREATION=40, TAG_CHANGE=10}")
        );
        assert_eq!(contents.lines().count(), 4);
    }

    #[test]
    fn empty_report_still_has_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mapping_events.csv");
        assert_eq!(write_events(&path, &Report::default()).unwrap(), 0);
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.starts_with("id;cell_id;event_nr;timestamp"));
        assert_eq!(contents.lines().count(), 1);

        let log = dir.path().join("convergence_errors.csv");
        write_failure_log(&log, &Report::default()).unwrap();
        assert_eq!(std::fs::read_to_string(&log).unwrap(), "cell_id\n");
    }
}
