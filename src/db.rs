use std::collections::BTreeMap;

use anyhow::Context;
use chrono::{Datelike, NaiveDate};
use sqlx::types::Json;
use sqlx::{PgPool, Row};

use crate::detect::{EntityEditSource, MonthWindow};
use crate::models::{CellGeometry, CellId, EntityEdits, MonthlyAggregate, TypeCounts};

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Loads the output of the history aggregation into `monthly_aggregates`.
///
/// Expects the columns `cell_id,month,contributions,type_counts,user_counts`
/// with both count maps encoded as JSON objects.
pub async fn import_csv(pool: &PgPool, csv_path: &std::path::Path) -> anyhow::Result<usize> {
    let mut reader = csv::Reader::from_path(csv_path)?;
    let mut written = 0usize;

    for (line, result) in reader.deserialize::<CsvRow>().enumerate() {
        let (cell_id, aggregate) = result?
            .into_aggregate()
            .with_context(|| format!("invalid aggregate on data row {}", line + 1))?;

        let result = sqlx::query(
            r#"
            INSERT INTO event_finder.monthly_aggregates
            (cell_id, month, contributions, type_counts, user_counts)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (cell_id, month) DO UPDATE
            SET contributions = EXCLUDED.contributions,
                type_counts = EXCLUDED.type_counts,
                user_counts = EXCLUDED.user_counts
            "#,
        )
        .bind(cell_id)
        .bind(aggregate.month)
        .bind(aggregate.contributions)
        .bind(Json(&aggregate.type_counts))
        .bind(Json(&aggregate.user_counts))
        .execute(pool)
        .await?;

        written += result.rows_affected() as usize;
    }

    Ok(written)
}

#[derive(serde::Deserialize)]
struct CsvRow {
    cell_id: CellId,
    month: NaiveDate,
    contributions: i64,
    type_counts: String,
    user_counts: String,
}

impl CsvRow {
    fn into_aggregate(self) -> anyhow::Result<(CellId, MonthlyAggregate)> {
        anyhow::ensure!(self.contributions >= 0, "negative contribution count");
        anyhow::ensure!(
            self.month.day() == 1,
            "month {} is not the first day of a month",
            self.month
        );
        let type_counts: TypeCounts =
            serde_json::from_str(&self.type_counts).context("type_counts is not a JSON map")?;
        let user_counts: BTreeMap<i64, i64> =
            serde_json::from_str(&self.user_counts).context("user_counts is not a JSON map")?;
        Ok((
            self.cell_id,
            MonthlyAggregate {
                month: self.month,
                contributions: self.contributions,
                type_counts,
                user_counts,
            },
        ))
    }
}

/// Fetches every stored aggregate in `[start, end)`, grouped by cell and
/// ordered by month.
pub async fn fetch_monthly_aggregates(
    pool: &PgPool,
    start: NaiveDate,
    end: NaiveDate,
) -> anyhow::Result<BTreeMap<CellId, Vec<MonthlyAggregate>>> {
    let rows = sqlx::query(
        "SELECT cell_id, month, contributions, type_counts, user_counts \
         FROM event_finder.monthly_aggregates \
         WHERE month >= $1 AND month < $2 \
         ORDER BY cell_id, month",
    )
    .bind(start)
    .bind(end)
    .fetch_all(pool)
    .await?;

    let mut records = Vec::with_capacity(rows.len());
    for row in rows {
        let type_counts: Json<TypeCounts> = row.try_get("type_counts")?;
        let user_counts: Json<BTreeMap<i64, i64>> = row.try_get("user_counts")?;
        records.push((
            row.try_get::<CellId, _>("cell_id")?,
            MonthlyAggregate {
                month: row.try_get("month")?,
                contributions: row.try_get("contributions")?,
                type_counts: type_counts.0,
                user_counts: user_counts.0,
            },
        ));
    }

    Ok(group_by_cell(records))
}

pub fn group_by_cell(
    records: impl IntoIterator<Item = (CellId, MonthlyAggregate)>,
) -> BTreeMap<CellId, Vec<MonthlyAggregate>> {
    let mut cells: BTreeMap<CellId, Vec<MonthlyAggregate>> = BTreeMap::new();
    for (cell_id, aggregate) in records {
        cells.entry(cell_id).or_default().push(aggregate);
    }
    for months in cells.values_mut() {
        months.sort_by_key(|m| m.month);
    }
    cells
}

/// Postgres/PostGIS history store answering the per-event follow-up query.
pub struct PgHistoryStore {
    pool: PgPool,
}

impl PgHistoryStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl EntityEditSource for PgHistoryStore {
    async fn entity_edits(
        &self,
        geometry: &CellGeometry,
        window: MonthWindow,
    ) -> anyhow::Result<EntityEdits> {
        tracing::info!(month = %window.start, "run follow-up query");
        let started = std::time::Instant::now();

        let row = sqlx::query(
            r#"
            SELECT COUNT(DISTINCT c.entity_type || '/' || c.entity_id) AS entities,
                   COUNT(*) FILTER (WHERE c.geometry_edit) AS geometry_edits,
                   COUNT(*) FILTER (WHERE c.tag_edit) AS tag_edits
            FROM event_finder.contributions c
            WHERE c.occurred_at >= $2
              AND c.occurred_at < $3
              AND ST_Intersects(c.geom, ST_SetSRID(ST_GeomFromGeoJSON($1), 4326))
            "#,
        )
        .bind(geometry.0.to_string())
        .bind(window.start.and_time(chrono::NaiveTime::MIN).and_utc())
        .bind(window.end.and_time(chrono::NaiveTime::MIN).and_utc())
        .fetch_one(&self.pool)
        .await
        .context("follow-up entity edit query failed")?;

        let edits = EntityEdits {
            entities: row.try_get("entities")?,
            geometry_edits: row.try_get("geometry_edits")?,
            tag_edits: row.try_get("tag_edits")?,
        };
        tracing::info!(
            minutes = started.elapsed().as_secs_f64() / 60.0,
            "follow-up query finished"
        );
        Ok(edits)
    }
}
