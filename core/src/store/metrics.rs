use super::{date_from_sql, date_to_sql, SimStore};
use crate::{error::SimResult, metrics::DailyMetric};
use chrono::NaiveDate;
use rusqlite::{params, OptionalExtension};

// Each method is one upsert statement: the row is created on the first
// event of the day and every counter moves by an in-database increment.
// In the DO UPDATE clause bare column names read the pre-update row.

impl SimStore {
    // ── Daily metrics ──────────────────────────────────────────────

    pub fn metric_record_requested(&self, date: NaiveDate, is_regeneration: bool) -> SimResult<()> {
        self.conn.execute(
            "INSERT INTO daily_metric (metric_date, requested_count, regenerated_count)
             VALUES (?1, 1, ?2)
             ON CONFLICT (metric_date) DO UPDATE SET
                requested_count   = requested_count + 1,
                regenerated_count = regenerated_count + excluded.regenerated_count",
            params![date_to_sql(date), i64::from(is_regeneration)],
        )?;
        Ok(())
    }

    /// A completion without a duration still counts, and contributes
    /// zero seconds to the running total.
    pub fn metric_record_completed(
        &self,
        date: NaiveDate,
        duration_seconds: Option<i64>,
    ) -> SimResult<()> {
        self.conn.execute(
            "INSERT INTO daily_metric (
                metric_date, completed_count, total_processing_seconds, average_processing_seconds
             ) VALUES (?1, 1, ?2, ?2)
             ON CONFLICT (metric_date) DO UPDATE SET
                completed_count            = completed_count + 1,
                total_processing_seconds   = total_processing_seconds
                                             + excluded.total_processing_seconds,
                average_processing_seconds = CAST(ROUND(
                    (total_processing_seconds + excluded.total_processing_seconds) * 1.0
                    / (completed_count + 1)
                ) AS INTEGER)",
            params![date_to_sql(date), duration_seconds.unwrap_or(0).max(0)],
        )?;
        Ok(())
    }

    pub fn metric_record_failed(&self, date: NaiveDate) -> SimResult<()> {
        self.conn.execute(
            "INSERT INTO daily_metric (metric_date, failed_count) VALUES (?1, 1)
             ON CONFLICT (metric_date) DO UPDATE SET failed_count = failed_count + 1",
            params![date_to_sql(date)],
        )?;
        Ok(())
    }

    pub fn daily_metric(&self, date: NaiveDate) -> SimResult<Option<DailyMetric>> {
        self.conn
            .query_row(
                "SELECT metric_date, requested_count, completed_count, failed_count,
                        regenerated_count, total_processing_seconds, average_processing_seconds
                 FROM daily_metric WHERE metric_date = ?1",
                params![date_to_sql(date)],
                |row| {
                    Ok(DailyMetric {
                        date: date_from_sql(0, row.get(0)?)?,
                        requested: row.get(1)?,
                        completed: row.get(2)?,
                        failed: row.get(3)?,
                        regenerated: row.get(4)?,
                        total_processing_seconds: row.get(5)?,
                        average_processing_seconds: row.get(6)?,
                    })
                },
            )
            .optional()
            .map_err(Into::into)
    }
}
