use super::{date_from_sql, date_to_sql, ts_to_sql, SimStore};
use crate::{error::SimResult, types::OwnerRef};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, OptionalExtension};

/// Quota columns of an owner row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerQuotaRow {
    pub owner_key: String,
    pub tier: String,
    pub daily_count: u32,
    pub last_counted_date: Option<NaiveDate>,
}

impl OwnerQuotaRow {
    /// The count that applies on `today`; a stale date reads as zero.
    pub fn count_on(&self, today: NaiveDate) -> u32 {
        match self.last_counted_date {
            Some(date) if date == today => self.daily_count,
            _ => 0,
        }
    }
}

impl SimStore {
    // ── Owner ──────────────────────────────────────────────────────

    /// Insert the owner if unseen. An existing row keeps its tier.
    pub fn ensure_owner(&self, owner: &OwnerRef, tier: &str, now: DateTime<Utc>) -> SimResult<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO owner (owner_key, kind, tier, daily_count, created_at)
             VALUES (?1, ?2, ?3, 0, ?4)",
            params![owner.key(), owner.kind(), tier, ts_to_sql(&now)],
        )?;
        Ok(())
    }

    pub fn set_owner_tier(&self, owner_key: &str, tier: &str) -> SimResult<bool> {
        let changed = self.conn.execute(
            "UPDATE owner SET tier = ?1 WHERE owner_key = ?2",
            params![tier, owner_key],
        )?;
        Ok(changed == 1)
    }

    pub fn owner_quota(&self, owner_key: &str) -> SimResult<Option<OwnerQuotaRow>> {
        self.conn
            .query_row(
                "SELECT owner_key, tier, daily_count, last_counted_date
                 FROM owner WHERE owner_key = ?1",
                params![owner_key],
                |row| {
                    Ok(OwnerQuotaRow {
                        owner_key: row.get(0)?,
                        tier: row.get(1)?,
                        daily_count: row.get::<_, i64>(2)?.max(0) as u32,
                        last_counted_date: row
                            .get::<_, Option<String>>(3)?
                            .map(|d| date_from_sql(3, d))
                            .transpose()?,
                    })
                },
            )
            .optional()
            .map_err(Into::into)
    }

    /// Reserve one unit of today's quota in a single statement.
    ///
    /// The day reset and the `< limit` check happen inside the same
    /// UPDATE, so two connections racing for the last slot cannot both
    /// succeed. Returns the new count, or None when the owner is at the
    /// limit (or unknown).
    pub fn try_reserve_quota(
        &self,
        owner_key: &str,
        today: NaiveDate,
        limit: u32,
    ) -> SimResult<Option<u32>> {
        let today = date_to_sql(today);
        self.conn
            .query_row(
                "UPDATE owner
                 SET daily_count = CASE WHEN last_counted_date = ?2
                                        THEN daily_count + 1 ELSE 1 END,
                     last_counted_date = ?2
                 WHERE owner_key = ?1
                   AND ?3 > 0
                   AND (last_counted_date IS NOT ?2 OR daily_count < ?3)
                 RETURNING daily_count",
                params![owner_key, today, limit as i64],
                |row| row.get::<_, i64>(0),
            )
            .optional()
            .map(|count| count.map(|c| c.max(0) as u32))
            .map_err(Into::into)
    }

    /// Give back a unit reserved today. No-op after a day change.
    pub fn release_quota(&self, owner_key: &str, today: NaiveDate) -> SimResult<bool> {
        let changed = self.conn.execute(
            "UPDATE owner SET daily_count = daily_count - 1
             WHERE owner_key = ?1 AND last_counted_date = ?2 AND daily_count > 0",
            params![owner_key, date_to_sql(today)],
        )?;
        Ok(changed == 1)
    }
}
