use super::{json_from_sql, opt_ts_from_sql, ts_from_sql, ts_to_sql, SimStore};
use crate::{
    error::{SimError, SimResult},
    simulation::{SimulationRecord, SimulationStatus},
    types::OwnerRef,
};
use chrono::{DateTime, Utc};
use rusqlite::{params, types::Type, OptionalExtension};

/// Inside `in_transaction` the first attempt always lands. Outside one,
/// every lost attempt means another writer's update landed first.
const CAS_MAX_ATTEMPTS: u32 = 8;

const SIMULATION_COLUMNS: &str = "simulation_id, owner_key, parent_id, input_json, output_json,
    status, correlation_id, progress_json, error_json, created_at, updated_at,
    processing_started_at, processing_completed_at, duration_seconds, version";

// Helper function for mapping simulation rows
fn simulation_row_mapper(row: &rusqlite::Row<'_>) -> rusqlite::Result<SimulationRecord> {
    let owner_key: String = row.get(1)?;
    let owner = OwnerRef::from_key(&owner_key).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            1,
            Type::Text,
            format!("unknown owner key '{owner_key}'").into(),
        )
    })?;
    let status: String = row.get(5)?;
    let status = status
        .parse::<SimulationStatus>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e)))?;

    Ok(SimulationRecord {
        id: row.get(0)?,
        owner,
        parent_id: row.get(2)?,
        input: json_from_sql(3, row.get(3)?)?,
        output: row
            .get::<_, Option<String>>(4)?
            .map(|raw| json_from_sql(4, raw))
            .transpose()?,
        status,
        correlation_id: row.get(6)?,
        progress: json_from_sql(7, row.get(7)?)?,
        error: row
            .get::<_, Option<String>>(8)?
            .map(|raw| json_from_sql(8, raw))
            .transpose()?,
        created_at: ts_from_sql(9, row.get(9)?)?,
        updated_at: ts_from_sql(10, row.get(10)?)?,
        processing_started_at: opt_ts_from_sql(11, row.get(11)?)?,
        processing_completed_at: opt_ts_from_sql(12, row.get(12)?)?,
        duration_seconds: row.get(13)?,
        version: row.get(14)?,
    })
}

fn opt_json(value: Option<&impl serde::Serialize>) -> SimResult<Option<String>> {
    value
        .map(serde_json::to_string)
        .transpose()
        .map_err(SimError::from)
}

impl SimStore {
    // ── Simulation ─────────────────────────────────────────────────

    pub fn insert_simulation(&self, r: &SimulationRecord) -> SimResult<()> {
        self.conn.execute(
            "INSERT INTO simulation (
                simulation_id, owner_key, parent_id, input_json, output_json,
                status, correlation_id, progress_json, error_json, created_at, updated_at,
                processing_started_at, processing_completed_at, duration_seconds, version
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                &r.id,
                r.owner.key(),
                r.parent_id.as_deref(),
                serde_json::to_string(&r.input)?,
                opt_json(r.output.as_ref())?,
                r.status.as_str(),
                r.correlation_id.as_deref(),
                serde_json::to_string(&r.progress)?,
                opt_json(r.error.as_ref())?,
                ts_to_sql(&r.created_at),
                ts_to_sql(&r.updated_at),
                r.processing_started_at.as_ref().map(ts_to_sql),
                r.processing_completed_at.as_ref().map(ts_to_sql),
                r.duration_seconds,
                r.version,
            ],
        )?;
        Ok(())
    }

    pub fn get_simulation(&self, simulation_id: &str) -> SimResult<Option<SimulationRecord>> {
        self.conn
            .query_row(
                &format!("SELECT {SIMULATION_COLUMNS} FROM simulation WHERE simulation_id = ?1"),
                params![simulation_id],
                simulation_row_mapper,
            )
            .optional()
            .map_err(Into::into)
    }

    pub fn find_by_correlation(&self, correlation_id: &str) -> SimResult<Option<SimulationRecord>> {
        self.conn
            .query_row(
                &format!("SELECT {SIMULATION_COLUMNS} FROM simulation WHERE correlation_id = ?1"),
                params![correlation_id],
                simulation_row_mapper,
            )
            .optional()
            .map_err(Into::into)
    }

    /// Compare-and-swap write of every mutable column.
    ///
    /// Succeeds only if the stored version still equals `r.version`; on
    /// success the record's version is bumped to match the row. Returns
    /// false when another writer got there first.
    pub fn update_simulation_cas(&self, r: &mut SimulationRecord) -> SimResult<bool> {
        let changed = self.conn.execute(
            "UPDATE simulation SET
                output_json = ?1, status = ?2, correlation_id = ?3, progress_json = ?4,
                error_json = ?5, updated_at = ?6, processing_started_at = ?7,
                processing_completed_at = ?8, duration_seconds = ?9, version = version + 1
             WHERE simulation_id = ?10 AND version = ?11",
            params![
                opt_json(r.output.as_ref())?,
                r.status.as_str(),
                r.correlation_id.as_deref(),
                serde_json::to_string(&r.progress)?,
                opt_json(r.error.as_ref())?,
                ts_to_sql(&r.updated_at),
                r.processing_started_at.as_ref().map(ts_to_sql),
                r.processing_completed_at.as_ref().map(ts_to_sql),
                r.duration_seconds,
                &r.id,
                r.version,
            ],
        )?;
        if changed == 1 {
            r.version += 1;
        }
        Ok(changed == 1)
    }

    /// Load, mutate and compare-and-swap until the write lands.
    ///
    /// `apply` runs against the freshest row on every attempt; an `Err`
    /// from it aborts without writing. Only the caller whose write lands
    /// gets `Ok`, so follow-up side effects run exactly once.
    pub fn modify_simulation<T>(
        &self,
        simulation_id: &str,
        mut apply: impl FnMut(&mut SimulationRecord) -> SimResult<T>,
    ) -> SimResult<(SimulationRecord, T)> {
        for attempt in 1..=CAS_MAX_ATTEMPTS {
            let mut record = self
                .get_simulation(simulation_id)?
                .ok_or_else(|| SimError::NotFound { id: simulation_id.to_string() })?;
            let value = apply(&mut record)?;
            if self.update_simulation_cas(&mut record)? {
                return Ok((record, value));
            }
            log::debug!("simulation {simulation_id}: version conflict on attempt {attempt}");
        }
        Err(SimError::Other(anyhow::anyhow!(
            "simulation {simulation_id}: gave up after {CAS_MAX_ATTEMPTS} conflicting writes"
        )))
    }

    pub fn simulations_for_owner(&self, owner: &OwnerRef) -> SimResult<Vec<SimulationRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {SIMULATION_COLUMNS} FROM simulation WHERE owner_key = ?1
             ORDER BY created_at DESC"
        ))?;
        let rows = stmt.query_map(params![owner.key()], simulation_row_mapper)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Records still processing that started strictly before `cutoff`.
    pub fn stale_processing(&self, cutoff: DateTime<Utc>) -> SimResult<Vec<SimulationRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {SIMULATION_COLUMNS} FROM simulation
             WHERE status = 'processing' AND processing_started_at < ?1
             ORDER BY processing_started_at ASC"
        ))?;
        let rows = stmt.query_map(params![ts_to_sql(&cutoff)], simulation_row_mapper)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn simulation_count(&self, status: SimulationStatus) -> SimResult<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM simulation WHERE status = ?1",
                params![status.as_str()],
                |row| row.get(0),
            )
            .map_err(Into::into)
    }
}
