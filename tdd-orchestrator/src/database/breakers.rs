//! Persistence for circuit breaker rows.

use anyhow::Result;
use rusqlite::{params, OptionalExtension, Row};
use tdd_orchestrator_sdk::BreakerLevel;

use super::{conversion_err, format_ts, parse_opt_ts, parse_ts, Database};
use crate::models::BreakerRecord;

impl Database {
    /// Upsert a breaker row keyed by (level, identifier)
    pub fn save_breaker(&self, record: &BreakerRecord) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO circuit_breakers (
                level, identifier, state, failure_count, success_count,
                consecutive_opens, last_state_change, cooldown_until
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(level, identifier) DO UPDATE SET
                state = excluded.state,
                failure_count = excluded.failure_count,
                success_count = excluded.success_count,
                consecutive_opens = excluded.consecutive_opens,
                last_state_change = excluded.last_state_change,
                cooldown_until = excluded.cooldown_until
            "#,
            params![
                record.level.as_str(),
                record.identifier,
                record.state.as_str(),
                record.failure_count,
                record.success_count,
                record.consecutive_opens,
                format_ts(record.last_state_change),
                record.cooldown_until.map(format_ts),
            ],
        )?;
        Ok(())
    }

    pub fn get_breaker(
        &self,
        level: BreakerLevel,
        identifier: &str,
    ) -> Result<Option<BreakerRecord>> {
        let conn = self.lock()?;
        let record = conn
            .query_row(
                r#"
                SELECT level, identifier, state, failure_count, success_count,
                       consecutive_opens, last_state_change, cooldown_until
                FROM circuit_breakers WHERE level = ?1 AND identifier = ?2
                "#,
                params![level.as_str(), identifier],
                map_breaker_row,
            )
            .optional()?;
        Ok(record)
    }

    /// All persisted breakers, ordered by level then identifier
    pub fn load_breakers(&self) -> Result<Vec<BreakerRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT level, identifier, state, failure_count, success_count,
                   consecutive_opens, last_state_change, cooldown_until
            FROM circuit_breakers ORDER BY level, identifier
            "#,
        )?;
        let records = stmt
            .query_map([], map_breaker_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }
}

fn map_breaker_row(row: &Row) -> rusqlite::Result<BreakerRecord> {
    let level: String = row.get(0)?;
    let state: String = row.get(2)?;
    let last_state_change: String = row.get(6)?;
    Ok(BreakerRecord {
        level: level.parse().map_err(|e| conversion_err(0, e))?,
        identifier: row.get(1)?,
        state: state.parse().map_err(|e| conversion_err(2, e))?,
        failure_count: row.get(3)?,
        success_count: row.get(4)?,
        consecutive_opens: row.get(5)?,
        last_state_change: parse_ts(&last_state_change)?,
        cooldown_until: parse_opt_ts(row.get(7)?)?,
    })
}
