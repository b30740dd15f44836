//! Run history repository for the `job_runs` table.

use rusqlite::{params, Row};

use super::{Database, DatabaseError};

/// A finished job run as stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRow {
    pub job_id: String,
    pub kind: String,
    pub status: String,
    pub processed_count: u32,
    pub total_count: u32,
    pub success_count: u32,
    pub failure_count: u32,
    pub error: Option<String>,
    pub started_at: Option<String>,
    pub finished_at: String,
}

impl RunRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            job_id: row.get("job_id")?,
            kind: row.get("kind")?,
            status: row.get("status")?,
            processed_count: row.get("processed_count")?,
            total_count: row.get("total_count")?,
            success_count: row.get("success_count")?,
            failure_count: row.get("failure_count")?,
            error: row.get("error")?,
            started_at: row.get("started_at")?,
            finished_at: row.get("finished_at")?,
        })
    }
}

/// Records a run. Recording the same job id twice replaces the earlier row.
pub fn insert(db: &Database, run: &RunRow) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT OR REPLACE INTO job_runs (job_id, kind, status, processed_count, total_count,
             success_count, failure_count, error, started_at, finished_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                run.job_id,
                run.kind,
                run.status,
                run.processed_count,
                run.total_count,
                run.success_count,
                run.failure_count,
                run.error,
                run.started_at,
                run.finished_at,
            ],
        )?;
        Ok(())
    })
}

/// Most recent runs first, optionally restricted to one kind.
pub fn recent(db: &Database, kind: Option<&str>, limit: u32) -> Result<Vec<RunRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM job_runs WHERE (?1 IS NULL OR kind = ?1)
             ORDER BY finished_at DESC, rowid DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![kind, limit], RunRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Counts recorded runs of `kind` that ended with `status`.
pub fn count_by_status(db: &Database, kind: &str, status: &str) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        let count: u64 = conn.query_row(
            "SELECT COUNT(*) FROM job_runs WHERE kind = ?1 AND status = ?2",
            params![kind, status],
            |r| r.get(0),
        )?;
        Ok(count)
    })
}
