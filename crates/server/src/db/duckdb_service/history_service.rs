use async_trait::async_trait;
use duckdb::{params, Result as DuckDbResult, Row};
use tracing::debug;

use super::{DuckDbPool, Error};
use crate::coordinator::history::{HistoryError, HistoryRecord, HistorySink};
use crate::db::entities::execution_history;

fn row_to_history(row: &Row) -> DuckDbResult<execution_history::Model> {
    Ok(execution_history::Model {
        id: row.get("id")?,
        exec_id: row.get("exec_id")?,
        host_id: row.get("host_id")?,
        host_name: row.get("host_name")?,
        label: row.get("label")?,
        status: row.get("status")?,
        ok_count: row.get("ok_count")?,
        changed_count: row.get("changed_count")?,
        failed_count: row.get("failed_count")?,
        skipped_count: row.get("skipped_count")?,
        error: row.get("error")?,
        output: row.get("output")?,
        started_at: row.get("started_at")?,
        finished_at: row.get("finished_at")?,
    })
}

pub async fn insert_history(pool: DuckDbPool, record: HistoryRecord) -> Result<i64, Error> {
    tokio::task::spawn_blocking(move || -> Result<i64, Error> {
        let conn = pool.get()?;
        let id: i64 = conn.query_row(
            "INSERT INTO execution_history (exec_id, host_id, host_name, label, status, ok_count, changed_count, failed_count, skipped_count, error, output, started_at, finished_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
            params![
                record.exec_id,
                record.host_id,
                record.host_name,
                record.label,
                record.status,
                record.stats.ok as i64,
                record.stats.changed as i64,
                record.stats.failed as i64,
                record.stats.skipped as i64,
                record.error,
                record.output,
                record.started_at,
                record.finished_at,
            ],
            |row| row.get(0),
        )?;
        Ok(id)
    })
    .await?
}

pub async fn get_history_for_execution(
    pool: DuckDbPool,
    exec_id: String,
) -> Result<Vec<execution_history::Model>, Error> {
    tokio::task::spawn_blocking(move || -> Result<Vec<execution_history::Model>, Error> {
        let conn = pool.get()?;
        let mut stmt =
            conn.prepare("SELECT * FROM execution_history WHERE exec_id = ? ORDER BY id")?;
        let rows = stmt
            .query_map(params![exec_id], row_to_history)?
            .collect::<DuckDbResult<Vec<_>>>()?;
        Ok(rows)
    })
    .await?
}

pub async fn get_recent_history_for_host(
    pool: DuckDbPool,
    host_id: String,
    limit: u32,
) -> Result<Vec<execution_history::Model>, Error> {
    tokio::task::spawn_blocking(move || -> Result<Vec<execution_history::Model>, Error> {
        let conn = pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM execution_history WHERE host_id = ? ORDER BY finished_at DESC, id DESC LIMIT ?",
        )?;
        let rows = stmt
            .query_map(params![host_id, limit as i64], row_to_history)?
            .collect::<DuckDbResult<Vec<_>>>()?;
        Ok(rows)
    })
    .await?
}

/// History sink backed by the `execution_history` table.
#[derive(Clone)]
pub struct DuckDbHistorySink {
    pool: DuckDbPool,
}

impl DuckDbHistorySink {
    pub fn new(pool: DuckDbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl HistorySink for DuckDbHistorySink {
    async fn record(&self, record: HistoryRecord) -> Result<(), HistoryError> {
        let exec_id = record.exec_id.clone();
        let id = insert_history(self.pool.clone(), record)
            .await
            .map_err(|e| HistoryError(e.to_string()))?;
        debug!(exec_id = %exec_id, history_id = id, "History record written.");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::duckdb_service::DuckDBService;
    use crate::tasks::RunStats;
    use chrono::Utc;

    fn record(exec_id: &str, host_id: &str) -> HistoryRecord {
        HistoryRecord {
            exec_id: exec_id.to_string(),
            host_id: host_id.to_string(),
            host_name: host_id.to_uppercase(),
            label: "deploy".to_string(),
            status: "success".to_string(),
            stats: RunStats {
                ok: 2,
                changed: 1,
                failed: 0,
                skipped: 1,
            },
            error: None,
            output: "line one\nline two".to_string(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn sink_writes_one_row_per_host() {
        let service = DuckDBService::in_memory().unwrap();
        let sink = DuckDbHistorySink::new(service.pool());
        sink.record(record("e1", "h1")).await.unwrap();
        sink.record(record("e1", "h2")).await.unwrap();
        sink.record(record("e2", "h1")).await.unwrap();

        let rows = get_history_for_execution(service.pool(), "e1".into()).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].ok_count, 2);
        assert_eq!(rows[0].skipped_count, 1);
        assert_eq!(rows[0].output, "line one\nline two");

        let recent = get_recent_history_for_host(service.pool(), "h1".into(), 10).await.unwrap();
        assert_eq!(recent.len(), 2);
    }
}
