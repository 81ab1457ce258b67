use duckdb::{params, Result as DuckDbResult, Row};

use super::{DuckDbPool, Error};
use crate::db::entities::scheduled_job;

fn row_to_job(row: &Row) -> DuckDbResult<scheduled_job::Model> {
    Ok(scheduled_job::Model {
        id: row.get("id")?,
        name: row.get("name")?,
        cron: row.get("cron")?,
        script_path: row.get("script_path")?,
        args: row.get("args")?,
        host_ids: row.get("host_ids")?,
        enabled: row.get("enabled")?,
        timeout_mins: row.get("timeout_mins")?,
        retries: row.get("retries")?,
        retry_delay_mins: row.get("retry_delay_mins")?,
        notify_on_fail: row.get("notify_on_fail")?,
        notify_on_success: row.get("notify_on_success")?,
        last_run: row.get("last_run")?,
        last_status: row.get("last_status")?,
        last_error: row.get("last_error")?,
        next_run: row.get("next_run")?,
        run_count: row.get("run_count")?,
        success_count: row.get("success_count")?,
        fail_count: row.get("fail_count")?,
    })
}

pub async fn get_all_jobs(pool: DuckDbPool) -> Result<Vec<scheduled_job::Model>, Error> {
    tokio::task::spawn_blocking(move || -> Result<Vec<scheduled_job::Model>, Error> {
        let conn = pool.get()?;
        let mut stmt = conn.prepare("SELECT * FROM scheduled_jobs ORDER BY name, id")?;
        let jobs = stmt
            .query_map([], row_to_job)?
            .collect::<DuckDbResult<Vec<_>>>()?;
        Ok(jobs)
    })
    .await?
}

pub async fn upsert_job(pool: DuckDbPool, model: scheduled_job::Model) -> Result<(), Error> {
    tokio::task::spawn_blocking(move || -> Result<(), Error> {
        let conn = pool.get()?;
        conn.execute(
            "INSERT OR REPLACE INTO scheduled_jobs (id, name, cron, script_path, args, host_ids, enabled, timeout_mins, retries, retry_delay_mins, notify_on_fail, notify_on_success, last_run, last_status, last_error, next_run, run_count, success_count, fail_count)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                model.id,
                model.name,
                model.cron,
                model.script_path,
                model.args,
                model.host_ids,
                model.enabled,
                model.timeout_mins,
                model.retries,
                model.retry_delay_mins,
                model.notify_on_fail,
                model.notify_on_success,
                model.last_run,
                model.last_status,
                model.last_error,
                model.next_run,
                model.run_count,
                model.success_count,
                model.fail_count,
            ],
        )?;
        Ok(())
    })
    .await?
}

pub async fn delete_job(pool: DuckDbPool, id: String) -> Result<(), Error> {
    tokio::task::spawn_blocking(move || -> Result<(), Error> {
        let conn = pool.get()?;
        let affected = conn.execute("DELETE FROM scheduled_jobs WHERE id = ?", params![id])?;
        if affected == 0 {
            return Err(Error::NotFound(format!("job {id}")));
        }
        Ok(())
    })
    .await?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::duckdb_service::DuckDBService;

    fn model(id: &str) -> scheduled_job::Model {
        scheduled_job::Model {
            id: id.to_string(),
            name: "nightly".to_string(),
            cron: "0 0 3 * * *".to_string(),
            script_path: "backup.sh".to_string(),
            args: r#"["--full"]"#.to_string(),
            host_ids: r#"["h1","h2"]"#.to_string(),
            enabled: true,
            timeout_mins: 0,
            retries: 2,
            retry_delay_mins: 1,
            notify_on_fail: true,
            notify_on_success: false,
            last_run: None,
            last_status: None,
            last_error: None,
            next_run: None,
            run_count: 0,
            success_count: 0,
            fail_count: 0,
        }
    }

    #[tokio::test]
    async fn jobs_round_trip_through_table() {
        let service = DuckDBService::in_memory().unwrap();
        let pool = service.pool();
        upsert_job(pool.clone(), model("j1")).await.unwrap();

        let mut updated = model("j1");
        updated.run_count = 4;
        updated.last_status = Some("failed".to_string());
        upsert_job(pool.clone(), updated).await.unwrap();

        let jobs = get_all_jobs(pool.clone()).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].run_count, 4);
        assert_eq!(jobs[0].last_status.as_deref(), Some("failed"));
        assert_eq!(jobs[0].host_ids, r#"["h1","h2"]"#);

        delete_job(pool.clone(), "j1".into()).await.unwrap();
        assert!(get_all_jobs(pool).await.unwrap().is_empty());
    }
}
