use duckdb::{params, Result as DuckDbResult, Row};

use super::{DuckDbPool, Error};
use crate::db::entities::host;

fn row_to_host(row: &Row) -> DuckDbResult<host::Model> {
    Ok(host::Model {
        id: row.get("id")?,
        name: row.get("name")?,
        address: row.get("address")?,
        port: row.get("port")?,
        login: row.get("login")?,
        secret: row.get("secret")?,
        has_agent: row.get("has_agent")?,
        agent_port: row.get("agent_port")?,
        tags: row.get("tags")?,
        mac: row.get("mac")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

pub async fn get_all_hosts(pool: DuckDbPool) -> Result<Vec<host::Model>, Error> {
    tokio::task::spawn_blocking(move || -> Result<Vec<host::Model>, Error> {
        let conn = pool.get()?;
        let mut stmt = conn.prepare("SELECT * FROM hosts ORDER BY name, id")?;
        let hosts = stmt
            .query_map([], row_to_host)?
            .collect::<DuckDbResult<Vec<_>>>()?;
        Ok(hosts)
    })
    .await?
}

pub async fn get_host(pool: DuckDbPool, id: String) -> Result<Option<host::Model>, Error> {
    tokio::task::spawn_blocking(move || -> Result<Option<host::Model>, Error> {
        let conn = pool.get()?;
        let mut stmt = conn.prepare("SELECT * FROM hosts WHERE id = ?")?;
        let mut rows = stmt.query_map(params![id], row_to_host)?;
        Ok(rows.next().transpose()?)
    })
    .await?
}

pub async fn upsert_host(pool: DuckDbPool, model: host::Model) -> Result<(), Error> {
    tokio::task::spawn_blocking(move || -> Result<(), Error> {
        let conn = pool.get()?;
        conn.execute(
            "INSERT OR REPLACE INTO hosts (id, name, address, port, login, secret, has_agent, agent_port, tags, mac, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                model.id,
                model.name,
                model.address,
                model.port,
                model.login,
                model.secret,
                model.has_agent,
                model.agent_port,
                model.tags,
                model.mac,
                model.created_at,
                model.updated_at,
            ],
        )?;
        Ok(())
    })
    .await?
}

pub async fn delete_host(pool: DuckDbPool, id: String) -> Result<(), Error> {
    tokio::task::spawn_blocking(move || -> Result<(), Error> {
        let conn = pool.get()?;
        let affected = conn.execute("DELETE FROM hosts WHERE id = ?", params![id])?;
        if affected == 0 {
            return Err(Error::NotFound(format!("host {id}")));
        }
        Ok(())
    })
    .await?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::duckdb_service::DuckDBService;
    use chrono::{SubsecRound, Utc};

    fn model(id: &str) -> host::Model {
        let now = Utc::now().trunc_subsecs(3);
        host::Model {
            id: id.to_string(),
            name: format!("name-{id}"),
            address: "10.0.0.1".to_string(),
            port: 2222,
            login: "root".to_string(),
            secret: "c2VjcmV0".to_string(),
            has_agent: true,
            agent_port: Some(9000),
            tags: r#"["db","prod"]"#.to_string(),
            mac: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn upsert_then_read_back() {
        let service = DuckDBService::in_memory().unwrap();
        let pool = service.pool();
        upsert_host(pool.clone(), model("h1")).await.unwrap();

        let mut changed = model("h1");
        changed.address = "10.0.0.2".to_string();
        upsert_host(pool.clone(), changed).await.unwrap();

        let all = get_all_hosts(pool.clone()).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].address, "10.0.0.2");
        assert_eq!(all[0].port, 2222);
        assert_eq!(all[0].agent_port, Some(9000));

        assert!(get_host(pool.clone(), "h1".into()).await.unwrap().is_some());
        assert!(get_host(pool, "nope".into()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_missing_is_not_found() {
        let service = DuckDBService::in_memory().unwrap();
        let pool = service.pool();
        upsert_host(pool.clone(), model("h1")).await.unwrap();
        delete_host(pool.clone(), "h1".into()).await.unwrap();
        assert!(matches!(
            delete_host(pool, "h1".into()).await,
            Err(Error::NotFound(_))
        ));
    }
}
