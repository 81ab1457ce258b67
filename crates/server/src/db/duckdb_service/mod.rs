pub mod history_service;
pub mod host_service;
pub mod job_service;

use duckdb::Connection;
use std::path::Path;
use thiserror::Error;
use tokio::task::JoinError;
use tracing::{error, info};

#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    DuckDB(#[from] duckdb::Error),
    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("Blocking task failed: {0}")]
    Join(#[from] JoinError),
    #[error("Not Found: {0}")]
    NotFound(String),
}

pub type DuckDbPool = r2d2::Pool<duckdb::DuckdbConnectionManager>;

/// Owns the connection pool and makes sure the schema exists before any
/// service function touches it.
#[derive(Clone)]
pub struct DuckDBService {
    pool: DuckDbPool,
}

impl DuckDBService {
    pub fn new(pool: DuckDbPool) -> Result<Self, Error> {
        info!("Initializing DuckDB service with connection pool.");
        let conn = pool.get()?;
        Self::initialize_db(&conn)?;
        Ok(Self { pool })
    }

    /// Opens (or creates) the database file at `path`.
    pub fn open(path: &Path) -> Result<Self, Error> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if let Err(e) = std::fs::create_dir_all(parent) {
                error!(path = %parent.display(), error = %e, "Failed to create database directory.");
            }
        }
        let manager = duckdb::DuckdbConnectionManager::file(path)?;
        let pool = r2d2::Pool::new(manager)?;
        Self::new(pool)
    }

    /// In-memory database; every pooled connection shares it.
    pub fn in_memory() -> Result<Self, Error> {
        let manager = duckdb::DuckdbConnectionManager::memory()?;
        let pool = r2d2::Pool::builder().max_size(4).build(manager)?;
        Self::new(pool)
    }

    pub fn pool(&self) -> DuckDbPool {
        self.pool.clone()
    }

    fn initialize_db(conn: &Connection) -> duckdb::Result<()> {
        info!("Running DuckDB migrations...");
        let migrations = include_str!("../../../migrations/001_create_tables.sql");
        conn.execute_batch(migrations).map_err(|e| {
            error!("Failed to execute DuckDB migrations: {}", e);
            e
        })?;
        info!("DuckDB migrations completed successfully.");
        Ok(())
    }
}
