pub mod duckdb_service;
pub mod entities;
