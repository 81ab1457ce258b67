pub mod execution_history;
pub mod host;
pub mod scheduled_job;
