pub mod execution_routes;
pub mod health_routes;
pub mod host_routes;
pub mod job_routes;
pub mod log_routes;
