pub mod metrics;

pub use metrics::HostMetrics;
