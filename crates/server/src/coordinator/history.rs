use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::tasks::RunStats;

pub const DEFAULT_OUTPUT_CAP: usize = 1024 * 1024;
const TRUNCATION_MARKER: &str = "\n... [output truncated]";

#[derive(Error, Debug)]
#[error("history sink failed: {0}")]
pub struct HistoryError(pub String);

/// One host's share of an execution, as persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryRecord {
    pub exec_id: String,
    pub host_id: String,
    pub host_name: String,
    pub label: String,
    pub status: String,
    pub stats: RunStats,
    pub error: Option<String>,
    pub output: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[async_trait]
pub trait HistorySink: Send + Sync {
    async fn record(&self, record: HistoryRecord) -> Result<(), HistoryError>;
}

/// Sink for deployments without persistence.
pub struct NullHistory;

#[async_trait]
impl HistorySink for NullHistory {
    async fn record(&self, _record: HistoryRecord) -> Result<(), HistoryError> {
        Ok(())
    }
}

/// Cuts `output` to at most `cap` bytes on a char boundary, marking the cut.
pub fn truncate_output(mut output: String, cap: usize) -> String {
    if output.len() <= cap {
        return output;
    }
    let mut end = cap.saturating_sub(TRUNCATION_MARKER.len());
    while !output.is_char_boundary(end) {
        end -= 1;
    }
    output.truncate(end);
    output.push_str(TRUNCATION_MARKER);
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_output_is_untouched() {
        assert_eq!(truncate_output("abc".into(), 10), "abc");
    }

    #[test]
    fn long_output_is_capped_with_marker() {
        let out = truncate_output("x".repeat(500), 100);
        assert!(out.len() <= 100);
        assert!(out.ends_with("[output truncated]"));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let out = truncate_output("é".repeat(100), 60);
        assert!(out.len() <= 60);
        assert!(out.starts_with('é'));
    }
}
