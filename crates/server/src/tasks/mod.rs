//! Manifest model and the per-host task engine.

pub mod engine;
pub mod manifest;
pub(crate) mod ops;
pub mod outcome;
pub mod template;

pub use engine::{NullSink, OutputSink, TaskEngine, TaskEngineConfig};
pub use manifest::{Manifest, ManifestError, Task, TaskDuration, TaskKind, TaskOptions};
pub use outcome::{ManifestRun, RunStats, TaskOutcome, TaskStatus};
