//! Job Registry & Log Bus
//!
//! Tracks long-running operations (deployments, project removals) as jobs with
//! an ordered in-memory log and a bounded live tail for streaming observers.

pub mod job;
pub mod registry;

pub use job::{Job, JobSnapshot, JobStatus, JobSubscription, LogEntry, LogKind, SequencedEntry};
pub use registry::JobRegistry;
