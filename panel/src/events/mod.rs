//! Event Log Store
//!
//! Append-only record of container lifecycle events, fed by the event watcher
//! worker and read back by the events endpoint.

pub mod store;

pub use store::{classify, EventStore};
