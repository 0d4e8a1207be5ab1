//! Background workers

pub mod event_watcher;
pub mod reaper;
