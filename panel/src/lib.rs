//! dockpanel library
//!
//! Core of a single-host container panel: deployment jobs with streamed logs,
//! ephemeral volume browsing sessions, port allocation and the runtime event log.

pub mod app;
pub mod deploy;
pub mod errors;
pub mod events;
pub mod filesys;
pub mod jobs;
pub mod logs;
pub mod ports;
pub mod runtime;
pub mod server;
pub mod sessions;
pub mod storage;
pub mod utils;
pub mod workers;
