//! Ephemeral Session Supervisor
//!
//! One disposable helper container per volume browsing session, reached
//! through a prefix-rewriting reverse proxy and reaped when idle or orphaned.

pub mod proxy;
pub mod supervisor;

pub use proxy::SessionProxy;
pub use supervisor::{session_prefix, ReapReport, Session, SessionSupervisor};
