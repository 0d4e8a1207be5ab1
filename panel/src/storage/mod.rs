//! Persistent storage: on-disk layout, settings and the port ledger database

pub mod layout;
pub mod ledger;
pub mod settings;
