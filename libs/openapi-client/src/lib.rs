//! Template origin models

pub mod models;
