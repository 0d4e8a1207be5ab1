//! Panel API models

pub mod models;
