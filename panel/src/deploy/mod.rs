//! Deployment Job Pipeline
//!
//! Renders a template into a compose manifest, drives compose up as a tracked
//! job and cleans up after partial failure.

pub mod compose;
pub mod manifest;
pub mod params;
pub mod pipeline;
pub mod templates;

pub use pipeline::Deployer;
