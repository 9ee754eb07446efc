//! map-core - Core library for the MAP orchestrator
//!
//! Shared by the orchestrator server and its tests:
//!
//! - **status**: Experiment, stage and ML-model status groups and transition rules
//! - **db**: SQLite persistence
//! - **client**: Remote facility API client
//! - **ml**: ML advisor job dispatch
//! - **tasks**: Background task, scheduler and retry policy types
//! - **auth**: Token-based authentication

pub mod auth;
pub mod client;
pub mod db;
pub mod error;
pub mod ml;
pub mod status;
pub mod tasks;
pub mod types;

// Re-export commonly used types
pub use db::Database;
pub use error::{Error, Result};
pub use status::{ExperimentStatus, MlModelStatus, StageStatus, StatusGroup};
