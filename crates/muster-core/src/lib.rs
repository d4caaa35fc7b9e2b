//! Muster Core: specialist orchestration and workflow runs.
//!
//! This crate holds the planner/router, the heap executor that walks a plan
//! across specialists, the per-specialist tool-calling loop, the workflow
//! run state machine and the reminder scheduler, together with the SQLite
//! stores they persist to. It has no transport dependency and is driven by
//! the `muster` CLI.

pub mod config;
pub mod db;
pub mod error;
pub mod llm;
pub mod models;
pub mod orchestration;
pub mod scheduler;
pub mod state;
pub mod store;
pub mod tools;
pub mod trace;
pub mod workflow;

// Convenience re-exports
pub use config::MusterConfig;
pub use db::Database;
pub use error::ServerError;
pub use state::{AppState, AppStateInner};
