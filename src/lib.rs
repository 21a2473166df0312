//! # ruleguard - incremental repository rule validation
//!
//! Validates a repository against a catalog of rules before a commit or in
//! CI. Rules declare dependencies and the files they read; ruleguard plans
//! them into dependency batches, runs each batch on a work-stealing pool,
//! and serves unchanged results from a file-hash validated cache.
//!
//! ## Quick Start
//!
//! ```bash
//! # Validate everything
//! ruleguard run
//!
//! # Only rules affected by staged changes (pre-commit)
//! ruleguard run --staged
//!
//! # Rules affected since main, as JSON (CI)
//! ruleguard run --base main --format json
//! ```
//!
//! ## Library use
//!
//! Build a [`rules::RuleRegistry`], a [`snapshot::FilesystemSnapshot`] and the
//! two stores, then hand them to [`orchestrator::Orchestrator::run`].

pub mod cache;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod git;
pub mod incremental;
pub mod orchestrator;
pub mod parallel;
pub mod plan;
pub mod profile;
pub mod rules;
pub mod shared;
pub mod snapshot;

pub use cli::{Cli, Output};
pub use config::RuleguardConfig;
pub use error::EngineError;

/// Result type alias for ruleguard operations
pub type Result<T> = anyhow::Result<T>;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
