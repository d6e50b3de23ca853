//! bMINTY Common Library
//!
//! Shared code for the bMINTY gateway and import tooling including:
//! - Database pool, schema and repository patterns
//! - Error types and handling
//! - Configuration management
//! - Job status store for background imports
//! - Filter predicates, export engine and snapshot restore
//! - Metrics and observability

pub mod config;
pub mod db;
pub mod errors;
pub mod export;
pub mod filter;
pub mod jobs;
pub mod metrics;
pub mod snapshot;

// Re-export commonly used types
pub use config::AppConfig;
pub use db::{DbPool, Repository, TableCounts};
pub use errors::{AppError, Result};
pub use export::{ExportArtifact, ExportEngine, ExportFormat, ExportRequest};
pub use filter::FilterPredicate;
pub use jobs::{JobHandle, JobStore, ProgressSink};
pub use snapshot::{RestoreReport, SnapshotService};

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
