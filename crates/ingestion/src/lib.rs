//! bMINTY Ingestion
//!
//! Bulk import of interval, cell and signal files into the catalog:
//! - Row parsing and validation with per-column strictness
//! - Interval deduplication per assembly
//! - All-or-nothing import pipeline with progress reporting
//! - Folder importer for dataset directories

pub mod dedup;
pub mod errors;
pub mod folder;
pub mod locks;
pub mod parser;
pub mod pipeline;

pub use errors::IngestionError;
pub use folder::{FolderImporter, FolderOutcome};
pub use locks::ImportLocks;
pub use pipeline::{AssayKind, BulkImporter, ImportOptions, ImportRequest};
