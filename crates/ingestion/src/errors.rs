//! Ingestion error types

use bminty_common::errors::AppError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IngestionError {
    /// Missing file or mandatory column; nothing of the file is imported
    #[error("{file}: {message}")]
    Structural { file: String, message: String },

    /// A row failed validation and row errors are not ignored
    #[error("{table} row {row}: {message}")]
    Row {
        table: &'static str,
        row: u64,
        message: String,
    },

    /// A row references an interval or cell that does not exist in scope
    #[error("{table} row {row}: {message}")]
    Referential {
        table: &'static str,
        row: u64,
        message: String,
    },

    #[error("Referenced {resource} {id} does not exist")]
    NotFound { resource: &'static str, id: i64 },

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    App(#[from] AppError),
}

impl IngestionError {
    pub fn structural(file: impl Into<String>, message: impl Into<String>) -> Self {
        IngestionError::Structural {
            file: file.into(),
            message: message.into(),
        }
    }

    /// Row-level failures, which `ignore_row_errors` may downgrade to skips
    pub fn is_row_level(&self) -> bool {
        matches!(self, IngestionError::Row { .. } | IngestionError::Referential { .. })
    }
}

impl From<IngestionError> for AppError {
    fn from(e: IngestionError) -> Self {
        match e {
            IngestionError::App(inner) => inner,
            IngestionError::Database(inner) => AppError::Database(inner),
            IngestionError::Csv(inner) => AppError::Csv(inner),
            IngestionError::Io(inner) => AppError::from(inner),
            IngestionError::NotFound { resource, id } => AppError::not_found(resource, id),
            IngestionError::Structural { file, message } => AppError::Validation {
                message: format!("{}: {}", file, message),
                field: Some(file),
            },
            IngestionError::Transaction(message) => AppError::Transaction { message },
            other => AppError::ImportFailed {
                message: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_errors_map_to_import_failed() {
        let err = IngestionError::Row {
            table: "signal",
            row: 12,
            message: "signal is not a number".into(),
        };
        assert!(err.is_row_level());
        assert_eq!(err.to_string(), "signal row 12: signal is not a number");

        let app: AppError = err.into();
        assert!(matches!(app, AppError::ImportFailed { .. }));
    }

    #[test]
    fn test_structural_maps_to_validation() {
        let app: AppError = IngestionError::structural("interval_file", "missing column 'start'").into();
        assert!(app.is_client_error());
    }

    #[test]
    fn test_not_found_round_trips_through_app_error() {
        let app: AppError = IngestionError::NotFound { resource: "assay", id: 9 }.into();
        assert!(matches!(app, AppError::NotFound { .. }));
    }
}
