//! Multipart upload staging
//!
//! Uploaded files are streamed to disk chunk by chunk so multi-gigabyte
//! imports and snapshots never sit in memory.

use axum::extract::multipart::{Field, MultipartError};
use axum::http::StatusCode;
use bminty_common::errors::{AppError, Result};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncWriteExt, BufWriter};

/// A file field written to the staging directory
#[derive(Debug, Clone)]
pub struct StagedFile {
    pub path: PathBuf,
    pub bytes: u64,
}

/// Map a failed multipart read to a client error
pub fn transport_error(e: MultipartError, limit: u64) -> AppError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        AppError::PayloadTooLarge { size: limit.saturating_add(1), limit }
    } else {
        AppError::InvalidFormat {
            message: format!("upload interrupted or malformed: {}", e.body_text()),
        }
    }
}

/// Stream `field` into `dir/<name>`.
///
/// Browsers send an empty part for an untouched file input; that yields `None`.
pub async fn stage_field(
    mut field: Field<'_>,
    dir: &Path,
    name: &str,
    limit: u64,
) -> Result<Option<StagedFile>> {
    let unnamed = field.file_name().map_or(true, str::is_empty);
    let path = dir.join(name);
    let mut file = BufWriter::new(tokio::fs::File::create(&path).await?);

    let mut bytes = 0u64;
    while let Some(chunk) = field.chunk().await.map_err(|e| transport_error(e, limit))? {
        bytes += chunk.len() as u64;
        file.write_all(&chunk).await?;
    }
    file.flush().await?;

    if bytes == 0 && unnamed {
        tokio::fs::remove_file(&path).await?;
        return Ok(None);
    }
    Ok(Some(StagedFile { path, bytes }))
}

/// Read a text field
pub async fn text_field(field: Field<'_>, limit: u64) -> Result<String> {
    field
        .text()
        .await
        .map(|t| t.trim().to_string())
        .map_err(|e| transport_error(e, limit))
}

/// Parse a boolean form field
pub fn flag(name: &str, raw: &str) -> Result<bool> {
    bminty_common::filter::parse_flag(raw).ok_or_else(|| AppError::Validation {
        message: format!("{} must be a boolean, got '{}'", name, raw),
        field: Some(name.to_string()),
    })
}

/// Parse an integer id form field
pub fn id(name: &str, raw: &str) -> Result<i64> {
    raw.parse().map_err(|_| AppError::Validation {
        message: format!("{} must be an integer id, got '{}'", name, raw),
        field: Some(name.to_string()),
    })
}
