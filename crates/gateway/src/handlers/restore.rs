//! Snapshot restore handler

use axum::{
    extract::{Multipart, State},
    Json,
};
use tracing::{info, warn};

use super::upload::{self, StagedFile};
use crate::AppState;
use bminty_common::{
    errors::{AppError, Result},
    snapshot::RestoreReport,
};

/// Replace the whole store with an uploaded snapshot.
///
/// Destructive: requires `confirm=true`. `create_backup` defaults to true.
pub async fn restore(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<RestoreReport>> {
    let limit = state.config.server.max_upload_bytes;
    let upload_dir = state.config.upload_dir();
    tokio::fs::create_dir_all(&upload_dir).await?;
    let staging = tempfile::Builder::new().prefix("bminty-restore-").tempdir_in(&upload_dir)?;

    let mut snapshot: Option<StagedFile> = None;
    let mut create_backup = true;
    let mut confirm = false;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| upload::transport_error(e, limit))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "snapshot" => snapshot = upload::stage_field(field, staging.path(), "snapshot.sqlite3", limit).await?,
            "create_backup" => create_backup = upload::flag(&name, &upload::text_field(field, limit).await?)?,
            "confirm" => confirm = upload::flag(&name, &upload::text_field(field, limit).await?)?,
            other => warn!(field = other, "Ignoring unknown upload field"),
        }
    }

    if !confirm {
        return Err(AppError::ConfirmationRequired {
            message: "restore deletes every row; resend with confirm=true".into(),
        });
    }
    let snapshot = snapshot.ok_or_else(|| AppError::MissingField {
        field: "snapshot".into(),
    })?;

    info!(bytes = snapshot.bytes, create_backup, "Restoring snapshot");
    let report = state.snapshots.restore(&snapshot.path, create_backup).await?;
    Ok(Json(report))
}
