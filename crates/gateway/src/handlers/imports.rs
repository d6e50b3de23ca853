//! Bulk import handlers

use axum::{
    extract::{Multipart, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::upload::{self, StagedFile};
use crate::AppState;
use bminty_common::{
    errors::{AppError, Result},
    jobs::{JobHandle, JobPhase, JobStatus, JobStatusDocument, ProgressSink},
};
use bminty_ingestion::{ImportOptions, ImportRequest};

/// Response after accepting an import
#[derive(Serialize)]
pub struct SubmitResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub status_url: String,
}

/// Why an import submission was refused
pub enum SubmitError {
    Rejected(AppError),
    /// The upload broke off; its failed job stays pollable
    Upload { job_id: Uuid, error: AppError },
}

impl From<AppError> for SubmitError {
    fn from(err: AppError) -> Self {
        SubmitError::Rejected(err)
    }
}

impl IntoResponse for SubmitError {
    fn into_response(self) -> Response {
        match self {
            SubmitError::Rejected(err) => err.into_response(),
            SubmitError::Upload { job_id, error } => error.into_response_with(serde_json::json!({
                "job_id": job_id,
                "status_url": status_url(job_id),
            })),
        }
    }
}

fn status_url(job_id: Uuid) -> String {
    format!("/v1/imports/{}", job_id)
}

/// Form fields of an import upload
#[derive(Default)]
struct ImportForm {
    interval_file: Option<StagedFile>,
    cell_file: Option<StagedFile>,
    signal_file: Option<StagedFile>,
    assembly_id: Option<i64>,
    assay_id: Option<i64>,
    options: ImportOptions,
}

impl ImportForm {
    async fn read(multipart: &mut Multipart, dir: &std::path::Path, limit: u64) -> Result<Self> {
        let mut form = ImportForm::default();

        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|e| upload::transport_error(e, limit))?
        {
            let name = field.name().unwrap_or_default().to_string();
            match name.as_str() {
                "interval_file" => form.interval_file = upload::stage_field(field, dir, "intervals.csv", limit).await?,
                "cell_file" => form.cell_file = upload::stage_field(field, dir, "cells.csv", limit).await?,
                "signal_file" => form.signal_file = upload::stage_field(field, dir, "signals.csv", limit).await?,
                "assembly_id" => form.assembly_id = Some(upload::id(&name, &upload::text_field(field, limit).await?)?),
                "assay_id" => form.assay_id = Some(upload::id(&name, &upload::text_field(field, limit).await?)?),
                "omit_zero_signals" => {
                    form.options.omit_zero_signals = upload::flag(&name, &upload::text_field(field, limit).await?)?
                }
                "ignore_optional_type_errors" => {
                    form.options.ignore_optional_type_errors =
                        upload::flag(&name, &upload::text_field(field, limit).await?)?
                }
                "ignore_row_errors" => {
                    form.options.ignore_row_errors = upload::flag(&name, &upload::text_field(field, limit).await?)?
                }
                "deduplicate_intervals" => {
                    form.options.deduplicate_intervals =
                        upload::flag(&name, &upload::text_field(field, limit).await?)?
                }
                other => warn!(field = other, "Ignoring unknown upload field"),
            }
        }

        Ok(form)
    }

    /// Turn a complete form into a request; missing pieces are structural errors
    fn into_request(self) -> Result<ImportRequest> {
        let missing = |field: &str| AppError::MissingField { field: field.to_string() };
        Ok(ImportRequest {
            assembly_id: self.assembly_id.ok_or_else(|| missing("assembly_id"))?,
            assay_id: self.assay_id.ok_or_else(|| missing("assay_id"))?,
            interval_file: self.interval_file.ok_or_else(|| missing("interval_file"))?.path,
            cell_file: self.cell_file.map(|f| f.path),
            signal_file: self.signal_file.ok_or_else(|| missing("signal_file"))?.path,
            options: self.options,
        })
    }
}

/// Accept a multipart import and run it in the background
pub async fn submit_import(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> std::result::Result<(StatusCode, Json<SubmitResponse>), SubmitError> {
    let limit = state.config.server.max_upload_bytes;
    let upload_dir = state.config.upload_dir();
    tokio::fs::create_dir_all(&upload_dir).await.map_err(AppError::from)?;
    let staging = tempfile::Builder::new()
        .prefix("bminty-import-")
        .tempdir_in(&upload_dir)
        .map_err(AppError::from)?;

    let job_id = state.jobs.create().await;
    let job = JobHandle::new(state.jobs.clone(), job_id);
    job.phase(JobPhase::Upload, "Receiving files".into()).await;

    let form = match ImportForm::read(&mut multipart, staging.path(), limit).await {
        Ok(form) => form,
        Err(e @ (AppError::PayloadTooLarge { .. } | AppError::InvalidFormat { .. })) => {
            // Transport failures stay visible as a failed upload
            warn!(%job_id, error = %e, "Upload failed");
            if let Err(store_err) = job.fail(e.to_string()).await {
                warn!(%job_id, error = %store_err, "Failed to record upload failure");
            }
            return Err(SubmitError::Upload { job_id, error: e });
        }
        Err(e) => {
            state.jobs.remove(job_id).await;
            return Err(e.into());
        }
    };

    let request = match form.into_request() {
        Ok(request) => request,
        Err(e) => {
            state.jobs.remove(job_id).await;
            return Err(e.into());
        }
    };

    // Unknown targets are rejected before any work is queued
    let repo = state.importer.repository();
    if repo.find_assembly(request.assembly_id).await?.is_none() {
        state.jobs.remove(job_id).await;
        return Err(AppError::not_found("assembly", request.assembly_id).into());
    }
    if repo.find_assay(request.assay_id).await?.is_none() {
        state.jobs.remove(job_id).await;
        return Err(AppError::not_found("assay", request.assay_id).into());
    }

    let status = state.jobs.get(job_id).await?.status;
    info!(%job_id, assembly_id = request.assembly_id, assay_id = request.assay_id, "Import accepted");

    let importer = state.importer.clone();
    tokio::spawn(async move {
        // The staging directory lives until the import finishes
        let _staging = staging;
        if let Err(e) = importer.run_tracked(&request, &job).await {
            error!(job_id = %job.job_id(), error = %e, "Import job failed");
        }
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            job_id,
            status,
            status_url: status_url(job_id),
        }),
    ))
}

/// Get import job status
pub async fn get_import(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobStatusDocument>> {
    Ok(Json(state.jobs.get(job_id).await?))
}
