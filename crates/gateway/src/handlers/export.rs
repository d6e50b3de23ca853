//! Export download handlers

use axum::{
    body::Body,
    extract::{Query, State},
    http::header,
    response::{IntoResponse, Response},
};
use futures::StreamExt;
use tokio_util::io::ReaderStream;
use tracing::info;

use crate::AppState;
use bminty_common::{
    errors::Result,
    export::{ExportArtifact, ExportRequest},
};

/// Filtered export; query pairs carry the filter vocabulary plus `export_format`, `table`, `ro_crate`
pub async fn export(
    State(state): State<AppState>,
    Query(pairs): Query<Vec<(String, String)>>,
) -> Result<Response> {
    let request = ExportRequest::from_pairs(&pairs)?;
    let artifact = state.exports.export(&request).await?;
    download(artifact).await
}

/// Full snapshot of the store, ignoring every filter
pub async fn export_full(State(state): State<AppState>) -> Result<Response> {
    let artifact = state.exports.export(&ExportRequest::full()).await?;
    download(artifact).await
}

/// Stream an artifact as an attachment. The artifact rides along with the
/// body so its temporary directory outlives the transfer.
async fn download(artifact: ExportArtifact) -> Result<Response> {
    let size = artifact.size()?;
    let file = tokio::fs::File::open(&artifact.path).await?;
    info!(file = %artifact.file_name, bytes = size, "Streaming export");

    let headers = [
        (header::CONTENT_TYPE, artifact.content_type.to_string()),
        (
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", artifact.file_name),
        ),
        (header::CONTENT_LENGTH, size.to_string()),
    ];

    let stream = ReaderStream::new(file).map(move |chunk| {
        let _artifact = &artifact;
        chunk
    });

    Ok((headers, Body::from_stream(stream)).into_response())
}
