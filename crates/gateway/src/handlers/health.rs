//! Liveness and readiness probes

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use std::time::Instant;

use crate::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

#[derive(Serialize)]
pub struct ReadyResponse {
    pub status: &'static str,
    pub checks: ReadyChecks,
}

#[derive(Serialize)]
pub struct ReadyChecks {
    pub database: StoreCheck,
    pub jobs: JobsCheck,
}

/// Database reachability plus the file it serves
#[derive(Serialize)]
pub struct StoreCheck {
    pub status: &'static str,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Import jobs currently held in memory
#[derive(Serialize)]
pub struct JobsCheck {
    pub tracked: usize,
}

/// Liveness: the process answers
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: bminty_common::VERSION,
    })
}

/// Readiness: 503 while the catalog database is unreachable
pub async fn ready(State(state): State<AppState>) -> (StatusCode, Json<ReadyResponse>) {
    let started = Instant::now();
    let path = state.db.path().display().to_string();

    let database = match state.db.ping().await {
        Ok(()) => StoreCheck {
            status: "up",
            path,
            latency_ms: Some(started.elapsed().as_millis() as u64),
            error: None,
        },
        Err(e) => StoreCheck {
            status: "down",
            path,
            latency_ms: None,
            error: Some(e.to_string()),
        },
    };

    let up = database.status == "up";
    let body = ReadyResponse {
        status: if up { "ready" } else { "not_ready" },
        checks: ReadyChecks {
            database,
            jobs: JobsCheck {
                tracked: state.jobs.len().await,
            },
        },
    };

    let code = if up { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (code, Json(body))
}
