//! Health & readiness handlers.
//!
//! - GET /healthz  -> liveness, no I/O
//! - GET /readyz   -> database round-trip plus a write/read/delete in the blob directory

use crate::state::AppState;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::{collections::BTreeMap, path::Path};
use tokio::fs;
use uuid::Uuid;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: &'static str,
    checks: BTreeMap<&'static str, CheckStatus>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}

impl CheckStatus {
    fn from_result(res: Result<(), String>) -> Self {
        match res {
            Ok(()) => Self { ok: true, error: None },
            Err(error) => Self { ok: false, error: Some(error) },
        }
    }
}

/// `GET /healthz`
pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, Json(HealthResponse { status: "ok" }))
}

/// `GET /readyz`: 200 when every check passes, 503 otherwise.
pub async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let mut checks = BTreeMap::new();
    checks.insert("sqlite", CheckStatus::from_result(check_sqlite(&state).await));
    checks.insert(
        "disk",
        CheckStatus::from_result(check_disk(state.blobs.base_path()).await),
    );

    let ok = checks.values().all(|c| c.ok);
    let status = if ok { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (
        status,
        Json(ReadyResponse {
            status: if ok { "ok" } else { "error" },
            checks,
        }),
    )
}

async fn check_sqlite(state: &AppState) -> Result<(), String> {
    match sqlx::query_scalar::<_, i64>("SELECT 1").fetch_one(&state.db).await {
        Ok(1) => Ok(()),
        Ok(v) => Err(format!("unexpected result: {}", v)),
        Err(e) => Err(format!("error: {}", e)),
    }
}

async fn check_disk(base: &Path) -> Result<(), String> {
    fs::create_dir_all(base)
        .await
        .map_err(|e| format!("could not create blob dir: {}", e))?;
    let probe = base.join(format!(".readyz-{}", Uuid::new_v4()));

    let result = match fs::write(&probe, b"readyz").await {
        Err(e) => return Err(format!("could not write tmp file: {}", e)),
        Ok(()) => match fs::read(&probe).await {
            Ok(bytes) if bytes == b"readyz" => Ok(()),
            Ok(_) => Err("file content mismatch".to_string()),
            Err(e) => Err(format!("could not read tmp file: {}", e)),
        },
    };
    // best-effort cleanup
    let _ = fs::remove_file(&probe).await;
    result
}
