//! Health & readiness handlers.
//!
//! - GET /healthz                   -> simple liveness ("ok")
//! - GET /readyz                    -> database plus every storage provider
//! - GET /health/providers          -> aggregate provider report
//! - GET /health/providers/{kind}   -> one provider

use super::AppState;
use crate::{
    errors::AppError,
    models::{HealthReport, HealthStatus, ProviderKind},
};
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// `GET /healthz`
///
/// Very small liveness probe; never performs I/O.
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".into(),
        }),
    )
}

/// `GET /readyz`
///
/// 1. Runs a lightweight query against SQLite (`SELECT 1`).
/// 2. Probes every configured storage provider concurrently.
///
/// HTTP 200 when all checks pass, HTTP 503 when any fails.
pub async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let sqlite_check = match sqlx::query_scalar::<_, i64>("SELECT 1")
        .fetch_one(&*state.db)
        .await
    {
        Ok(1) => CheckStatus::ok(),
        Ok(v) => CheckStatus::failed(format!("unexpected result: {}", v)),
        Err(e) => CheckStatus::failed(format!("error: {}", e)),
    };

    let report = state.health.check_all().await;

    let mut checks = BTreeMap::new();
    checks.insert("sqlite".to_string(), sqlite_check);
    for (kind, status) in &report.providers {
        let check = if status.is_healthy() {
            CheckStatus::ok()
        } else {
            CheckStatus::failed(status.message.clone())
        };
        checks.insert(format!("provider:{kind}"), check);
    }

    let overall_ok = checks.values().all(|c| c.ok);
    let body = ReadyResponse {
        status: if overall_ok { "ok" } else { "error" }.into(),
        checks,
    };
    let status = if overall_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

#[derive(Debug, Deserialize)]
pub struct ProviderHealthQuery {
    /// Serve the last report instead of probing again.
    #[serde(default)]
    pub cached: bool,
}

/// `GET /health/providers[?cached=true]`
///
/// Always 200; unhealthy providers are described in the body.
pub async fn providers_health(
    State(state): State<AppState>,
    Query(q): Query<ProviderHealthQuery>,
) -> Json<HealthReport> {
    if q.cached {
        if let Some(report) = state.health.last_report().await {
            return Json(report);
        }
    }
    Json(state.health.check_all().await)
}

/// `GET /health/providers/{kind}`
pub async fn provider_health(
    State(state): State<AppState>,
    Path(kind): Path<String>,
) -> Result<Json<HealthStatus>, AppError> {
    let kind = kind
        .parse::<ProviderKind>()
        .map_err(|err| AppError::bad_request(err.to_string()))?;
    if !state.registry.contains(kind) {
        return Err(AppError::not_found(format!(
            "provider `{kind}` is not configured"
        )));
    }
    Ok(Json(state.health.check(kind).await))
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: String,
    checks: BTreeMap<String, CheckStatus>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}

impl CheckStatus {
    fn ok() -> Self {
        Self {
            ok: true,
            error: None,
        }
    }

    fn failed(error: String) -> Self {
        Self {
            ok: false,
            error: Some(error),
        }
    }
}
