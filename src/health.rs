use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use reqwest::Url;
use serde::Serialize;

use crate::cache::MirrorStore;

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub checks: HealthChecks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Serialize)]
pub struct HealthChecks {
    pub cache: CheckResult,
    pub upstream: CheckResult,
}

#[derive(Debug, Serialize)]
pub struct CheckResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CheckResult {
    fn healthy() -> Self {
        Self {
            ok: true,
            detail: None,
        }
    }

    fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            detail: Some(detail.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Shared state expected by the handler
// ---------------------------------------------------------------------------

/// Subset of `AppState` the health check needs.
#[derive(Clone)]
pub struct HealthState {
    pub store: Arc<MirrorStore>,
    pub upstream_base: Url,
    pub http_client: reqwest::Client,
}

// ---------------------------------------------------------------------------
// Individual checks
// ---------------------------------------------------------------------------

async fn check_cache(store: &MirrorStore) -> CheckResult {
    match store.ensure_writable().await {
        Ok(()) => CheckResult::healthy(),
        Err(e) => CheckResult::unhealthy(format!("{e:#}")),
    }
}

async fn check_upstream(client: &reqwest::Client, base: &Url) -> CheckResult {
    if base.scheme() == "file" {
        return match base.to_file_path() {
            Ok(path) if tokio::fs::metadata(&path).await.is_ok_and(|m| m.is_dir()) => {
                CheckResult::healthy()
            }
            _ => CheckResult::unhealthy(format!("{base} is not a directory")),
        };
    }

    // Any HTTP answer, even 401 or 404, proves the server is up.
    match client.head(base.clone()).send().await {
        Ok(resp) if !resp.status().is_server_error() => CheckResult::healthy(),
        Ok(resp) => CheckResult::unhealthy(format!("HEAD {base} returned {}", resp.status())),
        Err(e) => CheckResult::unhealthy(format!("HEAD {base} failed: {e}")),
    }
}

// ---------------------------------------------------------------------------
// Aggregate status
// ---------------------------------------------------------------------------

/// Fresh mirrors can still be served while upstream is down.
fn aggregate_status(checks: &HealthChecks) -> HealthStatus {
    match (checks.cache.ok, checks.upstream.ok) {
        (true, true) => HealthStatus::Ok,
        (true, false) => HealthStatus::Degraded,
        (false, _) => HealthStatus::Unhealthy,
    }
}

// ---------------------------------------------------------------------------
// Axum handler
// ---------------------------------------------------------------------------

/// `GET /healthz` handler.  Returns 200 on Ok/Degraded, 503 on Unhealthy.
pub async fn health_handler(State(state): State<HealthState>) -> impl IntoResponse {
    let (cache, upstream) = tokio::join!(
        check_cache(&state.store),
        check_upstream(&state.http_client, &state.upstream_base),
    );

    let checks = HealthChecks { cache, upstream };
    let status = aggregate_status(&checks);
    let body = HealthResponse { status, checks };

    let http_status = match status {
        HealthStatus::Ok | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (http_status, Json(body))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checks(cache: bool, upstream: bool) -> HealthChecks {
        let result = |ok| CheckResult { ok, detail: None };
        HealthChecks {
            cache: result(cache),
            upstream: result(upstream),
        }
    }

    #[test]
    fn upstream_outage_only_degrades() {
        assert_eq!(aggregate_status(&checks(true, true)), HealthStatus::Ok);
        assert_eq!(aggregate_status(&checks(true, false)), HealthStatus::Degraded);
        assert_eq!(aggregate_status(&checks(false, true)), HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn local_upstream_and_cache_are_healthy() {
        let tmp = tempfile::tempdir().unwrap();
        let state = HealthState {
            store: Arc::new(MirrorStore::new(tmp.path())),
            upstream_base: Url::from_directory_path(tmp.path()).unwrap(),
            http_client: reqwest::Client::new(),
        };

        let response = health_handler(State(state)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
    }

    #[tokio::test]
    async fn missing_local_upstream_is_degraded() {
        let tmp = tempfile::tempdir().unwrap();
        let state = HealthState {
            store: Arc::new(MirrorStore::new(tmp.path())),
            upstream_base: Url::parse("file:///nonexistent/git-cdn-upstream/").unwrap(),
            http_client: reqwest::Client::new(),
        };

        let response = health_handler(State(state)).await.into_response();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "degraded");
        assert_eq!(json["checks"]["upstream"]["ok"], false);
    }
}
