/**
 * API REST LISTENER - Inspection de l'état réel
 *
 * ROLE: expose en lecture ce que le listener a agrégé et ce que le store
 * certifie, pour le dashboard, le scraping Prometheus et le debug.
 *
 * ROUTES:
 * - /health, /metrics : libres
 * - /system/health, /actual/freshness, /deas, /deas/{id} : header x-api-key
 */

use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use crate::clock::TimeProvider;
use crate::health::{HealthTracker, ListenerHealth};
use crate::listener::ActualStateListener;
use crate::metrics::PrometheusAccountant;
use crate::models::InstanceHeartbeat;
use crate::store::{ActualStateReader, DeaRecord};
use std::sync::Arc;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::warn;

#[derive(Clone)]
pub struct AppState {
    pub listener: Arc<ActualStateListener>,
    pub store: Arc<dyn ActualStateReader>,
    pub health_tracker: HealthTracker,
    pub metrics: Arc<PrometheusAccountant>,
    pub time_provider: Arc<dyn TimeProvider>,
}

#[derive(Debug, serde::Serialize)]
struct DeaView {
    dea_guid: String,
    updated_at: String,
    age_seconds: i64,
    instances: Vec<InstanceHeartbeat>,
}

#[derive(Debug, serde::Serialize)]
struct FreshnessView {
    fresh: bool,
    fresh_at: Option<String>,
    expires_at: Option<String>,
}

fn to_view(dea_guid: &str, record: &DeaRecord, now: OffsetDateTime) -> DeaView {
    DeaView {
        dea_guid: dea_guid.to_string(),
        updated_at: record.updated_at.format(&Rfc3339).unwrap_or_default(),
        age_seconds: (now - record.updated_at).whole_seconds().max(0),
        instances: record.instance_heartbeats.clone(),
    }
}

async fn require_api_key(req: Request, next: Next) -> Result<Response, StatusCode> {
    let path = req.uri().path();
    if path.starts_with("/health") || path.starts_with("/metrics") {
        return Ok(next.run(req).await);
    }

    let expected = std::env::var("SYMBION_API_KEY").unwrap_or_default();
    if expected.is_empty() {
        warn!("SYMBION_API_KEY not set - API access denied");
        return Err(StatusCode::UNAUTHORIZED);
    }

    let ok = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == expected)
        .unwrap_or(false);

    if !ok {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/metrics", get(get_metrics))
        .route("/system/health", get(get_system_health))
        .route("/actual/freshness", get(get_freshness))
        .route("/deas", get(get_deas))
        .route("/deas/{id}", get(get_dea))
        .with_state(app_state)
        .layer(middleware::from_fn(require_api_key))
}

// GET /metrics (format texte Prometheus)
async fn get_metrics(State(app): State<AppState>) -> Result<String, StatusCode> {
    app.metrics.encode().map_err(|e| {
        warn!(error = %e, "failed to encode metrics");
        StatusCode::INTERNAL_SERVER_ERROR
    })
}

// GET /system/health
async fn get_system_health(State(app): State<AppState>) -> Json<ListenerHealth> {
    let now = app.time_provider.now();
    Json(app.health_tracker.get_health(&app.listener, app.store.as_ref(), now).await)
}

// GET /actual/freshness
async fn get_freshness(State(app): State<AppState>) -> Json<FreshnessView> {
    let now = app.time_provider.now();
    let record = app.store.freshness().await;
    Json(FreshnessView {
        fresh: record.map(|f| now < f.expires_at).unwrap_or(false),
        fresh_at: record.and_then(|f| f.fresh_at.format(&Rfc3339).ok()),
        expires_at: record.and_then(|f| f.expires_at.format(&Rfc3339).ok()),
    })
}

// GET /deas (DEA vivants, triés par id)
async fn get_deas(State(app): State<AppState>) -> Json<Vec<DeaView>> {
    let now = app.time_provider.now();
    let state = app.store.actual_state(now).await;
    let mut list: Vec<DeaView> = state.iter().map(|(id, r)| to_view(id, r, now)).collect();
    list.sort_by(|a, b| a.dea_guid.cmp(&b.dea_guid));
    Json(list)
}

// GET /deas/{id}
async fn get_dea(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DeaView>, StatusCode> {
    let now = app.time_provider.now();
    let state = app.store.actual_state(now).await;
    let Some(record) = state.get(&id) else { return Err(StatusCode::NOT_FOUND); };
    Ok(Json(to_view(&id, record, now)))
}
