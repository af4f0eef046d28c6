//! Axum JSON API: job submission and status, schedule view, reconciliation trigger.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{rejection::JsonRejection, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use estate_core::{JobPriority, JobTrigger, RunType, ScrapeJobRequest, SourceId};
use estate_sync::{
    default_schedules, schedule_views, ReconcileOptions, ScheduleDefinition, ScrapeQueue, SourceSyncAgent,
};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "estate-web";

const INVALID_SOURCES: &str = "Invalid sources. Must be: tayara, mubawab, or tunisie-annonce";

#[derive(Clone)]
pub struct AppState {
    pub queue: ScrapeQueue,
    pub api_key: Option<String>,
    pub schedules: Vec<ScheduleDefinition>,
    pub reconciler: Option<Arc<SourceSyncAgent>>,
    pub default_reconcile: ReconcileOptions,
}

impl AppState {
    pub fn new(queue: ScrapeQueue, api_key: Option<String>) -> Self {
        Self {
            queue,
            api_key,
            schedules: default_schedules(),
            reconciler: None,
            default_reconcile: ReconcileOptions::default(),
        }
    }

    pub fn with_reconciler(mut self, agent: Arc<SourceSyncAgent>, defaults: ReconcileOptions) -> Self {
        self.reconciler = Some(agent);
        self.default_reconcile = defaults;
        self
    }
}

/// Wire shape of a job submission. Sources stay strings so unknown ids get a clear 400.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitBody {
    sources: Option<Vec<String>>,
    #[serde(rename = "type")]
    run_type: Option<RunType>,
    governorates: Option<Vec<String>>,
    property_types: Option<Vec<String>>,
    max_pages: Option<u32>,
    priority: Option<JobPriority>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusQuery {
    job_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReconcileBody {
    #[serde(default)]
    dry_run: Option<bool>,
    #[serde(default)]
    batch_size: Option<usize>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/scrape", post(submit_handler).get(status_handler))
        .route("/api/scrape/schedules", get(schedules_handler))
        .route("/api/scrape/reconcile", post(reconcile_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(bind: &str, state: AppState) -> anyhow::Result<()> {
    let listener = TcpListener::bind(bind).await?;
    info!(addr = %listener.local_addr()?, "api listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}

fn json_error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "success": false, "error": message.into() }))).into_response()
}

fn server_error(err: impl std::fmt::Display) -> Response {
    error!(error = %err, "request failed");
    json_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
}

/// `None` when the request may proceed.
fn check_bearer(state: &AppState, headers: &HeaderMap) -> Option<Response> {
    let Some(api_key) = state.api_key.as_deref() else {
        return Some(json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "API key not configured",
        ));
    };
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if presented != Some(api_key) {
        warn!("rejected request with missing or bad bearer token");
        return Some(json_error(StatusCode::UNAUTHORIZED, "Unauthorized"));
    }
    None
}

async fn health_handler() -> Response {
    Json(json!({ "status": "ok" })).into_response()
}

async fn submit_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Result<Json<SubmitBody>, JsonRejection>,
) -> Response {
    if let Some(denied) = check_bearer(&state, &headers) {
        return denied;
    }
    let body = match body {
        Ok(Json(body)) => body,
        Err(rejection) => return json_error(StatusCode::BAD_REQUEST, rejection.body_text()),
    };

    let sources = match body.sources {
        Some(raw) => match raw.iter().map(|s| s.parse::<SourceId>()).collect::<Result<Vec<_>, _>>() {
            Ok(sources) => Some(sources),
            Err(err) => {
                warn!(error = %err, "job submission with unknown source");
                return json_error(StatusCode::BAD_REQUEST, INVALID_SOURCES);
            }
        },
        None => None,
    };

    let request = ScrapeJobRequest {
        sources,
        run_type: body.run_type,
        governorates: body.governorates,
        property_types: body.property_types,
        max_pages: body.max_pages,
        priority: body.priority,
        trigger: Some(JobTrigger::Api),
        schedule_id: None,
    };

    match state.queue.enqueue(request).await {
        Ok(handle) => Json(json!({
            "success": true,
            "jobId": handle.id,
            "message": "Scrape job queued successfully",
            "data": {
                "sources": handle.data.sources,
                "type": handle.data.run_type,
                "maxPages": handle.data.max_pages,
                "priority": handle.data.priority,
            },
        }))
        .into_response(),
        Err(err) => server_error(err),
    }
}

async fn status_handler(State(state): State<Arc<AppState>>, Query(query): Query<StatusQuery>) -> Response {
    let Some(raw) = query.job_id.filter(|id| !id.trim().is_empty()) else {
        return json_error(StatusCode::BAD_REQUEST, "jobId parameter is required");
    };
    // ids we never issued cannot exist
    let Ok(job_id) = Uuid::parse_str(raw.trim()) else {
        return json_error(StatusCode::NOT_FOUND, "Job not found");
    };

    match state.queue.get_status(job_id).await {
        Ok(Some(status)) => {
            let mut body = json!({ "success": true, "jobId": job_id });
            if let (Some(target), Ok(serde_json::Value::Object(fields))) =
                (body.as_object_mut(), serde_json::to_value(&status))
            {
                target.extend(fields);
            }
            Json(body).into_response()
        }
        Ok(None) => json_error(StatusCode::NOT_FOUND, "Job not found"),
        Err(err) => server_error(err),
    }
}

async fn schedules_handler(State(state): State<Arc<AppState>>) -> Response {
    let now = Utc::now();
    Json(json!({
        "success": true,
        "generatedAt": now,
        "schedules": schedule_views(&state.schedules, now),
    }))
    .into_response()
}

async fn reconcile_handler(State(state): State<Arc<AppState>>, headers: HeaderMap, body: Bytes) -> Response {
    if let Some(denied) = check_bearer(&state, &headers) {
        return denied;
    }
    let Some(agent) = state.reconciler.as_ref() else {
        return json_error(StatusCode::SERVICE_UNAVAILABLE, "Reconciliation agent not configured");
    };

    let body: ReconcileBody = if body.is_empty() {
        ReconcileBody::default()
    } else {
        serde_json::from_slice(&body).unwrap_or_default()
    };
    let options = ReconcileOptions {
        dry_run: body.dry_run.unwrap_or(state.default_reconcile.dry_run),
        batch_size: body
            .batch_size
            .filter(|n| *n > 0)
            .unwrap_or(state.default_reconcile.batch_size),
    };

    match agent.run(options).await {
        Ok(summary) => Json(json!({ "success": true, "summary": summary })).into_response(),
        Err(err) => server_error(format!("{err:#}")),
    }
}
