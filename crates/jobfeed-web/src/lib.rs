//! Axum JSON interface over the job store: live-view queries, events, run
//! history, operator status, the manual sync trigger and backup/restore.

use std::str::FromStr;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use jobfeed_storage::{Backup, BackupError, DepartmentSource, EventQuery, FilterFacet, JobQuery, JobStore};
use jobfeed_sync::{
    build_scheduler, last_schema_report, status_report, MaintenanceError, StatusReport, SyncConfig, SyncPhase,
    SyncService, SyncStatus, Trigger,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "jobfeed-web";

const DEFAULT_RUNS_LIMIT: u32 = 20;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<SyncService>,
    pub department_source: DepartmentSource,
}

impl AppState {
    pub fn new(service: Arc<SyncService>, department_source: DepartmentSource) -> Self {
        Self {
            service,
            department_source,
        }
    }

    fn store(&self) -> &JobStore {
        self.service.store()
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/jobs", get(jobs_handler))
        .route("/jobs/{id}", get(job_detail_handler))
        .route("/filters/{facet}", get(filter_options_handler))
        .route("/events", get(events_handler))
        .route("/runs", get(runs_handler))
        .route("/status", get(status_handler))
        .route("/schema", get(schema_handler))
        .route("/sync", post(sync_handler))
        .route("/backup", get(export_handler).post(import_handler))
        .with_state(Arc::new(state))
}

/// Serves `state` on `0.0.0.0:port` until the process is interrupted.
pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding port {port}"))?;
    info!(port, "web interface listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}

/// Opens the configured store, starts the scheduled trigger when enabled and
/// serves the interface.
pub async fn serve_from_config(config: &SyncConfig) -> anyhow::Result<()> {
    let store = JobStore::connect(&config.database_url).await?;
    let service = Arc::new(SyncService::from_config(config, store)?);
    let scheduler = build_scheduler(Arc::clone(&service), config.schedule).await?;
    if let Some(sched) = &scheduler {
        sched.start().await.context("starting scheduler")?;
    }
    serve(AppState::new(service, config.department_source), config.web_port).await
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    serve_from_config(&SyncConfig::from_env()?).await
}

async fn jobs_handler(State(state): State<Arc<AppState>>, Query(query): Query<JobQuery>) -> Response {
    match state.store().query_jobs(&query, state.department_source).await {
        Ok(page) => Json(page).into_response(),
        Err(err) => server_error(err),
    }
}

async fn job_detail_handler(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    let store = state.store();
    let job = match store.job_by_id(&id).await {
        Ok(Some(job)) => job,
        Ok(None) => return not_found(format!("job {id} is not in the live view")),
        Err(err) => return server_error(err),
    };
    match store.job_events(&id).await {
        Ok(events) => Json(json!({ "job": job, "events": events })).into_response(),
        Err(err) => server_error(err),
    }
}

async fn filter_options_handler(State(state): State<Arc<AppState>>, Path(facet): Path<String>) -> Response {
    let facet = match FilterFacet::from_str(&facet) {
        Ok(facet) => facet,
        Err(err) => return bad_request(err.to_string()),
    };
    match state.store().filter_options(facet).await {
        Ok(options) => Json(options).into_response(),
        Err(err) => server_error(err),
    }
}

async fn events_handler(State(state): State<Arc<AppState>>, Query(query): Query<EventQuery>) -> Response {
    let today = state.service.now().date_naive();
    match state.store().list_events(&query, today).await {
        Ok(page) => Json(page).into_response(),
        Err(err) => server_error(err),
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct RunsQuery {
    limit: Option<u32>,
}

async fn runs_handler(State(state): State<Arc<AppState>>, Query(query): Query<RunsQuery>) -> Response {
    let limit = query.limit.unwrap_or(DEFAULT_RUNS_LIMIT).clamp(1, 500);
    match state.store().recent_runs(limit).await {
        Ok(runs) => Json(runs).into_response(),
        Err(err) => server_error(err),
    }
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    phase: SyncPhase,
    #[serde(flatten)]
    report: StatusReport,
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Response {
    match status_report(state.store(), DEFAULT_RUNS_LIMIT).await {
        Ok(report) => Json(StatusResponse {
            phase: state.service.phase(),
            report,
        })
        .into_response(),
        Err(err) => server_error(err),
    }
}

async fn schema_handler(State(state): State<Arc<AppState>>) -> Response {
    match last_schema_report(state.store()).await {
        Ok(Some(report)) => Json(report).into_response(),
        Ok(None) => not_found("no feed has been fetched yet".to_string()),
        Err(err) => server_error(err),
    }
}

/// The attempt runs on its own task, so a client that disconnects does not
/// cancel a sync halfway through.
async fn sync_handler(State(state): State<Arc<AppState>>) -> Response {
    let service = Arc::clone(&state.service);
    let attempt = tokio::spawn(async move { service.sync(Trigger::Manual).await });
    let outcome = match attempt.await {
        Ok(outcome) => outcome,
        Err(err) => return server_error(anyhow::Error::new(err).context("sync task ended abnormally")),
    };
    let status = match outcome.status {
        SyncStatus::Success => StatusCode::OK,
        SyncStatus::Skipped => StatusCode::CONFLICT,
        SyncStatus::Failed => StatusCode::BAD_GATEWAY,
    };
    (status, Json(outcome)).into_response()
}

async fn export_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store().export_backup(state.service.now()).await {
        Ok(backup) => Json(backup).into_response(),
        Err(err) => server_error(err),
    }
}

async fn import_handler(State(state): State<Arc<AppState>>, body: String) -> Response {
    let backup = match Backup::from_json(&body) {
        Ok(backup) => backup,
        Err(err) => return bad_request(err.to_string()),
    };
    match state.service.import_backup(&backup).await {
        Ok(()) => {}
        Err(err @ MaintenanceError::SyncInProgress) => return conflict(err.to_string()),
        Err(MaintenanceError::Backup(BackupError::Database(err)) | MaintenanceError::Storage(err)) => {
            return server_error(err)
        }
        Err(err) => return bad_request(err.to_string()),
    }
    match state.store().table_counts().await {
        Ok(counts) => Json(json!({ "imported": counts })).into_response(),
        Err(err) => server_error(err),
    }
}

fn error_body(status: StatusCode, message: String) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    error!(error = %format!("{err:#}"), "request failed");
    error_body(StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}"))
}

fn not_found(message: String) -> Response {
    error_body(StatusCode::NOT_FOUND, message)
}

fn bad_request(message: String) -> Response {
    error_body(StatusCode::BAD_REQUEST, message)
}

fn conflict(message: String) -> Response {
    error_body(StatusCode::CONFLICT, message)
}
