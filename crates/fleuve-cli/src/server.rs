//! Monitoring server for a Fleuve deployment
//!
//! Read-only views over the engine's store (events, snapshots, reader
//! offsets with lag, dead-lettered activities, delay schedules) plus the
//! one mutating endpoint an operator needs: re-enqueueing a dead-lettered
//! activity.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use fleuve_engine::activity::{retry_failed_action, ActivityStatus};
use fleuve_engine::persistence::EventStore;
use fleuve_engine::workflow::WorkflowId;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn EventStore>,
    pub nats_connected: bool,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/workflows/:workflow_type/:workflow_id/events", get(workflow_events))
        .route("/api/workflows/:workflow_type/:workflow_id/state", get(workflow_state))
        .route("/api/offsets", get(offsets))
        .route("/api/activities", get(activities))
        .route(
            "/api/activities/:workflow_id/:event_number/retry",
            post(retry_activity),
        )
        .route("/api/schedules", get(schedules))
        .with_state(state)
}

pub async fn serve(state: AppState, host: &str, port: u16) -> anyhow::Result<()> {
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "monitoring server listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

type ApiError = (StatusCode, Json<Value>);

fn internal_error(e: impl std::fmt::Display) -> ApiError {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": e.to_string()})),
    )
}

async fn healthz(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    // A cheap store round-trip proves DATABASE_URL actually works.
    state
        .store
        .max_global_id()
        .await
        .map_err(internal_error)?;

    Ok(Json(json!({
        "status": "ok",
        "nats": state.nats_connected,
    })))
}

#[derive(Deserialize)]
struct EventsQuery {
    #[serde(default)]
    after_version: i64,
    limit: Option<usize>,
}

async fn workflow_events(
    State(state): State<AppState>,
    Path((workflow_type, workflow_id)): Path<(String, String)>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<Value>, ApiError> {
    let workflow_id = WorkflowId::new(workflow_id);
    let mut events = state
        .store
        .read_workflow_events(&workflow_type, &workflow_id, query.after_version, None)
        .await
        .map_err(internal_error)?;
    events.truncate(query.limit.unwrap_or(500));

    Ok(Json(json!({ "events": events })))
}

#[derive(Deserialize)]
struct StateQuery {
    at_version: Option<i64>,
}

async fn workflow_state(
    State(state): State<AppState>,
    Path((workflow_type, workflow_id)): Path<(String, String)>,
    Query(query): Query<StateQuery>,
) -> Result<Json<Value>, ApiError> {
    let workflow_id = WorkflowId::new(workflow_id);

    let version = state
        .store
        .current_version(&workflow_type, &workflow_id)
        .await
        .map_err(internal_error)?;
    let Some(version) = version else {
        return Err((
            StatusCode::NOT_FOUND,
            Json(json!({"error": "workflow not found"})),
        ));
    };

    // The server has no workflow definitions, so it reports the raw
    // materials of the fold: latest covering snapshot plus the events above
    // it, up to the requested version.
    let snapshot = state
        .store
        .latest_snapshot(&workflow_id, query.at_version)
        .await
        .map_err(internal_error)?;
    let snapshot_version = snapshot.as_ref().map(|s| s.at_version).unwrap_or(0);

    let events = state
        .store
        .read_workflow_events(
            &workflow_type,
            &workflow_id,
            snapshot_version,
            query.at_version,
        )
        .await
        .map_err(internal_error)?;

    Ok(Json(json!({
        "workflow_id": workflow_id,
        "version": query.at_version.unwrap_or(version).min(version),
        "snapshot": snapshot,
        "events_after_snapshot": events,
    })))
}

async fn offsets(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let offsets = state.store.list_offsets().await.map_err(internal_error)?;
    let head = state.store.max_global_id().await.map_err(internal_error)?;

    let readers: Vec<Value> = offsets
        .into_iter()
        .map(|(reader_name, offset)| {
            json!({
                "reader_name": reader_name,
                "offset": offset,
                "lag": (head - offset).max(0),
            })
        })
        .collect();

    Ok(Json(json!({ "head": head, "readers": readers })))
}

#[derive(Deserialize)]
struct ActivitiesQuery {
    status: Option<String>,
    limit: Option<usize>,
}

async fn activities(
    State(state): State<AppState>,
    Query(query): Query<ActivitiesQuery>,
) -> Result<Json<Value>, ApiError> {
    let status = match query.status.as_deref() {
        None => None,
        Some(raw) => Some(
            serde_json::from_value::<ActivityStatus>(Value::String(raw.to_string())).map_err(
                |_| {
                    (
                        StatusCode::BAD_REQUEST,
                        Json(json!({"error": format!("unknown status {raw:?}")})),
                    )
                },
            )?,
        ),
    };

    let records = state
        .store
        .list_activities(status, query.limit.unwrap_or(100))
        .await
        .map_err(internal_error)?;

    Ok(Json(json!({ "activities": records })))
}

async fn retry_activity(
    State(state): State<AppState>,
    Path((workflow_id, event_number)): Path<(String, i64)>,
) -> Result<Json<Value>, ApiError> {
    let workflow_id = WorkflowId::new(workflow_id);
    retry_failed_action(&state.store, &workflow_id, event_number)
        .await
        .map_err(|e| {
            (
                StatusCode::NOT_FOUND,
                Json(json!({"error": e.to_string()})),
            )
        })?;

    Ok(Json(json!({"status": "requeued"})))
}

async fn schedules(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let far_future = Utc::now() + chrono::Duration::days(365 * 100);
    let rows = state
        .store
        .due_schedules(far_future, 500)
        .await
        .map_err(internal_error)?;

    let next: Option<DateTime<Utc>> = rows.first().map(|s| s.delay_until);
    Ok(Json(json!({ "next_fire": next, "schedules": rows })))
}
