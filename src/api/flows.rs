//! Flow inspection REST API endpoints
//!
//! Read-only views of flows, their outstanding requests and the processing
//! queue, plus the one write a non-holder may make: asking a flow to
//! terminate.

use crate::{
    client::ClientId,
    error::Error,
    flow::{Flow, FlowId},
    store::Store,
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Tracing target for the read API.
pub const TRACING_TARGET_API: &str = "flowkeeper::api";

/// Application state shared by all handlers
#[derive(Clone)]
pub struct AppState {
    pub store: Store,
}

/// Request body for flow termination
#[derive(Debug, Deserialize)]
pub struct TerminateFlowRequest {
    pub reason: String,
}

#[derive(Debug, Serialize)]
pub struct TerminateFlowResponse {
    pub client_id: ClientId,
    pub flow_id: FlowId,
    pub message: String,
}

/// Read-only flow views plus the terminate action, merged into the app router
pub fn create_flow_routes() -> Router<AppState> {
    Router::new()
        .route("/api/clients/{client_id}/flows", get(list_flows))
        .route("/api/clients/{client_id}/flows/{flow_id}", get(get_flow))
        .route("/api/clients/{client_id}/flows/{flow_id}/children", get(list_child_flows))
        .route("/api/clients/{client_id}/flows/{flow_id}/requests", get(list_requests))
        .route("/api/clients/{client_id}/flows/{flow_id}/terminate", post(terminate_flow))
        .route("/api/processing-requests", get(list_processing_requests))
}

/// Map a store error to a status code, logging anything unexpected
fn status_for(e: Error) -> StatusCode {
    match e {
        Error::InvalidId(_) => StatusCode::BAD_REQUEST,
        Error::UnknownClient { .. } | Error::UnknownFlow { .. } => StatusCode::NOT_FOUND,
        e => {
            tracing::error!(target: TRACING_TARGET_API, error = %e, "Request failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn parse_ids(client_id: &str, flow_id: &str) -> Result<(ClientId, FlowId), StatusCode> {
    let client_id = client_id.parse().map_err(status_for)?;
    let flow_id = flow_id.parse().map_err(status_for)?;
    Ok((client_id, flow_id))
}

/// List all flows of a client
///
/// GET /api/clients/{client_id}/flows
/// Returns: { "flows": [...] }
async fn list_flows(
    State(state): State<AppState>,
    Path(client_id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    let client_id: ClientId = client_id.parse().map_err(status_for)?;
    state.store.read_client(&client_id).await.map_err(status_for)?;

    let flows = state
        .store
        .read_all_flows(Some(&client_id))
        .await
        .map_err(status_for)?;
    Ok(Json(json!({ "flows": flows })))
}

/// GET /api/clients/{client_id}/flows/{flow_id}
async fn get_flow(
    State(state): State<AppState>,
    Path((client_id, flow_id)): Path<(String, String)>,
) -> Result<Json<Flow>, StatusCode> {
    let (client_id, flow_id) = parse_ids(&client_id, &flow_id)?;
    let flow = state
        .store
        .read_flow(&client_id, &flow_id)
        .await
        .map_err(status_for)?;
    Ok(Json(flow))
}

/// GET /api/clients/{client_id}/flows/{flow_id}/children
async fn list_child_flows(
    State(state): State<AppState>,
    Path((client_id, flow_id)): Path<(String, String)>,
) -> Result<Json<Value>, StatusCode> {
    let (client_id, flow_id) = parse_ids(&client_id, &flow_id)?;
    let flows = state
        .store
        .read_child_flows(&client_id, &flow_id)
        .await
        .map_err(status_for)?;
    Ok(Json(json!({ "flows": flows })))
}

/// Outstanding requests of a flow with the responses received so far
///
/// GET /api/clients/{client_id}/flows/{flow_id}/requests
/// Returns: { "requests": [{ "request": {...}, "responses": [...] }] }
async fn list_requests(
    State(state): State<AppState>,
    Path((client_id, flow_id)): Path<(String, String)>,
) -> Result<Json<Value>, StatusCode> {
    let (client_id, flow_id) = parse_ids(&client_id, &flow_id)?;
    state
        .store
        .read_flow(&client_id, &flow_id)
        .await
        .map_err(status_for)?;

    let requests = state
        .store
        .read_all_requests_and_responses(&client_id, &flow_id)
        .await
        .map_err(status_for)?;
    Ok(Json(json!({ "requests": requests })))
}

/// Ask a flow to terminate
///
/// POST /api/clients/{client_id}/flows/{flow_id}/terminate
/// Body: { "reason": "..." }
///
/// The flow stops at its next processing run. A wakeup is queued so an
/// idle flow gets that run.
async fn terminate_flow(
    State(state): State<AppState>,
    Path((client_id, flow_id)): Path<(String, String)>,
    Json(payload): Json<TerminateFlowRequest>,
) -> Result<Json<TerminateFlowResponse>, StatusCode> {
    let (client_id, flow_id) = parse_ids(&client_id, &flow_id)?;
    if payload.reason.trim().is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    state
        .store
        .set_pending_termination(&client_id, &flow_id, &payload.reason)
        .await
        .map_err(status_for)?;
    state
        .store
        .enqueue_flow_processing_request(&client_id, &flow_id, None)
        .await
        .map_err(status_for)?;

    Ok(Json(TerminateFlowResponse {
        client_id,
        flow_id,
        message: format!("Termination requested: {}", payload.reason),
    }))
}

/// GET /api/processing-requests
async fn list_processing_requests(State(state): State<AppState>) -> Result<Json<Value>, StatusCode> {
    let requests = state
        .store
        .list_flow_processing_requests()
        .await
        .map_err(status_for)?;
    Ok(Json(json!({ "processing_requests": requests })))
}
