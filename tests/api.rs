mod common;

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use common::{client, flow_id, status, store_with_flow};
use flowkeeper::{server::create_app, Flow, FlowId, FlowRequest, Store};
use serde_json::{json, Value};
use tower::ServiceExt;

async fn get(app: &Router, uri: &str) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    read(response).await
}

async fn post(app: &Router, uri: &str, body: Value) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    read(response).await
}

async fn read(response: axum::response::Response) -> (StatusCode, Value) {
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

async fn app_with_child() -> (Store, Router) {
    let store = store_with_flow("Interrogate").await;
    let child: FlowId = "0000C41D".parse().unwrap();
    store
        .write_flow(&Flow::new(client(), child, "ListDirectory", json!({})).with_parent(flow_id()))
        .await
        .unwrap();
    let app = create_app(store.clone());
    (store, app)
}

#[tokio::test]
async fn test_healthz() {
    let store = Store::in_memory("api").await.unwrap();
    let app = create_app(store);
    let response = app
        .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&bytes[..], b"ok");
}

#[tokio::test]
async fn test_list_and_get_flows() {
    let (_store, app) = app_with_child().await;

    let (code, body) = get(&app, &format!("/api/clients/{}/flows", client())).await;
    assert_eq!(code, StatusCode::OK);
    assert_eq!(body["flows"].as_array().unwrap().len(), 2);

    let (code, body) = get(&app, &format!("/api/clients/{}/flows/{}", client(), flow_id())).await;
    assert_eq!(code, StatusCode::OK);
    assert_eq!(body["flow_name"], "Interrogate");
    assert_eq!(body["flow_state"], "running");

    let (code, body) = get(&app, &format!("/api/clients/{}/flows/{}/children", client(), flow_id())).await;
    assert_eq!(code, StatusCode::OK);
    assert_eq!(body["flows"][0]["flow_id"], "0000C41D");
}

#[tokio::test]
async fn test_error_status_codes() {
    let (_store, app) = app_with_child().await;

    let (code, _) = get(&app, "/api/clients/not-a-client/flows").await;
    assert_eq!(code, StatusCode::BAD_REQUEST);

    let (code, _) = get(&app, "/api/clients/C.ffffffffffffffff/flows").await;
    assert_eq!(code, StatusCode::NOT_FOUND);

    let (code, _) = get(&app, &format!("/api/clients/{}/flows/DEADBEEF", client())).await;
    assert_eq!(code, StatusCode::NOT_FOUND);

    let (code, _) = get(&app, &format!("/api/clients/{}/flows/lowercase", client())).await;
    assert_eq!(code, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_requests_view_includes_responses() {
    let (store, app) = app_with_child().await;
    store
        .write_requests(&[FlowRequest::new(client(), flow_id(), 0, json!({"action": "stat"}))])
        .await
        .unwrap();
    store.write_responses(&[status(0, 0, 0)]).await.unwrap();

    let (code, body) = get(&app, &format!("/api/clients/{}/flows/{}/requests", client(), flow_id())).await;
    assert_eq!(code, StatusCode::OK);
    let requests = body["requests"].as_array().unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0]["request"]["needs_processing"], true);
    assert_eq!(requests[0]["responses"][0]["payload"]["type"], "status");

    let (code, body) = get(&app, "/api/processing-requests").await;
    assert_eq!(code, StatusCode::OK);
    assert_eq!(body["processing_requests"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_terminate_flow() {
    let (store, app) = app_with_child().await;

    let (code, body) = post(
        &app,
        &format!("/api/clients/{}/flows/{}/terminate", client(), flow_id()),
        json!({"reason": "operator cancelled"}),
    )
    .await;
    assert_eq!(code, StatusCode::OK);
    assert_eq!(body["flow_id"], flow_id().as_str());

    let flow = store.read_flow(&client(), &flow_id()).await.unwrap();
    assert_eq!(flow.pending_termination.as_deref(), Some("operator cancelled"));
    assert_eq!(store.list_flow_processing_requests().await.unwrap().len(), 1);

    let (code, _) = post(
        &app,
        &format!("/api/clients/{}/flows/{}/terminate", client(), flow_id()),
        json!({"reason": "  "}),
    )
    .await;
    assert_eq!(code, StatusCode::BAD_REQUEST);

    let (code, _) = post(
        &app,
        &format!("/api/clients/{}/flows/DEADBEEF/terminate", client()),
        json!({"reason": "gone"}),
    )
    .await;
    assert_eq!(code, StatusCode::NOT_FOUND);
}
