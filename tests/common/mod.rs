#![allow(dead_code)]

use flowkeeper::{
    flow::{FlowStatus, ResponsePayload},
    ClientId, Flow, FlowId, FlowResponse, Store,
};
use serde_json::json;
use std::time::Duration;

pub fn client() -> ClientId {
    "C.a000000000000001".parse().unwrap()
}

pub fn flow_id() -> FlowId {
    "00C0FFEE".parse().unwrap()
}

/// In-memory store with one registered client and one running flow
pub async fn store_with_flow(flow_name: &str) -> Store {
    let store = Store::in_memory("worker-a").await.unwrap();
    store.write_client(&client()).await.unwrap();
    store
        .write_flow(&Flow::new(client(), flow_id(), flow_name, json!({})))
        .await
        .unwrap();
    store
}

pub fn data(request_id: u64, response_id: u64) -> FlowResponse {
    FlowResponse::new(
        client(),
        flow_id(),
        request_id,
        response_id,
        ResponsePayload::Data(json!({ "response": response_id })),
    )
}

pub fn status(request_id: u64, response_id: u64, expected: u64) -> FlowResponse {
    FlowResponse::new(
        client(),
        flow_id(),
        request_id,
        response_id,
        ResponsePayload::Status(FlowStatus::ok(expected)),
    )
}

/// Poll `check` until it holds or two seconds pass
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for: {what}");
}
