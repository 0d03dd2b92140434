mod common;

use async_trait::async_trait;
use common::{client, data, eventually, flow_id, status, store_with_flow};
use flowkeeper::{
    flow::{ExecutionStatus, FlowState, FlowStatus, ReadyRequest},
    runtime::ProcessorOptions,
    ClientMessage, Flow, FlowEngine, FlowOutput, FlowProcessor, FlowRegistry, FlowRequest, FlowResponse,
    ResponsePayload, Store,
};
use serde_json::json;
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::sync::Notify;

fn options() -> ProcessorOptions {
    ProcessorOptions {
        pool_size: 4,
        flow_lease: Duration::from_secs(60),
        processing_lease: Duration::from_secs(60),
        batch_limit: 10,
        poll_interval: Duration::from_millis(10),
    }
}

fn start(store: &Store, flow_name: &str, engine: Arc<dyn FlowEngine>) -> flowkeeper::LoopHandle {
    let registry = Arc::new(FlowRegistry::new());
    registry.register(flow_name, engine);
    FlowProcessor::start(store.clone(), registry, options())
}

async fn flow_state(store: &Store) -> FlowState {
    store.read_flow(&client(), &flow_id()).await.unwrap().flow_state
}

/// Sends an agent work item for request 0, finishes once request 1 is ready
struct Collect;

#[async_trait]
impl FlowEngine for Collect {
    async fn process(&self, flow: &mut Flow, ready: &[ReadyRequest]) -> anyhow::Result<FlowOutput> {
        let mut output = FlowOutput::default();
        for item in ready {
            if item.request.request_id == 0 {
                output.requests.push(FlowRequest::new(
                    flow.client_id.clone(),
                    flow.flow_id.clone(),
                    1,
                    json!({"action": "list_directory"}),
                ));
                output.messages.push(
                    ClientMessage::new(flow.client_id.clone(), 7, json!({"action": "list_directory"}))
                        .for_request(flow.flow_id.clone(), 1),
                );
            } else {
                flow.state = json!({ "collected": item.responses.len() });
                output.finished = true;
            }
        }
        Ok(output)
    }
}

#[tokio::test]
async fn test_flow_runs_to_completion() {
    let store = store_with_flow("Collect").await;
    let handle = start(&store, "Collect", Arc::new(Collect));

    store
        .write_requests(&[FlowRequest::new(client(), flow_id(), 0, json!({})).ready()])
        .await
        .unwrap();

    // Request 0 ran and the flow went idle waiting on request 1
    eventually("cursor advanced and lock released", || async {
        let flow = store.read_flow(&client(), &flow_id()).await.unwrap();
        flow.next_request_to_process == 1 && flow.processing_on.is_none()
    })
    .await;
    assert_eq!(store.read_messages(&client()).await.unwrap().len(), 1);

    store
        .write_responses(&[data(1, 0), data(1, 1), status(1, 2, 2)])
        .await
        .unwrap();

    eventually("flow finished", || async { flow_state(&store).await == FlowState::Finished }).await;

    let flow = store.read_flow(&client(), &flow_id()).await.unwrap();
    assert_eq!(flow.state, json!({"collected": 3}));
    assert!(flow.processing_on.is_none());
    assert!(store.read_messages(&client()).await.unwrap().is_empty());
    assert!(store
        .read_all_requests_and_responses(&client(), &flow_id())
        .await
        .unwrap()
        .is_empty());
    eventually("queue drained", || async {
        store.list_flow_processing_requests().await.unwrap().is_empty()
    })
    .await;

    handle.stop(Duration::from_secs(5)).await.unwrap();
}

/// Blocks inside request 0 until released by the test
struct Gated {
    started: Notify,
    gate: Notify,
    calls: Mutex<Vec<Vec<u64>>>,
}

#[async_trait]
impl FlowEngine for Gated {
    async fn process(&self, _flow: &mut Flow, ready: &[ReadyRequest]) -> anyhow::Result<FlowOutput> {
        let ids: Vec<u64> = ready.iter().map(|r| r.request.request_id).collect();
        self.calls.lock().unwrap().push(ids.clone());

        if ids.contains(&0) {
            self.started.notify_one();
            self.gate.notified().await;
            return Ok(FlowOutput::default());
        }
        Ok(FlowOutput::finished())
    }
}

#[tokio::test]
async fn test_request_completed_during_processing_is_not_lost() {
    let store = store_with_flow("Gated").await;
    let engine = Arc::new(Gated {
        started: Notify::new(),
        gate: Notify::new(),
        calls: Mutex::new(Vec::new()),
    });
    let handle = start(&store, "Gated", engine.clone());

    store
        .write_requests(&[
            FlowRequest::new(client(), flow_id(), 0, json!({})).ready(),
            FlowRequest::new(client(), flow_id(), 1, json!({})),
        ])
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(2), engine.started.notified())
        .await
        .unwrap();

    // Request 1 completes while request 0 is being processed. It is not at
    // the stored cursor yet, so no notification is queued for it.
    let outcome = store.write_responses(&[status(1, 0, 0)]).await.unwrap();
    assert!(outcome.notifications.is_empty());
    engine.gate.notify_one();

    eventually("flow finished", || async { flow_state(&store).await == FlowState::Finished }).await;
    assert_eq!(*engine.calls.lock().unwrap(), vec![vec![0], vec![1]]);

    handle.stop(Duration::from_secs(5)).await.unwrap();
}

struct Finish {
    calls: Mutex<usize>,
}

#[async_trait]
impl FlowEngine for Finish {
    async fn process(&self, _flow: &mut Flow, _ready: &[ReadyRequest]) -> anyhow::Result<FlowOutput> {
        *self.calls.lock().unwrap() += 1;
        Ok(FlowOutput::finished())
    }
}

#[tokio::test]
async fn test_busy_flow_is_retried_after_lock_expires() {
    let store = store_with_flow("Finish").await;

    // Another worker holds the lock briefly and then disappears
    store
        .with_owner("crashed-worker")
        .read_flow_for_processing(&client(), &flow_id(), Duration::from_millis(200))
        .await
        .unwrap();

    let engine = Arc::new(Finish { calls: Mutex::new(0) });
    let handle = start(&store, "Finish", engine.clone());

    store
        .write_requests(&[FlowRequest::new(client(), flow_id(), 0, json!({})).ready()])
        .await
        .unwrap();

    eventually("notification rescheduled", || async {
        store
            .list_flow_processing_requests()
            .await
            .unwrap()
            .iter()
            .any(|r| r.delivery_time.is_some())
    })
    .await;
    assert_eq!(*engine.calls.lock().unwrap(), 0);

    eventually("flow finished", || async { flow_state(&store).await == FlowState::Finished }).await;
    assert_eq!(*engine.calls.lock().unwrap(), 1);

    handle.stop(Duration::from_secs(5)).await.unwrap();
}

struct Failing;

#[async_trait]
impl FlowEngine for Failing {
    async fn process(&self, _flow: &mut Flow, _ready: &[ReadyRequest]) -> anyhow::Result<FlowOutput> {
        anyhow::bail!("artifact collector unavailable")
    }
}

#[tokio::test]
async fn test_engine_error_is_recorded_on_flow() {
    let store = store_with_flow("Failing").await;
    let handle = start(&store, "Failing", Arc::new(Failing));

    store
        .write_requests(&[
            FlowRequest::new(client(), flow_id(), 0, json!({})).ready(),
            FlowRequest::new(client(), flow_id(), 1, json!({})),
        ])
        .await
        .unwrap();

    eventually("flow failed", || async { flow_state(&store).await == FlowState::Error }).await;

    let flow = store.read_flow(&client(), &flow_id()).await.unwrap();
    assert_eq!(flow.error_message.as_deref(), Some("artifact collector unavailable"));
    assert!(flow.processing_on.is_none());
    assert!(store
        .read_all_requests_and_responses(&client(), &flow_id())
        .await
        .unwrap()
        .is_empty());

    handle.stop(Duration::from_secs(5)).await.unwrap();
}

struct Panicking;

#[async_trait]
impl FlowEngine for Panicking {
    async fn process(&self, _flow: &mut Flow, _ready: &[ReadyRequest]) -> anyhow::Result<FlowOutput> {
        panic!("parser blew up")
    }
}

#[tokio::test]
async fn test_engine_panic_marks_flow_crashed() {
    let store = store_with_flow("Panicking").await;
    let handle = start(&store, "Panicking", Arc::new(Panicking));

    store
        .write_requests(&[FlowRequest::new(client(), flow_id(), 0, json!({})).ready()])
        .await
        .unwrap();

    eventually("flow crashed", || async { flow_state(&store).await == FlowState::Crashed }).await;

    let flow = store.read_flow(&client(), &flow_id()).await.unwrap();
    assert_eq!(flow.crash_info.as_deref(), Some("parser blew up"));

    handle.stop(Duration::from_secs(5)).await.unwrap();
}

/// Fails the flow when the agent reports a request as failed
struct StatusCheck;

#[async_trait]
impl FlowEngine for StatusCheck {
    async fn process(&self, _flow: &mut Flow, ready: &[ReadyRequest]) -> anyhow::Result<FlowOutput> {
        for item in ready {
            if let Some(status) = item.status().filter(|s| s.status == ExecutionStatus::Error) {
                anyhow::bail!(
                    "request {} failed on client: {}",
                    item.request.request_id,
                    status.error_message.as_deref().unwrap_or("unknown error")
                );
            }
        }
        Ok(FlowOutput::finished())
    }
}

#[tokio::test]
async fn test_client_error_status_fails_flow() {
    let store = store_with_flow("StatusCheck").await;
    let handle = start(&store, "StatusCheck", Arc::new(StatusCheck));

    store
        .write_requests(&[FlowRequest::new(client(), flow_id(), 0, json!({"action": "read_registry"}))])
        .await
        .unwrap();
    store
        .write_responses(&[FlowResponse::new(
            client(),
            flow_id(),
            0,
            0,
            ResponsePayload::Status(FlowStatus::error(0, "access denied")),
        )])
        .await
        .unwrap();

    eventually("flow failed", || async { flow_state(&store).await == FlowState::Error }).await;

    let flow = store.read_flow(&client(), &flow_id()).await.unwrap();
    assert_eq!(
        flow.error_message.as_deref(),
        Some("request 0 failed on client: access denied")
    );

    handle.stop(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn test_unregistered_flow_name_fails_flow() {
    let store = store_with_flow("NobodyKnowsMe").await;
    let handle = start(&store, "Collect", Arc::new(Collect));

    store
        .write_requests(&[FlowRequest::new(client(), flow_id(), 0, json!({})).ready()])
        .await
        .unwrap();

    eventually("flow failed", || async { flow_state(&store).await == FlowState::Error }).await;
    let flow = store.read_flow(&client(), &flow_id()).await.unwrap();
    assert!(flow.error_message.unwrap().contains("NobodyKnowsMe"));

    handle.stop(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn test_pending_termination_stops_flow() {
    let store = store_with_flow("Finish").await;
    let engine = Arc::new(Finish { calls: Mutex::new(0) });
    let handle = start(&store, "Finish", engine.clone());

    store
        .write_requests(&[FlowRequest::new(client(), flow_id(), 0, json!({}))])
        .await
        .unwrap();
    store
        .set_pending_termination(&client(), &flow_id(), "operator cancelled")
        .await
        .unwrap();
    store
        .enqueue_flow_processing_request(&client(), &flow_id(), None)
        .await
        .unwrap();

    eventually("flow terminated", || async { flow_state(&store).await == FlowState::Error }).await;

    let flow = store.read_flow(&client(), &flow_id()).await.unwrap();
    assert_eq!(flow.error_message.as_deref(), Some("operator cancelled"));
    assert_eq!(*engine.calls.lock().unwrap(), 0);
    assert!(store
        .read_all_requests_and_responses(&client(), &flow_id())
        .await
        .unwrap()
        .is_empty());

    handle.stop(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn test_mismatched_status_terminates_flow() {
    let store = store_with_flow("Finish").await;
    let engine = Arc::new(Finish { calls: Mutex::new(0) });
    let handle = start(&store, "Finish", engine.clone());

    store
        .write_requests(&[FlowRequest::new(client(), flow_id(), 0, json!({}))])
        .await
        .unwrap();
    store.write_responses(&[status(0, 3, 2)]).await.unwrap();
    assert!(store.write_responses(&[status(0, 4, 5)]).await.is_err());

    // The mismatch itself wakes the idle flow, which then halts
    eventually("flow halted", || async { flow_state(&store).await == FlowState::Error }).await;

    let flow = store.read_flow(&client(), &flow_id()).await.unwrap();
    assert!(flow.error_message.unwrap().contains("mismatch"));
    assert_eq!(*engine.calls.lock().unwrap(), 0);

    handle.stop(Duration::from_secs(5)).await.unwrap();
}
