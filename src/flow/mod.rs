//! Flow layer
//!
//! Everything keyed by `(client_id, flow_id)`:
//! - Type definitions (Flow, FlowRequest, FlowResponse, FlowProcessingRequest)
//! - Flow record store with the single-writer processing lock
//! - Request/response ledger deciding when a request is ready
//! - Processing request queue waking flows up

// Core flow type definitions
pub mod types;

// Flow records and the processing lock
pub mod storage;

// Request/response reconciliation
pub mod ledger;

// Durable flow wakeup notifications
pub mod processing;

pub use ledger::{WriteResponsesOutcome, TRACING_TARGET_LEDGER};
pub use processing::TRACING_TARGET_QUEUE;
pub use storage::TRACING_TARGET_FLOW;
pub use types::{
    ExecutionStatus, Flow, FlowId, FlowProcessingRequest, FlowRequest, FlowResponse, FlowState,
    FlowStatus, ReadyRequest, RequestKey, RequestWithResponses, ResponsePayload,
};
