//! Flowkeeper: flow coordination engine on a transactional store
//!
//! Flows issue numbered requests, remote agents answer them with data and a
//! terminal status, and the engine decides from out-of-order, duplicated
//! deliveries exactly when a flow's next step is ready, hands that step to
//! one worker at a time and recovers by lease expiry when a worker dies.

// Environment-driven configuration
pub mod config;

// Unified error type
pub mod error;

// SQLite pool, schema and shared helpers
pub mod store;

// Client identity and mailbox
pub mod client;

// Flow records, request/response ledger and processing queue
pub mod flow;

// Message handler queue and trait
pub mod handler;

// Dispatch loops and the flow engine interface
pub mod runtime;

// HTTP inspection API
pub mod api;

// Server setup and initialization
pub mod server;

pub use client::{ClientId, ClientMessage};
pub use error::{Error, Result};
pub use flow::{Flow, FlowId, FlowRequest, FlowResponse, ResponsePayload, WriteResponsesOutcome};
pub use handler::{MessageHandler, MessageHandlerRequest};
pub use runtime::{FlowEngine, FlowOutput, FlowProcessor, FlowRegistry, LoopHandle};
pub use server::start_server;
pub use store::Store;
