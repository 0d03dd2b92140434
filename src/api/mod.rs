//! HTTP API layer
//!
//! Thin inspection surface over the store:
//! - Flow records, child flows and outstanding requests per client
//! - Cooperative flow termination
//! - The flow processing queue

// Flow inspection endpoints
pub mod flows;

pub use flows::{create_flow_routes, AppState, TRACING_TARGET_API};
