//! Error types for store and dispatch operations.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::client::ClientId;
use crate::flow::FlowId;

/// Result type for all store operations in this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Unified error type for the flow coordination core
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The client was never registered
    #[error("Unknown client: {client_id}")]
    UnknownClient { client_id: ClientId },

    /// No flow record exists for this key
    #[error("Unknown flow: {client_id}/{flow_id}")]
    UnknownFlow { client_id: ClientId, flow_id: FlowId },

    /// Another worker holds the flow lock
    #[error("Flow {client_id}/{flow_id} is already being processed until {deadline}")]
    AlreadyBeingProcessed {
        client_id: ClientId,
        flow_id: FlowId,
        deadline: DateTime<Utc>,
    },

    /// A Status response contradicts the expected count already recorded
    #[error(
        "Expected response count mismatch for {client_id}/{flow_id} request {request_id}: recorded {recorded}, received {received}"
    )]
    ExpectedCountMismatch {
        client_id: ClientId,
        flow_id: FlowId,
        request_id: u64,
        recorded: u64,
        received: u64,
    },

    /// A dispatch loop failed to stop in time
    #[error("Loop '{name}' did not stop within {timeout:?}")]
    ShutdownTimeout { name: String, timeout: Duration },

    /// A dispatch loop task panicked or was aborted before it was stopped
    #[error("Loop '{name}' failed: {reason}")]
    LoopFailed { name: String, reason: String },

    /// Malformed client or flow identifier
    #[error("Invalid identifier: {0}")]
    InvalidId(String),

    /// A stored row could not be decoded
    #[error("Corrupt record: {0}")]
    CorruptRecord(String),

    /// Underlying SQLite failure
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// JSON (de)serialization of payloads
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Create an unknown flow error
    pub fn unknown_flow(client_id: &ClientId, flow_id: &FlowId) -> Self {
        Self::UnknownFlow {
            client_id: client_id.clone(),
            flow_id: flow_id.clone(),
        }
    }

    /// Create an unknown client error
    pub fn unknown_client(client_id: &ClientId) -> Self {
        Self::UnknownClient {
            client_id: client_id.clone(),
        }
    }

    /// Create a corrupt record error
    pub fn corrupt(details: impl Into<String>) -> Self {
        Self::CorruptRecord(details.into())
    }

    /// Whether retrying the same call later can succeed.
    ///
    /// Lock contention and transient database failures are retryable;
    /// referential violations and contradictory input are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::AlreadyBeingProcessed { .. } => true,
            Error::Database(e) => !matches!(e, sqlx::Error::RowNotFound | sqlx::Error::ColumnDecode { .. }),
            _ => false,
        }
    }
}
