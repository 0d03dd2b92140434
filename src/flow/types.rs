//! Core flow type definitions
//!
//! Flows, their numbered requests, the responses agents send back for them,
//! and the processing notifications that wake a flow up. These are the rows
//! the record store, the ledger and the processing queue persist.

use crate::{client::ClientId, error::Error};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{fmt, str::FromStr};

/// Opaque flow identifier: 8 to 16 uppercase hex digits
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FlowId(String);

impl FlowId {
    /// Fresh random 8-digit id
    pub fn random() -> Self {
        let bits = uuid::Uuid::new_v4().as_u128() as u32;
        Self(format!("{bits:08X}"))
    }

    /// Uppercase hex form
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for FlowId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let valid = (8..=16).contains(&s.len())
            && s.chars().all(|c| c.is_ascii_digit() || ('A'..='F').contains(&c));
        if valid {
            Ok(Self(s.to_string()))
        } else {
            Err(Error::InvalidId(format!("malformed flow id '{s}'")))
        }
    }
}

impl TryFrom<String> for FlowId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<FlowId> for String {
    fn from(id: FlowId) -> Self {
        id.0
    }
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle state recorded on the flow for inspection tooling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowState {
    Running,
    Finished,
    Error,
    Crashed,
}

impl FlowState {
    /// Stable lowercase name, used as the stored column value and in the API
    pub fn as_str(&self) -> &'static str {
        match self {
            FlowState::Running => "running",
            FlowState::Finished => "finished",
            FlowState::Error => "error",
            FlowState::Crashed => "crashed",
        }
    }
}

impl FromStr for FlowState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(FlowState::Running),
            "finished" => Ok(FlowState::Finished),
            "error" => Ok(FlowState::Error),
            "crashed" => Ok(FlowState::Crashed),
            other => Err(Error::corrupt(format!("unknown flow state '{other}'"))),
        }
    }
}

/// A resumable unit of work progressing through ordered numbered requests
///
/// Mutated only by the worker holding its processing lock; see
/// [`Store::read_flow_for_processing`](crate::Store::read_flow_for_processing).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flow {
    pub client_id: ClientId,
    pub flow_id: FlowId,
    pub parent_flow_id: Option<FlowId>,
    /// Selects the flow implementation in the registry
    pub flow_name: String,
    /// Opaque state owned by the flow implementation
    pub state: Value,
    pub flow_state: FlowState,
    /// The only request id this flow may execute next
    pub next_request_to_process: u64,
    pub processing_on: Option<String>,
    pub processing_since: Option<DateTime<Utc>>,
    pub processing_deadline: Option<DateTime<Utc>>,
    /// Set by anyone; honored by the lock holder before its next release
    pub pending_termination: Option<String>,
    pub error_message: Option<String>,
    pub crash_info: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Flow {
    /// A fresh running flow with its cursor at request 0
    pub fn new(client_id: ClientId, flow_id: FlowId, flow_name: impl Into<String>, state: Value) -> Self {
        let now = Utc::now();
        Self {
            client_id,
            flow_id,
            parent_flow_id: None,
            flow_name: flow_name.into(),
            state,
            flow_state: FlowState::Running,
            next_request_to_process: 0,
            processing_on: None,
            processing_since: None,
            processing_deadline: None,
            pending_termination: None,
            error_message: None,
            crash_info: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_parent(mut self, parent_flow_id: FlowId) -> Self {
        self.parent_flow_id = Some(parent_flow_id);
        self
    }

    pub fn is_running(&self) -> bool {
        self.flow_state == FlowState::Running
    }

    /// Mark the flow failed with a message for operators
    pub fn fail(&mut self, message: impl Into<String>) {
        self.flow_state = FlowState::Error;
        self.error_message = Some(message.into());
    }
}

/// Identity of one request within a flow
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestKey {
    pub client_id: ClientId,
    pub flow_id: FlowId,
    pub request_id: u64,
}

/// One step of a flow, waiting on zero or more responses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowRequest {
    pub client_id: ClientId,
    pub flow_id: FlowId,
    pub request_id: u64,
    /// All expected responses have arrived
    pub needs_processing: bool,
    /// Learned from the request's Status response; set at most once
    pub responses_expected: Option<u64>,
    /// Opaque request body for the flow implementation
    pub payload: Value,
    /// Not ready before this instant
    pub start_time: Option<DateTime<Utc>>,
    pub timestamp: DateTime<Utc>,
}

impl FlowRequest {
    /// A request waiting on agent responses.
    ///
    /// Call [`FlowRequest::ready`] for one the flow can process right away.
    pub fn new(client_id: ClientId, flow_id: FlowId, request_id: u64, payload: Value) -> Self {
        Self {
            client_id,
            flow_id,
            request_id,
            needs_processing: false,
            responses_expected: None,
            payload,
            start_time: None,
            timestamp: Utc::now(),
        }
    }

    /// A request that needs no agent responses (e.g. a local callback)
    pub fn ready(mut self) -> Self {
        self.needs_processing = true;
        self
    }

    pub fn with_start_time(mut self, start_time: DateTime<Utc>) -> Self {
        self.start_time = Some(start_time);
        self
    }

    pub fn key(&self) -> RequestKey {
        RequestKey {
            client_id: self.client_id.clone(),
            flow_id: self.flow_id.clone(),
            request_id: self.request_id,
        }
    }
}

/// Outcome reported by an agent in a Status response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Ok,
    Error,
}

/// Terminal response for a request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowStatus {
    pub status: ExecutionStatus,
    /// Number of non-status responses the request receives in total
    pub expected_responses: u64,
    pub error_message: Option<String>,
}

impl FlowStatus {
    /// Successful completion after `expected_responses` data responses
    pub fn ok(expected_responses: u64) -> Self {
        Self {
            status: ExecutionStatus::Ok,
            expected_responses,
            error_message: None,
        }
    }

    /// Failed completion; the flow decides what the failure means
    pub fn error(expected_responses: u64, message: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::Error,
            expected_responses,
            error_message: Some(message.into()),
        }
    }
}

/// Response body, exactly one of the three kinds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum ResponsePayload {
    Data(Value),
    Status(FlowStatus),
    Iterator(Value),
}

impl ResponsePayload {
    /// Stored in the `kind` column so counts can skip status rows
    pub fn kind(&self) -> &'static str {
        match self {
            ResponsePayload::Data(_) => "data",
            ResponsePayload::Status(_) => "status",
            ResponsePayload::Iterator(_) => "iterator",
        }
    }

    /// The status body, if this is a Status response
    pub fn as_status(&self) -> Option<&FlowStatus> {
        match self {
            ResponsePayload::Status(status) => Some(status),
            _ => None,
        }
    }
}

/// One piece of data or status delivered for a request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowResponse {
    pub client_id: ClientId,
    pub flow_id: FlowId,
    pub request_id: u64,
    pub response_id: u64,
    pub payload: ResponsePayload,
    pub timestamp: DateTime<Utc>,
}

impl FlowResponse {
    pub fn new(
        client_id: ClientId,
        flow_id: FlowId,
        request_id: u64,
        response_id: u64,
        payload: ResponsePayload,
    ) -> Self {
        Self {
            client_id,
            flow_id,
            request_id,
            response_id,
            payload,
            timestamp: Utc::now(),
        }
    }

    pub fn key(&self) -> RequestKey {
        RequestKey {
            client_id: self.client_id.clone(),
            flow_id: self.flow_id.clone(),
            request_id: self.request_id,
        }
    }
}

/// A ready request together with its responses sorted by response id
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadyRequest {
    pub request: FlowRequest,
    pub responses: Vec<FlowResponse>,
}

impl ReadyRequest {
    /// Status response among the collected responses
    pub fn status(&self) -> Option<&FlowStatus> {
        self.responses.iter().find_map(|r| r.payload.as_status())
    }
}

/// A stored request in any state with whatever responses it has so far
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestWithResponses {
    pub request: FlowRequest,
    pub responses: Vec<FlowResponse>,
}

/// Durable "this flow has work" notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowProcessingRequest {
    pub client_id: ClientId,
    pub flow_id: FlowId,
    /// Server-assigned; part of the identity acks delete by
    pub timestamp: DateTime<Utc>,
    /// Invisible to leasing until this instant
    pub delivery_time: Option<DateTime<Utc>>,
    pub leased_until: Option<DateTime<Utc>>,
    pub leased_by: Option<String>,
}
