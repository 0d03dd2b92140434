//! Client identity and mailbox message types

use crate::{error::Error, flow::FlowId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{fmt, str::FromStr};

/// Opaque agent identifier: `C.` followed by 16 lowercase hex digits
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ClientId(String);

impl ClientId {
    /// Canonical `C.` form, as stored
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for ClientId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let valid = s
            .strip_prefix("C.")
            .map(|hex| {
                hex.len() == 16
                    && hex
                        .chars()
                        .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
            })
            .unwrap_or(false);

        if valid {
            Ok(Self(s.to_string()))
        } else {
            Err(Error::InvalidId(format!("malformed client id '{s}'")))
        }
    }
}

impl TryFrom<String> for ClientId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ClientId> for String {
    fn from(id: ClientId) -> Self {
        id.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A registered agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Client {
    pub client_id: ClientId,
    pub first_seen: DateTime<Utc>,
}

/// A work item queued for delivery to an agent
///
/// Written when a flow dispatches work, leased by the transport layer and
/// deleted on ack, on completion of the flow request it serves, or once it
/// has been leased more times than the mailbox TTL allows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientMessage {
    pub client_id: ClientId,
    /// Message id, unique per client
    pub task_id: u64,
    /// Flow request this message serves, if any
    pub flow_id: Option<FlowId>,
    pub request_id: Option<u64>,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    pub leased_until: Option<DateTime<Utc>>,
    pub leased_by: Option<String>,
    /// Number of times this message has been leased
    pub leased_count: u32,
}

impl ClientMessage {
    /// A message not yet tied to any flow request
    pub fn new(client_id: ClientId, task_id: u64, payload: Value) -> Self {
        Self {
            client_id,
            task_id,
            flow_id: None,
            request_id: None,
            payload,
            created_at: Utc::now(),
            leased_until: None,
            leased_by: None,
            leased_count: 0,
        }
    }

    /// Tie this message to the flow request it carries work for
    pub fn for_request(mut self, flow_id: FlowId, request_id: u64) -> Self {
        self.flow_id = Some(flow_id);
        self.request_id = Some(request_id);
        self
    }

    /// Key to ack this message with once the agent has processed it
    pub fn reference(&self) -> MessageRef {
        MessageRef {
            client_id: self.client_id.clone(),
            task_id: self.task_id,
        }
    }
}

/// Identity of a client message, used for acks
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageRef {
    pub client_id: ClientId,
    pub task_id: u64,
}
