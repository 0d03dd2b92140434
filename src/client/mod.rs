//! Client layer
//!
//! Agent identity plus the durable per-client mailbox of work items.

// Client ids and mailbox message types
pub mod types;

// Lease/ack/TTL-drop queue over the client_messages table
pub mod mailbox;

pub use mailbox::TRACING_TARGET_MAILBOX;
pub use types::{Client, ClientId, ClientMessage, MessageRef};
