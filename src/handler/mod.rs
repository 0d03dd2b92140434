//! Message handlers
//!
//! Named consumers of [`MessageHandlerRequest`]s, each driven by its own
//! dispatch loop (see [`crate::runtime::MessageHandlerLoop`]).

// Lease/delete queue over message_handler_requests
pub mod queue;

pub use queue::{MessageHandlerRequest, TRACING_TARGET_HANDLER};

use crate::store::Store;
use async_trait::async_trait;

/// A consumer of one named stream of handler requests.
///
/// The handler owns deletion: anything it does not delete is leased again
/// once the lease expires.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Queue partition this handler consumes
    fn name(&self) -> &str;

    async fn handle(&self, store: &Store, requests: Vec<MessageHandlerRequest>) -> anyhow::Result<()>;
}
