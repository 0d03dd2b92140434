//! Flow execution interface and hot-swappable registry
//!
//! What a flow computes when it resumes lives behind [`FlowEngine`]. The
//! dispatcher hands it the locked snapshot plus the contiguous run of ready
//! requests and persists whatever it returns.

use crate::{
    client::ClientMessage,
    flow::{Flow, FlowRequest, ReadyRequest},
    handler::MessageHandlerRequest,
};
use arc_swap::ArcSwap;
use async_trait::async_trait;
use std::{collections::HashMap, fmt, sync::Arc};

/// Everything a flow produced while processing one ready run
#[derive(Debug, Default)]
pub struct FlowOutput {
    /// New requests for this or other flows
    pub requests: Vec<FlowRequest>,
    /// Work items for agents
    pub messages: Vec<ClientMessage>,
    pub handler_requests: Vec<MessageHandlerRequest>,
    /// The flow has nothing left to do
    pub finished: bool,
}

impl FlowOutput {
    /// Output that only marks the flow finished
    pub fn finished() -> Self {
        Self {
            finished: true,
            ..Self::default()
        }
    }
}

/// Resumes a flow with its ready requests.
///
/// May mutate `flow.state` freely; the cursor is advanced by the caller.
#[async_trait]
pub trait FlowEngine: Send + Sync {
    async fn process(&self, flow: &mut Flow, ready: &[ReadyRequest]) -> anyhow::Result<FlowOutput>;
}

/// Lock-free registry routing flows to engines by `flow_name`
///
/// Registering swaps the whole map, so in-flight processing keeps the engine
/// it started with.
pub struct FlowRegistry {
    engines: ArcSwap<HashMap<String, Arc<dyn FlowEngine>>>,
}

impl FlowRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self {
            engines: ArcSwap::new(Arc::new(HashMap::new())),
        }
    }

    /// Add or replace the engine for `flow_name`
    pub fn register(&self, flow_name: impl Into<String>, engine: Arc<dyn FlowEngine>) {
        let flow_name = flow_name.into();
        self.engines.rcu(|current| {
            let mut next = (**current).clone();
            next.insert(flow_name.clone(), Arc::clone(&engine));
            next
        });
        tracing::info!(flow_name = %flow_name, "Registered flow engine");
    }

    /// Returns whether an engine was registered under `flow_name`
    pub fn remove(&self, flow_name: &str) -> bool {
        let mut removed = false;
        self.engines.rcu(|current| {
            let mut next = (**current).clone();
            removed = next.remove(flow_name).is_some();
            next
        });
        if removed {
            tracing::info!(flow_name, "Removed flow engine");
        }
        removed
    }

    /// Engine currently registered for `flow_name`.
    ///
    /// Reads a snapshot, so a concurrent `register` or `remove` is seen by the
    /// next lookup.
    pub fn get(&self, flow_name: &str) -> Option<Arc<dyn FlowEngine>> {
        self.engines.load().get(flow_name).cloned()
    }

    /// Registered flow names, sorted
    pub fn flow_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.engines.load().keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for FlowRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for FlowRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowRegistry")
            .field("flow_names", &self.flow_names())
            .finish()
    }
}

#[async_trait]
impl FlowEngine for FlowRegistry {
    async fn process(&self, flow: &mut Flow, ready: &[ReadyRequest]) -> anyhow::Result<FlowOutput> {
        let engine = self
            .get(&flow.flow_name)
            .ok_or_else(|| anyhow::anyhow!("no flow registered under '{}'", flow.flow_name))?;
        engine.process(flow, ready).await
    }
}
