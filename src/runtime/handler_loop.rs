//! Message handler dispatch loop
//!
//! One loop per registered handler: lease a batch, hand it to the handler,
//! repeat; back off for the poll interval (or until new requests are written)
//! when the queue is empty. Each batch runs in its own task so a panicking
//! handler loses only that batch, which is redelivered when its lease expires.

use crate::{
    config::{Config, WorkerConfig},
    handler::{MessageHandler, TRACING_TARGET_HANDLER},
    runtime::handle::{panic_message, LoopHandle},
    store::Store,
};
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;

/// Lease and backoff settings for a handler loop
#[derive(Debug, Clone)]
pub struct HandlerLoopOptions {
    pub lease_time: Duration,
    pub limit: usize,
    pub poll_interval: Duration,
}

impl HandlerLoopOptions {
    /// Handler lease, batch size and poll interval from the worker settings
    pub fn from_config(config: &WorkerConfig) -> Self {
        Self {
            lease_time: config.handler_lease(),
            limit: config.handler_batch_limit,
            poll_interval: config.poll_interval(),
        }
    }
}

impl Default for HandlerLoopOptions {
    fn default() -> Self {
        Self::from_config(&Config::default().worker)
    }
}

pub struct MessageHandlerLoop;

impl MessageHandlerLoop {
    /// Spawn the loop for `handler`
    pub fn start(store: Store, handler: Arc<dyn MessageHandler>, options: HandlerLoopOptions) -> LoopHandle {
        let cancel = CancellationToken::new();
        let name = format!("handler:{}", handler.name());
        let task = tokio::spawn(run(store, handler, options, cancel.clone()));
        LoopHandle::new(name, cancel, task)
    }
}

async fn run(store: Store, handler: Arc<dyn MessageHandler>, options: HandlerLoopOptions, cancel: CancellationToken) {
    tracing::info!(
        target: TRACING_TARGET_HANDLER,
        handler = handler.name(),
        limit = options.limit,
        "🚀 Starting message handler loop"
    );

    while !cancel.is_cancelled() {
        // Registered before leasing so a write racing the lease still wakes us
        let written = store.signals().handler_requests.notified();
        tokio::pin!(written);
        written.as_mut().enable();

        match store
            .lease_message_handler_requests(handler.name(), options.lease_time, options.limit)
            .await
        {
            Ok(requests) if !requests.is_empty() => {
                let count = requests.len();
                let batch_handler = Arc::clone(&handler);
                let batch_store = store.clone();
                let outcome =
                    tokio::spawn(async move { batch_handler.handle(&batch_store, requests).await }).await;
                match outcome {
                    Ok(Ok(())) => tracing::debug!(
                        target: TRACING_TARGET_HANDLER,
                        handler = handler.name(),
                        count,
                        "Handled message handler requests"
                    ),
                    Ok(Err(e)) => tracing::error!(
                        target: TRACING_TARGET_HANDLER,
                        handler = handler.name(),
                        count,
                        error = %e,
                        "Message handler failed"
                    ),
                    Err(join_error) => tracing::error!(
                        target: TRACING_TARGET_HANDLER,
                        handler = handler.name(),
                        count,
                        panic = %panic_message(join_error),
                        "💥 Message handler panicked"
                    ),
                }
                continue;
            }
            Ok(_) => {}
            Err(e) => tracing::error!(
                target: TRACING_TARGET_HANDLER,
                handler = handler.name(),
                error = %e,
                "Failed to lease message handler requests"
            ),
        }

        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            () = &mut written => {}
            () = tokio::time::sleep(options.poll_interval) => {}
        }
    }

    tracing::info!(
        target: TRACING_TARGET_HANDLER,
        handler = handler.name(),
        "Message handler loop stopped"
    );
}
