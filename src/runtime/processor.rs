//! Flow processing dispatch loop
//!
//! Polls the flow processing queue and hands every leased notification to a
//! bounded pool of workers. Each worker takes the flow lock, feeds the ready
//! run at the cursor to the [`FlowEngine`], persists what it produced and
//! releases the lock, re-running in place whenever the release is refused
//! because more work became ready meanwhile.

use crate::{
    config::{Config, WorkerConfig},
    error::{Error, Result},
    flow::{Flow, FlowProcessingRequest, FlowState, RequestKey},
    runtime::{
        engine::{FlowEngine, FlowOutput},
        handle::{panic_message, LoopHandle, TRACING_TARGET_DISPATCH},
    },
    store::Store,
};
use std::{sync::Arc, time::Duration};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// Pool and lease settings for the flow processor
#[derive(Debug, Clone)]
pub struct ProcessorOptions {
    /// Concurrent flows per processor
    pub pool_size: usize,
    /// How long a worker may hold a flow lock
    pub flow_lease: Duration,
    /// How long a leased notification stays invisible to other pollers
    pub processing_lease: Duration,
    pub batch_limit: usize,
    pub poll_interval: Duration,
}

impl ProcessorOptions {
    /// Pool size, leases and batch limits from the worker settings
    pub fn from_config(config: &WorkerConfig) -> Self {
        Self {
            pool_size: config.pool_size.max(1),
            flow_lease: config.flow_lease(),
            processing_lease: config.processing_lease(),
            batch_limit: config.batch_limit.max(1),
            poll_interval: config.poll_interval(),
        }
    }
}

impl Default for ProcessorOptions {
    fn default() -> Self {
        Self::from_config(&Config::default().worker)
    }
}

pub struct FlowProcessor;

impl FlowProcessor {
    /// Spawn the dispatch loop. Stopping it also waits for in-flight workers.
    pub fn start(store: Store, engine: Arc<dyn FlowEngine>, options: ProcessorOptions) -> LoopHandle {
        let cancel = CancellationToken::new();
        let name = format!("flow-processor:{}", store.owner());
        let worker = Arc::new(FlowWorker {
            store,
            engine,
            flow_lease: options.flow_lease,
        });
        let task = tokio::spawn(run(worker, options, cancel.clone()));
        LoopHandle::new(name, cancel, task)
    }
}

async fn run(worker: Arc<FlowWorker>, options: ProcessorOptions, cancel: CancellationToken) {
    let semaphore = Arc::new(Semaphore::new(options.pool_size));
    let store = worker.store.clone();

    tracing::info!(
        target: TRACING_TARGET_DISPATCH,
        owner = %store.owner(),
        pool_size = options.pool_size,
        batch_limit = options.batch_limit,
        "🚀 Starting flow processor"
    );

    while !cancel.is_cancelled() {
        let enqueued = store.signals().flow_processing.notified();
        tokio::pin!(enqueued);

        let free = semaphore.available_permits().min(options.batch_limit);
        if free == 0 {
            // Pool saturated: wait for a worker to finish before leasing more
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                permit = semaphore.acquire() => drop(permit),
            }
            continue;
        }

        match store
            .lease_flow_processing_requests(options.processing_lease, free)
            .await
        {
            Ok(batch) if !batch.is_empty() => {
                for notification in batch {
                    let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                        tracing::error!(target: TRACING_TARGET_DISPATCH, "Worker pool closed");
                        return;
                    };
                    let worker = Arc::clone(&worker);
                    tokio::spawn(async move {
                        let _permit = permit;
                        worker.process(notification).await;
                    });
                }
                continue;
            }
            Ok(_) => {}
            Err(e) => tracing::error!(
                target: TRACING_TARGET_DISPATCH,
                error = %e,
                "Failed to lease flow processing requests"
            ),
        }

        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            () = &mut enqueued => {}
            () = tokio::time::sleep(options.poll_interval) => {}
        }
    }

    // Drain: every permit back means every worker finished
    let permits = u32::try_from(options.pool_size).unwrap_or(u32::MAX);
    if semaphore.acquire_many(permits).await.is_err() {
        tracing::error!(target: TRACING_TARGET_DISPATCH, "Worker pool closed while draining");
    }

    tracing::info!(
        target: TRACING_TARGET_DISPATCH,
        owner = %store.owner(),
        "Flow processor stopped"
    );
}

/// Processes one notification at a time; shared by all pool tasks
struct FlowWorker {
    store: Store,
    engine: Arc<dyn FlowEngine>,
    flow_lease: Duration,
}

impl FlowWorker {
    /// Handle a notification and ack it unless handling failed
    async fn process(&self, notification: FlowProcessingRequest) {
        match self.handle(&notification).await {
            Ok(()) => {
                if let Err(e) = self.store.ack_flow_processing_requests(&[notification]).await {
                    tracing::error!(
                        target: TRACING_TARGET_DISPATCH,
                        error = %e,
                        "Failed to ack flow processing request"
                    );
                }
            }
            // Unacked: redelivered once the processing lease expires
            Err(e) => tracing::error!(
                target: TRACING_TARGET_DISPATCH,
                client_id = %notification.client_id,
                flow_id = %notification.flow_id,
                error = %e,
                retryable = e.is_retryable(),
                "Flow processing failed"
            ),
        }
    }

    async fn handle(&self, notification: &FlowProcessingRequest) -> Result<()> {
        let client_id = &notification.client_id;
        let flow_id = &notification.flow_id;

        let flow = match self
            .store
            .read_flow_for_processing(client_id, flow_id, self.flow_lease)
            .await
        {
            Ok(flow) => flow,
            Err(Error::AlreadyBeingProcessed { deadline, .. }) => {
                // Retry once the current holder's lease runs out
                self.store
                    .enqueue_flow_processing_request(client_id, flow_id, Some(deadline))
                    .await?;
                tracing::debug!(
                    target: TRACING_TARGET_DISPATCH,
                    client_id = %client_id,
                    flow_id = %flow_id,
                    %deadline,
                    "Flow busy, rescheduled notification"
                );
                return Ok(());
            }
            Err(Error::UnknownFlow { .. }) => {
                tracing::warn!(
                    target: TRACING_TARGET_DISPATCH,
                    client_id = %client_id,
                    flow_id = %flow_id,
                    "Dropping notification for unknown flow"
                );
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        self.run_locked(flow).await
    }

    async fn run_locked(&self, mut flow: Flow) -> Result<()> {
        if let Some(reason) = flow.pending_termination.clone() {
            if flow.is_running() {
                return self.terminate(flow, reason).await;
            }
        }
        if !flow.is_running() {
            return self.discard_and_release(&flow).await;
        }

        let mut consumed = Vec::new();
        loop {
            let ready = self
                .store
                .read_requests_ready_for_processing(&flow.client_id, &flow.flow_id, flow.next_request_to_process)
                .await?;

            if let Some(last) = ready.last() {
                let next_cursor = last.request.request_id + 1;
                let keys: Vec<RequestKey> = ready.iter().map(|r| r.request.key()).collect();

                tracing::debug!(
                    target: TRACING_TARGET_DISPATCH,
                    client_id = %flow.client_id,
                    flow_id = %flow.flow_id,
                    cursor = flow.next_request_to_process,
                    ready = ready.len(),
                    "Running flow"
                );

                let engine = Arc::clone(&self.engine);
                let mut snapshot = flow.clone();
                let run = tokio::spawn(async move {
                    let output = engine.process(&mut snapshot, &ready).await;
                    (snapshot, output)
                });

                match run.await {
                    Ok((updated, Ok(output))) => {
                        flow = updated;
                        flow.next_request_to_process = next_cursor;
                        consumed.extend(keys);
                        self.persist_output(&mut flow, output).await?;
                    }
                    Ok((_, Err(e))) => {
                        tracing::error!(
                            target: TRACING_TARGET_DISPATCH,
                            client_id = %flow.client_id,
                            flow_id = %flow.flow_id,
                            error = %e,
                            "Flow failed"
                        );
                        flow.fail(format!("{e:#}"));
                        return self.discard_and_release(&flow).await;
                    }
                    Err(join_error) => {
                        let crash_info = panic_message(join_error);
                        tracing::error!(
                            target: TRACING_TARGET_DISPATCH,
                            client_id = %flow.client_id,
                            flow_id = %flow.flow_id,
                            crash_info = %crash_info,
                            "💥 Flow crashed"
                        );
                        flow.flow_state = FlowState::Crashed;
                        flow.crash_info = Some(crash_info);
                        return self.discard_and_release(&flow).await;
                    }
                }
            }

            // Cooperative cancellation: the holder checks before every release
            let current = self.store.read_flow(&flow.client_id, &flow.flow_id).await?;
            if let Some(reason) = current.pending_termination {
                return self.terminate(flow, reason).await;
            }

            if !flow.is_running() {
                return self.discard_and_release(&flow).await;
            }

            if self.store.return_processed_flow(&flow).await? {
                break;
            }
            tracing::debug!(
                target: TRACING_TARGET_DISPATCH,
                client_id = %flow.client_id,
                flow_id = %flow.flow_id,
                cursor = flow.next_request_to_process,
                "Release refused, processing newly ready requests in place"
            );
        }

        self.store.delete_requests(&consumed).await?;
        Ok(())
    }

    async fn persist_output(&self, flow: &mut Flow, output: FlowOutput) -> Result<()> {
        self.store.write_requests(&output.requests).await?;
        self.store.write_messages(&output.messages).await?;
        self.store
            .write_message_handler_requests(&output.handler_requests)
            .await?;

        if output.finished {
            flow.flow_state = FlowState::Finished;
            tracing::info!(
                target: TRACING_TARGET_DISPATCH,
                client_id = %flow.client_id,
                flow_id = %flow.flow_id,
                flow_name = %flow.flow_name,
                "🏁 Flow finished"
            );
        }
        Ok(())
    }

    async fn terminate(&self, mut flow: Flow, reason: String) -> Result<()> {
        tracing::info!(
            target: TRACING_TARGET_DISPATCH,
            client_id = %flow.client_id,
            flow_id = %flow.flow_id,
            reason = %reason,
            "🛑 Terminating flow"
        );
        flow.fail(reason);
        self.discard_and_release(&flow).await
    }

    /// Drop every outstanding request of a flow that will not run again and
    /// persist its final record
    async fn discard_and_release(&self, flow: &Flow) -> Result<()> {
        loop {
            self.store
                .delete_all_requests_and_responses(&flow.client_id, &flow.flow_id)
                .await?;
            if self.store.return_processed_flow(flow).await? {
                return Ok(());
            }
        }
    }
}
