//! Lifecycle handle for background dispatch loops

use crate::error::{Error, Result};
use std::time::Duration;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;

/// Tracing target for dispatch loops.
pub const TRACING_TARGET_DISPATCH: &str = "flowkeeper::dispatch";

/// A running loop: cancel it and join it with [`LoopHandle::stop`]
#[derive(Debug)]
pub struct LoopHandle {
    name: String,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl LoopHandle {
    pub(crate) fn new(name: impl Into<String>, cancel: CancellationToken, task: JoinHandle<()>) -> Self {
        Self {
            name: name.into(),
            cancel,
            task,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the loop task has exited, normally or not
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Signal the loop to stop and wait up to `timeout` for it to exit.
    ///
    /// A loop that does not exit in time is aborted and reported as
    /// [`Error::ShutdownTimeout`]; it is most likely stuck in a handler.
    /// A loop task that already died is reported as [`Error::LoopFailed`].
    pub async fn stop(mut self, timeout: Duration) -> Result<()> {
        tracing::info!(target: TRACING_TARGET_DISPATCH, name = %self.name, "⏹️ Stopping loop");
        self.cancel.cancel();

        match tokio::time::timeout(timeout, &mut self.task).await {
            Ok(Ok(())) => {
                tracing::info!(target: TRACING_TARGET_DISPATCH, name = %self.name, "Loop stopped");
                Ok(())
            }
            Ok(Err(join_error)) => {
                let reason = panic_message(join_error);
                tracing::error!(
                    target: TRACING_TARGET_DISPATCH,
                    name = %self.name,
                    error = %reason,
                    "Loop exited abnormally"
                );
                Err(Error::LoopFailed {
                    name: self.name,
                    reason,
                })
            }
            Err(_) => {
                self.task.abort();
                tracing::error!(
                    target: TRACING_TARGET_DISPATCH,
                    name = %self.name,
                    timeout_ms = timeout.as_millis() as u64,
                    "Loop failed to stop in time"
                );
                Err(Error::ShutdownTimeout {
                    name: self.name,
                    timeout,
                })
            }
        }
    }
}

/// Render a failed task's panic payload, or the join error itself for a
/// cancelled task
pub(crate) fn panic_message(join_error: JoinError) -> String {
    if !join_error.is_panic() {
        return join_error.to_string();
    }
    let payload = join_error.into_panic();
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "task panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stop_cooperative_loop() {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task = tokio::spawn(async move { token.cancelled().await });

        let handle = LoopHandle::new("cooperative", cancel, task);
        assert_eq!(handle.name(), "cooperative");
        handle.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_stuck_loop_times_out() {
        let task = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });

        let handle = LoopHandle::new("stuck", CancellationToken::new(), task);
        let err = handle.stop(Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, Error::ShutdownTimeout { ref name, .. } if name == "stuck"));
    }

    #[tokio::test]
    async fn test_panicked_loop_reports_failure() {
        let task = tokio::spawn(async {
            panic!("lost the database");
        });
        while !task.is_finished() {
            tokio::task::yield_now().await;
        }

        let handle = LoopHandle::new("crashed", CancellationToken::new(), task);
        assert!(handle.is_finished());
        let err = handle.stop(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(
            err,
            Error::LoopFailed { ref name, ref reason } if name == "crashed" && reason == "lost the database"
        ));
    }
}
