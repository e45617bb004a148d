//! Stream Connection
//!
//! Consumes the message stream of one chat turn and reduces it to callbacks:
//! any number of `on_message` calls for `complete` chunks, followed by exactly
//! one of `on_complete` / `on_error`. Cancelling silences the connection for
//! good, including chunks that were already received.

use crate::backend::EventStreamSource;
use crate::types::{ClientError, ClientResult, WorkflowRun};
use futures::StreamExt;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Receives the outcome of a stream connection.
pub trait StreamObserver: Send + Sync {
    fn on_message(&self, message: String);
    fn on_complete(&self);
    fn on_error(&self, error: ClientError);
}

pub struct StreamConnection {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl StreamConnection {
    /// Open the stream for `run` in a background task.
    pub fn open(
        source: Arc<dyn EventStreamSource>,
        run: WorkflowRun,
        observer: Arc<dyn StreamObserver>,
    ) -> Self {
        let token = CancellationToken::new();
        let guard = token.clone();

        let task = tokio::spawn(async move {
            let outcome = tokio::select! {
                biased;
                _ = guard.cancelled() => {
                    debug!(run = %run, "Stream cancelled");
                    return;
                }
                outcome = pump(source.as_ref(), &run, observer.as_ref(), &guard) => outcome,
            };

            if guard.is_cancelled() {
                return;
            }
            match outcome {
                Ok(()) => {
                    debug!(run = %run, "Stream finished");
                    observer.on_complete();
                }
                Err(e) => {
                    warn!(run = %run, "Stream error: {}", e);
                    observer.on_error(e);
                }
            }
        });

        Self { token, task }
    }

    /// Stop delivering callbacks. Safe to call any number of times.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// True once the background task has delivered its terminal callback or
    /// observed cancellation
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for StreamConnection {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

async fn pump(
    source: &dyn EventStreamSource,
    run: &WorkflowRun,
    observer: &dyn StreamObserver,
    token: &CancellationToken,
) -> ClientResult<()> {
    let mut stream = source.open_event_stream(run).await?;

    while let Some(item) = stream.next().await {
        let chunk = item?;
        if !chunk.is_terminal() {
            debug!(kind = %chunk.kind, "Skipping intermediate chunk");
            continue;
        }
        if token.is_cancelled() {
            return Ok(());
        }
        observer.on_message(chunk.message.unwrap_or_default());
    }

    Ok(())
}
