//! Boundary to hosted application logic.
//!
//! A unit can host one [`Executor`]: something that maps a batch of records to
//! a batch of the same length. Work reaches it through a bounded channel; the
//! serving runtime drains that channel while it runs.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::control::ShutdownHandle;
use crate::error::ExecutorError;

pub type Record = serde_json::Value;

pub trait Executor: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Transforms `records`, returning exactly one output per input.
    fn apply(&self, records: &[Record]) -> anyhow::Result<Vec<Record>>;

    /// Largest batch passed to `apply` at once; 0 means unbatched.
    fn batch_size(&self) -> usize {
        0
    }
}

/// Runs `executor` over `records` in chunks of `batch_size`.
pub fn apply_batched(
    executor: &dyn Executor,
    records: &[Record],
    batch_size: usize,
) -> Result<Vec<Record>, ExecutorError> {
    if records.is_empty() {
        return Ok(Vec::new());
    }
    let chunk = if batch_size == 0 { records.len() } else { batch_size };

    let mut outputs = Vec::with_capacity(records.len());
    for batch in records.chunks(chunk) {
        let out = executor.apply(batch).map_err(|source| ExecutorError::Apply {
            executor: executor.name().to_string(),
            source,
        })?;
        if out.len() != batch.len() {
            warn!(
                executor = executor.name(),
                expected = batch.len(),
                actual = out.len(),
                "Executor output length does not match its input"
            );
            return Err(ExecutorError::LengthMismatch {
                executor: executor.name().to_string(),
                expected: batch.len(),
                actual: out.len(),
            });
        }
        outputs.extend(out);
    }
    Ok(outputs)
}

struct WorkItem {
    records: Vec<Record>,
    reply: oneshot::Sender<Result<Vec<Record>, ExecutorError>>,
}

/// Submits work to a running unit.
#[derive(Clone)]
pub struct WorkSender {
    tx: mpsc::Sender<WorkItem>,
}

pub struct WorkReceiver {
    rx: mpsc::Receiver<WorkItem>,
}

pub fn work_channel(capacity: usize) -> (WorkSender, WorkReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (WorkSender { tx }, WorkReceiver { rx })
}

impl WorkSender {
    pub async fn submit(&self, records: Vec<Record>) -> Result<Vec<Record>, ExecutorError> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(WorkItem { records, reply })
            .await
            .map_err(|_| ExecutorError::Closed)?;
        response.await.map_err(|_| ExecutorError::Closed)?
    }
}

/// An executor paired with its inbox, served by a runtime.
pub struct HostedExecutor {
    executor: Arc<dyn Executor>,
    inbox: WorkReceiver,
}

impl HostedExecutor {
    pub fn new(executor: Arc<dyn Executor>, inbox: WorkReceiver) -> Self {
        Self { executor, inbox }
    }

    /// Applies submitted batches until `shutdown` fires or all senders are gone.
    ///
    /// A failing batch is reported to its submitter only.
    pub async fn serve(mut self, shutdown: ShutdownHandle) {
        debug!(executor = self.executor.name(), "Executor inbox open");
        loop {
            let item = tokio::select! {
                item = self.inbox.rx.recv() => item,
                _ = shutdown.wait() => break,
            };
            let Some(WorkItem { records, reply }) = item else {
                shutdown.wait().await;
                break;
            };

            let executor = Arc::clone(&self.executor);
            let result = tokio::task::spawn_blocking(move || {
                apply_batched(executor.as_ref(), &records, executor.batch_size())
            })
            .await
            .unwrap_or_else(|e| {
                Err(ExecutorError::Apply {
                    executor: self.executor.name().to_string(),
                    source: anyhow::anyhow!("executor panicked: {}", e),
                })
            });
            if let Err(e) = &result {
                warn!(executor = self.executor.name(), error = %e, kind = e.as_label(), "Batch failed");
            }
            let _ = reply.send(result);
        }
        self.inbox.rx.close();
        debug!(executor = self.executor.name(), "Executor inbox closed");
    }
}
