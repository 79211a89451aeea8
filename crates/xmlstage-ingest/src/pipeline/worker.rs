//! Loader workers
//!
//! Each worker takes one batch at a time from the shared batch channel and
//! keeps it until it is loaded or definitively fails. Transient COPY errors
//! are retried with exponential backoff. Cancellation is honoured between
//! batches and during backoff, never while a COPY is in flight.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::channel::BoundedReceiver;
use super::metrics::PipelineMetrics;
use super::state::StageEvent;
use crate::config::{RetryPolicy, TableNames};
use crate::db::{BulkCopySink, CopyRequest};
use crate::error::LoadError;
use crate::record::Batch;

/// Terminal state of one batch in a worker's hands.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchOutcome {
    Loaded {
        attempts: u32,
        latency: Duration,
    },
    Failed {
        attempts: u32,
        error: LoadError,
    },
    Abandoned {
        attempts: u32,
    },
}

pub struct LoaderWorker {
    id: usize,
    sink: Arc<dyn BulkCopySink>,
    tables: Arc<TableNames>,
    retry: RetryPolicy,
    metrics: Arc<PipelineMetrics>,
}

impl LoaderWorker {
    pub fn new(
        id: usize,
        sink: Arc<dyn BulkCopySink>,
        tables: Arc<TableNames>,
        retry: RetryPolicy,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            id,
            sink,
            tables,
            retry,
            metrics,
        }
    }

    pub fn spawn(
        self,
        batches: BoundedReceiver<Batch>,
        events: UnboundedSender<StageEvent>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(self.run(batches, events, cancel))
    }

    pub async fn run(
        self,
        batches: BoundedReceiver<Batch>,
        events: UnboundedSender<StageEvent>,
        cancel: CancellationToken,
    ) {
        debug!(worker = self.id, "Loader worker started");
        let mut loaded = 0u64;

        loop {
            let batch = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                batch = batches.recv() => match batch {
                    Some(batch) => batch,
                    None => break,
                },
            };

            let (batch_id, kind, rows) = (batch.id(), batch.kind(), batch.len());
            let event = match self.load(&batch, &cancel).await {
                BatchOutcome::Loaded { attempts, latency } => {
                    loaded += 1;
                    self.metrics.batch_loaded(kind, rows, latency);
                    StageEvent::BatchLoaded {
                        worker: self.id,
                        batch_id,
                        kind,
                        rows,
                        attempts,
                        latency,
                    }
                },
                BatchOutcome::Failed { attempts, error } => {
                    self.metrics.batch_failed(rows);
                    StageEvent::BatchFailed {
                        worker: self.id,
                        batch_id,
                        kind,
                        rows,
                        attempts,
                        error,
                    }
                },
                BatchOutcome::Abandoned { attempts } => {
                    self.metrics.batch_abandoned();
                    StageEvent::BatchAbandoned {
                        worker: self.id,
                        batch_id,
                        kind,
                        rows,
                        attempts,
                    }
                },
            };
            let _ = events.send(event);
        }

        info!(worker = self.id, batches_loaded = loaded, "Loader worker finished");
        let _ = events.send(StageEvent::WorkerExited { worker: self.id });
    }

    /// Drive one batch to a terminal outcome.
    pub async fn load(&self, batch: &Batch, cancel: &CancellationToken) -> BatchOutcome {
        let request = CopyRequest::for_batch(batch, &self.tables);
        let started = Instant::now();
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let error = match self.sink.copy_in(&request).await {
                Ok(reported) => {
                    if reported != request.rows as u64 {
                        warn!(
                            worker = self.id,
                            batch_id = request.batch_id,
                            expected = request.rows,
                            reported,
                            "COPY row count differs from batch size"
                        );
                    }
                    debug!(
                        worker = self.id,
                        batch_id = request.batch_id,
                        kind = %request.kind,
                        rows = request.rows,
                        attempts,
                        "Batch loaded"
                    );
                    return BatchOutcome::Loaded {
                        attempts,
                        latency: started.elapsed(),
                    };
                },
                Err(error) => error,
            };

            self.metrics.copy_error();

            let retries_used = attempts - 1;
            if !error.is_transient() || retries_used >= self.retry.max_retries {
                error!(
                    worker = self.id,
                    batch_id = request.batch_id,
                    kind = %request.kind,
                    rows = request.rows,
                    attempts,
                    error = %error,
                    "Batch failed"
                );
                return BatchOutcome::Failed { attempts, error };
            }

            if attempts == 1 {
                self.metrics.batch_retried();
            }
            let delay = self.retry.delay_for(retries_used);
            warn!(
                worker = self.id,
                batch_id = request.batch_id,
                attempt = attempts,
                max_retries = self.retry.max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Transient COPY failure, retrying"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(worker = self.id, batch_id = request.batch_id, attempts, "Batch abandoned during backoff");
                    return BatchOutcome::Abandoned { attempts };
                },
                _ = tokio::time::sleep(delay) => {},
            }
        }
    }
}
