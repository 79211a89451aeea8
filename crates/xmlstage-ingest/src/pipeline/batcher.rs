//! Dual-threshold batching
//!
//! Records arrive interleaved by kind; each kind accumulates in its own
//! [`BatchBuilder`] until the row or byte limit is reached.

use std::sync::Arc;

use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::channel::{BoundedReceiver, BoundedSender, Closed};
use super::metrics::PipelineMetrics;
use super::state::StageEvent;
use crate::record::{Batch, BatchId, EntityKind, Record};

/// Hands out batch ids, starting at 1.
#[derive(Debug)]
pub struct BatchSequence {
    next: BatchId,
}

impl Default for BatchSequence {
    fn default() -> Self {
        Self { next: 1 }
    }
}

impl BatchSequence {
    pub fn next_id(&mut self) -> BatchId {
        let id = self.next;
        self.next += 1;
        id
    }
}

/// Accumulates records of one kind.
#[derive(Debug)]
pub struct BatchBuilder {
    kind: EntityKind,
    max_rows: usize,
    max_bytes: usize,
    records: Vec<Record>,
    bytes: usize,
}

impl BatchBuilder {
    pub fn new(kind: EntityKind, max_rows: usize, max_bytes: usize) -> Self {
        Self {
            kind,
            max_rows: max_rows.max(1),
            max_bytes: max_bytes.max(1),
            records: Vec::new(),
            bytes: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Add a record. Yields zero, one or (for a record that alone reaches a
    /// limit while others are pending) two completed batches, in order.
    pub fn push(&mut self, record: Record, ids: &mut BatchSequence) -> impl Iterator<Item = Batch> {
        debug_assert_eq!(record.kind(), self.kind);
        let size = record.estimated_size();

        let before = if !self.records.is_empty()
            && (self.records.len() + 1 > self.max_rows || self.bytes + size > self.max_bytes)
        {
            self.flush(ids)
        } else {
            None
        };

        self.bytes += size;
        self.records.push(record);

        let after = if self.records.len() >= self.max_rows || self.bytes >= self.max_bytes {
            self.flush(ids)
        } else {
            None
        };

        [before, after].into_iter().flatten()
    }

    /// Emit whatever is pending.
    pub fn flush(&mut self, ids: &mut BatchSequence) -> Option<Batch> {
        if self.records.is_empty() {
            return None;
        }
        let records = std::mem::replace(&mut self.records, Vec::with_capacity(self.max_rows.min(4096)));
        let bytes = std::mem::take(&mut self.bytes);
        Some(Batch::new(ids.next_id(), self.kind, records, bytes))
    }
}

/// The batching stage.
pub struct Batcher {
    max_rows: usize,
    max_bytes: usize,
    metrics: Arc<PipelineMetrics>,
}

enum Forward {
    Sent,
    Cancelled,
    NoConsumers,
}

impl Batcher {
    pub fn new(max_rows: usize, max_bytes: usize, metrics: Arc<PipelineMetrics>) -> Self {
        Self {
            max_rows,
            max_bytes,
            metrics,
        }
    }

    pub async fn run(
        self,
        records: BoundedReceiver<Record>,
        mut batches: BoundedSender<Batch>,
        events: UnboundedSender<StageEvent>,
        cancel: CancellationToken,
    ) {
        let mut builders =
            EntityKind::ALL.map(|kind| BatchBuilder::new(kind, self.max_rows, self.max_bytes));
        let mut ids = BatchSequence::default();
        let mut emitted = 0u64;
        let mut batched = 0u64;
        let mut flushed = false;

        'stream: loop {
            let record = tokio::select! {
                biased;
                _ = cancel.cancelled() => break 'stream,
                record = records.recv() => record,
            };

            let Some(record) = record else {
                for builder in builders.iter_mut() {
                    if let Some(batch) = builder.flush(&mut ids) {
                        let rows = batch.len() as u64;
                        match self.forward(&batches, batch, &cancel).await {
                            Forward::Sent => {
                                emitted += 1;
                                batched += rows;
                            },
                            Forward::Cancelled | Forward::NoConsumers => break 'stream,
                        }
                    }
                }
                flushed = true;
                break;
            };

            let kind = record.kind();
            for batch in builders[kind.index()].push(record, &mut ids) {
                let rows = batch.len() as u64;
                match self.forward(&batches, batch, &cancel).await {
                    Forward::Sent => {
                        emitted += 1;
                        batched += rows;
                    },
                    Forward::Cancelled | Forward::NoConsumers => break 'stream,
                }
            }
        }

        if !flushed {
            records.close().await;
            let dropped: usize = builders.iter().map(BatchBuilder::len).sum();
            debug!(dropped_records = dropped, "Batcher stopped before end of stream");
        }
        batches.close();

        info!(batches_emitted = emitted, records_batched = batched, flushed, "Batcher finished");
        let _ = events.send(StageEvent::BatcherFinished {
            batches_emitted: emitted,
            records_batched: batched,
            flushed,
        });
    }

    async fn forward(
        &self,
        batches: &BoundedSender<Batch>,
        batch: Batch,
        cancel: &CancellationToken,
    ) -> Forward {
        let (batch_id, kind, rows) = (batch.id(), batch.kind(), batch.len());
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Forward::Cancelled,
            sent = batches.send(batch) => match sent {
                Ok(()) => {
                    self.metrics.batch_emitted();
                    debug!(batch_id, %kind, rows, "Batch emitted");
                    Forward::Sent
                },
                Err(Closed(_)) => {
                    error!(batch_id, %kind, rows, "No loader workers left to take batch");
                    Forward::NoConsumers
                },
            },
        }
    }
}
