//! Producer stage
//!
//! Parsing is synchronous and CPU bound, so the reader runs on the blocking
//! pool and hands records to the async side through the bounded record
//! channel. A full channel blocks the parser; nothing is read ahead.

use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::channel::{BoundedSender, Closed};
use super::metrics::PipelineMetrics;
use super::state::StageEvent;
use crate::config::{ParseErrorPolicy, XmlConfig};
use crate::record::Record;
use crate::xml::{RecordReader, XmlSource};

pub struct Producer {
    xml: XmlConfig,
    policy: ParseErrorPolicy,
    metrics: Arc<PipelineMetrics>,
}

enum Hand {
    Sent,
    Cancelled,
    Closed,
}

impl Producer {
    pub fn new(xml: XmlConfig, policy: ParseErrorPolicy, metrics: Arc<PipelineMetrics>) -> Self {
        Self { xml, policy, metrics }
    }

    /// Run the producer on the blocking pool. Must be called from within a
    /// Tokio runtime.
    pub fn spawn(
        self,
        source: XmlSource,
        records: BoundedSender<Record>,
        events: UnboundedSender<StageEvent>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let handle = Handle::current();
        tokio::task::spawn_blocking(move || self.run(&handle, source, records, events, cancel))
    }

    fn run(
        self,
        handle: &Handle,
        source: XmlSource,
        mut records: BoundedSender<Record>,
        events: UnboundedSender<StageEvent>,
        cancel: CancellationToken,
    ) {
        let description = source.describe();
        let input = match source.open(self.xml.buffer_size) {
            Ok(input) => input,
            Err(e) => {
                records.close();
                let _ = events.send(StageEvent::SourceFailed(format!("{}: {}", description, e)));
                let _ = events.send(StageEvent::ProducerFinished {
                    produced: 0,
                    stats: Default::default(),
                    end_of_stream: false,
                });
                return;
            },
        };
        info!(source = %description, policy = %self.policy, "Parsing started");

        let mut reader = RecordReader::new(input, &self.xml);
        let mut produced = 0u64;
        let mut end_of_stream = true;

        for item in reader.by_ref() {
            if cancel.is_cancelled() {
                end_of_stream = false;
                break;
            }

            match item {
                Ok(record) => {
                    let kind = record.kind();
                    match Self::hand_off(handle, &records, record, &cancel) {
                        Hand::Sent => {
                            produced += 1;
                            self.metrics.record_produced(kind);
                        },
                        Hand::Cancelled | Hand::Closed => {
                            end_of_stream = false;
                            break;
                        },
                    }
                },
                Err(e) if e.recoverable && self.policy == ParseErrorPolicy::Skip => {
                    warn!(position = %e.position, error = %e, "Skipping malformed element");
                    self.metrics.record_rejected();
                    let _ = events.send(StageEvent::Rejected(e));
                },
                Err(e) => {
                    warn!(position = %e.position, error = %e, "Parsing aborted");
                    let _ = events.send(StageEvent::ParseAborted(e));
                    end_of_stream = false;
                    break;
                },
            }
        }

        records.close();
        let stats = reader.stats();
        info!(
            records_produced = produced,
            groups = stats.groups_emitted,
            events = stats.events_emitted,
            skipped = stats.skipped,
            end_of_stream,
            "Parsing finished"
        );
        let _ = events.send(StageEvent::ProducerFinished {
            produced,
            stats,
            end_of_stream,
        });
    }

    fn hand_off(
        handle: &Handle,
        records: &BoundedSender<Record>,
        record: Record,
        cancel: &CancellationToken,
    ) -> Hand {
        handle.block_on(async {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Hand::Cancelled,
                sent = records.send(record) => match sent {
                    Ok(()) => Hand::Sent,
                    Err(Closed(_)) => {
                        debug!("Record channel closed by consumer");
                        Hand::Closed
                    },
                },
            }
        })
    }
}
