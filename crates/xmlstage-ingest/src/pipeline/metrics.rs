//! Run metrics
//!
//! Lock-free counters written by the stages and read by the progress reporter
//! and the final summary. Counters only increase; the queue gauges go both
//! ways and also keep their peak.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::task::JoinHandle;

use super::channel::DepthGauge;
use crate::record::EntityKind;

#[derive(Debug, Default)]
pub struct PipelineMetrics {
    records_produced: AtomicU64,
    records_loaded: AtomicU64,
    records_failed: AtomicU64,
    records_rejected: AtomicU64,
    produced_by_kind: [AtomicU64; 2],
    loaded_by_kind: [AtomicU64; 2],
    batches_emitted: AtomicU64,
    batches_loaded: AtomicU64,
    batches_failed: AtomicU64,
    batches_retried: AtomicU64,
    batches_abandoned: AtomicU64,
    copy_errors: AtomicU64,
    latency_count: AtomicU64,
    latency_total_us: AtomicU64,
    latency_max_us: AtomicU64,
    record_queue: Arc<DepthGauge>,
    batch_queue: Arc<DepthGauge>,
}

fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_queue(&self) -> Arc<DepthGauge> {
        self.record_queue.clone()
    }

    pub fn batch_queue(&self) -> Arc<DepthGauge> {
        self.batch_queue.clone()
    }

    pub fn record_produced(&self, kind: EntityKind) {
        bump(&self.records_produced, 1);
        bump(&self.produced_by_kind[kind.index()], 1);
    }

    pub fn record_rejected(&self) {
        bump(&self.records_rejected, 1);
    }

    pub fn batch_emitted(&self) {
        bump(&self.batches_emitted, 1);
    }

    pub fn batch_loaded(&self, kind: EntityKind, rows: usize, latency: Duration) {
        let rows = rows as u64;
        bump(&self.batches_loaded, 1);
        bump(&self.records_loaded, rows);
        bump(&self.loaded_by_kind[kind.index()], rows);

        let micros = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        bump(&self.latency_count, 1);
        bump(&self.latency_total_us, micros);
        self.latency_max_us.fetch_max(micros, Ordering::Relaxed);
    }

    pub fn batch_failed(&self, rows: usize) {
        bump(&self.batches_failed, 1);
        bump(&self.records_failed, rows as u64);
    }

    pub fn batch_abandoned(&self) {
        bump(&self.batches_abandoned, 1);
    }

    /// Counted once per batch, however many retries it takes.
    pub fn batch_retried(&self) {
        bump(&self.batches_retried, 1);
    }

    pub fn copy_error(&self) {
        bump(&self.copy_errors, 1);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let latency_count = get(&self.latency_count);
        let avg_us = get(&self.latency_total_us)
            .checked_div(latency_count)
            .unwrap_or(0);

        MetricsSnapshot {
            records_produced: get(&self.records_produced),
            records_loaded: get(&self.records_loaded),
            records_failed: get(&self.records_failed),
            records_rejected: get(&self.records_rejected),
            groups_produced: get(&self.produced_by_kind[EntityKind::Group.index()]),
            events_produced: get(&self.produced_by_kind[EntityKind::Event.index()]),
            groups_loaded: get(&self.loaded_by_kind[EntityKind::Group.index()]),
            events_loaded: get(&self.loaded_by_kind[EntityKind::Event.index()]),
            batches_emitted: get(&self.batches_emitted),
            batches_loaded: get(&self.batches_loaded),
            batches_failed: get(&self.batches_failed),
            batches_retried: get(&self.batches_retried),
            batches_abandoned: get(&self.batches_abandoned),
            copy_errors: get(&self.copy_errors),
            queue_depth_records: self.record_queue.current(),
            queue_depth_records_peak: self.record_queue.peak(),
            queue_depth_batches: self.batch_queue.current(),
            queue_depth_batches_peak: self.batch_queue.peak(),
            batch_latency_avg_ms: avg_us as f64 / 1000.0,
            batch_latency_max_ms: get(&self.latency_max_us) as f64 / 1000.0,
        }
    }
}

/// Point-in-time copy of every metric.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub records_produced: u64,
    pub records_loaded: u64,
    pub records_failed: u64,
    pub records_rejected: u64,
    pub groups_produced: u64,
    pub events_produced: u64,
    pub groups_loaded: u64,
    pub events_loaded: u64,
    pub batches_emitted: u64,
    pub batches_loaded: u64,
    pub batches_failed: u64,
    pub batches_retried: u64,
    pub batches_abandoned: u64,
    pub copy_errors: u64,
    pub queue_depth_records: usize,
    pub queue_depth_records_peak: usize,
    pub queue_depth_batches: usize,
    pub queue_depth_batches_peak: usize,
    pub batch_latency_avg_ms: f64,
    pub batch_latency_max_ms: f64,
}

fn per_sec(delta: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        delta as f64 / secs
    } else {
        0.0
    }
}

/// Log throughput and queue depths every `interval` until aborted.
pub fn spawn_progress_reporter(metrics: Arc<PipelineMetrics>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        let mut last = metrics.snapshot();
        let mut last_at = Instant::now();
        loop {
            ticker.tick().await;
            let now = metrics.snapshot();
            let elapsed = last_at.elapsed();

            tracing::info!(
                groups_per_sec = format_args!("{:.0}", per_sec(now.groups_loaded - last.groups_loaded, elapsed)),
                events_per_sec = format_args!("{:.0}", per_sec(now.events_loaded - last.events_loaded, elapsed)),
                records_produced = now.records_produced,
                records_loaded = now.records_loaded,
                records_rejected = now.records_rejected,
                batches_loaded = now.batches_loaded,
                copy_errors = now.copy_errors,
                queue_records = now.queue_depth_records,
                queue_batches = now.queue_depth_batches,
                "Progress"
            );

            last = now;
            last_at = Instant::now();
        }
    })
}
