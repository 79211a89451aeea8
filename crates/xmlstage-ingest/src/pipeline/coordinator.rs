//! Run coordinator
//!
//! Wires producer, batcher and loader workers together, owns the
//! [`RunState`], and decides when staging may be finalized. Stages never see
//! each other's state; they report through one unbounded event channel and
//! stop when the run's cancellation token fires.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::batcher::Batcher;
use super::channel::bounded;
use super::metrics::{spawn_progress_reporter, MetricsSnapshot, PipelineMetrics};
use super::producer::Producer;
use super::state::{RunPhase, RunState, RunStatus, StageEvent};
use super::worker::LoaderWorker;
use crate::config::PipelineConfig;
use crate::db::{finalize_all, BulkCopySink, FinalizeReport, Finalizer};
use crate::error::{CancelReason, PipelineError};
use crate::xml::{ReaderStats, XmlSource};

/// What a finished run reports back.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub phase: RunPhase,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub records_produced: u64,
    pub records_loaded: u64,
    pub records_rejected: u64,
    pub records_failed: u64,
    /// Loaded rows that finalize left out because their parent never made
    /// it to the final table.
    pub records_orphaned: u64,
    pub reader: ReaderStats,
    pub metrics: MetricsSnapshot,
    pub finalized: Vec<FinalizeReport>,
    pub first_error: Option<PipelineError>,
}

impl RunSummary {
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Done
    }
}

type StageExit = (&'static str, Result<(), JoinError>);

/// Stage tasks, yielding each one as it exits.
type Stages = FuturesUnordered<BoxFuture<'static, StageExit>>;

fn watch(stages: &Stages, stage: &'static str, handle: JoinHandle<()>) {
    stages.push(async move { (stage, handle.await) }.boxed());
}

pub struct Coordinator {
    config: PipelineConfig,
    sink: Arc<dyn BulkCopySink>,
    finalizer: Arc<dyn Finalizer>,
    cancel: CancellationToken,
}

impl Coordinator {
    pub fn new(
        config: PipelineConfig,
        sink: Arc<dyn BulkCopySink>,
        finalizer: Arc<dyn Finalizer>,
    ) -> Self {
        Self {
            config,
            sink,
            finalizer,
            cancel: CancellationToken::new(),
        }
    }

    /// Use an externally owned token. Cancelling it stops the current run
    /// with status `Cancelled`.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Parse `source`, load it into staging and, if every batch landed,
    /// finalize. Never panics on stage failures; everything ends up in the
    /// summary.
    pub async fn run(&self, source: XmlSource) -> RunSummary {
        let run_id = Uuid::new_v4();
        let span = info_span!("run", %run_id);
        self.execute(run_id, source).instrument(span).await
    }

    async fn execute(&self, run_id: Uuid, source: XmlSource) -> RunSummary {
        let started_at = Utc::now();
        let started = Instant::now();
        let metrics = Arc::new(PipelineMetrics::new());
        let mut state = RunState::new(run_id);
        let run_cancel = self.cancel.child_token();
        let mut finalized = Vec::new();

        info!(
            source = %source.describe(),
            workers = self.config.workers,
            batch_max_rows = self.config.batch_max_rows,
            batch_max_bytes = self.config.batch_max_bytes,
            policy = %self.config.parse_error_policy,
            "Run started"
        );

        advance(&mut state, RunPhase::Parsing);
        let (mut stages, events) = self.spawn_stages(source, &metrics, &run_cancel);
        advance(&mut state, RunPhase::Loading);

        let reporter = spawn_progress_reporter(metrics.clone(), self.config.progress_interval);
        self.drain_events(&mut state, events, &mut stages, &run_cancel).await;
        join_stages(&mut state, stages, &run_cancel).await;
        reporter.abort();

        if state.first_error().is_none() {
            if let Err(message) = state.check_barrier(self.config.workers) {
                fail(&mut state, PipelineError::Accounting { message }, &run_cancel);
            }
        }

        if state.first_error().is_none() {
            advance(&mut state, RunPhase::Finalizing);
            match finalize_all(self.finalizer.as_ref()).await {
                Ok(reports) => {
                    finalized = reports;
                    advance(&mut state, RunPhase::Done);
                },
                Err((kind, e)) => {
                    let error = PipelineError::Finalize {
                        kind,
                        message: format!("{:#}", e),
                    };
                    fail(&mut state, error, &run_cancel);
                },
            }
        } else {
            info!("Skipping finalize, staging left as loaded");
        }

        let records_orphaned = finalized.iter().map(|r| r.orphaned).sum();
        let finished_at = Utc::now();
        let summary = RunSummary {
            run_id,
            status: state.status(),
            phase: state.phase(),
            started_at,
            finished_at,
            elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            records_produced: state.records_produced(),
            records_loaded: state.records_loaded(),
            records_rejected: state.records_rejected(),
            records_failed: state.records_failed(),
            records_orphaned,
            reader: state.reader_stats(),
            metrics: metrics.snapshot(),
            finalized,
            first_error: state.first_error().cloned(),
        };
        log_summary(&summary);
        summary
    }

    fn spawn_stages(
        &self,
        source: XmlSource,
        metrics: &Arc<PipelineMetrics>,
        cancel: &CancellationToken,
    ) -> (Stages, UnboundedReceiver<StageEvent>) {
        let config = &self.config;
        let (events_tx, events_rx) = unbounded_channel();
        let (record_tx, record_rx) = bounded(config.channel_capacity, metrics.record_queue());
        let (batch_tx, batch_rx) = bounded(config.batch_channel_capacity, metrics.batch_queue());

        let stages = Stages::new();

        let producer = Producer::new(config.xml.clone(), config.parse_error_policy, metrics.clone())
            .spawn(source, record_tx, events_tx.clone(), cancel.clone());
        watch(&stages, "producer", producer);

        let batcher = Batcher::new(config.batch_max_rows, config.batch_max_bytes, metrics.clone());
        let batcher =
            tokio::spawn(batcher.run(record_rx, batch_tx, events_tx.clone(), cancel.clone()));
        watch(&stages, "batcher", batcher);

        let tables = Arc::new(config.tables.clone());
        for id in 0..config.workers {
            let worker = LoaderWorker::new(
                id,
                self.sink.clone(),
                tables.clone(),
                config.retry,
                metrics.clone(),
            )
            .spawn(batch_rx.clone(), events_tx.clone(), cancel.clone());
            watch(&stages, "loader", worker);
        }
        drop(batch_rx);
        drop(events_tx);

        debug!(workers = config.workers, "Stages spawned");
        (stages, events_rx)
    }

    /// Apply stage events until every stage has dropped its sender. A stage
    /// that dies meanwhile fails the run right away.
    async fn drain_events(
        &self,
        state: &mut RunState,
        mut events: UnboundedReceiver<StageEvent>,
        stages: &mut Stages,
        run_cancel: &CancellationToken,
    ) {
        let deadline = self
            .config
            .run_timeout
            .map(|timeout| tokio::time::Instant::now() + timeout);
        let mut timed_out = false;
        let mut cancel_seen = false;

        loop {
            // Stop signals first so they are recorded before the stages
            // they stopped report in.
            tokio::select! {
                biased;
                _ = self.cancel.cancelled(), if !cancel_seen => {
                    cancel_seen = true;
                    warn!("Cancellation requested");
                    fail(state, PipelineError::Cancelled { reason: CancelReason::Requested }, run_cancel);
                },
                _ = wait_until(deadline), if !timed_out => {
                    timed_out = true;
                    warn!(timeout = ?self.config.run_timeout, "Run timeout elapsed");
                    fail(state, PipelineError::Cancelled { reason: CancelReason::Timeout }, run_cancel);
                },
                Some((stage, joined)) = stages.next(), if !stages.is_empty() => {
                    on_stage_exit(state, stage, joined, run_cancel);
                },
                event = events.recv() => match event {
                    Some(event) => apply(state, event, run_cancel),
                    None => break,
                },
            }
        }
    }
}

fn apply(state: &mut RunState, event: StageEvent, run_cancel: &CancellationToken) {
    match event {
        StageEvent::Rejected(e) => {
            debug!(position = %e.position, "Element rejected");
            state.on_rejected();
        },
        StageEvent::ParseAborted(e) => fail(state, PipelineError::Parse(e), run_cancel),
        StageEvent::SourceFailed(message) => {
            fail(state, PipelineError::Source { message }, run_cancel)
        },
        StageEvent::ProducerFinished {
            produced,
            stats,
            end_of_stream,
        } => state.on_producer_finished(produced, stats, end_of_stream),
        StageEvent::BatcherFinished {
            batches_emitted,
            records_batched,
            flushed,
        } => state.on_batcher_finished(batches_emitted, records_batched, flushed),
        StageEvent::BatchLoaded { rows, .. } => state.on_batch_loaded(rows),
        StageEvent::BatchFailed {
            batch_id,
            kind,
            rows,
            attempts,
            error,
            ..
        } => {
            state.on_batch_failed(rows);
            let error = PipelineError::PermanentLoad {
                batch_id,
                kind,
                rows,
                attempts,
                message: error.to_string(),
            };
            fail(state, error, run_cancel);
        },
        StageEvent::BatchAbandoned { rows, .. } => state.on_batch_abandoned(rows),
        StageEvent::WorkerExited { .. } => state.on_worker_exited(),
    }
}

/// Record the error (first one wins) and stop every stage.
fn fail(state: &mut RunState, error: PipelineError, run_cancel: &CancellationToken) {
    if state.fail(error.clone()) {
        if error.is_cancellation() {
            warn!(error = %error, "Run stopping");
        } else {
            error!(error = %error, "Run failed");
        }
    }
    run_cancel.cancel();
}

fn advance(state: &mut RunState, next: RunPhase) {
    if let Err(e) = state.transition(next) {
        warn!(error = %e, "Refused phase change");
    }
}

fn on_stage_exit(
    state: &mut RunState,
    stage: &str,
    joined: Result<(), JoinError>,
    run_cancel: &CancellationToken,
) {
    match joined {
        Ok(()) => debug!(stage, "Stage exited"),
        Err(e) => fail(state, PipelineError::stage_failed(stage, e), run_cancel),
    }
}

async fn join_stages(state: &mut RunState, mut stages: Stages, run_cancel: &CancellationToken) {
    while let Some((stage, joined)) = stages.next().await {
        on_stage_exit(state, stage, joined, run_cancel);
    }
}

async fn wait_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn log_summary(summary: &RunSummary) {
    match &summary.first_error {
        None => info!(
            status = ?summary.status,
            records_produced = summary.records_produced,
            records_loaded = summary.records_loaded,
            records_rejected = summary.records_rejected,
            records_orphaned = summary.records_orphaned,
            batches_loaded = summary.metrics.batches_loaded,
            batches_retried = summary.metrics.batches_retried,
            elapsed_ms = summary.elapsed_ms,
            "Run finished"
        ),
        Some(e) => warn!(
            status = ?summary.status,
            phase = %summary.phase,
            records_produced = summary.records_produced,
            records_loaded = summary.records_loaded,
            records_failed = summary.records_failed,
            elapsed_ms = summary.elapsed_ms,
            error = %e,
            "Run did not complete"
        ),
    }
}
