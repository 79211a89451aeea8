//! Run state machine
//!
//! ```text
//! Idle -> Parsing -> Loading -> Finalizing -> Done
//!            |          |            |
//!            +----------+------------+--> Failed
//! ```
//!
//! [`RunState`] is owned by the coordinator and mutated only from its event
//! loop. Stages report through [`StageEvent`]s instead of touching it.

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::error::{LoadError, ParseError, PipelineError};
use crate::record::{BatchId, EntityKind};
use crate::xml::ReaderStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Idle,
    Parsing,
    Loading,
    Finalizing,
    Done,
    Failed,
}

impl RunPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunPhase::Idle => "idle",
            RunPhase::Parsing => "parsing",
            RunPhase::Loading => "loading",
            RunPhase::Finalizing => "finalizing",
            RunPhase::Done => "done",
            RunPhase::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunPhase::Done | RunPhase::Failed)
    }

    pub fn can_transition_to(&self, next: RunPhase) -> bool {
        use RunPhase::*;
        matches!(
            (self, next),
            (Idle, Parsing)
                | (Parsing, Loading)
                | (Loading, Finalizing)
                | (Finalizing, Done)
                | (Parsing | Loading | Finalizing, Failed)
        )
    }
}

impl std::fmt::Display for RunPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a run ended, as reported to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Done,
    Failed,
    Cancelled,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("illegal run transition {from} -> {to}")]
pub struct IllegalTransition {
    pub from: RunPhase,
    pub to: RunPhase,
}

/// Messages from stages to the coordinator.
#[derive(Debug)]
pub enum StageEvent {
    /// A malformed element was skipped under the `skip` policy.
    Rejected(ParseError),
    /// Parsing stopped on an error that ends the run.
    ParseAborted(ParseError),
    SourceFailed(String),
    ProducerFinished {
        produced: u64,
        stats: ReaderStats,
        end_of_stream: bool,
    },
    BatcherFinished {
        batches_emitted: u64,
        records_batched: u64,
        flushed: bool,
    },
    BatchLoaded {
        worker: usize,
        batch_id: BatchId,
        kind: EntityKind,
        rows: usize,
        attempts: u32,
        latency: Duration,
    },
    BatchFailed {
        worker: usize,
        batch_id: BatchId,
        kind: EntityKind,
        rows: usize,
        attempts: u32,
        error: LoadError,
    },
    /// Cancellation arrived while the batch was waiting to be retried.
    BatchAbandoned {
        worker: usize,
        batch_id: BatchId,
        kind: EntityKind,
        rows: usize,
        attempts: u32,
    },
    WorkerExited {
        worker: usize,
    },
}

#[derive(Debug, Clone)]
pub struct RunState {
    run_id: Uuid,
    phase: RunPhase,
    first_error: Option<PipelineError>,
    records_produced: u64,
    records_batched: u64,
    records_loaded: u64,
    records_rejected: u64,
    records_failed: u64,
    batches_emitted: u64,
    batches_loaded: u64,
    batches_failed: u64,
    batches_abandoned: u64,
    workers_exited: usize,
    reader_stats: ReaderStats,
    end_of_stream: bool,
    batcher_flushed: bool,
}

impl RunState {
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            phase: RunPhase::Idle,
            first_error: None,
            records_produced: 0,
            records_batched: 0,
            records_loaded: 0,
            records_rejected: 0,
            records_failed: 0,
            batches_emitted: 0,
            batches_loaded: 0,
            batches_failed: 0,
            batches_abandoned: 0,
            workers_exited: 0,
            reader_stats: ReaderStats::default(),
            end_of_stream: false,
            batcher_flushed: false,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    pub fn first_error(&self) -> Option<&PipelineError> {
        self.first_error.as_ref()
    }

    pub fn records_produced(&self) -> u64 {
        self.records_produced
    }

    pub fn records_loaded(&self) -> u64 {
        self.records_loaded
    }

    pub fn records_rejected(&self) -> u64 {
        self.records_rejected
    }

    pub fn records_failed(&self) -> u64 {
        self.records_failed
    }

    pub fn reader_stats(&self) -> ReaderStats {
        self.reader_stats
    }

    pub fn transition(&mut self, next: RunPhase) -> Result<(), IllegalTransition> {
        if !self.phase.can_transition_to(next) {
            return Err(IllegalTransition {
                from: self.phase,
                to: next,
            });
        }
        tracing::debug!(run_id = %self.run_id, from = %self.phase, to = %next, "Run phase change");
        self.phase = next;
        Ok(())
    }

    /// Record a fatal error. Only the first one is kept; returns whether this
    /// call was it.
    pub fn fail(&mut self, error: PipelineError) -> bool {
        if self.first_error.is_some() {
            tracing::debug!(run_id = %self.run_id, error = %error, "Additional failure after first error");
            return false;
        }
        if self.phase.can_transition_to(RunPhase::Failed) {
            self.phase = RunPhase::Failed;
        }
        self.first_error = Some(error);
        true
    }

    pub fn status(&self) -> RunStatus {
        match (&self.phase, &self.first_error) {
            (RunPhase::Done, _) => RunStatus::Done,
            (_, Some(e)) if e.is_cancellation() => RunStatus::Cancelled,
            _ => RunStatus::Failed,
        }
    }

    pub fn on_rejected(&mut self) {
        self.records_rejected += 1;
    }

    pub fn on_producer_finished(&mut self, produced: u64, stats: ReaderStats, end_of_stream: bool) {
        self.records_produced = produced;
        self.reader_stats = stats;
        self.end_of_stream = end_of_stream;
    }

    pub fn on_batcher_finished(&mut self, batches_emitted: u64, records_batched: u64, flushed: bool) {
        self.batches_emitted = batches_emitted;
        self.records_batched = records_batched;
        self.batcher_flushed = flushed;
    }

    pub fn on_batch_loaded(&mut self, rows: usize) {
        self.batches_loaded += 1;
        self.records_loaded += rows as u64;
    }

    pub fn on_batch_failed(&mut self, rows: usize) {
        self.batches_failed += 1;
        self.records_failed += rows as u64;
    }

    pub fn on_batch_abandoned(&mut self, rows: usize) {
        self.batches_abandoned += 1;
        self.records_failed += rows as u64;
    }

    pub fn on_worker_exited(&mut self) {
        self.workers_exited += 1;
    }

    /// Everything that must hold before staging can be finalized.
    pub fn check_barrier(&self, workers: usize) -> Result<(), String> {
        if !self.end_of_stream {
            return Err("producer did not reach end of input".to_string());
        }
        if !self.batcher_flushed {
            return Err("batcher did not flush".to_string());
        }
        if self.workers_exited != workers {
            return Err(format!("{} of {} workers exited", self.workers_exited, workers));
        }
        let settled = self.batches_loaded + self.batches_failed + self.batches_abandoned;
        if settled != self.batches_emitted {
            return Err(format!(
                "{} batches emitted but {} have an outcome",
                self.batches_emitted, settled
            ));
        }
        if self.records_batched != self.records_produced {
            return Err(format!(
                "{} records produced but {} batched",
                self.records_produced, self.records_batched
            ));
        }
        if self.records_loaded != self.records_produced {
            return Err(format!(
                "{} records produced but {} loaded",
                self.records_produced, self.records_loaded
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::error::CancelReason;

    #[test]
    fn test_happy_path_transitions() {
        let mut state = RunState::new(Uuid::new_v4());
        for phase in [RunPhase::Parsing, RunPhase::Loading, RunPhase::Finalizing, RunPhase::Done] {
            state.transition(phase).unwrap();
        }
        assert_eq!(state.status(), RunStatus::Done);
    }

    #[test]
    fn test_illegal_transitions_refused() {
        let mut state = RunState::new(Uuid::new_v4());
        let err = state.transition(RunPhase::Finalizing).unwrap_err();
        assert_eq!(err.from, RunPhase::Idle);
        assert_eq!(state.phase(), RunPhase::Idle);

        state.transition(RunPhase::Parsing).unwrap();
        assert!(state.transition(RunPhase::Done).is_err());
    }

    #[test]
    fn test_failed_is_absorbing() {
        let mut state = RunState::new(Uuid::new_v4());
        state.transition(RunPhase::Parsing).unwrap();
        state.transition(RunPhase::Loading).unwrap();
        assert!(state.fail(PipelineError::Accounting { message: "x".into() }));
        assert!(!state.fail(PipelineError::Cancelled { reason: CancelReason::Requested }));

        assert_eq!(state.phase(), RunPhase::Failed);
        assert!(state.transition(RunPhase::Finalizing).is_err());
        assert!(state.transition(RunPhase::Loading).is_err());
        assert!(matches!(state.first_error(), Some(PipelineError::Accounting { .. })));
        assert_eq!(state.status(), RunStatus::Failed);
    }

    #[test]
    fn test_cancellation_status() {
        let mut state = RunState::new(Uuid::new_v4());
        state.transition(RunPhase::Parsing).unwrap();
        state.fail(PipelineError::Cancelled { reason: CancelReason::Timeout });
        assert_eq!(state.status(), RunStatus::Cancelled);
    }

    #[test]
    fn test_barrier_requires_every_batch_settled() {
        let mut state = RunState::new(Uuid::new_v4());
        state.on_producer_finished(3, ReaderStats::default(), true);
        state.on_batcher_finished(2, 3, true);
        state.on_batch_loaded(2);
        state.on_worker_exited();

        let err = state.check_barrier(1).unwrap_err();
        assert!(err.contains("2 batches emitted but 1"));

        state.on_batch_loaded(1);
        state.check_barrier(1).unwrap();
    }

    #[test]
    fn test_barrier_requires_end_of_stream() {
        let mut state = RunState::new(Uuid::new_v4());
        state.on_producer_finished(0, ReaderStats::default(), false);
        state.on_batcher_finished(0, 0, true);
        assert!(state.check_barrier(0).is_err());
    }
}
