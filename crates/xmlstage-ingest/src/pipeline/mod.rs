//! The staged pipeline: producer -> records -> batcher -> batches -> loaders
//!
//! Two bounded channels sit between the three stages, so memory use is
//! capped at `channel_capacity` records plus `batch_channel_capacity` batches
//! plus one batch per worker, whatever the input size.

pub mod batcher;
pub mod channel;
pub mod coordinator;
pub mod metrics;
pub mod producer;
pub mod state;
pub mod worker;

pub use batcher::{BatchBuilder, Batcher};
pub use channel::{bounded, BoundedReceiver, BoundedSender, Closed, DepthGauge};
pub use coordinator::{Coordinator, RunSummary};
pub use metrics::{MetricsSnapshot, PipelineMetrics};
pub use producer::Producer;
pub use state::{RunPhase, RunState, RunStatus, StageEvent};
pub use worker::{BatchOutcome, LoaderWorker};
