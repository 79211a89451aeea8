//! xmlstage ingest library
//!
//! Streams a large two-level XML document (`<group_event>` elements holding
//! `<event>` elements) into Postgres staging tables with `COPY`, then merges
//! staging into the final tables once every batch has landed.
//!
//! # Pipeline
//!
//! - **Producer**: pull-parses the document on a blocking thread and emits
//!   typed [`record::Record`]s into a bounded channel.
//! - **Batcher**: groups records per kind into batches bounded by row count
//!   and byte size.
//! - **Loader workers**: copy batches into staging, retrying transient
//!   failures with exponential backoff.
//! - **Coordinator**: owns the run state machine, fails fast, and finalizes
//!   only after the loading barrier.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use xmlstage_ingest::config::PipelineConfig;
//! use xmlstage_ingest::db::{create_pool, DbConfig, PgCopySink, PgFinalizer};
//! use xmlstage_ingest::pipeline::Coordinator;
//! use xmlstage_ingest::xml::XmlSource;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = PipelineConfig::from_env()?;
//!     let pool = create_pool(&DbConfig::from_env()?).await?;
//!
//!     let sink = Arc::new(PgCopySink::new(pool.clone()));
//!     let finalizer = Arc::new(PgFinalizer::new(pool, config.tables.clone()));
//!     let summary = Coordinator::new(config, sink, finalizer)
//!         .run(XmlSource::path("events.xml"))
//!         .await;
//!
//!     println!("{:?}", summary.status);
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod config;
pub mod db;
pub mod error;
pub mod generate;
pub mod pipeline;
pub mod record;
pub mod xml;

pub use config::{ParseErrorPolicy, PipelineConfig, RetryPolicy, TableNames, XmlConfig};
pub use error::{CancelReason, LoadError, ParseError, PipelineError, PipelineResult};
pub use pipeline::{Coordinator, RunPhase, RunStatus, RunSummary};
pub use record::{Batch, BatchId, EntityKind, FieldValue, Record, SourcePosition};
