//! Shared helpers for xmlstage integration tests
//!
//! - [`MemoryWarehouse`]: an in-memory stand-in for Postgres that accepts COPY
//!   text payloads into staging and finalizes with the same
//!   insert-if-absent and parent-exists rules as the SQL merge.
//! - [`FlakySink`], [`GatedSink`], [`SlowSink`]: sinks that inject failures
//!   (optionally after the rows were written), hold batches until released,
//!   or take their time.
//! - [`TestPostgres`]: a Postgres testcontainer with a connected pool.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::io::Read;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use testcontainers::{runners::AsyncRunner, ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tokio_util::sync::CancellationToken;
use tracing::info;
use xmlstage_ingest::db::{BulkCopySink, CopyRequest, FinalizeReport, Finalizer};
use xmlstage_ingest::{BatchId, EntityKind, LoadError};

/// Initialize tracing for tests
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,xmlstage_ingest=debug")),
        )
        .with_test_writer()
        .try_init();
}

pub type Row = Vec<Option<String>>;

/// One accepted COPY call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyCall {
    pub batch_id: BatchId,
    pub kind: EntityKind,
    pub rows: usize,
}

#[derive(Default)]
struct Tables {
    staging: HashMap<EntityKind, Vec<Row>>,
    finals: HashMap<EntityKind, BTreeMap<i64, Row>>,
    copies: Vec<CopyCall>,
}

#[derive(Default)]
pub struct MemoryWarehouse {
    tables: Mutex<Tables>,
    finalize_calls: Mutex<Vec<EntityKind>>,
}

impl MemoryWarehouse {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn staging(&self, kind: EntityKind) -> Vec<Row> {
        let tables = self.tables.lock().unwrap();
        tables.staging.get(&kind).cloned().unwrap_or_default()
    }

    pub fn staging_ids(&self, kind: EntityKind) -> Vec<i64> {
        self.staging(kind).iter().filter_map(|row| key_of(row)).collect()
    }

    pub fn final_rows(&self, kind: EntityKind) -> BTreeMap<i64, Row> {
        let tables = self.tables.lock().unwrap();
        tables.finals.get(&kind).cloned().unwrap_or_default()
    }

    pub fn final_count(&self, kind: EntityKind) -> usize {
        self.final_rows(kind).len()
    }

    pub fn copies(&self) -> Vec<CopyCall> {
        self.tables.lock().unwrap().copies.clone()
    }

    /// Row counts of accepted batches of one kind, in batch-id order.
    pub fn batch_sizes(&self, kind: EntityKind) -> Vec<usize> {
        let mut calls: Vec<_> = self.copies().into_iter().filter(|c| c.kind == kind).collect();
        calls.sort_by_key(|c| c.batch_id);
        calls.into_iter().map(|c| c.rows).collect()
    }

    pub fn finalize_calls(&self) -> Vec<EntityKind> {
        self.finalize_calls.lock().unwrap().clone()
    }

    /// Put rows straight into staging, as a crashed earlier run would leave
    /// them.
    pub fn seed_staging(&self, kind: EntityKind, rows: Vec<Row>) {
        let mut tables = self.tables.lock().unwrap();
        tables.staging.entry(kind).or_default().extend(rows);
    }
}

fn key_of(row: &Row) -> Option<i64> {
    row.first()?.as_deref()?.parse().ok()
}

#[async_trait]
impl BulkCopySink for MemoryWarehouse {
    async fn copy_in(&self, request: &CopyRequest) -> Result<u64, LoadError> {
        let rows = decode_payload(&request.payload, request.columns.len())
            .map_err(LoadError::Permanent)?;
        let count = rows.len() as u64;

        let mut tables = self.tables.lock().unwrap();
        tables.staging.entry(request.kind).or_default().extend(rows);
        tables.copies.push(CopyCall {
            batch_id: request.batch_id,
            kind: request.kind,
            rows: request.rows,
        });
        Ok(count)
    }
}

#[async_trait]
impl Finalizer for MemoryWarehouse {
    async fn finalize(&self, kind: EntityKind) -> Result<FinalizeReport> {
        self.finalize_calls.lock().unwrap().push(kind);

        let mut tables = self.tables.lock().unwrap();
        let staged = tables.staging.get(&kind).cloned().unwrap_or_default();
        let parents: Option<Vec<i64>> = kind.parent().map(|(parent, _)| {
            tables
                .finals
                .get(&parent)
                .map(|m| m.keys().copied().collect())
                .unwrap_or_default()
        });

        let target = tables.finals.entry(kind).or_default();
        let mut inserted = 0;
        let mut orphans = std::collections::BTreeSet::new();
        for row in staged {
            let Some(id) = key_of(&row) else { continue };
            if let Some(parents) = &parents {
                let parent_id = row.get(1).and_then(|v| v.as_deref()).and_then(|v| v.parse().ok());
                if !parent_id.is_some_and(|p: i64| parents.contains(&p)) {
                    orphans.insert(id);
                    continue;
                }
            }
            if let std::collections::btree_map::Entry::Vacant(slot) = target.entry(id) {
                slot.insert(row);
                inserted += 1;
            }
        }

        Ok(FinalizeReport {
            kind,
            table: kind.as_str().to_string(),
            inserted,
            orphaned: orphans.len() as u64,
            elapsed_ms: 0,
        })
    }
}

/// Parse COPY text rows back into columns. `None` is SQL NULL.
pub fn decode_payload(payload: &[u8], columns: usize) -> std::result::Result<Vec<Row>, String> {
    let text = std::str::from_utf8(payload).map_err(|e| e.to_string())?;
    let mut rows = Vec::new();
    for line in text.split_terminator('\n') {
        let row: Row = line.split('\t').map(decode_field).collect();
        if row.len() != columns {
            return Err(format!("expected {} columns, got {}: {:?}", columns, row.len(), line));
        }
        rows.push(row);
    }
    Ok(rows)
}

fn decode_field(field: &str) -> Option<String> {
    if field == "\\N" {
        return None;
    }
    let mut out = String::with_capacity(field.len());
    let mut chars = field.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('t') => out.push('\t'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('b') => out.push('\u{8}'),
            Some('f') => out.push('\u{c}'),
            Some('v') => out.push('\u{b}'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    Some(out)
}

/// Fails the first `failures` attempts of every batch, then delegates.
pub struct FlakySink {
    inner: Arc<MemoryWarehouse>,
    failures: u32,
    permanent: bool,
    /// Write the rows before reporting the failure, like a COPY that
    /// committed but whose acknowledgement was lost.
    commit_first: bool,
    attempts: Mutex<HashMap<BatchId, u32>>,
    errors: AtomicUsize,
}

impl FlakySink {
    fn build(
        inner: Arc<MemoryWarehouse>,
        failures: u32,
        permanent: bool,
        commit_first: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            inner,
            failures,
            permanent,
            commit_first,
            attempts: Mutex::new(HashMap::new()),
            errors: AtomicUsize::new(0),
        })
    }

    pub fn transient(inner: Arc<MemoryWarehouse>, failures: u32) -> Arc<Self> {
        Self::build(inner, failures, false, false)
    }

    /// Transient failures reported after the rows already landed.
    pub fn lost_ack(inner: Arc<MemoryWarehouse>, failures: u32) -> Arc<Self> {
        Self::build(inner, failures, false, true)
    }

    pub fn permanent(inner: Arc<MemoryWarehouse>) -> Arc<Self> {
        Self::build(inner, u32::MAX, true, false)
    }

    pub fn errors(&self) -> usize {
        self.errors.load(Ordering::SeqCst)
    }

    pub fn attempts(&self, batch_id: BatchId) -> u32 {
        self.attempts.lock().unwrap().get(&batch_id).copied().unwrap_or(0)
    }
}

#[async_trait]
impl BulkCopySink for FlakySink {
    async fn copy_in(&self, request: &CopyRequest) -> Result<u64, LoadError> {
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            let n = attempts.entry(request.batch_id).or_insert(0);
            *n += 1;
            *n
        };
        if attempt <= self.failures {
            if self.commit_first {
                self.inner.copy_in(request).await?;
            }
            self.errors.fetch_add(1, Ordering::SeqCst);
            return Err(if self.permanent {
                LoadError::Permanent("null value in column \"id\" violates not-null constraint".into())
            } else {
                LoadError::Transient("connection reset by peer".into())
            });
        }
        self.inner.copy_in(request).await
    }
}

/// Holds every COPY until [`GatedSink::open`] is called.
pub struct GatedSink {
    inner: Arc<MemoryWarehouse>,
    gate: CancellationToken,
    waiting: AtomicUsize,
}

impl GatedSink {
    pub fn new(inner: Arc<MemoryWarehouse>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            gate: CancellationToken::new(),
            waiting: AtomicUsize::new(0),
        })
    }

    pub fn open(&self) {
        self.gate.cancel();
    }

    /// Calls currently parked at the gate.
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BulkCopySink for GatedSink {
    async fn copy_in(&self, request: &CopyRequest) -> Result<u64, LoadError> {
        self.waiting.fetch_add(1, Ordering::SeqCst);
        self.gate.cancelled().await;
        self.waiting.fetch_sub(1, Ordering::SeqCst);
        self.inner.copy_in(request).await
    }
}

/// Sleeps before every COPY.
pub struct SlowSink {
    inner: Arc<MemoryWarehouse>,
    delay: Duration,
}

impl SlowSink {
    pub fn new(inner: Arc<MemoryWarehouse>, delay: Duration) -> Arc<Self> {
        Arc::new(Self { inner, delay })
    }
}

#[async_trait]
impl BulkCopySink for SlowSink {
    async fn copy_in(&self, request: &CopyRequest) -> Result<u64, LoadError> {
        tokio::time::sleep(self.delay).await;
        self.inner.copy_in(request).await
    }
}

/// Wraps an input and counts the bytes handed to the parser.
pub struct CountingReader<R> {
    inner: R,
    read: Arc<AtomicU64>,
}

impl<R: Read> CountingReader<R> {
    pub fn new(inner: R) -> (Self, Arc<AtomicU64>) {
        let read = Arc::new(AtomicU64::new(0));
        (
            Self {
                inner,
                read: read.clone(),
            },
            read,
        )
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.read.fetch_add(n as u64, Ordering::SeqCst);
        Ok(n)
    }
}

// ============================================================================
// PostgreSQL Test Container
// ============================================================================

pub struct TestPostgres {
    container: ContainerAsync<Postgres>,
    pool: PgPool,
    connection_string: String,
}

impl TestPostgres {
    pub async fn start() -> Result<Self> {
        info!("Starting PostgreSQL test container...");

        let container = Postgres::default()
            .with_tag("16-alpine")
            .start()
            .await
            .context("Failed to start PostgreSQL container")?;

        let host = container.get_host().await.context("Failed to get container host")?;
        let port = container
            .get_host_port_ipv4(5432)
            .await
            .context("Failed to get container port")?;
        let connection_string =
            format!("postgresql://postgres:postgres@{}:{}/postgres", host, port);

        let pool = PgPoolOptions::new()
            .max_connections(8)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&connection_string)
            .await
            .context("Failed to connect to PostgreSQL")?;

        Ok(Self {
            container,
            pool,
            connection_string,
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }
}
