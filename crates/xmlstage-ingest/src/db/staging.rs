//! Bulk copy into staging tables

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolCopyExt};

use super::copy::CopyRequest;
use crate::error::LoadError;

/// Payload bytes sent per `CopyData` message.
pub const DEFAULT_COPY_CHUNK_BYTES: usize = 1024 * 1024;

/// Destination for encoded batches. One call is one attempt; retrying is the
/// loader worker's business.
#[async_trait]
pub trait BulkCopySink: Send + Sync {
    /// Copy the payload into `request.table`. Returns the row count reported
    /// by the server.
    async fn copy_in(&self, request: &CopyRequest) -> Result<u64, LoadError>;
}

/// `COPY ... FROM STDIN` through a pooled connection.
#[derive(Debug, Clone)]
pub struct PgCopySink {
    pool: PgPool,
    chunk_bytes: usize,
}

impl PgCopySink {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            chunk_bytes: DEFAULT_COPY_CHUNK_BYTES,
        }
    }

    pub fn with_chunk_bytes(mut self, chunk_bytes: usize) -> Self {
        self.chunk_bytes = chunk_bytes.max(1);
        self
    }
}

#[async_trait]
impl BulkCopySink for PgCopySink {
    async fn copy_in(&self, request: &CopyRequest) -> Result<u64, LoadError> {
        let statement = request.statement();
        let mut copy = self.pool.copy_in_raw(&statement).await.map_err(classify)?;

        for chunk in request.payload.chunks(self.chunk_bytes) {
            if let Err(e) = copy.send(chunk).await {
                let error = classify(e);
                if let Err(abort_err) = copy.abort(error.message().to_string()).await {
                    tracing::debug!(batch_id = request.batch_id, error = %abort_err, "COPY abort failed");
                }
                return Err(error);
            }
        }

        copy.finish().await.map_err(classify)
    }
}

/// SQLSTATEs worth retrying: connection exceptions (class 08), serialization
/// failure, deadlock, admin/crash shutdown, cannot-connect-now, statement
/// cancel, too many connections, out of memory.
pub fn is_transient_sqlstate(code: &str) -> bool {
    code.starts_with("08")
        || matches!(
            code,
            "40001" | "40P01" | "57P01" | "57P02" | "57P03" | "57014" | "53300" | "53200"
        )
}

/// Sort a driver error into retryable or not.
pub fn classify(error: sqlx::Error) -> LoadError {
    let transient = match &error {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db) => db.code().is_some_and(|code| is_transient_sqlstate(&code)),
        _ => false,
    };

    if transient {
        LoadError::Transient(error.to_string())
    } else {
        LoadError::Permanent(error.to_string())
    }
}
