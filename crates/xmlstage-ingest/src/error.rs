//! Error types for the ingestion pipeline
//!
//! Errors are layered the way they are handled:
//!
//! - [`ParseError`] is raised per element by the XML reader and handled at the
//!   producer according to the parse-error policy.
//! - [`LoadError`] is raised per COPY attempt and handled by the loader worker
//!   (transient errors are retried).
//! - [`PipelineError`] is what the coordinator records as the first fatal error
//!   of a run.

use serde::Serialize;
use thiserror::Error;

use crate::record::{BatchId, EntityKind, SourcePosition};

/// Malformed input at a known position.
#[derive(Error, Debug, Clone, PartialEq, Serialize)]
#[error("{}malformed input at {position}: {message}", kind_prefix(.kind))]
pub struct ParseError {
    /// Entity being built when the problem was found, if any.
    pub kind: Option<EntityKind>,
    pub position: SourcePosition,
    pub message: String,
    /// `false` when the tokenizer cannot continue past this point.
    pub recoverable: bool,
}

impl ParseError {
    pub fn recoverable(
        kind: Option<EntityKind>,
        position: SourcePosition,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            position,
            message: message.into(),
            recoverable: true,
        }
    }

    pub fn fatal(position: SourcePosition, message: impl Into<String>) -> Self {
        Self {
            kind: None,
            position,
            message: message.into(),
            recoverable: false,
        }
    }
}

fn kind_prefix(kind: &Option<EntityKind>) -> String {
    kind.map(|k| format!("{} ", k)).unwrap_or_default()
}

/// Outcome of one failed bulk-copy attempt.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    /// Connection drops, timeouts, serialization failures: worth retrying.
    #[error("transient load error: {0}")]
    Transient(String),

    /// Constraint or data errors that will fail the same way again.
    #[error("permanent load error: {0}")]
    Permanent(String),
}

impl LoadError {
    pub fn is_transient(&self) -> bool {
        matches!(self, LoadError::Transient(_))
    }

    pub fn message(&self) -> &str {
        match self {
            LoadError::Transient(m) | LoadError::Permanent(m) => m,
        }
    }
}

/// Why a run stopped early without a stage failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    /// The caller's cancellation token fired (Ctrl-C in the CLI).
    Requested,
    /// The configured run timeout elapsed.
    Timeout,
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CancelReason::Requested => f.write_str("cancellation requested"),
            CancelReason::Timeout => f.write_str("run timeout elapsed"),
        }
    }
}

/// The first fatal error of a run, as recorded by the coordinator.
#[derive(Error, Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineError {
    #[error("cannot open input: {message}")]
    Source { message: String },

    #[error("parse failed: {0}")]
    Parse(#[from] ParseError),

    #[error("batch {batch_id} ({kind}, {rows} rows) failed after {attempts} attempt(s): {message}")]
    PermanentLoad {
        batch_id: BatchId,
        kind: EntityKind,
        rows: usize,
        attempts: u32,
        message: String,
    },

    #[error("run cancelled: {reason}")]
    Cancelled { reason: CancelReason },

    #[error("finalize failed for {kind}: {message}")]
    Finalize { kind: EntityKind, message: String },

    #[error("{stage} stage terminated abnormally: {message}")]
    StageFailed { stage: String, message: String },

    /// The loading barrier found batches or records without an outcome.
    #[error("accounting mismatch at barrier: {message}")]
    Accounting { message: String },
}

impl PipelineError {
    pub fn is_cancellation(&self) -> bool {
        matches!(self, PipelineError::Cancelled { .. })
    }

    pub fn stage_failed(stage: &str, message: impl std::fmt::Display) -> Self {
        Self::StageFailed {
            stage: stage.to_string(),
            message: message.to_string(),
        }
    }
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_error_display_includes_kind_and_position() {
        let err = ParseError::recoverable(
            Some(EntityKind::Event),
            SourcePosition {
                byte_offset: 120,
                element_index: 7,
            },
            "missing integer id",
        );
        assert_eq!(
            err.to_string(),
            "event malformed input at byte 120 (element #7): missing integer id"
        );

        let fatal = ParseError::fatal(SourcePosition::default(), "unexpected EOF");
        assert!(!fatal.recoverable);
        assert!(fatal.to_string().starts_with("malformed input"));
    }

    #[test]
    fn test_pipeline_error_serializes_with_context() {
        let err = PipelineError::PermanentLoad {
            batch_id: 4,
            kind: EntityKind::Group,
            rows: 2,
            attempts: 6,
            message: "connection reset".into(),
        };
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["type"], "permanent_load");
        assert_eq!(json["batch_id"], 4);
        assert_eq!(json["kind"], "group");
    }

    #[test]
    fn test_cancellation_is_distinguished() {
        let err = PipelineError::Cancelled {
            reason: CancelReason::Timeout,
        };
        assert!(err.is_cancellation());
        assert_eq!(err.to_string(), "run cancelled: run timeout elapsed");
    }
}
