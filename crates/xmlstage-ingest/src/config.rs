//! Pipeline configuration
//!
//! Values come from environment variables (after `.env` is loaded) with the
//! defaults below, and may then be overridden by CLI flags. Call
//! [`PipelineConfig::validate`] after the last override.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::time::Duration;
use xmlstage_common::env;

use crate::record::EntityKind;

// ============================================================================
// Pipeline Defaults
// ============================================================================

pub const DEFAULT_WORKERS: usize = 4;

/// Records buffered between the parser and the batcher.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 10_000;

/// Completed batches buffered between the batcher and the workers.
pub const DEFAULT_BATCH_CHANNEL_CAPACITY: usize = 32;

pub const DEFAULT_BATCH_MAX_ROWS: usize = 50_000;

pub const DEFAULT_BATCH_MAX_BYTES: usize = 8 * 1024 * 1024;

/// Retries after the first COPY attempt of a batch.
pub const DEFAULT_COPY_RETRIES: u32 = 5;

pub const DEFAULT_RETRY_BASE_MS: u64 = 500;

pub const DEFAULT_RETRY_MAX_MS: u64 = 30_000;

pub const DEFAULT_PROGRESS_INTERVAL_SECS: u64 = 5;

pub const DEFAULT_XML_BUFFER_BYTES: usize = 64 * 1024;

pub const DEFAULT_GROUP_TAG: &str = "group_event";

pub const DEFAULT_EVENT_TAG: &str = "event";

pub const DEFAULT_GROUP_TABLE: &str = "group_event";

pub const DEFAULT_EVENT_TABLE: &str = "event";

pub const DEFAULT_STAGING_PREFIX: &str = "stg_";

/// What the producer does with a malformed element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ParseErrorPolicy {
    /// Report the element as rejected and keep parsing.
    #[default]
    Skip,
    /// Fail the run on the first malformed element.
    Abort,
}

impl std::str::FromStr for ParseErrorPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "skip" | "recover" => Ok(ParseErrorPolicy::Skip),
            "abort" | "strict" => Ok(ParseErrorPolicy::Abort),
            _ => Err(anyhow::anyhow!("Invalid parse error policy: {}", s)),
        }
    }
}

impl std::fmt::Display for ParseErrorPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseErrorPolicy::Skip => f.write_str("skip"),
            ParseErrorPolicy::Abort => f.write_str("abort"),
        }
    }
}

/// Exponential backoff for transient COPY failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt; a batch gets `max_retries + 1` attempts.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_COPY_RETRIES,
            base_delay: Duration::from_millis(DEFAULT_RETRY_BASE_MS),
            max_delay: Duration::from_millis(DEFAULT_RETRY_MAX_MS),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-based): `base * 2^retry`, capped.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Element names the reader recognizes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct XmlConfig {
    pub group_tag: String,
    pub event_tag: String,
    /// Read buffer for the input file.
    pub buffer_size: usize,
}

impl Default for XmlConfig {
    fn default() -> Self {
        Self {
            group_tag: DEFAULT_GROUP_TAG.to_string(),
            event_tag: DEFAULT_EVENT_TAG.to_string(),
            buffer_size: DEFAULT_XML_BUFFER_BYTES,
        }
    }
}

/// Final and staging table names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableNames {
    pub group: String,
    pub event: String,
    pub staging_prefix: String,
}

impl Default for TableNames {
    fn default() -> Self {
        Self {
            group: DEFAULT_GROUP_TABLE.to_string(),
            event: DEFAULT_EVENT_TABLE.to_string(),
            staging_prefix: DEFAULT_STAGING_PREFIX.to_string(),
        }
    }
}

impl TableNames {
    pub fn final_table(&self, kind: EntityKind) -> &str {
        match kind {
            EntityKind::Group => &self.group,
            EntityKind::Event => &self.event,
        }
    }

    pub fn staging_table(&self, kind: EntityKind) -> String {
        format!("{}{}", self.staging_prefix, self.final_table(kind))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        for kind in EntityKind::ALL {
            for name in [self.final_table(kind).to_string(), self.staging_table(kind)] {
                if !is_identifier(&name) {
                    anyhow::bail!(
                        "Table name '{}' for {} is not a valid identifier (lowercase letters, digits, underscores; max 63 chars)",
                        name,
                        kind
                    );
                }
            }
        }
        if self.group == self.event {
            anyhow::bail!("Group and event tables must differ (both '{}')", self.group);
        }
        if self.staging_prefix.is_empty() {
            anyhow::bail!("Staging prefix cannot be empty");
        }
        Ok(())
    }
}

/// Lowercase unquoted SQL identifier. Table names are interpolated into DDL
/// and COPY statements, so nothing else is accepted.
pub fn is_identifier(name: &str) -> bool {
    static IDENT: OnceLock<Option<Regex>> = OnceLock::new();
    IDENT
        .get_or_init(|| Regex::new(r"^[a-z_][a-z0-9_]{0,62}$").ok())
        .as_ref()
        .is_some_and(|re| re.is_match(name))
}

/// Everything the coordinator and its stages need to know.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub workers: usize,
    pub channel_capacity: usize,
    pub batch_channel_capacity: usize,
    pub batch_max_rows: usize,
    pub batch_max_bytes: usize,
    pub retry: RetryPolicy,
    /// Deadline for parsing and loading. Finalize is not covered.
    pub run_timeout: Option<Duration>,
    pub parse_error_policy: ParseErrorPolicy,
    pub progress_interval: Duration,
    /// Run `ANALYZE` on final tables after finalize.
    pub analyze: bool,
    pub xml: XmlConfig,
    pub tables: TableNames,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            batch_channel_capacity: DEFAULT_BATCH_CHANNEL_CAPACITY,
            batch_max_rows: DEFAULT_BATCH_MAX_ROWS,
            batch_max_bytes: DEFAULT_BATCH_MAX_BYTES,
            retry: RetryPolicy::default(),
            run_timeout: None,
            parse_error_policy: ParseErrorPolicy::default(),
            progress_interval: Duration::from_secs(DEFAULT_PROGRESS_INTERVAL_SECS),
            analyze: true,
            xml: XmlConfig::default(),
            tables: TableNames::default(),
        }
    }
}

impl PipelineConfig {
    /// Load from `XMLSTAGE_*` environment variables. `.env` is read first.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            workers: env::parse_or("XMLSTAGE_WORKERS", DEFAULT_WORKERS)?,
            channel_capacity: env::parse_or("XMLSTAGE_CHANNEL_CAPACITY", DEFAULT_CHANNEL_CAPACITY)?,
            batch_channel_capacity: env::parse_or(
                "XMLSTAGE_BATCH_CHANNEL_CAPACITY",
                DEFAULT_BATCH_CHANNEL_CAPACITY,
            )?,
            batch_max_rows: env::parse_or("XMLSTAGE_BATCH_MAX_ROWS", DEFAULT_BATCH_MAX_ROWS)?,
            batch_max_bytes: env::parse_or("XMLSTAGE_BATCH_MAX_BYTES", DEFAULT_BATCH_MAX_BYTES)?,
            retry: RetryPolicy {
                max_retries: env::parse_or("XMLSTAGE_COPY_RETRIES", DEFAULT_COPY_RETRIES)?,
                base_delay: Duration::from_millis(env::parse_or(
                    "XMLSTAGE_RETRY_BASE_MS",
                    DEFAULT_RETRY_BASE_MS,
                )?),
                max_delay: Duration::from_millis(env::parse_or(
                    "XMLSTAGE_RETRY_MAX_MS",
                    DEFAULT_RETRY_MAX_MS,
                )?),
            },
            run_timeout: env::parse_opt::<u64>("XMLSTAGE_RUN_TIMEOUT_SECS")?
                .map(Duration::from_secs),
            parse_error_policy: match env::var("XMLSTAGE_PARSE_ERROR_POLICY") {
                Some(raw) => raw.parse()?,
                None => ParseErrorPolicy::default(),
            },
            progress_interval: Duration::from_secs(env::parse_or(
                "XMLSTAGE_PROGRESS_INTERVAL_SECS",
                DEFAULT_PROGRESS_INTERVAL_SECS,
            )?),
            analyze: env::flag_or("XMLSTAGE_ANALYZE", true)?,
            xml: XmlConfig {
                group_tag: env::var("XMLSTAGE_GROUP_TAG")
                    .unwrap_or_else(|| DEFAULT_GROUP_TAG.to_string()),
                event_tag: env::var("XMLSTAGE_EVENT_TAG")
                    .unwrap_or_else(|| DEFAULT_EVENT_TAG.to_string()),
                buffer_size: env::parse_or("XMLSTAGE_XML_BUFFER_BYTES", DEFAULT_XML_BUFFER_BYTES)?,
            },
            tables: TableNames {
                group: env::var("XMLSTAGE_GROUP_TABLE")
                    .unwrap_or_else(|| DEFAULT_GROUP_TABLE.to_string()),
                event: env::var("XMLSTAGE_EVENT_TABLE")
                    .unwrap_or_else(|| DEFAULT_EVENT_TABLE.to_string()),
                staging_prefix: env::var("XMLSTAGE_STAGING_PREFIX")
                    .unwrap_or_else(|| DEFAULT_STAGING_PREFIX.to_string()),
            },
        };

        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let positive = [
            ("workers", self.workers),
            ("channel_capacity", self.channel_capacity),
            ("batch_channel_capacity", self.batch_channel_capacity),
            ("batch_max_rows", self.batch_max_rows),
            ("batch_max_bytes", self.batch_max_bytes),
            ("xml.buffer_size", self.xml.buffer_size),
        ];
        for (name, value) in positive {
            if value == 0 {
                anyhow::bail!("{} must be greater than 0", name);
            }
        }

        if self.retry.base_delay > self.retry.max_delay {
            anyhow::bail!(
                "Retry base delay ({:?}) cannot exceed max delay ({:?})",
                self.retry.base_delay,
                self.retry.max_delay
            );
        }

        if self.progress_interval.is_zero() {
            anyhow::bail!("progress_interval must be greater than 0");
        }

        if matches!(self.run_timeout, Some(t) if t.is_zero()) {
            anyhow::bail!("run_timeout must be greater than 0 when set");
        }

        if self.xml.group_tag.is_empty() || self.xml.event_tag.is_empty() {
            anyhow::bail!("XML tag names cannot be empty");
        }
        if self.xml.group_tag == self.xml.event_tag {
            anyhow::bail!("Group and event tags must differ (both '{}')", self.xml.group_tag);
        }

        self.tables.validate()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_default_config_is_valid() {
        let config = PipelineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.batch_max_bytes, 8 * 1024 * 1024);
        assert_eq!(config.parse_error_policy, ParseErrorPolicy::Skip);
    }

    #[test]
    fn test_retry_delay_doubles_and_caps() {
        let retry = RetryPolicy {
            max_retries: 10,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(3),
        };
        assert_eq!(retry.delay_for(0), Duration::from_millis(500));
        assert_eq!(retry.delay_for(1), Duration::from_secs(1));
        assert_eq!(retry.delay_for(2), Duration::from_secs(2));
        assert_eq!(retry.delay_for(3), Duration::from_secs(3));
        assert_eq!(retry.delay_for(40), Duration::from_secs(3));
    }

    #[test]
    fn test_zero_values_rejected() {
        let mut config = PipelineConfig::default();
        config.workers = 0;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.batch_max_bytes = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_table_names_must_be_identifiers() {
        let mut config = PipelineConfig::default();
        config.tables.event = "event; DROP TABLE x".to_string();
        assert!(config.validate().is_err());

        assert!(is_identifier("stg_group_event"));
        assert!(!is_identifier("Group"));
        assert!(!is_identifier("9lives"));
    }

    #[test]
    fn test_staging_table_names() {
        let tables = TableNames::default();
        assert_eq!(tables.staging_table(EntityKind::Group), "stg_group_event");
        assert_eq!(tables.staging_table(EntityKind::Event), "stg_event");
        assert_eq!(tables.final_table(EntityKind::Event), "event");
    }

    #[test]
    fn test_parse_error_policy_from_str() {
        assert_eq!("Abort".parse::<ParseErrorPolicy>().unwrap(), ParseErrorPolicy::Abort);
        assert_eq!("recover".parse::<ParseErrorPolicy>().unwrap(), ParseErrorPolicy::Skip);
        assert!("ignore".parse::<ParseErrorPolicy>().is_err());
    }

    #[test]
    #[serial]
    fn test_from_env_overrides() {
        std::env::set_var("XMLSTAGE_WORKERS", "2");
        std::env::set_var("XMLSTAGE_PARSE_ERROR_POLICY", "abort");
        std::env::set_var("XMLSTAGE_RUN_TIMEOUT_SECS", "90");

        let config = PipelineConfig::from_env().unwrap();
        assert_eq!(config.workers, 2);
        assert_eq!(config.parse_error_policy, ParseErrorPolicy::Abort);
        assert_eq!(config.run_timeout, Some(Duration::from_secs(90)));

        std::env::remove_var("XMLSTAGE_WORKERS");
        std::env::remove_var("XMLSTAGE_PARSE_ERROR_POLICY");
        std::env::remove_var("XMLSTAGE_RUN_TIMEOUT_SECS");
    }

    #[test]
    #[serial]
    fn test_from_env_rejects_invalid_number() {
        std::env::set_var("XMLSTAGE_BATCH_MAX_ROWS", "lots");
        assert!(PipelineConfig::from_env().is_err());
        std::env::remove_var("XMLSTAGE_BATCH_MAX_ROWS");
    }
}
