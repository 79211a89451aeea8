//! Staging -> final merge
//!
//! One `INSERT ... SELECT DISTINCT ON (key) ... ON CONFLICT DO NOTHING` per
//! kind, each in its own transaction. Running it again over the same staging
//! data inserts nothing, and duplicate staging rows collapse to one final row.
//! Staging is left untouched.

use std::time::Instant;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use sqlx::PgPool;

use crate::config::TableNames;
use crate::record::EntityKind;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FinalizeReport {
    pub kind: EntityKind,
    pub table: String,
    /// Rows new to the final table.
    pub inserted: u64,
    /// Distinct staging keys left out because their parent is not in the
    /// final table. Always 0 for kinds without a parent.
    pub orphaned: u64,
    pub elapsed_ms: u64,
}

/// Merges one kind from staging into its final table.
#[async_trait]
pub trait Finalizer: Send + Sync {
    async fn finalize(&self, kind: EntityKind) -> Result<FinalizeReport>;
}

fn parent_exists(kind: EntityKind, tables: &TableNames) -> Option<String> {
    kind.parent().map(|(parent, fk)| {
        format!(
            "EXISTS (SELECT 1 FROM {} p WHERE p.{} = s.{})",
            tables.final_table(parent),
            parent.natural_key(),
            fk
        )
    })
}

/// The merge statement for `kind`.
///
/// Children are only inserted when their parent exists in the parent's final
/// table, so the foreign key holds even when a parent row was rejected.
pub fn finalize_statement(kind: EntityKind, tables: &TableNames) -> String {
    let columns = kind.columns();
    let key = kind.natural_key();
    let target = tables.final_table(kind);
    let staging = tables.staging_table(kind);
    let select_list = columns
        .iter()
        .map(|c| format!("s.{}", c))
        .collect::<Vec<_>>()
        .join(", ");

    let mut filter = format!("s.{} IS NOT NULL", key);
    if let Some(exists) = parent_exists(kind, tables) {
        filter.push_str(" AND ");
        filter.push_str(&exists);
    }

    format!(
        "INSERT INTO {target} ({cols}) \
         SELECT DISTINCT ON (s.{key}) {select_list} FROM {staging} s \
         WHERE {filter} \
         ORDER BY s.{key} \
         ON CONFLICT ({key}) DO NOTHING",
        cols = columns.join(", "),
    )
}

/// Counts the distinct staging keys the merge leaves out for want of a
/// parent. `None` for kinds without a parent.
pub fn orphan_count_statement(kind: EntityKind, tables: &TableNames) -> Option<String> {
    let key = kind.natural_key();
    parent_exists(kind, tables).map(|exists| {
        format!(
            "SELECT COUNT(DISTINCT s.{key}) FROM {staging} s \
             WHERE s.{key} IS NOT NULL AND NOT {exists}",
            staging = tables.staging_table(kind),
        )
    })
}

/// Finalize every kind, parents first. Stops at the first failure.
pub async fn finalize_all(
    finalizer: &dyn Finalizer,
) -> std::result::Result<Vec<FinalizeReport>, (EntityKind, anyhow::Error)> {
    let mut reports = Vec::with_capacity(EntityKind::ALL.len());
    for kind in EntityKind::ALL {
        let report = finalizer.finalize(kind).await.map_err(|e| (kind, e))?;
        reports.push(report);
    }
    Ok(reports)
}

pub struct PgFinalizer {
    pool: PgPool,
    tables: TableNames,
    analyze: bool,
}

impl PgFinalizer {
    pub fn new(pool: PgPool, tables: TableNames) -> Self {
        Self {
            pool,
            tables,
            analyze: true,
        }
    }

    pub fn with_analyze(mut self, analyze: bool) -> Self {
        self.analyze = analyze;
        self
    }
}

#[async_trait]
impl Finalizer for PgFinalizer {
    async fn finalize(&self, kind: EntityKind) -> Result<FinalizeReport> {
        let started = Instant::now();
        let table = self.tables.final_table(kind).to_string();
        let statement = finalize_statement(kind, &self.tables);

        let mut tx = self.pool.begin().await.context("Failed to begin finalize transaction")?;
        let result = sqlx::query(&statement)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("Failed to merge staging into {}", table))?;
        let orphaned: i64 = match orphan_count_statement(kind, &self.tables) {
            Some(count) => sqlx::query_scalar(&count)
                .fetch_one(&mut *tx)
                .await
                .with_context(|| format!("Failed to count orphaned rows for {}", table))?,
            None => 0,
        };
        tx.commit().await.context("Failed to commit finalize transaction")?;

        if self.analyze {
            sqlx::query(&format!("ANALYZE {}", table))
                .execute(&self.pool)
                .await
                .with_context(|| format!("Failed to analyze {}", table))?;
        }

        let report = FinalizeReport {
            kind,
            table,
            inserted: result.rows_affected(),
            orphaned: u64::try_from(orphaned).unwrap_or(0),
            elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        };
        tracing::info!(
            kind = %kind,
            table = %report.table,
            inserted = report.inserted,
            elapsed_ms = report.elapsed_ms,
            "Finalized"
        );
        if report.orphaned > 0 {
            tracing::warn!(
                kind = %kind,
                orphaned = report.orphaned,
                "Staging rows without a parent were not finalized"
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_group_statement() {
        let sql = finalize_statement(EntityKind::Group, &TableNames::default());
        assert_eq!(
            sql,
            "INSERT INTO group_event (id, name) \
             SELECT DISTINCT ON (s.id) s.id, s.name FROM stg_group_event s \
             WHERE s.id IS NOT NULL \
             ORDER BY s.id \
             ON CONFLICT (id) DO NOTHING"
        );
    }

    #[test]
    fn test_event_statement_requires_parent() {
        let tables = TableNames {
            staging_prefix: "load_".into(),
            ..TableNames::default()
        };
        let sql = finalize_statement(EntityKind::Event, &tables);
        assert!(sql.starts_with("INSERT INTO event (id, group_event_id, name) "));
        assert!(sql.contains("FROM load_event s"));
        assert!(sql.contains("EXISTS (SELECT 1 FROM group_event p WHERE p.id = s.group_event_id)"));
        assert!(sql.ends_with("ON CONFLICT (id) DO NOTHING"));
    }

    #[test]
    fn test_orphan_count_only_for_children() {
        let tables = TableNames::default();
        assert_eq!(orphan_count_statement(EntityKind::Group, &tables), None);
        assert_eq!(
            orphan_count_statement(EntityKind::Event, &tables).unwrap(),
            "SELECT COUNT(DISTINCT s.id) FROM stg_event s \
             WHERE s.id IS NOT NULL AND NOT EXISTS (SELECT 1 FROM group_event p WHERE p.id = s.group_event_id)"
        );
    }
}
