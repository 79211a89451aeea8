//! DDL for staging and final tables

use anyhow::{Context, Result};
use sqlx::PgPool;

use crate::config::TableNames;
use crate::record::EntityKind;

fn column_type(column: &str) -> &'static str {
    match column {
        "name" => "TEXT",
        _ => "BIGINT",
    }
}

/// Final table: primary key on the natural key, foreign key to the parent.
pub fn final_table_ddl(kind: EntityKind, tables: &TableNames) -> String {
    let key = kind.natural_key();
    let mut columns: Vec<String> = kind
        .columns()
        .iter()
        .map(|c| {
            if *c == key {
                format!("{} {} PRIMARY KEY", c, column_type(c))
            } else {
                format!("{} {}", c, column_type(c))
            }
        })
        .collect();

    if let Some((parent, fk)) = kind.parent() {
        if let Some(col) = columns.iter_mut().find(|c| c.starts_with(&format!("{} ", fk))) {
            col.push_str(&format!(
                " NOT NULL REFERENCES {} ({})",
                tables.final_table(parent),
                parent.natural_key()
            ));
        }
    }

    format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        tables.final_table(kind),
        columns.join(", ")
    )
}

/// Staging table: same columns, no constraints, not WAL-logged.
pub fn staging_table_ddl(kind: EntityKind, tables: &TableNames) -> String {
    let columns: Vec<String> = kind
        .columns()
        .iter()
        .map(|c| format!("{} {}", c, column_type(c)))
        .collect();
    format!(
        "CREATE UNLOGGED TABLE IF NOT EXISTS {} ({})",
        tables.staging_table(kind),
        columns.join(", ")
    )
}

fn parent_index_ddl(kind: EntityKind, tables: &TableNames) -> Option<String> {
    kind.parent().map(|(_, fk)| {
        let table = tables.final_table(kind);
        format!("CREATE INDEX IF NOT EXISTS {table}_{fk}_idx ON {table} ({fk})")
    })
}

/// Create any missing tables. Parents are created before children.
pub async fn ensure_schema(pool: &PgPool, tables: &TableNames) -> Result<()> {
    for kind in EntityKind::ALL {
        let mut statements = vec![final_table_ddl(kind, tables), staging_table_ddl(kind, tables)];
        statements.extend(parent_index_ddl(kind, tables));
        for statement in statements {
            sqlx::query(&statement)
                .execute(pool)
                .await
                .with_context(|| format!("Failed to run DDL: {}", statement))?;
        }
    }
    tracing::info!(
        group_table = %tables.group,
        event_table = %tables.event,
        staging_prefix = %tables.staging_prefix,
        "Schema ready"
    );
    Ok(())
}

/// Empty every staging table before a fresh load.
pub async fn truncate_staging(pool: &PgPool, tables: &TableNames) -> Result<()> {
    let names: Vec<String> = EntityKind::ALL.iter().map(|k| tables.staging_table(*k)).collect();
    sqlx::query(&format!("TRUNCATE {}", names.join(", ")))
        .execute(pool)
        .await
        .context("Failed to truncate staging tables")?;
    tracing::info!(tables = %names.join(","), "Staging truncated");
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_final_ddl() {
        let tables = TableNames::default();
        assert_eq!(
            final_table_ddl(EntityKind::Group, &tables),
            "CREATE TABLE IF NOT EXISTS group_event (id BIGINT PRIMARY KEY, name TEXT)"
        );
        assert_eq!(
            final_table_ddl(EntityKind::Event, &tables),
            "CREATE TABLE IF NOT EXISTS event (id BIGINT PRIMARY KEY, \
             group_event_id BIGINT NOT NULL REFERENCES group_event (id), name TEXT)"
        );
    }

    #[test]
    fn test_staging_ddl_has_no_constraints() {
        let ddl = staging_table_ddl(EntityKind::Event, &TableNames::default());
        assert_eq!(
            ddl,
            "CREATE UNLOGGED TABLE IF NOT EXISTS stg_event (id BIGINT, group_event_id BIGINT, name TEXT)"
        );
    }

    #[test]
    fn test_index_only_for_children() {
        let tables = TableNames::default();
        assert_eq!(parent_index_ddl(EntityKind::Group, &tables), None);
        assert_eq!(
            parent_index_ddl(EntityKind::Event, &tables).unwrap(),
            "CREATE INDEX IF NOT EXISTS event_group_event_id_idx ON event (group_event_id)"
        );
    }
}
