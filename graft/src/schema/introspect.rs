//! Live schema introspection
//!
//! Builds a [`SchemaSnapshot`] of the database the adapter currently points at,
//! in the same shape the parser produces for schema files.

use std::sync::Arc;

use crate::db::adapter::DatabaseAdapter;
use crate::error::Result;
use crate::migrations::history::TRACKING_TABLE;
use crate::schema::types::{SchemaSnapshot, SchemaTable};

/// Reads tables, columns and enums from the live catalogs
pub struct SchemaIntrospector {
    adapter: Arc<dyn DatabaseAdapter>,
}

impl SchemaIntrospector {
    pub fn new(adapter: Arc<dyn DatabaseAdapter>) -> Self {
        Self { adapter }
    }

    /// Snapshot the active namespace. The tracking table is never part of it.
    pub async fn introspect(&self) -> Result<SchemaSnapshot> {
        let mut snapshot = SchemaSnapshot::new();

        for name in self.adapter.get_all_table_names().await? {
            if name.eq_ignore_ascii_case(TRACKING_TABLE) {
                continue;
            }

            let mut table = SchemaTable::new(name.as_str());
            table.columns = self.adapter.get_table_columns(&name).await?;
            normalize_primary_key(&mut table);

            for reference in table.columns.iter().filter_map(|c| c.references.as_ref()) {
                if !table.references.iter().any(|r| r.eq_ignore_ascii_case(&reference.table)) {
                    table.references.push(reference.table.clone());
                }
            }

            tracing::debug!(table = %table.name, columns = table.columns.len(), "Introspected table");
            snapshot.insert_table(table);
        }

        for schema_enum in self.adapter.get_current_enums().await? {
            snapshot.insert_enum(schema_enum);
        }

        tracing::info!(
            tables = snapshot.tables.len(),
            enums = snapshot.enums.len(),
            namespace = %self.adapter.active_namespace().await,
            "Introspected database schema"
        );

        Ok(snapshot)
    }
}

/// A composite key is a table-level `PRIMARY KEY (...)`, the way the parser
/// records it, not a flag on each member column.
fn normalize_primary_key(table: &mut SchemaTable) {
    let keys: Vec<String> = table
        .columns
        .iter()
        .filter(|c| c.primary_key)
        .map(|c| c.name.clone())
        .collect();

    if keys.len() > 1 {
        for column in &mut table.columns {
            column.primary_key = false;
        }
        table.primary_key = keys;
    }
}
