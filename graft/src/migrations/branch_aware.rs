//! Branch-aware migration runner
//!
//! Points the adapter at the current branch's namespace, then behaves exactly
//! like the [`Migrator`] it wraps.

use std::ops::Deref;

use crate::branch::metadata::{BranchMetadata, MetadataManager};
use crate::error::Result;
use crate::migrations::runner::Migrator;

pub struct BranchAwareMigrator {
    inner: Migrator,
    branch: BranchMetadata,
}

impl BranchAwareMigrator {
    /// Load the current branch and switch the migrator's adapter to it
    pub async fn new(inner: Migrator) -> Result<Self> {
        let metadata = MetadataManager::new(inner.migrations_dir());
        Self::with_metadata(inner, &metadata).await
    }

    pub async fn with_metadata(inner: Migrator, metadata: &MetadataManager) -> Result<Self> {
        let adapter = inner.adapter();
        let store = metadata.load(&adapter.default_namespace())?;
        let branch = store.current_branch()?.clone();

        if adapter.active_namespace().await != branch.schema {
            adapter.set_active_schema(&branch.schema).await?;
            tracing::info!(branch = %branch.name, namespace = %branch.schema, "Using branch namespace");
        }

        Ok(Self { inner, branch })
    }

    pub fn branch(&self) -> &BranchMetadata {
        &self.branch
    }

    pub fn into_inner(self) -> Migrator {
        self.inner
    }
}

impl Deref for BranchAwareMigrator {
    type Target = Migrator;

    fn deref(&self) -> &Migrator {
        &self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::branch::BranchManager;
    use crate::config::DatabaseConfig;
    use crate::db::connection;
    use pretty_assertions::assert_eq;
    use std::fs;

    #[tokio::test]
    async fn applies_to_the_current_branch_only() {
        let dir = tempfile::tempdir().unwrap();
        let migrations = dir.path().join("migrations");
        let config = DatabaseConfig {
            driver: "sqlite".to_string(),
            url: format!("sqlite://{}", dir.path().join("app.db").display()),
            pool_size: Some(1),
            timeout_seconds: None,
        };

        let branches = BranchManager::new(connection::connect(&config).await.unwrap(), &migrations);
        branches.create("feature").await.unwrap();
        branches.switch("feature").await.unwrap();

        fs::write(
            migrations.join("20240101000000_notes.sql"),
            "CREATE TABLE notes (id INTEGER PRIMARY KEY);",
        )
        .unwrap();

        let adapter = connection::connect(&config).await.unwrap();
        let migrator = BranchAwareMigrator::new(Migrator::new(adapter.clone(), &migrations).unwrap())
            .await
            .unwrap();
        assert_eq!(migrator.branch().name, "feature");

        let report = migrator.apply().await.unwrap();
        assert_eq!(report.applied.len(), 1);
        assert!(adapter.table_exists("notes").await.unwrap());

        adapter.set_active_schema("main").await.unwrap();
        assert!(!adapter.table_exists("notes").await.unwrap());
    }
}
