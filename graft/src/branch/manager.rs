//! Branch lifecycle
//!
//! A branch is an isolated copy of the database: a Postgres schema, a MySQL
//! database or a sibling SQLite file. Creating one clones the current
//! branch's namespace, structure and data both.

use chrono::Utc;
use std::path::Path;
use std::sync::Arc;

use crate::branch::metadata::{BranchMetadata, BranchStore, MetadataManager};
use crate::db::adapter::DatabaseAdapter;
use crate::error::{Error, Result};
use crate::schema::diff::SchemaDiff;
use crate::schema::introspect::SchemaIntrospector;
use crate::schema::types::SchemaSnapshot;
use crate::utils::naming::validate_branch_name;

pub struct BranchManager {
    adapter: Arc<dyn DatabaseAdapter>,
    metadata: MetadataManager,
}

impl BranchManager {
    pub fn new(adapter: Arc<dyn DatabaseAdapter>, migrations_dir: impl AsRef<Path>) -> Self {
        Self {
            adapter,
            metadata: MetadataManager::new(migrations_dir),
        }
    }

    fn load(&self) -> Result<BranchStore> {
        self.metadata.load(&self.adapter.default_namespace())
    }

    /// Clone the current branch into a new branch. The current branch does
    /// not change.
    pub async fn create(&self, name: &str) -> Result<BranchMetadata> {
        validate_branch_name(name)?;

        let mut store = self.load()?;
        if store.branch(name).is_some() {
            return Err(Error::branch(format!("branch '{}' already exists", name)));
        }

        let parent = store.current_branch()?.clone();
        let schema = self.adapter.dialect().branch_namespace(name);
        if store.branches.iter().any(|b| b.schema == schema) {
            return Err(Error::branch(format!("namespace '{}' is already used by another branch", schema)));
        }

        self.adapter.create_branch_namespace(&parent.schema, &schema).await?;

        let branch = BranchMetadata {
            name: name.to_string(),
            parent: parent.name,
            schema,
            created_at: Utc::now(),
            is_default: false,
        };
        store.add(branch.clone())?;
        self.metadata.save(&store)?;

        tracing::info!(branch = name, schema = %branch.schema, parent = %branch.parent, "Created branch");
        Ok(branch)
    }

    /// Make `name` current and point the adapter at its namespace
    pub async fn switch(&self, name: &str) -> Result<BranchMetadata> {
        let mut store = self.load()?;
        let branch = store
            .branch(name)
            .cloned()
            .ok_or_else(|| Error::branch(format!("branch '{}' not found", name)))?;

        self.adapter.set_active_schema(&branch.schema).await?;
        store.current = branch.name.clone();
        self.metadata.save(&store)?;

        tracing::info!(branch = name, schema = %branch.schema, "Switched branch");
        Ok(branch)
    }

    /// Rename a branch. Its namespace keeps its name.
    pub fn rename(&self, old_name: &str, new_name: &str) -> Result<()> {
        validate_branch_name(new_name)?;

        let mut store = self.load()?;
        if store.branch(new_name).is_some() {
            return Err(Error::branch(format!("branch '{}' already exists", new_name)));
        }

        let branch = store
            .branch_mut(old_name)
            .ok_or_else(|| Error::branch(format!("branch '{}' not found", old_name)))?;
        branch.name = new_name.to_string();

        for child in store.branches.iter_mut().filter(|b| b.parent == old_name) {
            child.parent = new_name.to_string();
        }
        if store.current == old_name {
            store.current = new_name.to_string();
        }

        self.metadata.save(&store)?;
        tracing::info!(from = old_name, to = new_name, "Renamed branch");
        Ok(())
    }

    /// Drop a branch and its namespace. The default and the current branch
    /// cannot be deleted.
    pub async fn delete(&self, name: &str) -> Result<()> {
        let mut store = self.load()?;
        let branch = store
            .branch(name)
            .ok_or_else(|| Error::branch(format!("branch '{}' not found", name)))?;

        if branch.is_default {
            return Err(Error::branch(format!("cannot delete default branch '{}'", name)));
        }
        if store.current == name {
            return Err(Error::branch(format!("cannot delete current branch '{}'", name)));
        }

        self.adapter.drop_branch_namespace(&branch.schema).await?;
        let removed = store.remove(name)?;
        self.metadata.save(&store)?;

        tracing::info!(branch = name, schema = %removed.schema, "Deleted branch");
        Ok(())
    }

    /// All branches and the name of the current one
    pub fn list(&self) -> Result<(Vec<BranchMetadata>, String)> {
        let store = self.load()?;
        Ok((store.branches, store.current))
    }

    pub fn current(&self) -> Result<BranchMetadata> {
        Ok(self.load()?.current_branch()?.clone())
    }

    /// Schema changes that would turn branch `from` into branch `to`. The
    /// adapter is pointed back at the namespace it started on afterwards.
    pub async fn diff(&self, from: &str, to: &str) -> Result<SchemaDiff> {
        let store = self.load()?;
        let find = |name: &str| {
            store
                .branch(name)
                .cloned()
                .ok_or_else(|| Error::branch(format!("branch '{}' not found", name)))
        };
        let (from_branch, to_branch) = (find(from)?, find(to)?);

        let active = self.adapter.active_namespace().await;
        let snapshots = self.snapshots(&from_branch.schema, &to_branch.schema).await;
        self.adapter.set_active_schema(&active).await?;
        let (from_schema, to_schema) = snapshots?;

        let diff = SchemaDiff::generate(&from_schema, &to_schema, self.adapter.dialect());
        tracing::info!(from, to, changes = diff.summary().len(), "Compared branches");
        Ok(diff)
    }

    async fn snapshots(&self, first: &str, second: &str) -> Result<(SchemaSnapshot, SchemaSnapshot)> {
        let introspector = SchemaIntrospector::new(self.adapter.clone());

        self.adapter.set_active_schema(first).await?;
        let first = introspector.introspect().await?;
        self.adapter.set_active_schema(second).await?;
        let second = introspector.introspect().await?;

        Ok((first, second))
    }
}
