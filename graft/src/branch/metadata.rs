//! Branch metadata persisted as JSON under `<migrations_dir>/.graft/`

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

pub const METADATA_DIR: &str = ".graft";
pub const METADATA_FILE: &str = "branches.json";
pub const DEFAULT_BRANCH: &str = "main";

/// One logical branch and the namespace backing it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchMetadata {
    pub name: String,
    /// Branch this one was cloned from; empty for the default branch
    #[serde(default)]
    pub parent: String,
    /// Schema, database or file suffix holding the branch's tables
    pub schema: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub is_default: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchStore {
    pub current: String,
    pub branches: Vec<BranchMetadata>,
}

impl BranchStore {
    /// A store holding only the default branch
    pub fn with_default(namespace: &str) -> Self {
        Self {
            current: DEFAULT_BRANCH.to_string(),
            branches: vec![BranchMetadata {
                name: DEFAULT_BRANCH.to_string(),
                parent: String::new(),
                schema: namespace.to_string(),
                created_at: Utc::now(),
                is_default: true,
            }],
        }
    }

    pub fn branch(&self, name: &str) -> Option<&BranchMetadata> {
        self.branches.iter().find(|b| b.name == name)
    }

    pub fn branch_mut(&mut self, name: &str) -> Option<&mut BranchMetadata> {
        self.branches.iter_mut().find(|b| b.name == name)
    }

    /// The branch named by `current`
    pub fn current_branch(&self) -> Result<&BranchMetadata> {
        self.branch(&self.current)
            .ok_or_else(|| Error::branch(format!("current branch '{}' not found", self.current)))
    }

    pub fn add(&mut self, branch: BranchMetadata) -> Result<()> {
        if self.branch(&branch.name).is_some() {
            return Err(Error::branch(format!("branch '{}' already exists", branch.name)));
        }
        self.branches.push(branch);
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> Result<BranchMetadata> {
        let index = self
            .branches
            .iter()
            .position(|b| b.name == name)
            .ok_or_else(|| Error::branch(format!("branch '{}' not found", name)))?;
        Ok(self.branches.remove(index))
    }
}

/// Reads and writes `branches.json`
#[derive(Debug, Clone)]
pub struct MetadataManager {
    path: PathBuf,
}

impl MetadataManager {
    pub fn new(migrations_dir: impl AsRef<Path>) -> Self {
        Self {
            path: migrations_dir.as_ref().join(METADATA_DIR).join(METADATA_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the store. A missing file means a single default branch on
    /// `default_namespace`.
    pub fn load(&self, default_namespace: &str) -> Result<BranchStore> {
        if !self.path.exists() {
            return Ok(BranchStore::with_default(default_namespace));
        }

        let content = fs::read_to_string(&self.path)?;
        let store: BranchStore = serde_json::from_str(&content)
            .map_err(|e| Error::branch(format!("failed to parse {}: {}", self.path.display(), e)))?;
        store.current_branch()?;
        Ok(store)
    }

    pub fn save(&self, store: &BranchStore) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, serde_json::to_string_pretty(store)?)?;
        tracing::debug!(path = %self.path.display(), branches = store.branches.len(), "Saved branch metadata");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn missing_file_is_a_single_main_branch() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataManager::new(dir.path()).load("public").unwrap();

        assert_eq!(store.current, "main");
        assert_eq!(store.branches.len(), 1);
        assert!(store.branches[0].is_default);
        assert_eq!(store.branches[0].schema, "public");
    }

    #[test]
    fn saves_next_to_migrations() {
        let dir = tempfile::tempdir().unwrap();
        let manager = MetadataManager::new(dir.path());
        let mut store = BranchStore::with_default("main");
        store
            .add(BranchMetadata {
                name: "feature".to_string(),
                parent: "main".to_string(),
                schema: "feature".to_string(),
                created_at: Utc::now(),
                is_default: false,
            })
            .unwrap();

        manager.save(&store).unwrap();

        assert!(dir.path().join(".graft/branches.json").exists());
        assert_eq!(manager.load("ignored").unwrap(), store);
        assert!(store.add(store.branches[1].clone()).is_err());
    }

    #[test]
    fn rejects_unknown_current_branch() {
        let dir = tempfile::tempdir().unwrap();
        let manager = MetadataManager::new(dir.path());
        let mut store = BranchStore::with_default("public");
        store.current = "ghost".to_string();
        manager.save(&store).unwrap();

        assert!(matches!(manager.load("public"), Err(Error::BranchError(_))));
    }
}
