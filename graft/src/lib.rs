//! graft: declarative schema files in, forward migrations out
//!
//! graft parses a directory of `CREATE TABLE` / `CREATE INDEX` / `CREATE TYPE`
//! DDL, compares it with the live database, writes the difference as a
//! timestamped migration file and applies pending migrations one transaction
//! at a time, with conflict detection, backups and database branches.

pub mod branch;
pub mod config;
pub mod db;
pub mod error;
pub mod migrations;
pub mod schema;
pub mod utils;

#[cfg(test)]
mod test;

use std::path::Path;
use std::sync::Arc;

// Re-export main types for easier access
pub use branch::BranchManager;
pub use config::Config;
pub use db::{DatabaseAdapter, Dialect};
pub use error::{Error, Result};
pub use migrations::{
    ApplyReport, BranchAwareMigrator, Migration, MigrationConflict, MigrationStatus, Migrator,
    ResetReport, RestoreReport,
};
pub use schema::{MigrationGenerator, SchemaDiff, SchemaParser};

use migrations::JsonBackup;
use utils::prompt::{Prompter, StdinPrompter};

/// Initialize graft with the specified configuration file
pub async fn init(config_path: &str) -> Result<GraftClient> {
    let config = config::load_from_file(config_path)?;
    GraftClient::new(config).await
}

/// The main client for interacting with graft
pub struct GraftClient {
    config: Config,
    adapter: Arc<dyn DatabaseAdapter>,
    prompter: Arc<dyn Prompter>,
    force: bool,
}

impl GraftClient {
    /// Connect using the `[database]` section of `config`
    pub async fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let adapter = db::connect(&config.database).await?;

        Ok(Self {
            config,
            adapter,
            prompter: Arc::new(StdinPrompter),
            force: false,
        })
    }

    pub fn with_prompter(mut self, prompter: Arc<dyn Prompter>) -> Self {
        self.prompter = prompter;
        self
    }

    /// Answer every prompt without asking
    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn adapter(&self) -> &Arc<dyn DatabaseAdapter> {
        &self.adapter
    }

    /// A migrator already pointed at the current branch
    pub async fn migrator(&self) -> Result<BranchAwareMigrator> {
        let migrator = Migrator::new(self.adapter.clone(), &self.config.migrations.directory)?
            .with_prompter(self.prompter.clone())
            .with_backup(Arc::new(JsonBackup::new(self.config.migrations.backup_dir())))
            .with_force(self.force);

        BranchAwareMigrator::new(migrator).await
    }

    pub fn branches(&self) -> BranchManager {
        BranchManager::new(self.adapter.clone(), &self.config.migrations.directory)
    }

    fn schema_path(&self) -> &Path {
        Path::new(&self.config.migrations.schema_path)
    }

    /// Write a migration for the difference between the schema files and the database
    pub async fn generate(&self, name: &str) -> Result<Migration> {
        self.migrator().await?.generate(name, self.schema_path()).await
    }

    /// The diff and SQL `generate` would write
    pub async fn preview(&self) -> Result<(SchemaDiff, String)> {
        self.migrator().await?.preview(self.schema_path()).await
    }

    pub async fn apply(&self) -> Result<ApplyReport> {
        self.migrator().await?.apply().await
    }

    pub async fn deploy(&self) -> Result<ApplyReport> {
        self.migrator().await?.deploy().await
    }

    pub async fn status(&self) -> Result<MigrationStatus> {
        self.migrator().await?.status().await
    }

    pub async fn reset(&self) -> Result<ResetReport> {
        self.migrator().await?.reset(self.force).await
    }

    pub async fn backup(&self, comment: &str) -> Result<std::path::PathBuf> {
        self.migrator().await?.backup(comment).await
    }

    /// Put the rows of a backup file back into the current branch
    pub async fn restore(&self, path: impl AsRef<Path>) -> Result<RestoreReport> {
        self.migrator().await?.restore(path.as_ref()).await
    }

    /// Schema changes between two branches
    pub async fn branch_diff(&self, from: &str, to: &str) -> Result<SchemaDiff> {
        self.branches().diff(from, to).await
    }

    pub async fn close(&self) {
        self.adapter.close().await;
    }
}
