//! Migration runner
//!
//! The [`Migrator`] owns the apply lifecycle: bootstrap the tracking table,
//! discover migration files, gate the batch on conflict detection, then run
//! each pending migration in its own transaction and record it once the
//! transaction has committed. A migration that fails rolls back and leaves no
//! tracking row; migrations committed before it stay applied.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::db::adapter::DatabaseAdapter;
use crate::db::executor::SqlExecutor;
use crate::error::{Error, Result};
use crate::migrations::backup::{BackupProvider, JsonBackup, RestoreReport};
use crate::migrations::conflict::{ConflictDetector, ConflictKind, MigrationConflict};
use crate::migrations::file::{self, Migration};
use crate::migrations::history::{MigrationRecord, STALE_RECORD_HOURS};
use crate::schema::diff::SchemaDiff;
use crate::schema::generator::MigrationGenerator;
use crate::schema::parser::SchemaParser;
use crate::utils::patterns::SqlPatterns;
use crate::utils::prompt::{Prompter, StdinPrompter};

const ADD_DEFAULTS: &str = "Add default values to the new columns";
const RESET_AND_REAPPLY: &str = "Reset the database and re-apply all migrations (all data will be lost)";
const FORCE_CONTINUE: &str = "Continue anyway";
const CANCEL: &str = "Cancel";

/// Outcome of `apply` and `deploy`
#[derive(Debug, Default, Clone, Serialize)]
pub struct ApplyReport {
    /// Ids applied by this run, in order
    pub applied: Vec<String>,
    /// Conflicts found before applying, including any that were forced through
    pub conflicts: Vec<MigrationConflict>,
    /// The database was reset before applying
    pub reset: bool,
    pub backup: Option<PathBuf>,
}

impl ApplyReport {
    pub fn is_noop(&self) -> bool {
        self.applied.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MigrationStatusItem {
    pub id: String,
    pub name: String,
    pub applied: bool,
    pub applied_at: Option<DateTime<Utc>>,
    /// The file changed after it was applied
    pub checksum_mismatch: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct MigrationStatus {
    pub namespace: String,
    pub total: usize,
    pub applied: usize,
    pub pending: usize,
    pub migrations: Vec<MigrationStatusItem>,
    /// Applied ids with no local file
    pub missing_files: Vec<String>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct ResetReport {
    pub dropped_tables: Vec<String>,
    pub dropped_enums: Vec<String>,
    pub backup: Option<PathBuf>,
    pub removed_files: usize,
}

/// Applies migration files to the database an adapter points at
pub struct Migrator {
    adapter: Arc<dyn DatabaseAdapter>,
    migrations_dir: PathBuf,
    prompter: Arc<dyn Prompter>,
    backup: Arc<dyn BackupProvider>,
    patterns: Arc<SqlPatterns>,
    force: bool,
}

impl Migrator {
    /// A migrator prompting on stdin and writing JSON backups under
    /// `<migrations_dir>/backups`
    pub fn new(adapter: Arc<dyn DatabaseAdapter>, migrations_dir: impl Into<PathBuf>) -> Result<Self> {
        let migrations_dir = migrations_dir.into();
        Ok(Self {
            backup: Arc::new(JsonBackup::new(migrations_dir.join("backups"))),
            prompter: Arc::new(StdinPrompter),
            patterns: Arc::new(SqlPatterns::new()?),
            adapter,
            migrations_dir,
            force: false,
        })
    }

    pub fn with_prompter(mut self, prompter: Arc<dyn Prompter>) -> Self {
        self.prompter = prompter;
        self
    }

    pub fn with_backup(mut self, backup: Arc<dyn BackupProvider>) -> Self {
        self.backup = backup;
        self
    }

    /// Skip every prompt. Blocking conflicts still fail.
    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn adapter(&self) -> &Arc<dyn DatabaseAdapter> {
        &self.adapter
    }

    pub fn migrations_dir(&self) -> &Path {
        &self.migrations_dir
    }

    /// Create the tracking table, upgrade older layouts and purge rows left by
    /// crashed runs
    pub async fn bootstrap(&self) -> Result<()> {
        self.adapter.create_migrations_table().await?;
        self.adapter.ensure_migration_table_compatibility().await?;

        let cutoff = Utc::now() - Duration::hours(STALE_RECORD_HOURS);
        match self.adapter.cleanup_broken_migration_records(cutoff).await {
            Ok(0) => {}
            Ok(purged) => tracing::info!(purged, "Removed unfinished migration records"),
            Err(e) => tracing::warn!(error = %e, "Failed to clean up unfinished migration records"),
        }
        Ok(())
    }

    /// Every migration file, sorted by id
    pub fn load_migrations(&self) -> Result<Vec<Migration>> {
        file::discover(&self.migrations_dir)
    }

    /// Migrations with no tracking row, in id order
    pub async fn pending(&self) -> Result<Vec<Migration>> {
        let applied: HashSet<String> = self
            .adapter
            .get_applied_migrations()
            .await?
            .into_iter()
            .map(|m| m.id)
            .collect();

        Ok(self
            .load_migrations()?
            .into_iter()
            .filter(|m| !applied.contains(&m.id))
            .collect())
    }

    /// Apply pending migrations after conflict detection
    pub async fn apply(&self) -> Result<ApplyReport> {
        self.bootstrap().await?;

        let pending = self.pending().await?;
        if pending.is_empty() {
            tracing::info!("No pending migrations");
            return Ok(ApplyReport::default());
        }
        tracing::info!(count = pending.len(), "Found pending migrations");

        let detector = ConflictDetector::new(self.adapter.clone(), self.patterns.clone());
        let conflicts = detector.detect_all(&pending).await?;
        if conflicts.is_empty() {
            return self.apply_all(&pending, ApplyReport::default()).await;
        }

        self.resolve_conflicts(conflicts, pending).await
    }

    /// Apply pending migrations without conflict detection
    pub async fn deploy(&self) -> Result<ApplyReport> {
        self.bootstrap().await?;

        let pending = self.pending().await?;
        if pending.is_empty() {
            tracing::info!("No pending migrations");
            return Ok(ApplyReport::default());
        }

        self.apply_all(&pending, ApplyReport::default()).await
    }

    async fn resolve_conflicts(
        &self,
        conflicts: Vec<MigrationConflict>,
        pending: Vec<Migration>,
    ) -> Result<ApplyReport> {
        let blocking = conflicts.iter().any(MigrationConflict::is_blocking);
        for conflict in &conflicts {
            tracing::warn!(
                kind = %conflict.kind,
                table = %conflict.table,
                migration = conflict.migration_id.as_deref().unwrap_or(""),
                blocking = conflict.is_blocking(),
                "{}",
                conflict.description
            );
        }

        if self.force {
            if blocking {
                return Err(Error::Conflicts(conflicts));
            }
            tracing::warn!(count = conflicts.len(), "Continuing past conflicts because of --force");
            let report = ApplyReport {
                conflicts,
                ..Default::default()
            };
            return self.apply_all(&pending, report).await;
        }

        let not_null: Vec<&MigrationConflict> = conflicts
            .iter()
            .filter(|c| c.kind == ConflictKind::NotNullConstraint)
            .collect();

        let mut options = Vec::new();
        if !not_null.is_empty() {
            options.push(ADD_DEFAULTS.to_string());
        }
        options.push(RESET_AND_REAPPLY.to_string());
        if !blocking {
            options.push(FORCE_CONTINUE.to_string());
        }
        options.push(CANCEL.to_string());

        let choice = self.prompter.choose(&conflict_menu(&conflicts), &options)?;
        match options[choice].as_str() {
            ADD_DEFAULTS => Err(Error::Cancelled(add_defaults_instructions(&not_null))),
            RESET_AND_REAPPLY => self.reset_and_reapply(conflicts).await,
            FORCE_CONTINUE => {
                let report = ApplyReport {
                    conflicts,
                    ..Default::default()
                };
                self.apply_all(&pending, report).await
            }
            _ => Err(Error::Cancelled("migration cancelled by user".to_string())),
        }
    }

    async fn reset_and_reapply(&self, conflicts: Vec<MigrationConflict>) -> Result<ApplyReport> {
        if !self.prompter.confirm(
            "This drops every table and its data, then applies all migrations from the start. Reset the database?",
        )? {
            return Err(Error::Cancelled("reset cancelled".to_string()));
        }

        let backup = self.offer_backup("Pre-migration-reset backup").await?;
        self.drop_everything().await?;
        self.bootstrap().await?;

        let all = self.load_migrations()?;
        tracing::info!(count = all.len(), "Applying all migrations from the beginning");

        let report = ApplyReport {
            conflicts,
            reset: true,
            backup,
            ..Default::default()
        };
        self.apply_all(&all, report).await
    }

    async fn apply_all(&self, migrations: &[Migration], mut report: ApplyReport) -> Result<ApplyReport> {
        for migration in migrations {
            self.apply_one(migration).await?;
            report.applied.push(migration.id.clone());
        }

        tracing::info!(applied = report.applied.len(), "All migrations applied successfully");
        Ok(report)
    }

    /// Run one migration in a transaction, then record it
    pub async fn apply_one(&self, migration: &Migration) -> Result<()> {
        tracing::info!(migration = %migration.id, name = %migration.name, "Applying migration");

        let statements = migration.statements()?;
        let started_at = Utc::now();
        SqlExecutor::new(self.adapter.clone())
            .execute_migration(&migration.id, &statements)
            .await?;

        let record = MigrationRecord {
            id: migration.id.clone(),
            checksum: migration.checksum.clone(),
            migration_name: migration.name.clone(),
            started_at,
            finished_at: Utc::now(),
            applied_steps_count: statements.len() as i32,
            logs: Some("Migration completed successfully".to_string()),
        };
        self.adapter.record_migration(&record).await.map_err(|e| {
            Error::MigrationError(format!(
                "Migration {} was applied but could not be recorded: {}",
                migration.id, e
            ))
        })?;

        tracing::info!(migration = %migration.id, statements = statements.len(), "Applied migration");
        Ok(())
    }

    /// Applied and pending migrations, with drift between the tracking table
    /// and the files on disk
    pub async fn status(&self) -> Result<MigrationStatus> {
        self.bootstrap().await?;

        let migrations = self.load_migrations()?;
        let applied: HashMap<String, _> = self
            .adapter
            .get_applied_migrations()
            .await?
            .into_iter()
            .map(|m| (m.id.clone(), m))
            .collect();

        let mut warnings = Vec::new();
        let items: Vec<MigrationStatusItem> = migrations
            .iter()
            .map(|migration| {
                let row = applied.get(&migration.id);
                let checksum_mismatch = row.map_or(false, |r| r.checksum != migration.checksum);
                if checksum_mismatch {
                    warnings.push(format!(
                        "Migration {} was modified after it was applied",
                        migration.id
                    ));
                }
                MigrationStatusItem {
                    id: migration.id.clone(),
                    name: migration.name.clone(),
                    applied: row.is_some(),
                    applied_at: row.map(|r| r.finished_at),
                    checksum_mismatch,
                }
            })
            .collect();

        let local: HashSet<&str> = migrations.iter().map(|m| m.id.as_str()).collect();
        let mut missing_files: Vec<String> = applied
            .keys()
            .filter(|id| !local.contains(id.as_str()))
            .cloned()
            .collect();
        missing_files.sort();
        for id in &missing_files {
            warnings.push(format!("Applied migration {} has no local file", id));
        }

        for warning in &warnings {
            tracing::warn!("{}", warning);
        }

        let applied_count = items.iter().filter(|i| i.applied).count();
        Ok(MigrationStatus {
            namespace: self.adapter.active_namespace().await,
            total: items.len(),
            applied: applied_count,
            pending: items.len() - applied_count,
            migrations: items,
            missing_files,
            warnings,
        })
    }

    /// Drop every table and enum. `force` skips the confirmation and the
    /// backup offer; migration files are only removed when confirmed
    /// interactively.
    pub async fn reset(&self, force: bool) -> Result<ResetReport> {
        let interactive = !(force || self.force);

        if interactive
            && !self
                .prompter
                .confirm("This will drop all tables and data. Are you sure you want to reset the database?")?
        {
            return Err(Error::Cancelled("reset cancelled".to_string()));
        }

        let backup = if interactive {
            self.offer_backup("Pre-reset backup").await?
        } else {
            None
        };

        let (dropped_tables, dropped_enums) = self.drop_everything().await?;

        let removed_files = if interactive && self.prompter.confirm("Delete all migration files?")? {
            self.remove_migration_files()
        } else {
            0
        };

        tracing::info!(
            tables = dropped_tables.len(),
            enums = dropped_enums.len(),
            "Database reset completed"
        );
        Ok(ResetReport {
            dropped_tables,
            dropped_enums,
            backup,
            removed_files,
        })
    }

    /// Manual backup
    pub async fn backup(&self, comment: &str) -> Result<PathBuf> {
        let comment = if comment.trim().is_empty() {
            "Manual backup"
        } else {
            comment
        };
        self.backup.create_backup(self.adapter.as_ref(), comment).await
    }

    /// Replace table contents with the rows of a backup file. Asks first
    /// unless forced; the schema must already contain the backed up tables.
    pub async fn restore(&self, path: &Path) -> Result<RestoreReport> {
        if !path.is_file() {
            return Err(Error::MigrationError(format!(
                "Backup file does not exist: {}",
                path.display()
            )));
        }

        if !self.force
            && !self.prompter.confirm(&format!(
                "This will overwrite all existing data. Restore from {}?",
                path.display()
            ))?
        {
            return Err(Error::Cancelled("restore cancelled".to_string()));
        }

        self.backup.restore(self.adapter.as_ref(), path).await
    }

    /// Write a migration from the difference between the schema files and
    /// the database
    pub async fn generate(&self, name: &str, schema_path: &Path) -> Result<Migration> {
        self.generator().generate(name, schema_path).await
    }

    /// The diff and SQL `generate` would write, without writing it
    pub async fn preview(&self, schema_path: &Path) -> Result<(SchemaDiff, String)> {
        self.generator().preview(schema_path).await
    }

    fn generator(&self) -> MigrationGenerator {
        let parser = SchemaParser::with_patterns(self.patterns.clone());
        MigrationGenerator::new(self.adapter.clone(), parser, &self.migrations_dir)
    }

    /// Ask for a backup. A failed backup asks whether to go on without one.
    async fn offer_backup(&self, comment: &str) -> Result<Option<PathBuf>> {
        if !self.prompter.confirm("Create a backup before reset?")? {
            return Ok(None);
        }

        match self.backup.create_backup(self.adapter.as_ref(), comment).await {
            Ok(path) => {
                tracing::info!(path = %path.display(), "Backup created");
                Ok(Some(path))
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to create backup");
                if self.prompter.confirm("Continue without backup?")? {
                    Ok(None)
                } else {
                    Err(Error::Cancelled("backup failed, reset cancelled".to_string()))
                }
            }
        }
    }

    async fn drop_everything(&self) -> Result<(Vec<String>, Vec<String>)> {
        let tables = self.adapter.get_all_table_names().await?;
        if !tables.is_empty() {
            tracing::info!(count = tables.len(), "Dropping all tables");
            self.adapter.drop_tables(&tables).await?;
        }

        let mut enums = Vec::new();
        for schema_enum in self.adapter.get_current_enums().await? {
            match self.adapter.drop_enum(&schema_enum.name).await {
                Ok(()) => enums.push(schema_enum.name),
                Err(e) => tracing::warn!(enum_type = %schema_enum.name, error = %e, "Failed to drop enum"),
            }
        }

        Ok((tables, enums))
    }

    /// Delete the `*.sql` files; branch metadata and backups stay
    fn remove_migration_files(&self) -> usize {
        let migrations = match self.load_migrations() {
            Ok(migrations) => migrations,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to list migration files");
                return 0;
            }
        };

        let mut removed = 0;
        for migration in migrations {
            match fs::remove_file(&migration.path) {
                Ok(()) => removed += 1,
                Err(e) => tracing::warn!(path = %migration.path.display(), error = %e, "Failed to remove migration file"),
            }
        }
        tracing::info!(removed, dir = %self.migrations_dir.display(), "Removed migration files");
        removed
    }
}

fn conflict_menu(conflicts: &[MigrationConflict]) -> String {
    let mut message = String::from("There are conflicts that need to be resolved:\n");
    for conflict in conflicts {
        message.push_str(&format!("  - {}\n", conflict.summary()));
        for remedy in &conflict.remedies {
            message.push_str(&format!("      * {}\n", remedy));
        }
    }
    message.push_str("How would you like to resolve this?");
    message
}

fn add_defaults_instructions(conflicts: &[&MigrationConflict]) -> String {
    let mut message = String::from("add DEFAULT values to these columns and run the migration again:");
    for conflict in conflicts {
        message.push_str(&format!(
            "\n  {}.{}",
            conflict.table,
            conflict.column.as_deref().unwrap_or("?")
        ));
    }
    if let Some(first) = conflicts.first() {
        message.push_str(&format!(
            "\nExample: ALTER TABLE \"{}\" ADD COLUMN \"{}\" VARCHAR(255) NOT NULL DEFAULT '';",
            first.table,
            first.column.as_deref().unwrap_or("column")
        ));
    }
    message
}
