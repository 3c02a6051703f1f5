//! Migration files, the tracking table and the apply lifecycle

pub mod backup;
pub mod branch_aware;
pub mod conflict;
pub mod file;
pub mod history;
pub mod runner;

pub use backup::{BackupProvider, JsonBackup, RestoreReport};
pub use branch_aware::BranchAwareMigrator;
pub use conflict::{ConflictDetector, ConflictKind, MigrationConflict, Severity};
pub use file::Migration;
pub use history::{AppliedMigration, MigrationRecord, TRACKING_TABLE};
pub use runner::{ApplyReport, MigrationStatus, MigrationStatusItem, Migrator, ResetReport};
