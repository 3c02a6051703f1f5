//! graft CLI
//!
//! Thin front-end over the library: every command loads `graft.toml`,
//! connects, and calls one `GraftClient` operation.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};

use graft::utils::logging;
use graft::{config, Error, GraftClient};

/// Declarative schema migrations for PostgreSQL, MySQL and SQLite.
#[derive(Parser)]
#[command(name = "graft")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file.
    #[arg(short, long, env = "GRAFT_CONFIG", default_value = "graft.toml")]
    config: PathBuf,

    /// Never prompt. Blocking conflicts still fail.
    #[arg(short, long, global = true)]
    force: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a migration for the difference between the schema files and the database.
    Generate {
        /// Migration name.
        name: String,

        /// Print the SQL without writing a file.
        #[arg(long)]
        dry_run: bool,
    },

    /// Apply pending migrations, checking for conflicts first.
    Apply {
        /// Generate a migration with this name before applying.
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Apply pending migrations without conflict detection.
    Deploy,

    /// Show applied and pending migrations.
    Status,

    /// Drop every table and enum.
    Reset,

    /// Write a JSON backup of every table.
    Backup {
        /// Note stored in the backup file.
        comment: Option<String>,
    },

    /// Replace table contents with the rows of a backup file.
    Restore {
        /// Backup file written by `backup` or `reset`.
        file: PathBuf,
    },

    /// Manage database branches.
    Branch {
        #[command(subcommand)]
        command: BranchCommands,
    },
}

#[derive(Subcommand)]
enum BranchCommands {
    /// Copy the current branch into a new one.
    Create { name: String },
    /// Make a branch current.
    Switch { name: String },
    /// Drop a branch and its data.
    Delete { name: String },
    /// Rename a branch.
    Rename { old: String, new: String },
    /// List branches.
    List,
    /// Show the schema changes that turn one branch into another.
    Diff { from: String, to: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = config::load_from_file(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    logging::init_logging(&config.logging)?;

    let client = GraftClient::new(config).await?.with_force(cli.force);
    let result = run(&client, cli.command).await;
    client.close().await;
    result
}

async fn run(client: &GraftClient, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Generate { dry_run: true, .. } => {
            let (diff, sql) = client.preview().await?;
            if !diff.has_changes() {
                println!("No schema changes detected");
                return Ok(());
            }
            for line in diff.summary() {
                println!("{}", line);
            }
            println!("\n{}", sql);
        }

        Commands::Generate { name, dry_run: false } => match client.generate(&name).await {
            Ok(migration) => println!("Created {}", migration.path.display()),
            Err(Error::NoChanges) => println!("No schema changes detected"),
            Err(e) => return Err(e.into()),
        },

        Commands::Apply { name } => {
            if let Some(name) = name {
                match client.generate(&name).await {
                    Ok(migration) => println!("Created {}", migration.path.display()),
                    Err(Error::NoChanges) => println!("No schema changes detected"),
                    Err(e) => return Err(e.into()),
                }
            }
            print_apply(client.apply().await?);
        }

        Commands::Deploy => print_apply(client.deploy().await?),

        Commands::Status => {
            let status = client.status().await?;
            println!("Namespace: {}", status.namespace);
            println!("Total migrations: {}", status.total);
            println!("Applied: {}", status.applied);
            println!("Pending: {}\n", status.pending);

            if status.migrations.is_empty() {
                println!("No migrations found.");
            }
            for item in &status.migrations {
                let applied = item
                    .applied_at
                    .map(|at| at.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_else(|| "not applied".to_string());
                let marker = if item.applied { "[X]" } else { "[ ]" };
                println!("{} {} ({})", marker, item.id, applied);
            }
            for warning in &status.warnings {
                println!("warning: {}", warning);
            }
        }

        Commands::Reset => {
            let report = client.reset().await?;
            println!(
                "Dropped {} table(s) and {} enum(s)",
                report.dropped_tables.len(),
                report.dropped_enums.len()
            );
            if let Some(path) = report.backup {
                println!("Backup written to {}", path.display());
            }
            if report.removed_files > 0 {
                println!("Removed {} migration file(s)", report.removed_files);
            }
        }

        Commands::Backup { comment } => {
            let path = client.backup(comment.as_deref().unwrap_or("")).await?;
            println!("Backup completed: {}", path.display());
        }

        Commands::Restore { file } => {
            let report = client.restore(&file).await?;
            for (table, rows) in &report.tables {
                println!("Restored {} row(s) into {}", rows, table);
            }
            for table in &report.skipped {
                println!("warning: table {} from the backup does not exist, skipped", table);
            }
        }

        Commands::Branch { command } => {
            let branches = client.branches();
            match command {
                BranchCommands::Create { name } => {
                    let branch = branches.create(&name).await?;
                    println!("Created branch '{}' from '{}' ({})", branch.name, branch.parent, branch.schema);
                }
                BranchCommands::Switch { name } => {
                    let branch = branches.switch(&name).await?;
                    println!("Switched to branch '{}' ({})", branch.name, branch.schema);
                }
                BranchCommands::Delete { name } => {
                    branches.delete(&name).await?;
                    println!("Deleted branch '{}'", name);
                }
                BranchCommands::Rename { old, new } => {
                    branches.rename(&old, &new)?;
                    println!("Renamed branch '{}' to '{}'", old, new);
                }
                BranchCommands::Diff { from, to } => {
                    let diff = client.branch_diff(&from, &to).await?;
                    if !diff.has_changes() {
                        println!("No differences between '{}' and '{}'", from, to);
                    }
                    for line in diff.summary() {
                        println!("{}", line);
                    }
                }
                BranchCommands::List => {
                    let (all, current) = branches.list()?;
                    for branch in all {
                        let marker = if branch.name == current { "*" } else { " " };
                        println!("{} {} ({})", marker, branch.name, branch.schema);
                    }
                }
            }
        }
    }

    Ok(())
}

fn print_apply(report: graft::ApplyReport) {
    if report.is_noop() {
        println!("No pending migrations");
        return;
    }
    if report.reset {
        println!("Database was reset before applying");
    }
    for id in &report.applied {
        println!("Applied {}", id);
    }
}
