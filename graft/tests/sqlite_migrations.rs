//! End-to-end migration flows against a temporary SQLite database

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use pretty_assertions::assert_eq;
use rstest::rstest;
use tempfile::TempDir;

use graft::config::DatabaseConfig;
use graft::migrations::{ConflictDetector, ConflictKind};
use graft::utils::{Answer, Prompter, ScriptedPrompter, SqlPatterns};
use graft::{db, DatabaseAdapter, Error, Migrator};

struct Workspace {
    dir: TempDir,
    adapter: Arc<dyn DatabaseAdapter>,
}

impl Workspace {
    async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = DatabaseConfig {
            driver: "sqlite".to_string(),
            url: format!("sqlite://{}", dir.path().join("app.db").display()),
            pool_size: Some(2),
            timeout_seconds: Some(5),
        };
        let adapter = db::connect(&config).await.unwrap();
        Self { dir, adapter }
    }

    fn migrations_dir(&self) -> PathBuf {
        self.dir.path().join("migrations")
    }

    fn schema_dir(&self) -> PathBuf {
        self.dir.path().join("schema")
    }

    fn write_schema(&self, file: &str, sql: &str) {
        fs::create_dir_all(self.schema_dir()).unwrap();
        fs::write(self.schema_dir().join(file), sql).unwrap();
    }

    fn write_migration(&self, id: &str, body: &str) -> PathBuf {
        fs::create_dir_all(self.migrations_dir()).unwrap();
        let path = self.migrations_dir().join(format!("{}.sql", id));
        fs::write(&path, body).unwrap();
        path
    }

    fn migrator(&self) -> Migrator {
        self.migrator_with(Arc::new(ScriptedPrompter::default()))
    }

    fn migrator_with(&self, prompter: Arc<dyn Prompter>) -> Migrator {
        Migrator::new(self.adapter.clone(), self.migrations_dir())
            .unwrap()
            .with_prompter(prompter)
    }

    async fn exec(&self, sql: &str) {
        self.adapter.execute_query(sql).await.unwrap();
    }
}

fn sql_files(dir: &Path) -> usize {
    fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .filter(|e| e.path().extension().map_or(false, |ext| ext == "sql"))
                .count()
        })
        .unwrap_or(0)
}

#[tokio::test]
async fn generate_apply_and_round_trip() {
    let ws = Workspace::new().await;
    ws.write_schema(
        "users.sql",
        "CREATE TABLE users (id SERIAL PRIMARY KEY, name VARCHAR(255) NOT NULL);",
    );
    let migrator = ws.migrator();

    let migration = migrator.generate("init", &ws.schema_dir()).await.unwrap();
    assert!(migration.id.ends_with("_init"));
    assert_eq!(
        migration.body,
        "CREATE TABLE \"users\" (\n    \"id\" INTEGER PRIMARY KEY AUTOINCREMENT,\n    \"name\" VARCHAR(255) NOT NULL\n);"
    );

    let report = migrator.apply().await.unwrap();
    assert_eq!(report.applied, vec![migration.id.clone()]);

    let applied = ws.adapter.get_applied_migrations().await.unwrap();
    assert_eq!(applied.len(), 1);
    assert_eq!(applied[0].checksum, migration.checksum);

    // The database now matches the schema files
    let err = migrator.generate("again", &ws.schema_dir()).await.unwrap_err();
    assert!(err.is_no_changes());
    assert_eq!(sql_files(&ws.migrations_dir()), 1);
}

#[tokio::test]
async fn schema_changes_produce_follow_up_migrations() {
    let ws = Workspace::new().await;
    ws.write_schema("users.sql", "CREATE TABLE users (id SERIAL PRIMARY KEY);");
    let migrator = ws.migrator();
    migrator.generate("init", &ws.schema_dir()).await.unwrap();
    migrator.apply().await.unwrap();

    ws.write_schema(
        "users.sql",
        "CREATE TABLE users (id SERIAL PRIMARY KEY, nickname TEXT);\nCREATE TABLE tags (id SERIAL PRIMARY KEY);",
    );
    let (diff, sql) = migrator.preview(&ws.schema_dir()).await.unwrap();
    assert_eq!(diff.new_tables.len(), 1);
    assert_eq!(diff.modified_tables[0].new_columns[0].name, "nickname");
    assert!(sql.contains("ALTER TABLE \"users\" ADD COLUMN \"nickname\" TEXT;"));

    migrator.generate("tags", &ws.schema_dir()).await.unwrap();
    assert_eq!(migrator.apply().await.unwrap().applied.len(), 1);
    assert!(ws.adapter.column_exists("users", "nickname").await.unwrap());
    assert!(migrator.generate("noop", &ws.schema_dir()).await.unwrap_err().is_no_changes());
}

#[tokio::test]
async fn pending_migrations_apply_in_id_order() {
    let ws = Workspace::new().await;
    ws.write_migration("20240101000000_a", "CREATE TABLE a (id INTEGER PRIMARY KEY);");
    let migrator = ws.migrator();
    migrator.apply().await.unwrap();

    ws.write_migration("20240103000000_c", "CREATE TABLE c (id INTEGER PRIMARY KEY, b_id INTEGER REFERENCES b(id));");
    ws.write_migration("20240102000000_b", "CREATE TABLE b (id INTEGER PRIMARY KEY);");

    let report = migrator.apply().await.unwrap();
    assert_eq!(report.applied, vec!["20240102000000_b", "20240103000000_c"]);
    assert!(report.conflicts.is_empty());
}

#[tokio::test]
async fn failed_migration_rolls_back_and_leaves_no_row() {
    let ws = Workspace::new().await;
    ws.write_migration("20240101000000_ok", "CREATE TABLE ok (id INTEGER PRIMARY KEY);");
    ws.write_migration(
        "20240102000000_broken",
        "CREATE TABLE half (id INTEGER);\n\nINSERT INTO missing_table VALUES (1);",
    );
    let migrator = ws.migrator();

    match migrator.deploy().await {
        Err(Error::MigrationFailed { id, .. }) => assert_eq!(id, "20240102000000_broken"),
        other => panic!("expected a migration failure, got {:?}", other.map(|r| r.applied)),
    }

    let applied: Vec<String> = ws
        .adapter
        .get_applied_migrations()
        .await
        .unwrap()
        .into_iter()
        .map(|m| m.id)
        .collect();
    assert_eq!(applied, vec!["20240101000000_ok"]);
    assert!(ws.adapter.table_exists("ok").await.unwrap());
    assert!(!ws.adapter.table_exists("half").await.unwrap());
}

#[rstest]
#[case(0, 0)]
#[case(3, 1)]
#[tokio::test]
async fn not_null_conflicts_need_rows(#[case] rows: usize, #[case] expected: usize) {
    let ws = Workspace::new().await;
    ws.exec("CREATE TABLE users (id INTEGER PRIMARY KEY)").await;
    for i in 0..rows {
        ws.exec(&format!("INSERT INTO users (id) VALUES ({})", i + 1)).await;
    }

    let detector = ConflictDetector::new(ws.adapter.clone(), Arc::new(SqlPatterns::new().unwrap()));
    let conflicts = detector
        .detect("ALTER TABLE users ADD COLUMN age INTEGER NOT NULL;")
        .await
        .unwrap();

    assert_eq!(conflicts.len(), expected);
    assert!(conflicts.iter().all(|c| c.kind == ConflictKind::NotNullConstraint));
}

#[tokio::test]
async fn forced_not_null_failure_carries_a_hint() {
    let ws = Workspace::new().await;
    ws.exec("CREATE TABLE users (id INTEGER PRIMARY KEY)").await;
    ws.exec("INSERT INTO users (id) VALUES (1)").await;
    ws.write_migration("20240101000000_age", "ALTER TABLE users ADD COLUMN age INTEGER NOT NULL;");

    let migrator = ws.migrator().with_force(true);
    match migrator.apply().await {
        Err(Error::MigrationFailed { message, .. }) => assert!(message.contains("Hint:")),
        other => panic!("expected a migration failure, got {:?}", other.map(|r| r.applied)),
    }
    assert!(ws.adapter.get_applied_migrations().await.unwrap().is_empty());
}

#[tokio::test]
async fn reset_and_reapply_resolves_conflicts() {
    let ws = Workspace::new().await;
    ws.exec("CREATE TABLE users (id INTEGER PRIMARY KEY, stale TEXT)").await;
    ws.write_migration("20240101000000_users", "CREATE TABLE users (id INTEGER PRIMARY KEY);");

    let prompter = Arc::new(ScriptedPrompter::new([
        Answer::Choose("Reset the database".to_string()),
        Answer::Yes,
        Answer::No,
    ]));
    let migrator = ws.migrator_with(prompter.clone());

    let report = migrator.apply().await.unwrap();
    assert!(report.reset);
    assert_eq!(report.conflicts[0].kind, ConflictKind::TableExists);
    assert_eq!(report.applied, vec!["20240101000000_users"]);
    assert!(!ws.adapter.column_exists("users", "stale").await.unwrap());
    assert_eq!(prompter.asked().len(), 3);
}

#[tokio::test]
async fn status_reports_drift() {
    let ws = Workspace::new().await;
    let first = ws.write_migration("20240101000000_a", "CREATE TABLE a (id INTEGER PRIMARY KEY);");
    let second = ws.write_migration("20240102000000_b", "CREATE TABLE b (id INTEGER PRIMARY KEY);");
    let migrator = ws.migrator();
    migrator.apply().await.unwrap();

    fs::remove_file(&first).unwrap();
    fs::write(&second, "CREATE TABLE b (id INTEGER PRIMARY KEY, extra TEXT);").unwrap();
    ws.write_migration("20240103000000_c", "CREATE TABLE c (id INTEGER PRIMARY KEY);");

    let status = migrator.status().await.unwrap();
    assert_eq!(status.total, 2);
    assert_eq!(status.applied, 1);
    assert_eq!(status.pending, 1);
    assert_eq!(status.missing_files, vec!["20240101000000_a"]);
    assert!(status.migrations[0].checksum_mismatch);
    assert_eq!(status.warnings.len(), 2);
}

#[tokio::test]
async fn forced_reset_drops_everything_but_keeps_files() {
    let ws = Workspace::new().await;
    ws.write_migration("20240101000000_a", "CREATE TABLE a (id INTEGER PRIMARY KEY);");
    let migrator = ws.migrator();
    migrator.apply().await.unwrap();

    let report = migrator.reset(true).await.unwrap();

    assert_eq!(report.dropped_tables.len(), 2);
    assert_eq!(report.removed_files, 0);
    assert!(ws.adapter.get_all_table_names().await.unwrap().is_empty());
    assert_eq!(sql_files(&ws.migrations_dir()), 1);

    // Everything is pending again
    assert_eq!(migrator.apply().await.unwrap().applied.len(), 1);
}

#[tokio::test]
async fn interactive_reset_can_remove_files_and_back_up() {
    let ws = Workspace::new().await;
    ws.write_migration("20240101000000_a", "CREATE TABLE a (id INTEGER PRIMARY KEY, name TEXT);");
    ws.migrator().apply().await.unwrap();
    ws.exec("INSERT INTO a (id, name) VALUES (1, 'x')").await;

    let prompter = Arc::new(ScriptedPrompter::new([Answer::Yes, Answer::Yes, Answer::Yes]));
    let report = ws.migrator_with(prompter).reset(false).await.unwrap();

    let backup = report.backup.expect("backup path");
    let content: serde_json::Value = serde_json::from_str(&fs::read_to_string(backup).unwrap()).unwrap();
    assert_eq!(content["tables"]["a"]["rows"][0]["name"], "x");
    assert_eq!(report.removed_files, 1);
    assert_eq!(sql_files(&ws.migrations_dir()), 0);
}

#[tokio::test]
async fn declined_reset_changes_nothing() {
    let ws = Workspace::new().await;
    ws.exec("CREATE TABLE keep (id INTEGER)").await;

    let prompter = Arc::new(ScriptedPrompter::new([Answer::No]));
    let err = ws.migrator_with(prompter).reset(false).await.unwrap_err();

    assert!(matches!(err, Error::Cancelled(_)));
    assert!(ws.adapter.table_exists("keep").await.unwrap());
}

#[tokio::test]
async fn referenced_tables_are_created_first_across_files() {
    let ws = Workspace::new().await;
    ws.write_schema(
        "a_posts.sql",
        "CREATE TABLE posts (id SERIAL PRIMARY KEY, user_id INTEGER NOT NULL REFERENCES users(id));",
    );
    ws.write_schema("b_users.sql", "CREATE TABLE users (id SERIAL PRIMARY KEY, name TEXT);");
    let migrator = ws.migrator();

    let migration = migrator.generate("init", &ws.schema_dir()).await.unwrap();
    let users_at = migration.body.find("CREATE TABLE \"users\"").unwrap();
    let posts_at = migration.body.find("CREATE TABLE \"posts\"").unwrap();
    assert!(users_at < posts_at, "posts created before users:\n{}", migration.body);

    // No prompt answers are scripted, so any conflict would fail the apply
    let report = migrator.apply().await.unwrap();
    assert!(report.conflicts.is_empty());
    assert_eq!(report.applied, vec![migration.id]);
    assert!(ws.adapter.table_exists("posts").await.unwrap());
}

#[tokio::test]
async fn references_to_missing_tables_are_reported() {
    let ws = Workspace::new().await;
    let detector = ConflictDetector::new(ws.adapter.clone(), Arc::new(SqlPatterns::new().unwrap()));

    let conflicts = detector
        .detect("CREATE TABLE posts (id INTEGER PRIMARY KEY, user_id INTEGER REFERENCES users(id));")
        .await
        .unwrap();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].kind, ConflictKind::ForeignKey);
    assert_eq!(conflicts[0].table, "posts");
    assert!(!conflicts[0].is_blocking());

    // Created earlier in the same batch
    let conflicts = detector
        .detect(
            "CREATE TABLE users (id INTEGER PRIMARY KEY);\n\n\
             CREATE TABLE posts (id INTEGER PRIMARY KEY, user_id INTEGER REFERENCES users(id));",
        )
        .await
        .unwrap();
    assert!(conflicts.is_empty(), "unexpected conflicts: {:?}", conflicts);
}

#[rstest]
#[case("ALTER TABLE users ADD CONSTRAINT users_email_key UNIQUE (email);")]
#[case("CREATE UNIQUE INDEX users_email_idx ON users (email);")]
#[tokio::test]
async fn unique_constraints_over_duplicates_are_reported(#[case] sql: &str) {
    let ws = Workspace::new().await;
    ws.exec("CREATE TABLE users (id INTEGER PRIMARY KEY, email TEXT)").await;
    for email in ["a@x", "a@x", "b@x", "b@x", "c@x"] {
        ws.exec(&format!("INSERT INTO users (email) VALUES ('{}')", email)).await;
    }
    ws.exec("INSERT INTO users (email) VALUES (NULL), (NULL)").await;

    let detector = ConflictDetector::new(ws.adapter.clone(), Arc::new(SqlPatterns::new().unwrap()));
    let conflicts = detector.detect(sql).await.unwrap();

    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].kind, ConflictKind::UniqueConstraint);
    assert_eq!(conflicts[0].column.as_deref(), Some("email"));
    assert!(conflicts[0].description.contains("2 duplicate value group(s)"));
    assert!(!conflicts[0].is_blocking());
}

#[tokio::test]
async fn backup_survives_reset_and_restores() {
    let ws = Workspace::new().await;
    ws.write_migration(
        "20240101000000_init",
        "CREATE TABLE users (id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT NOT NULL);\n\n\
         CREATE TABLE posts (id INTEGER PRIMARY KEY, user_id INTEGER NOT NULL REFERENCES users(id), body TEXT);",
    );
    let migrator = ws.migrator().with_force(true);
    migrator.apply().await.unwrap();
    ws.exec("INSERT INTO users (name) VALUES ('ada'), ('O''Brien')").await;
    ws.exec("INSERT INTO posts (id, user_id, body) VALUES (7, 2, NULL)").await;
    let users = ws.adapter.get_table_data("users").await.unwrap();
    let posts = ws.adapter.get_table_data("posts").await.unwrap();

    let backup = migrator.backup("").await.unwrap();
    migrator.reset(true).await.unwrap();
    migrator.apply().await.unwrap();
    assert!(ws.adapter.get_table_data("users").await.unwrap().is_empty());

    let report = migrator.restore(&backup).await.unwrap();

    let restored: Vec<(&str, usize)> = report.tables.iter().map(|(t, n)| (t.as_str(), *n)).collect();
    assert_eq!(restored, vec![("users", 2), ("posts", 1)]);
    assert!(report.skipped.is_empty());
    assert_eq!(ws.adapter.get_table_data("users").await.unwrap(), users);
    assert_eq!(ws.adapter.get_table_data("posts").await.unwrap(), posts);
    assert_eq!(ws.adapter.get_applied_migrations().await.unwrap().len(), 1);

    // Autoincrement carries on after the restored ids
    ws.exec("INSERT INTO users (name) VALUES ('grace')").await;
    assert_eq!(ws.adapter.get_table_row_count("users").await.unwrap(), 3);
}

#[tokio::test]
async fn declined_restore_changes_nothing() {
    let ws = Workspace::new().await;
    ws.exec("CREATE TABLE keep (id INTEGER PRIMARY KEY)").await;
    let backup = ws.migrator().backup("empty").await.unwrap();
    ws.exec("INSERT INTO keep (id) VALUES (1)").await;

    let prompter = Arc::new(ScriptedPrompter::new([Answer::No]));
    let err = ws.migrator_with(prompter).restore(&backup).await.unwrap_err();

    assert!(matches!(err, Error::Cancelled(_)));
    assert_eq!(ws.adapter.get_table_row_count("keep").await.unwrap(), 1);

    let missing = ws.migrations_dir().join("backups").join("nope.json");
    assert!(ws.migrator().with_force(true).restore(&missing).await.is_err());
}
