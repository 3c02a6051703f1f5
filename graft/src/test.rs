//! Tests for graft
//!
//! Parse, adapt, diff and render working together, without a database.

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::*;

    use crate::db::dialect::Dialect;
    use crate::schema::diff::SchemaDiff;
    use crate::schema::generator::{render_sql, render_statements};
    use crate::schema::parser::{merge, SchemaParser};
    use crate::schema::types::{SchemaColumn, SchemaSnapshot, SchemaTable};

    const SCHEMA: &str = r#"
        CREATE TYPE mood AS ENUM ('happy', 'sad');

        CREATE TABLE users (
            id SERIAL PRIMARY KEY,
            email VARCHAR(255) NOT NULL UNIQUE,
            mood mood DEFAULT 'happy',
            created_at TIMESTAMP DEFAULT NOW()
        );

        CREATE TABLE posts (
            id SERIAL PRIMARY KEY,
            author_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            body TEXT
        );

        CREATE INDEX posts_author_idx ON posts (author_id);
    "#;

    fn parse(sql: &str) -> SchemaSnapshot {
        let parser = SchemaParser::new().unwrap();
        merge(vec![parser.parse_str("schema.sql", sql).unwrap()]).unwrap()
    }

    #[rstest]
    #[case(Dialect::Postgres)]
    #[case(Dialect::MySql)]
    #[case(Dialect::Sqlite)]
    fn schema_diffed_with_itself_is_empty(#[case] dialect: Dialect) {
        let snapshot = dialect.adapt_snapshot(&parse(SCHEMA));
        let diff = SchemaDiff::generate(&snapshot, &snapshot, dialect);

        assert!(!diff.has_changes());
        assert!(render_statements(&diff, dialect).is_empty());
    }

    #[test]
    fn reference_scenario_on_postgres() {
        let target = parse("CREATE TABLE users (id SERIAL PRIMARY KEY, name VARCHAR(255) NOT NULL);");
        let diff = SchemaDiff::generate(&SchemaSnapshot::new(), &target, Dialect::Postgres);

        assert_eq!(
            render_sql(&diff, Dialect::Postgres),
            "CREATE TABLE \"users\" (\n    \"id\" SERIAL PRIMARY KEY,\n    \"name\" VARCHAR(255) NOT NULL\n);"
        );
    }

    #[test]
    fn catalog_spelling_matches_declared_types() {
        // What the Postgres catalog reports for the users table above
        let mut current = SchemaSnapshot::new();
        let mut id = SchemaColumn::new("id", "integer").primary();
        id.auto_increment = true;
        current.insert_table(
            SchemaTable::new("users")
                .with_column(id)
                .with_column(SchemaColumn::new("name", "character varying(255)").not_null()),
        );

        let target = parse("CREATE TABLE users (id SERIAL PRIMARY KEY, name VARCHAR(255) NOT NULL);");
        let diff = SchemaDiff::generate(&current, &target, Dialect::Postgres);

        assert!(!diff.has_changes(), "unexpected changes: {:?}", diff.summary());
    }

    #[test]
    fn new_columns_and_tables_render_in_order() {
        let current = parse("CREATE TABLE users (id SERIAL PRIMARY KEY);");
        let target = parse(
            "CREATE TABLE users (id SERIAL PRIMARY KEY, age INTEGER NOT NULL DEFAULT 0);
             CREATE TABLE tags (id SERIAL PRIMARY KEY, label TEXT);",
        );

        let statements = render_statements(&SchemaDiff::generate(&current, &target, Dialect::Postgres), Dialect::Postgres);

        assert_eq!(statements.len(), 2);
        assert!(statements[0].starts_with("CREATE TABLE \"tags\""));
        assert_eq!(
            statements[1],
            "ALTER TABLE \"users\" ADD COLUMN IF NOT EXISTS \"age\" INTEGER NOT NULL DEFAULT 0;"
        );
    }

    #[test]
    fn dropped_objects_come_last() {
        let current = parse(SCHEMA);
        let target = parse("CREATE TABLE users (id SERIAL PRIMARY KEY, email VARCHAR(255) NOT NULL UNIQUE);");

        let diff = SchemaDiff::generate(&current, &target, Dialect::Postgres);
        let statements = render_statements(&diff, Dialect::Postgres);

        assert_eq!(diff.dropped_tables, vec!["posts"]);
        assert_eq!(diff.dropped_enums, vec!["mood"]);
        assert_eq!(statements.last().unwrap(), "DROP TYPE IF EXISTS \"mood\";");
        assert!(statements.iter().any(|s| s == "DROP TABLE IF EXISTS \"posts\" CASCADE;"));
    }

    #[test]
    fn sqlite_column_changes_are_not_a_migration() {
        let current = Dialect::Sqlite.adapt_snapshot(&parse("CREATE TABLE notes (id SERIAL PRIMARY KEY, body TEXT);"));
        let target = Dialect::Sqlite.adapt_snapshot(&parse("CREATE TABLE notes (id SERIAL PRIMARY KEY, body TEXT NOT NULL);"));

        let diff = SchemaDiff::generate(&current, &target, Dialect::Sqlite);

        assert!(!diff.has_changes());
        assert_eq!(render_sql(&diff, Dialect::Sqlite), "");
    }

    #[test]
    fn mysql_inlines_enums_and_foreign_keys() {
        let target = Dialect::MySql.adapt_snapshot(&parse(SCHEMA));
        let diff = SchemaDiff::generate(&SchemaSnapshot::new(), &target, Dialect::MySql);
        let sql = render_sql(&diff, Dialect::MySql);

        assert!(diff.new_enums.is_empty());
        assert!(sql.contains("`mood` ENUM('happy', 'sad')"));
        assert!(sql.contains("FOREIGN KEY (`author_id`) REFERENCES `users`"));
        assert!(sql.contains("CREATE INDEX `posts_author_idx` ON `posts` (`author_id`);"));
    }
}
