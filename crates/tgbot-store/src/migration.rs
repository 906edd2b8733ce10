//! Schema management.
//!
//! The schema is declared statically: four fixed tables plus the wide
//! `users` table whose columns come from [`UserProperty::ALL`]. On every
//! startup [`run_all`] creates what is missing and adds columns that the
//! live `users` table lacks. Nothing is ever dropped unless the caller
//! explicitly opts into rebuilding columns whose stored type is wrong.

use rusqlite::Connection;
use tracing::{debug, error, info, warn};

use crate::error::{StoreError, StoreResult};
use crate::property::{ColumnType, UserProperty};

/// A fixed table definition.
struct TableDef {
    name: &'static str,
    sql: &'static str,
}

/// An index definition. Created with `IF NOT EXISTS` semantics.
struct IndexDef {
    name: &'static str,
    table: &'static str,
    sql: &'static str,
}

pub const USERS_TABLE: &str = "users";

static TABLES: &[TableDef] = &[
    TableDef {
        name: "usage_events",
        sql: r#"
            CREATE TABLE usage_events (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id     TEXT,
                access_time REAL,
                model_used  TEXT
            );
        "#,
    },
    TableDef {
        name: "translations",
        sql: r#"
            CREATE TABLE translations (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                original    TEXT,
                lang        TEXT,
                help        TEXT,
                translation TEXT,
                timestamp   DATETIME DEFAULT CURRENT_TIMESTAMP
            );
        "#,
    },
    TableDef {
        name: "misc_cache",
        sql: r#"
            CREATE TABLE misc_cache (
                id   INTEGER PRIMARY KEY AUTOINCREMENT,
                date REAL,
                url  TEXT,
                text TEXT
            );
        "#,
    },
    TableDef {
        name: "im_suggests",
        sql: r#"
            CREATE TABLE im_suggests (
                id     INTEGER PRIMARY KEY AUTOINCREMENT,
                date   REAL,
                hash   TEXT,
                prompt TEXT
            );
        "#,
    },
];

static INDEXES: &[IndexDef] = &[
    IndexDef {
        name: "idx_users_id",
        table: "users",
        sql: "CREATE UNIQUE INDEX IF NOT EXISTS idx_users_id ON users (id)",
    },
    IndexDef {
        name: "idx_users_first_meet",
        table: "users",
        sql: "CREATE INDEX IF NOT EXISTS idx_users_first_meet ON users (first_meet)",
    },
    IndexDef {
        name: "idx_usage_access_time",
        table: "usage_events",
        sql: "CREATE INDEX IF NOT EXISTS idx_usage_access_time ON usage_events (access_time)",
    },
    IndexDef {
        name: "idx_usage_user_id",
        table: "usage_events",
        sql: "CREATE INDEX IF NOT EXISTS idx_usage_user_id ON usage_events (user_id)",
    },
    IndexDef {
        name: "idx_usage_model_used",
        table: "usage_events",
        sql: "CREATE INDEX IF NOT EXISTS idx_usage_model_used ON usage_events (model_used)",
    },
    IndexDef {
        name: "idx_translations_original",
        table: "translations",
        sql: "CREATE INDEX IF NOT EXISTS idx_translations_original ON translations (original)",
    },
    IndexDef {
        name: "idx_translations_lang",
        table: "translations",
        sql: "CREATE INDEX IF NOT EXISTS idx_translations_lang ON translations (lang)",
    },
    IndexDef {
        name: "idx_translations_help",
        table: "translations",
        sql: "CREATE INDEX IF NOT EXISTS idx_translations_help ON translations (help)",
    },
    IndexDef {
        name: "idx_translations_translation",
        table: "translations",
        sql: "CREATE INDEX IF NOT EXISTS idx_translations_translation ON translations (translation)",
    },
    IndexDef {
        name: "idx_misc_cache_url",
        table: "misc_cache",
        sql: "CREATE INDEX IF NOT EXISTS idx_misc_cache_url ON misc_cache (url)",
    },
    IndexDef {
        name: "idx_im_suggests_hash",
        table: "im_suggests",
        sql: "CREATE INDEX IF NOT EXISTS idx_im_suggests_hash ON im_suggests (hash)",
    },
];

/// Options for [`run_all`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SchemaOptions {
    /// Drop and re-add `users` columns whose stored type differs from the
    /// declared one. Destroys those columns' values.
    pub rebuild_mismatched_columns: bool,
}

/// What a schema run changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    pub created_tables: Vec<&'static str>,
    pub created_indexes: Vec<&'static str>,
    pub added_columns: Vec<&'static str>,
    pub rebuilt_columns: Vec<&'static str>,
    /// Columns whose stored type differs from the declared one, as
    /// `(column, stored type)`. Reported whether or not they were rebuilt.
    pub mismatched_columns: Vec<(&'static str, String)>,
}

impl MigrationReport {
    /// `true` when the run made no schema change.
    pub fn is_unchanged(&self) -> bool {
        self.created_tables.is_empty()
            && self.created_indexes.is_empty()
            && self.added_columns.is_empty()
            && self.rebuilt_columns.is_empty()
    }
}

// ── public API ───────────────────────────────────────────────────────

/// Bring the schema up to date.
///
/// This is a **synchronous** function; call it from inside
/// [`Database::execute`](crate::Database::execute). Failures on individual
/// tables, columns or indexes are logged and the run continues; only
/// failures to inspect the schema at all are returned.
pub fn run_all(conn: &Connection, options: SchemaOptions) -> StoreResult<MigrationReport> {
    let mut report = MigrationReport::default();

    for table in TABLES {
        if table_exists(conn, table.name)? {
            continue;
        }
        match conn.execute_batch(table.sql) {
            Ok(()) => {
                info!(table = table.name, "table created");
                report.created_tables.push(table.name);
            }
            Err(err) => error!(table = table.name, %err, "failed to create table"),
        }
    }

    if table_exists(conn, USERS_TABLE)? {
        sync_user_columns(conn, options, &mut report)?;
    } else {
        match conn.execute_batch(&users_table_sql()) {
            Ok(()) => {
                info!(columns = UserProperty::ALL.len(), "users table created");
                report.created_tables.push(USERS_TABLE);
            }
            Err(err) => error!(%err, "failed to create users table"),
        }
    }

    for index in INDEXES {
        if index_exists(conn, index)? || !table_exists(conn, index.table)? {
            continue;
        }
        match conn.execute_batch(index.sql) {
            Ok(()) => {
                debug!(index = index.name, "index created");
                report.created_indexes.push(index.name);
            }
            // A legacy users table with duplicate ids cannot take the
            // unique index; keep going without it.
            Err(err) => error!(index = index.name, %err, "failed to create index"),
        }
    }

    if report.is_unchanged() {
        debug!("database schema is up to date");
    } else {
        info!(
            tables = report.created_tables.len(),
            indexes = report.created_indexes.len(),
            columns = report.added_columns.len(),
            rebuilt = report.rebuilt_columns.len(),
            "schema updated"
        );
    }
    Ok(report)
}

/// `CREATE TABLE users (...)` with every declared property column.
pub fn users_table_sql() -> String {
    let mut sql = String::from(
        "CREATE TABLE users (\n    id_num INTEGER PRIMARY KEY AUTOINCREMENT,\n    id TEXT NOT NULL",
    );
    for prop in UserProperty::ALL {
        sql.push_str(",\n    ");
        sql.push_str(prop.as_str());
        sql.push(' ');
        sql.push_str(prop.column_type().sql());
    }
    sql.push_str("\n);");
    sql
}

/// Live `(name, declared type)` pairs of `table`.
pub fn live_columns(conn: &Connection, table: &str) -> StoreResult<Vec<(String, String)>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let columns = stmt
        .query_map([], |row| Ok((row.get::<_, String>(1)?, row.get::<_, String>(2)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(columns)
}

// ── internals ────────────────────────────────────────────────────────

fn table_exists(conn: &Connection, name: &'static str) -> StoreResult<bool> {
    schema_object_exists(conn, "table", name, name)
}

fn index_exists(conn: &Connection, index: &IndexDef) -> StoreResult<bool> {
    schema_object_exists(conn, "index", index.name, index.table)
}

/// Whether `name` exists in `sqlite_master`. Failures are attributed to
/// `table`, the table the object belongs to.
fn schema_object_exists(conn: &Connection, kind: &str, name: &str, table: &'static str) -> StoreResult<bool> {
    let count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = ?1 AND name = ?2",
            rusqlite::params![kind, name],
            |row| row.get(0),
        )
        .map_err(|e| inspect_failed(table, kind, name, e))?;
    Ok(count > 0)
}

fn inspect_failed(table: &'static str, kind: &str, name: &str, err: rusqlite::Error) -> StoreError {
    StoreError::Migration {
        table,
        message: format!("failed to inspect schema for {kind} {name}: {err}"),
    }
}

/// Diff declared user columns against the live table.
fn sync_user_columns(
    conn: &Connection,
    options: SchemaOptions,
    report: &mut MigrationReport,
) -> StoreResult<()> {
    let live = live_columns(conn, USERS_TABLE)?;

    for prop in UserProperty::ALL {
        let declared = prop.column_type();
        let Some((_, live_type)) = live.iter().find(|(name, _)| name == prop.as_str()) else {
            if add_column(conn, prop.as_str(), declared)? {
                report.added_columns.push(prop.as_str());
            }
            continue;
        };

        if ColumnType::from_declared(live_type) == Some(declared) {
            continue;
        }

        report.mismatched_columns.push((prop.as_str(), live_type.clone()));
        if !options.rebuild_mismatched_columns {
            warn!(
                column = prop.as_str(),
                stored = %live_type,
                declared = declared.sql(),
                "users column has the wrong type; enable rebuild_mismatched_columns to fix it"
            );
            continue;
        }

        warn!(
            column = prop.as_str(),
            stored = %live_type,
            declared = declared.sql(),
            "REBUILDING users column: every stored value in it will be discarded"
        );
        if rebuild_column(conn, prop.as_str(), declared) {
            report.rebuilt_columns.push(prop.as_str());
        }
    }
    Ok(())
}

/// `ALTER TABLE users ADD COLUMN`. Returns `Ok(false)` when the column was
/// already there or the statement failed for another logged reason.
fn add_column(conn: &Connection, column: &'static str, ty: ColumnType) -> StoreResult<bool> {
    let sql = format!("ALTER TABLE {USERS_TABLE} ADD COLUMN {column} {}", ty.sql());
    match conn.execute_batch(&sql) {
        Ok(()) => {
            info!(column, ty = ty.sql(), "users column added");
            Ok(true)
        }
        Err(err) if is_duplicate_column(&err) => {
            info!(column, "users column already present");
            Ok(false)
        }
        Err(err) => {
            error!(column, %err, "failed to add users column");
            Ok(false)
        }
    }
}

fn rebuild_column(conn: &Connection, column: &'static str, ty: ColumnType) -> bool {
    let sql = format!(
        "BEGIN IMMEDIATE;
         ALTER TABLE {USERS_TABLE} DROP COLUMN {column};
         ALTER TABLE {USERS_TABLE} ADD COLUMN {column} {};
         COMMIT;",
        ty.sql()
    );
    match conn.execute_batch(&sql) {
        Ok(()) => {
            warn!(column, ty = ty.sql(), "users column rebuilt");
            true
        }
        Err(err) => {
            error!(column, %err, "failed to rebuild users column, rolling back");
            let _ = conn.execute_batch("ROLLBACK;");
            false
        }
    }
}

fn is_duplicate_column(err: &rusqlite::Error) -> bool {
    err.to_string().contains("duplicate column name")
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn setup_conn() -> Connection {
        Connection::open_in_memory().unwrap()
    }

    fn schema_version(conn: &Connection) -> i64 {
        conn.query_row("PRAGMA schema_version", [], |row| row.get(0)).unwrap()
    }

    fn column_type(conn: &Connection, column: &str) -> Option<String> {
        live_columns(conn, USERS_TABLE)
            .unwrap()
            .into_iter()
            .find(|(name, _)| name == column)
            .map(|(_, ty)| ty)
    }

    /// A users table as an old deployment left it: fewer columns and the
    /// saved file stored as TEXT.
    fn create_legacy_users(conn: &Connection) {
        conn.execute_batch(
            "CREATE TABLE users (
                id_num INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT,
                lang TEXT,
                first_meet REAL,
                saved_file TEXT,
                role TEXT
            );
            INSERT INTO users (id, lang, first_meet, saved_file, role)
            VALUES ('u1', 'en', 1.0, 'legacy text', 'helper');",
        )
        .unwrap();
    }

    #[test]
    fn run_all_on_fresh_db() {
        let conn = setup_conn();
        let report = run_all(&conn, SchemaOptions::default()).unwrap();

        assert_eq!(
            report.created_tables,
            vec!["usage_events", "translations", "misc_cache", "im_suggests", "users"]
        );
        assert_eq!(report.created_indexes.len(), INDEXES.len());
        assert!(report.added_columns.is_empty());

        let columns = live_columns(&conn, USERS_TABLE).unwrap();
        // id_num + id + every property.
        assert_eq!(columns.len(), UserProperty::ALL.len() + 2);
    }

    #[test]
    fn run_all_is_idempotent() {
        let conn = setup_conn();
        run_all(&conn, SchemaOptions::default()).unwrap();
        let version = schema_version(&conn);

        let second = run_all(&conn, SchemaOptions::default()).unwrap();
        assert!(second.is_unchanged(), "{second:?}");
        assert_eq!(second, MigrationReport::default());
        assert_eq!(schema_version(&conn), version);
    }

    #[test]
    fn missing_columns_are_added_without_touching_data() {
        let conn = setup_conn();
        create_legacy_users(&conn);

        let report = run_all(&conn, SchemaOptions::default()).unwrap();
        // lang, first_meet, saved_file and role already existed.
        assert_eq!(report.added_columns.len(), UserProperty::ALL.len() - 4);
        assert!(report.added_columns.contains(&"dialog_gemini"));

        let role: String = conn
            .query_row("SELECT role FROM users WHERE id = 'u1'", [], |row| row.get(0))
            .unwrap();
        assert_eq!(role, "helper");
    }

    #[test]
    fn type_mismatch_is_reported_but_kept_by_default() {
        let conn = setup_conn();
        create_legacy_users(&conn);

        let report = run_all(&conn, SchemaOptions::default()).unwrap();
        assert_eq!(report.mismatched_columns, vec![("saved_file", "TEXT".to_string())]);
        assert!(report.rebuilt_columns.is_empty());
        assert_eq!(column_type(&conn, "saved_file").as_deref(), Some("TEXT"));

        let kept: String = conn
            .query_row("SELECT saved_file FROM users WHERE id = 'u1'", [], |row| row.get(0))
            .unwrap();
        assert_eq!(kept, "legacy text");
    }

    #[test]
    fn type_mismatch_rebuild_is_opt_in() {
        let conn = setup_conn();
        create_legacy_users(&conn);

        let options = SchemaOptions {
            rebuild_mismatched_columns: true,
        };
        let report = run_all(&conn, options).unwrap();
        assert_eq!(report.rebuilt_columns, vec!["saved_file"]);
        assert_eq!(column_type(&conn, "saved_file").as_deref(), Some("BLOB"));

        let gone: Option<String> = conn
            .query_row("SELECT saved_file FROM users WHERE id = 'u1'", [], |row| row.get(0))
            .unwrap();
        assert!(gone.is_none());

        // Second run: nothing left to fix.
        let again = run_all(&conn, options).unwrap();
        assert!(again.is_unchanged());
        assert!(again.mismatched_columns.is_empty());
    }

    #[test]
    fn duplicate_column_is_not_an_error() {
        let conn = setup_conn();
        run_all(&conn, SchemaOptions::default()).unwrap();
        assert!(!add_column(&conn, "role", ColumnType::Text).unwrap());
    }

    #[test]
    fn unique_index_failure_is_tolerated() {
        let conn = setup_conn();
        create_legacy_users(&conn);
        conn.execute_batch("INSERT INTO users (id) VALUES ('u1');").unwrap();

        let report = run_all(&conn, SchemaOptions::default()).unwrap();
        assert!(!report.created_indexes.contains(&"idx_users_id"));
        assert!(report.created_indexes.contains(&"idx_users_first_meet"));
    }

    #[test]
    fn inspection_errors_name_the_owning_table() {
        let err = inspect_failed(
            "translations",
            "index",
            "idx_translations_lang",
            rusqlite::Error::QueryReturnedNoRows,
        );
        match err {
            StoreError::Migration { table, message } => {
                assert_eq!(table, "translations");
                assert!(message.contains("index idx_translations_lang"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn users_sql_declares_every_property() {
        let sql = users_table_sql();
        for prop in UserProperty::ALL {
            assert!(
                sql.contains(&format!("{} {}", prop.as_str(), prop.column_type().sql())),
                "{prop}"
            );
        }
    }
}
