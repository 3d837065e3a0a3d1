//! Registry schema, versioned through SQLite's `user_version` header.

use rusqlite::Connection;
use tracing::debug;

/// Schema version written to `PRAGMA user_version` once migrations finish.
pub const SCHEMA_VERSION: u32 = 2;

/// Bring the registry schema up to [`SCHEMA_VERSION`].
///
/// Each step runs only when the stored version is below it, so reopening an
/// up-to-date database does no writes.
pub fn run_migrations(conn: &Connection) -> Result<(), rusqlite::Error> {
    let steps: [(u32, fn(&Connection) -> Result<(), rusqlite::Error>); 2] =
        [(1, create_registry_table), (2, add_updated_at)];

    let stored = schema_version(conn)?;
    for (version, step) in steps {
        if stored < version {
            step(conn)?;
            debug!(version, "Registry schema migrated");
        }
    }
    if stored < SCHEMA_VERSION {
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    }
    Ok(())
}

/// Version recorded in the database header; 0 for a fresh file.
pub fn schema_version(conn: &Connection) -> Result<u32, rusqlite::Error> {
    conn.pragma_query_value(None, "user_version", |row| row.get(0))
}

fn has_column(conn: &Connection, table: &str, column: &str) -> Result<bool, rusqlite::Error> {
    conn.query_row(
        "SELECT COUNT(*) FROM pragma_table_info(?1) WHERE name = ?2",
        [table, column],
        |row| row.get::<_, i64>(0),
    )
    .map(|n| n > 0)
}

/// Version 1: the registry table.
///
/// `node_name` carries no unique index: uniqueness is a writer convention,
/// and a reader that sees two rows reports the registry as inconsistent.
fn create_registry_table(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS process_registry (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            node_name TEXT NOT NULL,
            address TEXT NOT NULL DEFAULT '',
            port INTEGER NOT NULL DEFAULT 0,
            status INTEGER NOT NULL DEFAULT 0,
            start_counter INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_process_registry_name ON process_registry(node_name);
        ",
    )?;
    Ok(())
}

/// Version 2: record when a row was last written.
fn add_updated_at(conn: &Connection) -> Result<(), rusqlite::Error> {
    if !has_column(conn, "process_registry", "updated_at")? {
        conn.execute(
            "ALTER TABLE process_registry ADD COLUMN updated_at TEXT NOT NULL DEFAULT ''",
            [],
        )?;
    }
    Ok(())
}
