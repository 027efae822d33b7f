//! Local SQLite database layer.
//!
//! Uses rusqlite with WAL mode. Every logical collection of the offline store
//! lives in its own table, and the request cache keeps its entries in
//! `cache_entries`. Schema changes are applied as numbered migrations.

use rusqlite::Connection;
use std::fs;
use std::path::Path;
use tracing::{error, info, warn};

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 2;

/// Open (or create) the database at `path`.
///
/// Creates the parent directory if needed, sets pragmas and runs any pending
/// migrations. On open failure the file is deleted and opening is retried
/// once.
pub fn open(path: &Path) -> Result<Connection, rusqlite::Error> {
    if let Some(parent) = path.parent() {
        if let Err(e) = fs::create_dir_all(parent) {
            warn!("Failed to create data dir {}: {e}", parent.display());
        }
    }

    info!("Opening database at {}", path.display());

    let conn = match open_and_configure(path) {
        Ok(c) => c,
        Err(first_err) => {
            warn!(
                "Database open failed ({}), deleting and retrying once",
                first_err
            );
            if path.exists() {
                let _ = fs::remove_file(path);
                let _ = fs::remove_file(sidecar(path, "-wal"));
                let _ = fs::remove_file(sidecar(path, "-shm"));
            }
            open_and_configure(path)?
        }
    };

    run_migrations(&conn)?;
    Ok(conn)
}

/// In-memory database with the full schema applied.
pub fn open_in_memory() -> Result<Connection, rusqlite::Error> {
    let conn = Connection::open_in_memory()?;
    conn.execute_batch(
        "PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;
    run_migrations(&conn)?;
    Ok(conn)
}

fn sidecar(path: &Path, suffix: &str) -> std::path::PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    name.into()
}

fn open_and_configure(path: &Path) -> Result<Connection, rusqlite::Error> {
    let conn = Connection::open(path)?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;

    Ok(conn)
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )?;

    if current >= CURRENT_SCHEMA_VERSION {
        info!("Database schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating database from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }

    Ok(())
}

/// Migration v1: offline store collections.
///
/// `item_key` is declared without a type so SQLite keeps integer and text keys
/// as given (queue keys are integers and must sort numerically).
fn migrate_v1(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "
        BEGIN;

        -- cached reference data keyed by natural id
        CREATE TABLE IF NOT EXISTS medicines (
            item_key PRIMARY KEY NOT NULL,
            value TEXT NOT NULL,
            updated_at TEXT DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS customers (
            item_key PRIMARY KEY NOT NULL,
            value TEXT NOT NULL,
            updated_at TEXT DEFAULT (datetime('now'))
        );

        -- sales made while offline, keyed by queue timestamp (unix ms)
        CREATE TABLE IF NOT EXISTS offline_sales_queue (
            item_key PRIMARY KEY NOT NULL,
            value TEXT NOT NULL,
            updated_at TEXT DEFAULT (datetime('now'))
        );

        -- bookkeeping (lastSync etc.)
        CREATE TABLE IF NOT EXISTS metadata (
            item_key PRIMARY KEY NOT NULL,
            value TEXT NOT NULL,
            updated_at TEXT DEFAULT (datetime('now'))
        );

        INSERT INTO schema_version (version) VALUES (1);

        COMMIT;
        ",
    )
    .map_err(|e| {
        error!("Migration v1 failed: {e}");
        e
    })?;

    info!("Applied migration v1 (offline store collections)");
    Ok(())
}

/// Migration v2: versioned request cache.
fn migrate_v2(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "
        BEGIN;

        CREATE TABLE IF NOT EXISTS cache_entries (
            cache_name TEXT NOT NULL,
            url TEXT NOT NULL,
            status INTEGER NOT NULL,
            headers TEXT NOT NULL DEFAULT '{}',
            body BLOB NOT NULL,
            stored_at TEXT DEFAULT (datetime('now')),
            PRIMARY KEY (cache_name, url)
        );

        INSERT INTO schema_version (version) VALUES (2);

        COMMIT;
        ",
    )
    .map_err(|e| {
        error!("Migration v2 failed: {e}");
        e
    })?;

    info!("Applied migration v2 (cache_entries table)");
    Ok(())
}
