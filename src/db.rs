//! Local SQLite store for the sync engine.
//!
//! Uses rusqlite with WAL mode. Holds the cached catalog (products,
//! categories), the offline operation queues (pending sales, invoice sync
//! queue, generic sync queue) and sync metadata. Provides schema migrations
//! and an atomic clear-all used on logout.

use rusqlite::Connection;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{error, info, warn};

use crate::error::{SyncError, SyncResult};

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 3;

/// Single shared handle to the local database.
///
/// Construct one per device (or one per test) and pass it around explicitly;
/// every component reads and writes through it. Lock guards are scoped to
/// synchronous blocks and never held across an await.
pub struct Store {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

impl Store {
    /// Open (or create) the database at `{data_dir}/pos.db`.
    ///
    /// Creates the directory if needed, opens the connection, sets pragmas,
    /// and runs any pending migrations. On corruption or open failure,
    /// deletes the file and retries once.
    pub fn open(data_dir: &Path) -> SyncResult<Store> {
        fs::create_dir_all(data_dir)?;

        let db_path = data_dir.join("pos.db");
        info!("Opening database at {}", db_path.display());

        let conn = match open_and_configure(&db_path) {
            Ok(c) => c,
            Err(first_err) => {
                warn!(
                    "Database open failed ({}), deleting and retrying once",
                    first_err
                );
                if db_path.exists() {
                    let _ = fs::remove_file(&db_path);
                    // Also remove WAL/SHM files if present
                    let wal = db_path.with_extension("db-wal");
                    let shm = db_path.with_extension("db-shm");
                    let _ = fs::remove_file(&wal);
                    let _ = fs::remove_file(&shm);
                }
                open_and_configure(&db_path)?
            }
        };

        run_migrations(&conn)?;

        info!("Database initialized (schema v{CURRENT_SCHEMA_VERSION})");

        Ok(Store {
            conn: Mutex::new(conn),
            db_path,
        })
    }

    /// Open an isolated in-memory store. Used by tests and tooling; behaves
    /// identically apart from the WAL journal (not supported in memory).
    pub fn open_in_memory() -> SyncResult<Store> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;
             PRAGMA synchronous = NORMAL;",
        )?;
        run_migrations(&conn)?;
        Ok(Store {
            conn: Mutex::new(conn),
            db_path: PathBuf::from(":memory:"),
        })
    }

    /// Path of the backing database file.
    pub fn path(&self) -> &Path {
        &self.db_path
    }

    /// Acquire the connection guard. Callers must drop it before awaiting.
    pub(crate) fn conn(&self) -> SyncResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| SyncError::LockPoisoned)
    }

    /// Atomically empty every table (session teardown on logout).
    ///
    /// Either all tables are cleared or none are; `schema_version` is kept so
    /// the next login does not re-run migrations.
    pub fn clear_all(&self) -> SyncResult<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            "BEGIN IMMEDIATE;
             DELETE FROM invoice_sync_queue;
             DELETE FROM invoice_drafts;
             DELETE FROM sync_queue;
             DELETE FROM pending_sales;
             DELETE FROM products;
             DELETE FROM categories;
             DELETE FROM sync_meta;
             COMMIT;",
        )?;
        info!("Local store cleared");
        Ok(())
    }

    /// Explicitly close the store, flushing the WAL.
    pub fn close(self) -> SyncResult<()> {
        let conn = self.conn.into_inner().map_err(|_| SyncError::LockPoisoned)?;
        conn.close().map_err(|(_, e)| SyncError::Db(e))
    }

    /// Read a sync metadata value (last-sync timestamps and similar).
    pub fn sync_meta_get(&self, key: &str) -> SyncResult<Option<String>> {
        use rusqlite::OptionalExtension;
        let conn = self.conn()?;
        let value = conn
            .query_row(
                "SELECT value FROM sync_meta WHERE key = ?1",
                [key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    /// Upsert a sync metadata value.
    pub fn sync_meta_set(&self, key: &str, value: &str) -> SyncResult<()> {
        let now = chrono::Utc::now().to_rfc3339();
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO sync_meta (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            rusqlite::params![key, value, now],
        )?;
        Ok(())
    }
}

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> SyncResult<Connection> {
    let conn = Connection::open(path)?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;

    Ok(conn)
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> SyncResult<()> {
    // Ensure schema_version table exists first
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
        )
        .unwrap_or(0);

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
    if current < 3 {
        migrate_v3(conn)?;
    }

    Ok(())
}

/// Migration v1: cached catalog, pending sales, generic sync queue, metadata.
fn migrate_v1(conn: &Connection) -> SyncResult<()> {
    conn.execute_batch(
        "
        -- cached reference data, replaced wholesale by catalog sync
        CREATE TABLE IF NOT EXISTS products (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            barcode TEXT,
            category_id TEXT,
            price REAL NOT NULL DEFAULT 0,
            vat_rate REAL NOT NULL DEFAULT 0,
            quantity REAL NOT NULL DEFAULT 0,
            image_url TEXT,
            updated_at TEXT
        );

        CREATE TABLE IF NOT EXISTS categories (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            sort_order INTEGER NOT NULL DEFAULT 0
        );

        -- sales completed offline, awaiting replay to the admin dashboard
        CREATE TABLE IF NOT EXISTS pending_sales (
            id TEXT PRIMARY KEY,
            local_reference TEXT NOT NULL,
            items TEXT NOT NULL DEFAULT '[]',
            customer TEXT,
            payments TEXT NOT NULL DEFAULT '[]',
            subtotal REAL NOT NULL DEFAULT 0,
            vat_total REAL NOT NULL DEFAULT 0,
            discount_total REAL NOT NULL DEFAULT 0,
            total REAL NOT NULL DEFAULT 0,
            note TEXT,
            synced INTEGER NOT NULL DEFAULT 0,
            remote_id TEXT,
            created_at TEXT NOT NULL,
            synced_at TEXT
        );

        -- generic operation queue (non-sale, non-invoice actions)
        CREATE TABLE IF NOT EXISTS sync_queue (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            action TEXT NOT NULL,
            payload TEXT NOT NULL DEFAULT '{}',
            status TEXT NOT NULL DEFAULT 'pending',
            retry_count INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS sync_meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        -- Indexes
        CREATE INDEX IF NOT EXISTS idx_products_category ON products(category_id);
        CREATE INDEX IF NOT EXISTS idx_pending_sales_synced ON pending_sales(synced, created_at);
        CREATE INDEX IF NOT EXISTS idx_sync_queue_status ON sync_queue(status);

        -- Record migration
        INSERT INTO schema_version (version) VALUES (1);
        ",
    )
    .map_err(|e| {
        error!("Migration v1 failed: {e}");
        SyncError::Db(e)
    })?;
    Ok(())
}

/// Migration v2: e-invoice drafts and their sync queue.
fn migrate_v2(conn: &Connection) -> SyncResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS invoice_drafts (
            id TEXT PRIMARY KEY,
            sale_id TEXT NOT NULL,
            buyer TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            invoice_number TEXT,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS invoice_sync_queue (
            id TEXT PRIMARY KEY,
            sale_id TEXT NOT NULL,
            draft_id TEXT,
            action TEXT NOT NULL,
            payload TEXT NOT NULL DEFAULT '{}',
            status TEXT NOT NULL DEFAULT 'pending',
            retry_count INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            created_at TEXT NOT NULL,
            processed_at TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_invoice_drafts_sale ON invoice_drafts(sale_id);
        CREATE INDEX IF NOT EXISTS idx_invoice_queue_status ON invoice_sync_queue(status, created_at);

        INSERT INTO schema_version (version) VALUES (2);
        ",
    )
    .map_err(|e| {
        error!("Migration v2 failed: {e}");
        SyncError::Db(e)
    })?;
    Ok(())
}

/// Migration v3: remote reference number on synced sales, barcode lookup.
fn migrate_v3(conn: &Connection) -> SyncResult<()> {
    conn.execute_batch(
        "
        ALTER TABLE pending_sales ADD COLUMN remote_reference TEXT;
        CREATE INDEX IF NOT EXISTS idx_products_barcode ON products(barcode);

        INSERT INTO schema_version (version) VALUES (3);
        ",
    )
    .map_err(|e| {
        error!("Migration v3 failed: {e}");
        SyncError::Db(e)
    })?;
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::params;

    /// Helper: list table names in the database.
    fn table_names(conn: &Connection) -> Vec<String> {
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .expect("prepare table list");
        stmt.query_map([], |row| row.get(0))
            .expect("query tables")
            .filter_map(|r| r.ok())
            .collect()
    }

    fn count(conn: &Connection, table: &str) -> i64 {
        conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
            row.get(0)
        })
        .expect("count rows")
    }

    /// Seed one row into every user table.
    fn seed_all_tables(conn: &Connection) {
        conn.execute_batch(
            "INSERT INTO products (id, name, price) VALUES ('p1', 'Coffee', 2.5);
             INSERT INTO categories (id, name, sort_order) VALUES ('c1', 'Drinks', 1);
             INSERT INTO pending_sales (id, local_reference, created_at)
                 VALUES ('s1', 'OFF-0001', '2026-03-01T10:00:00+00:00');
             INSERT INTO sync_queue (action, payload, created_at, updated_at)
                 VALUES ('noop', '{}', '2026-03-01T10:00:00+00:00', '2026-03-01T10:00:00+00:00');
             INSERT INTO sync_meta (key, value, updated_at)
                 VALUES ('k', 'v', '2026-03-01T10:00:00+00:00');
             INSERT INTO invoice_drafts (id, sale_id, buyer, created_at)
                 VALUES ('d1', 's1', '{}', '2026-03-01T10:00:00+00:00');
             INSERT INTO invoice_sync_queue (id, sale_id, action, created_at)
                 VALUES ('q1', 's1', 'create', '2026-03-01T10:00:00+00:00');",
        )
        .expect("seed tables");
    }

    #[test]
    fn test_migrations_create_all_tables() {
        let store = Store::open_in_memory().expect("open store");
        let conn = store.conn().unwrap();
        let tables = table_names(&conn);

        for table in [
            "products",
            "categories",
            "pending_sales",
            "sync_queue",
            "sync_meta",
            "invoice_drafts",
            "invoice_sync_queue",
        ] {
            assert!(tables.contains(&table.to_string()), "missing {table}");
        }

        // v3: remote_reference column exists on pending_sales
        let _probe: Result<Option<String>, _> = conn.query_row(
            "SELECT remote_reference FROM pending_sales LIMIT 0",
            [],
            |row| row.get(0),
        );

        let version: i32 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| {
                row.get(0)
            })
            .expect("read schema version");
        assert_eq!(version, CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let store = Store::open_in_memory().expect("open store");
        let conn = store.conn().unwrap();
        // A second run on an up-to-date schema must be a no-op.
        run_migrations(&conn).expect("re-run migrations");
        let rows: i64 = count(&conn, "schema_version");
        assert_eq!(rows, CURRENT_SCHEMA_VERSION as i64);
    }

    #[test]
    fn test_clear_all_empties_every_table() {
        let store = Store::open_in_memory().expect("open store");
        {
            let conn = store.conn().unwrap();
            seed_all_tables(&conn);
            assert_eq!(count(&conn, "pending_sales"), 1);
        }

        store.clear_all().expect("clear all");

        let conn = store.conn().unwrap();
        for table in [
            "products",
            "categories",
            "pending_sales",
            "sync_queue",
            "sync_meta",
            "invoice_drafts",
            "invoice_sync_queue",
        ] {
            assert_eq!(count(&conn, table), 0, "{table} not empty after clear_all");
        }

        // Schema survives, so the next session skips migrations.
        let version: i32 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| {
                row.get(0)
            })
            .expect("read schema version");
        assert_eq!(version, CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_sync_meta_roundtrip() {
        let store = Store::open_in_memory().expect("open store");
        assert_eq!(store.sync_meta_get("products_last_sync").unwrap(), None);

        store
            .sync_meta_set("products_last_sync", "2026-03-01T10:00:00+00:00")
            .unwrap();
        assert_eq!(
            store.sync_meta_get("products_last_sync").unwrap().as_deref(),
            Some("2026-03-01T10:00:00+00:00")
        );

        // Upsert overwrites
        store
            .sync_meta_set("products_last_sync", "2026-03-02T10:00:00+00:00")
            .unwrap();
        assert_eq!(
            store.sync_meta_get("products_last_sync").unwrap().as_deref(),
            Some("2026-03-02T10:00:00+00:00")
        );
    }

    #[test]
    fn test_insert_visible_through_second_guard() {
        let store = Store::open_in_memory().expect("open store");
        {
            let conn = store.conn().unwrap();
            conn.execute(
                "INSERT INTO categories (id, name, sort_order) VALUES (?1, ?2, ?3)",
                params!["c9", "Bakery", 4],
            )
            .unwrap();
        }
        let conn = store.conn().unwrap();
        assert_eq!(count(&conn, "categories"), 1);
    }
}
