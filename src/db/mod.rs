//! Embedded persistence layer.
//!
//! Single SQLite file in WAL mode, single writer / many readers. The
//! connection sits behind a `parking_lot::Mutex`; writers funnel through
//! `with_transaction`, which guarantees rollback on any failure. Uniqueness
//! and non-negativity constraints are declared in the schema so concurrent
//! writers cannot violate them at the application layer alone.

use crate::error::{CoreError, CoreResult};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags};
use std::sync::Arc;
use tracing::{debug, info};

/// Schema for the wine cellar. Idempotent; applied at startup.
const SCHEMA_SQL: &str = r#"
-- Enable WAL mode for concurrent reads during writes
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;
PRAGMA cache_size = -16000;
PRAGMA temp_store = MEMORY;

CREATE TABLE IF NOT EXISTS wines (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    producer TEXT NOT NULL,
    region TEXT NOT NULL DEFAULT '',
    country TEXT NOT NULL DEFAULT '',
    wine_type TEXT NOT NULL,
    grape_varieties TEXT NOT NULL DEFAULT '[]',
    style TEXT,
    tasting_notes TEXT,
    food_pairings TEXT,
    serving_temp_min REAL,
    serving_temp_max REAL,
    updated_at INTEGER NOT NULL,
    updated_by TEXT NOT NULL DEFAULT 'server',
    op_id TEXT NOT NULL DEFAULT '',
    origin TEXT NOT NULL DEFAULT 'server',
    UNIQUE(name, producer)
);

CREATE TABLE IF NOT EXISTS vintages (
    id INTEGER PRIMARY KEY,
    wine_id INTEGER NOT NULL REFERENCES wines(id),
    year INTEGER NOT NULL,
    quality_score REAL,
    critic_score REAL,
    weather_score REAL,
    peak_drinking_start INTEGER,
    peak_drinking_end INTEGER,
    production_notes TEXT,
    updated_at INTEGER NOT NULL,
    updated_by TEXT NOT NULL DEFAULT 'server',
    op_id TEXT NOT NULL DEFAULT '',
    origin TEXT NOT NULL DEFAULT 'server',
    UNIQUE(wine_id, year)
);

CREATE INDEX IF NOT EXISTS idx_vintages_wine ON vintages(wine_id, year);

CREATE TABLE IF NOT EXISTS stock (
    vintage_id INTEGER NOT NULL REFERENCES vintages(id),
    location TEXT NOT NULL,
    quantity INTEGER NOT NULL DEFAULT 0 CHECK (quantity >= 0),
    reserved_quantity INTEGER NOT NULL DEFAULT 0
        CHECK (reserved_quantity >= 0 AND reserved_quantity <= quantity),
    cost_per_bottle REAL,
    updated_at INTEGER NOT NULL,
    updated_by TEXT NOT NULL DEFAULT 'server',
    op_id TEXT NOT NULL DEFAULT '',
    origin TEXT NOT NULL DEFAULT 'server',
    PRIMARY KEY (vintage_id, location)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_stock_location ON stock(location);

-- Append-only movement ledger. AUTOINCREMENT keeps ids monotonic so append
-- order equals commit order even after deletes (which never happen).
CREATE TABLE IF NOT EXISTS ledger (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    vintage_id INTEGER NOT NULL,
    transaction_type TEXT NOT NULL,
    location TEXT NOT NULL,
    quantity INTEGER NOT NULL,
    unit_cost REAL,
    reference_id INTEGER,
    notes TEXT,
    created_by TEXT NOT NULL,
    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
);

CREATE INDEX IF NOT EXISTS idx_ledger_vintage_location
    ON ledger(vintage_id, location, id);

CREATE TABLE IF NOT EXISTS suppliers (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    contact TEXT,
    rating REAL,
    active INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS intake_orders (
    id INTEGER PRIMARY KEY,
    supplier_id INTEGER REFERENCES suppliers(id),
    order_date INTEGER NOT NULL,
    expected_delivery INTEGER,
    status TEXT NOT NULL DEFAULT 'ORDERED',
    notes TEXT,
    updated_at INTEGER NOT NULL,
    updated_by TEXT NOT NULL DEFAULT 'server',
    op_id TEXT NOT NULL DEFAULT '',
    origin TEXT NOT NULL DEFAULT 'server'
);

CREATE TABLE IF NOT EXISTS intake_items (
    id INTEGER PRIMARY KEY,
    order_id INTEGER NOT NULL REFERENCES intake_orders(id),
    vintage_id INTEGER NOT NULL REFERENCES vintages(id),
    expected_quantity INTEGER NOT NULL CHECK (expected_quantity > 0),
    unit_cost REAL,
    location TEXT
);

CREATE INDEX IF NOT EXISTS idx_intake_items_order ON intake_items(order_id);

CREATE TABLE IF NOT EXISTS pairing_recommendations (
    id TEXT PRIMARY KEY,
    fingerprint TEXT NOT NULL,
    dish TEXT NOT NULL,
    context_json TEXT NOT NULL,
    selections_json TEXT NOT NULL,
    provider TEXT NOT NULL,
    created_at INTEGER NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_pairing_created ON pairing_recommendations(created_at);

CREATE TABLE IF NOT EXISTS pairing_feedback (
    id INTEGER PRIMARY KEY,
    recommendation_id TEXT NOT NULL REFERENCES pairing_recommendations(id),
    rating_overall INTEGER CHECK (rating_overall BETWEEN 1 AND 5),
    rating_flavor_harmony INTEGER CHECK (rating_flavor_harmony BETWEEN 1 AND 5),
    rating_texture_balance INTEGER CHECK (rating_texture_balance BETWEEN 1 AND 5),
    rating_acidity_match INTEGER CHECK (rating_acidity_match BETWEEN 1 AND 5),
    rating_tannin_balance INTEGER CHECK (rating_tannin_balance BETWEEN 1 AND 5),
    rating_body_match INTEGER CHECK (rating_body_match BETWEEN 1 AND 5),
    rating_regional_tradition INTEGER CHECK (rating_regional_tradition BETWEEN 1 AND 5),
    selected INTEGER,
    time_to_select_ms INTEGER,
    notes TEXT,
    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
);

CREATE TABLE IF NOT EXISTS weather_vintage (
    region_normalized TEXT NOT NULL,
    year INTEGER NOT NULL,
    gdd REAL NOT NULL,
    huglin_index REAL NOT NULL,
    diurnal_range REAL NOT NULL,
    heatwave_days INTEGER NOT NULL,
    frost_days INTEGER NOT NULL,
    precipitation_total REAL NOT NULL,
    wet_days INTEGER NOT NULL,
    ripeness_score REAL NOT NULL,
    acidity_score REAL NOT NULL,
    tannin_score REAL NOT NULL,
    disease_score REAL NOT NULL,
    overall_score REAL NOT NULL,
    confidence REAL NOT NULL,
    narrative TEXT,
    retrieved_at INTEGER NOT NULL,
    PRIMARY KEY (region_normalized, year)
) WITHOUT ROWID;

-- Sync idempotence: previously committed op_ids with their original outcomes.
CREATE TABLE IF NOT EXISTS applied_ops (
    op_id TEXT PRIMARY KEY,
    payload_hash TEXT NOT NULL,
    outcome TEXT NOT NULL,
    applied_at INTEGER NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_applied_ops_at ON applied_ops(applied_at);

CREATE TABLE IF NOT EXISTS metadata (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
) WITHOUT ROWID;
"#;

/// Transactional key/value + relational store over the wine schema.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn open(path: &str) -> CoreResult<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )?;
        conn.execute_batch(SCHEMA_SQL)
            .map_err(|e| CoreError::Storage(format!("schema init: {e}")))?;

        info!(path, "💾 Store opened (WAL mode)");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` inside a single write transaction. Rolls back on any error.
    ///
    /// BEGIN IMMEDIATE takes the write lock up front so the transaction never
    /// fails with SQLITE_BUSY at commit time.
    pub fn with_transaction<T>(
        &self,
        f: impl FnOnce(&Connection) -> CoreResult<T>,
    ) -> CoreResult<T> {
        let conn = self.conn.lock();
        conn.execute_batch("BEGIN IMMEDIATE")?;
        match f(&conn) {
            Ok(value) => {
                conn.execute_batch("COMMIT")?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rb) = conn.execute_batch("ROLLBACK") {
                    debug!(error = %rb, "rollback after failed transaction");
                }
                Err(e)
            }
        }
    }

    /// Read-only access. WAL lets these proceed concurrently with the writer
    /// at the SQLite level; the process-level mutex keeps rusqlite happy.
    pub fn read<T>(&self, f: impl FnOnce(&Connection) -> CoreResult<T>) -> CoreResult<T> {
        let conn = self.conn.lock();
        f(&conn)
    }

    pub fn get_metadata(&self, key: &str) -> CoreResult<Option<String>> {
        let conn = self.conn.lock();
        let value: Option<String> = conn
            .query_row(
                "SELECT value FROM metadata WHERE key = ?1 LIMIT 1",
                [key],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(CoreError::from(other)),
            })?;
        Ok(value.filter(|v| !v.trim().is_empty()))
    }

    pub fn set_metadata(&self, key: &str, value: &str) -> CoreResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO metadata (key, value) VALUES (?1, ?2) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    /// Drop applied-op records older than the cutoff. Returns rows deleted.
    pub fn prune_applied_ops_before(&self, cutoff: i64) -> CoreResult<usize> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM applied_ops WHERE applied_at < ?1",
            params![cutoff],
        )?;
        Ok(deleted)
    }

    /// Retention policy for produced pairings (90 days). Feedback rows go
    /// first so the FK stays satisfied.
    pub fn prune_recommendations_before(&self, cutoff: i64) -> CoreResult<usize> {
        let conn = self.conn.lock();
        conn.execute_batch("BEGIN IMMEDIATE")?;
        let result = (|| -> CoreResult<usize> {
            conn.execute(
                "DELETE FROM pairing_feedback WHERE recommendation_id IN \
                 (SELECT id FROM pairing_recommendations WHERE created_at < ?1)",
                params![cutoff],
            )?;
            let deleted = conn.execute(
                "DELETE FROM pairing_recommendations WHERE created_at < ?1",
                params![cutoff],
            )?;
            Ok(deleted)
        })();
        match result {
            Ok(n) => {
                conn.execute_batch("COMMIT")?;
                Ok(n)
            }
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK");
                Err(e)
            }
        }
    }

    pub fn optimize(&self) -> CoreResult<()> {
        let conn = self.conn.lock();
        conn.execute_batch("PRAGMA optimize")?;
        Ok(())
    }
}
