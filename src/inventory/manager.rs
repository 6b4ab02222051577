//! Public inventory operations.
//!
//! The only component that mutates Stock. Each operation runs in a single
//! store transaction, appends to the ledger, and on success fans an
//! `inventory_action` event out to the `inventory_updates` room and records a
//! metrics sample.

use crate::db::Store;
use crate::error::{CoreError, CoreResult};
use crate::events::{EventSink, ROOM_INVENTORY};
use crate::inventory::ledger::{self, Balance, Movement};
use crate::metrics::MetricsTracker;
use crate::models::{
    InventoryAction, LedgerEntry, ServerFrame, StockView, TransactionType, WineType,
};
use chrono::Utc;
use rusqlite::{params, Connection};
use std::sync::Arc;
use tracing::{debug, info};

/// Filters for stock listings.
#[derive(Debug, Clone, Default)]
pub struct StockFilters {
    pub wine_type: Option<WineType>,
    pub region: Option<String>,
    pub location: Option<String>,
    pub available_only: bool,
    pub search: Option<String>,
    pub limit: usize,
    pub offset: usize,
}

/// Aggregate totals for reporting surfaces.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StockSummary {
    pub total_bottles: i64,
    pub total_reserved: i64,
    pub by_type: Vec<(String, i64)>,
    pub by_location: Vec<(String, i64)>,
}

pub struct InventoryManager {
    store: Store,
    sink: Arc<dyn EventSink>,
    metrics: Arc<MetricsTracker>,
}

impl InventoryManager {
    pub fn new(store: Store, sink: Arc<dyn EventSink>, metrics: Arc<MetricsTracker>) -> Self {
        Self {
            store,
            sink,
            metrics,
        }
    }

    pub(crate) fn store(&self) -> &Store {
        &self.store
    }

    /// Remove `quantity` bottles from a location.
    pub fn consume(
        &self,
        vintage_id: i64,
        location: &str,
        quantity: i64,
        notes: Option<String>,
        created_by: &str,
    ) -> CoreResult<Balance> {
        let balance = self.apply(
            Movement {
                vintage_id,
                transaction_type: TransactionType::Consume,
                location: location.to_string(),
                quantity,
                unit_cost: None,
                reference_id: None,
                notes,
                created_by: created_by.to_string(),
            },
            "remove",
        )?;
        Ok(balance)
    }

    /// Move bottles between two locations atomically.
    pub fn move_stock(
        &self,
        vintage_id: i64,
        from: &str,
        to: &str,
        quantity: i64,
        notes: Option<String>,
        created_by: &str,
    ) -> CoreResult<(Balance, Balance)> {
        let from = from.trim();
        let to = to.trim();
        if from.is_empty() || to.is_empty() {
            return Err(CoreError::invalid("move requires both locations"));
        }
        if from == to {
            return Err(CoreError::invalid("move across the same location"));
        }

        let result = self.store.with_transaction(|conn| {
            ensure_vintage_exists(conn, vintage_id)?;
            ledger::append(
                conn,
                &Movement {
                    vintage_id,
                    transaction_type: TransactionType::MoveOut,
                    location: from.to_string(),
                    quantity,
                    unit_cost: None,
                    reference_id: None,
                    notes: notes.clone(),
                    created_by: created_by.to_string(),
                },
            )?;
            ledger::append(
                conn,
                &Movement {
                    vintage_id,
                    transaction_type: TransactionType::MoveIn,
                    location: to.to_string(),
                    quantity,
                    unit_cost: None,
                    reference_id: None,
                    notes,
                    created_by: created_by.to_string(),
                },
            )?;
            Ok((
                ledger::balance(conn, vintage_id, from)?,
                ledger::balance(conn, vintage_id, to)?,
            ))
        });

        match result {
            Ok(balances) => {
                self.metrics.record_inventory_op();
                self.publish_action(InventoryAction {
                    action: "move".to_string(),
                    vintage_id,
                    location: from.to_string(),
                    quantity,
                    to_location: Some(to.to_string()),
                    created_by: created_by.to_string(),
                });
                Ok(balances)
            }
            Err(e) => {
                if matches!(e, CoreError::InventoryConflict(_)) {
                    self.metrics.record_inventory_conflict();
                }
                Err(e)
            }
        }
    }

    /// Set bottles aside for a party or service without removing them.
    pub fn reserve(
        &self,
        vintage_id: i64,
        location: &str,
        quantity: i64,
        notes: Option<String>,
        created_by: &str,
    ) -> CoreResult<Balance> {
        self.apply(
            Movement {
                vintage_id,
                transaction_type: TransactionType::Reserve,
                location: location.to_string(),
                quantity,
                unit_cost: None,
                reference_id: None,
                notes,
                created_by: created_by.to_string(),
            },
            "reserve",
        )
    }

    pub fn unreserve(
        &self,
        vintage_id: i64,
        location: &str,
        quantity: i64,
        notes: Option<String>,
        created_by: &str,
    ) -> CoreResult<Balance> {
        self.apply(
            Movement {
                vintage_id,
                transaction_type: TransactionType::Unreserve,
                location: location.to_string(),
                quantity,
                unit_cost: None,
                reference_id: None,
                notes,
                created_by: created_by.to_string(),
            },
            "unreserve",
        )
    }

    /// Manual correction, signed quantity.
    pub fn adjust(
        &self,
        vintage_id: i64,
        location: &str,
        signed_quantity: i64,
        notes: Option<String>,
        created_by: &str,
    ) -> CoreResult<Balance> {
        self.apply(
            Movement {
                vintage_id,
                transaction_type: TransactionType::Adjust,
                location: location.to_string(),
                quantity: signed_quantity,
                unit_cost: None,
                reference_id: None,
                notes,
                created_by: created_by.to_string(),
            },
            "adjust",
        )
    }

    /// Single-movement transaction shared by consume/reserve/unreserve/adjust.
    fn apply(&self, movement: Movement, action: &str) -> CoreResult<Balance> {
        let location = movement.location.trim().to_string();
        if location.is_empty() {
            return Err(CoreError::invalid("location must not be empty"));
        }

        let vintage_id = movement.vintage_id;
        let quantity = movement.quantity;
        let created_by = movement.created_by.clone();

        let result = self.store.with_transaction(|conn| {
            ensure_vintage_exists(conn, vintage_id)?;
            ledger::append(conn, &movement)?;
            ledger::balance(conn, vintage_id, &location)
        });

        match result {
            Ok(balance) => {
                self.metrics.record_inventory_op();
                self.publish_action(InventoryAction {
                    action: action.to_string(),
                    vintage_id,
                    location,
                    quantity,
                    to_location: None,
                    created_by,
                });
                Ok(balance)
            }
            Err(e) => {
                if matches!(e, CoreError::InventoryConflict(_)) {
                    self.metrics.record_inventory_conflict();
                }
                Err(e)
            }
        }
    }

    pub(crate) fn publish_action(&self, action: InventoryAction) {
        debug!(
            action = %action.action,
            vintage_id = action.vintage_id,
            location = %action.location,
            quantity = action.quantity,
            "📦 Inventory mutation"
        );
        self.sink.publish(
            ROOM_INVENTORY,
            ServerFrame::InventoryAction {
                action,
                timestamp: Utc::now().timestamp(),
            },
        );
    }

    pub(crate) fn record_op_metrics(&self) {
        self.metrics.record_inventory_op();
    }

    /// Read-only stock listing joining Wine/Vintage/Stock.
    pub fn get_stock(&self, filters: &StockFilters) -> CoreResult<Vec<StockView>> {
        self.store.read(|conn| query_stock(conn, filters))
    }

    pub fn get_stock_view(&self, vintage_id: i64, location: &str) -> CoreResult<Option<StockView>> {
        let filters = StockFilters {
            location: Some(location.to_string()),
            ..Default::default()
        };
        let views = self.store.read(|conn| query_stock(conn, &filters))?;
        Ok(views.into_iter().find(|v| v.vintage_id == vintage_id))
    }

    pub fn list_ledger(
        &self,
        vintage_id: Option<i64>,
        location: Option<&str>,
        limit: usize,
    ) -> CoreResult<Vec<LedgerEntry>> {
        self.store
            .read(|conn| ledger::list_entries(conn, vintage_id, location, limit))
    }

    /// Rebuild the materialized stock table from the ledger.
    pub fn repair_stock(&self) -> CoreResult<usize> {
        let written = self.store.with_transaction(ledger::rebuild_stock)?;
        info!(rows = written, "🔧 Stock rebuilt from ledger");
        Ok(written)
    }

    pub fn stock_summary(&self) -> CoreResult<StockSummary> {
        self.store.read(|conn| {
            let (total_bottles, total_reserved) = conn.query_row(
                "SELECT COALESCE(SUM(quantity), 0), COALESCE(SUM(reserved_quantity), 0) \
                 FROM stock",
                [],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
            )?;

            let mut stmt = conn.prepare_cached(
                "SELECT w.wine_type, COALESCE(SUM(s.quantity), 0) \
                 FROM stock s \
                 JOIN vintages v ON v.id = s.vintage_id \
                 JOIN wines w ON w.id = v.wine_id \
                 GROUP BY w.wine_type ORDER BY 2 DESC",
            )?;
            let by_type: Vec<(String, i64)> = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<Result<_, _>>()?;

            let mut stmt = conn.prepare_cached(
                "SELECT location, COALESCE(SUM(quantity), 0) FROM stock \
                 GROUP BY location ORDER BY 2 DESC",
            )?;
            let by_location: Vec<(String, i64)> = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<Result<_, _>>()?;

            Ok(StockSummary {
                total_bottles,
                total_reserved,
                by_type,
                by_location,
            })
        })
    }
}

pub(crate) fn ensure_vintage_exists(conn: &Connection, vintage_id: i64) -> CoreResult<()> {
    let exists: bool = conn
        .prepare_cached("SELECT 1 FROM vintages WHERE id = ?1 LIMIT 1")?
        .exists(params![vintage_id])?;
    if exists {
        Ok(())
    } else {
        Err(CoreError::not_found(format!("vintage {vintage_id}")))
    }
}

fn query_stock(conn: &Connection, filters: &StockFilters) -> CoreResult<Vec<StockView>> {
    let mut sql = String::from(
        "SELECT s.vintage_id, w.id, w.name, w.producer, w.region, w.country, w.wine_type, \
                v.year, s.location, s.quantity, s.reserved_quantity, s.cost_per_bottle, \
                v.quality_score, v.weather_score \
         FROM stock s \
         JOIN vintages v ON v.id = s.vintage_id \
         JOIN wines w ON w.id = v.wine_id \
         WHERE 1=1",
    );
    let mut args: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

    if let Some(wine_type) = filters.wine_type {
        sql.push_str(&format!(" AND w.wine_type = ?{}", args.len() + 1));
        args.push(Box::new(wine_type.as_str().to_string()));
    }
    if let Some(region) = filters.region.as_deref().filter(|r| !r.trim().is_empty()) {
        sql.push_str(&format!(" AND w.region LIKE ?{}", args.len() + 1));
        args.push(Box::new(format!("%{}%", region.trim())));
    }
    if let Some(location) = filters.location.as_deref().filter(|l| !l.trim().is_empty()) {
        sql.push_str(&format!(" AND s.location = ?{}", args.len() + 1));
        args.push(Box::new(location.trim().to_string()));
    }
    if filters.available_only {
        sql.push_str(" AND (s.quantity - s.reserved_quantity) > 0");
    }
    if let Some(search) = filters.search.as_deref().filter(|s| !s.trim().is_empty()) {
        let n = args.len() + 1;
        sql.push_str(&format!(
            " AND (w.name LIKE ?{n} OR w.producer LIKE ?{n} OR w.region LIKE ?{n})"
        ));
        args.push(Box::new(format!("%{}%", search.trim())));
    }

    sql.push_str(" ORDER BY w.name, v.year, s.location");
    let limit = if filters.limit == 0 { 200 } else { filters.limit.min(1000) };
    sql.push_str(&format!(" LIMIT ?{}", args.len() + 1));
    args.push(Box::new(limit as i64));
    sql.push_str(&format!(" OFFSET ?{}", args.len() + 1));
    args.push(Box::new(filters.offset as i64));

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(
        rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
        |row| {
            let type_text: String = row.get(6)?;
            let quantity: i64 = row.get(9)?;
            let reserved: i64 = row.get(10)?;
            Ok(StockView {
                vintage_id: row.get(0)?,
                wine_id: row.get(1)?,
                wine_name: row.get(2)?,
                producer: row.get(3)?,
                region: row.get(4)?,
                country: row.get(5)?,
                wine_type: WineType::parse(&type_text).unwrap_or(WineType::Red),
                year: row.get(7)?,
                location: row.get(8)?,
                quantity,
                reserved_quantity: reserved,
                available: quantity - reserved,
                cost_per_bottle: row.get(11)?,
                quality_score: row.get(12)?,
                weather_score: row.get(13)?,
            })
        },
    )?;

    let mut views = Vec::new();
    for row in rows {
        views.push(row?);
    }
    Ok(views)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RecordingSink;

    fn manager() -> (tempfile::TempDir, InventoryManager, Arc<RecordingSink>) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inv.db");
        let store = Store::open(path.to_str().unwrap()).unwrap();
        store
            .with_transaction(|conn| {
                conn.execute(
                    "INSERT INTO wines (id, name, producer, region, country, wine_type, updated_at) \
                     VALUES (1, 'Riesling Kabinett', 'Dr. Loosen', 'Mosel', 'Germany', 'white', 0)",
                    [],
                )?;
                conn.execute(
                    "INSERT INTO vintages (id, wine_id, year, updated_at) VALUES (42, 1, 2021, 0)",
                    [],
                )?;
                Ok(())
            })
            .unwrap();
        let sink = Arc::new(RecordingSink::default());
        let metrics = Arc::new(MetricsTracker::new(100));
        let mgr = InventoryManager::new(store, sink.clone(), metrics);
        (dir, mgr, sink)
    }

    fn seed(mgr: &InventoryManager, qty: i64) {
        mgr.adjust(42, "main-cellar", qty, None, "seed").unwrap();
    }

    #[test]
    fn consume_emits_event() {
        let (_dir, mgr, sink) = manager();
        seed(&mgr, 3);
        sink.take();

        let balance = mgr
            .consume(42, "main-cellar", 1, Some("service".into()), "crew")
            .unwrap();
        assert_eq!(balance.quantity, 2);

        let frames = sink.take();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].0, ROOM_INVENTORY);
        assert!(matches!(
            &frames[0].1,
            ServerFrame::InventoryAction { action, .. } if action.action == "remove"
        ));
    }

    #[test]
    fn consume_unknown_vintage_not_found() {
        let (_dir, mgr, _sink) = manager();
        let result = mgr.consume(999, "main-cellar", 1, None, "crew");
        assert!(matches!(result, Err(CoreError::NotFound(_))));
    }

    #[test]
    fn move_same_location_rejected() {
        let (_dir, mgr, _sink) = manager();
        seed(&mgr, 3);
        let result = mgr.move_stock(42, "main-cellar", "main-cellar", 1, None, "crew");
        assert!(matches!(result, Err(CoreError::InvalidArgument(_))));
    }

    #[test]
    fn move_is_atomic() {
        let (_dir, mgr, _sink) = manager();
        seed(&mgr, 2);

        let (from, to) = mgr
            .move_stock(42, "main-cellar", "service-bar", 2, None, "crew")
            .unwrap();
        assert_eq!(from.quantity, 0);
        assert_eq!(to.quantity, 2);

        // Moving more than remains fails and leaves both sides untouched.
        let result = mgr.move_stock(42, "service-bar", "main-cellar", 3, None, "crew");
        assert!(matches!(result, Err(CoreError::InventoryConflict(_))));
        let views = mgr.get_stock(&StockFilters::default()).unwrap();
        let bar = views.iter().find(|v| v.location == "service-bar").unwrap();
        assert_eq!(bar.quantity, 2);
    }

    #[test]
    fn zero_quantity_rows_not_available() {
        let (_dir, mgr, _sink) = manager();
        seed(&mgr, 1);
        mgr.consume(42, "main-cellar", 1, None, "crew").unwrap();

        let all = mgr.get_stock(&StockFilters::default()).unwrap();
        assert_eq!(all.len(), 1, "zero rows persist");

        let available = mgr
            .get_stock(&StockFilters {
                available_only: true,
                ..Default::default()
            })
            .unwrap();
        assert!(available.is_empty());
    }

    #[test]
    fn reserved_excluded_from_available() {
        let (_dir, mgr, _sink) = manager();
        seed(&mgr, 4);
        mgr.reserve(42, "main-cellar", 4, None, "crew").unwrap();

        let available = mgr
            .get_stock(&StockFilters {
                available_only: true,
                ..Default::default()
            })
            .unwrap();
        assert!(available.is_empty());

        mgr.unreserve(42, "main-cellar", 1, None, "crew").unwrap();
        let available = mgr
            .get_stock(&StockFilters {
                available_only: true,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(available.len(), 1);
        assert_eq!(available[0].available, 1);
    }

    #[test]
    fn filters_by_type_and_search() {
        let (_dir, mgr, _sink) = manager();
        seed(&mgr, 5);

        let whites = mgr
            .get_stock(&StockFilters {
                wine_type: Some(WineType::White),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(whites.len(), 1);

        let reds = mgr
            .get_stock(&StockFilters {
                wine_type: Some(WineType::Red),
                ..Default::default()
            })
            .unwrap();
        assert!(reds.is_empty());

        let hits = mgr
            .get_stock(&StockFilters {
                search: Some("loosen".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn summary_totals() {
        let (_dir, mgr, _sink) = manager();
        seed(&mgr, 6);
        mgr.reserve(42, "main-cellar", 2, None, "crew").unwrap();

        let summary = mgr.stock_summary().unwrap();
        assert_eq!(summary.total_bottles, 6);
        assert_eq!(summary.total_reserved, 2);
        assert_eq!(summary.by_type[0].0, "white");
    }
}
