//! Intake orders: planned receipts from suppliers.
//!
//! `intake` records what was ordered without touching stock; `receive` turns
//! deliveries into RECEIVE ledger entries referencing the intake item, so
//! order status is always derivable from the ledger.

use crate::error::{CoreError, CoreResult};
use crate::inventory::ledger::{self, Movement};
use crate::inventory::manager::InventoryManager;
use crate::models::{vintage_year_valid, IntakeStatus, InventoryAction, TransactionType, WineType};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WineSpec {
    pub name: String,
    pub producer: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub country: String,
    pub wine_type: WineType,
    #[serde(default)]
    pub grape_varieties: Vec<String>,
    #[serde(default)]
    pub style: Option<String>,
    #[serde(default)]
    pub tasting_notes: Option<String>,
    #[serde(default)]
    pub food_pairings: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntakeItemSpec {
    pub wine: WineSpec,
    pub year: i32,
    pub expected_quantity: i64,
    #[serde(default)]
    pub unit_cost: Option<f64>,
    #[serde(default)]
    pub location: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntakeRequest {
    #[serde(default)]
    pub supplier: Option<String>,
    pub order_date: i64,
    #[serde(default)]
    pub expected_delivery: Option<i64>,
    pub items: Vec<IntakeItemSpec>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IntakeReceipt {
    pub order_id: i64,
    pub items: Vec<IntakeItemRef>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IntakeItemRef {
    pub item_id: i64,
    pub vintage_id: i64,
    pub wine_id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReceiptLine {
    pub item_id: i64,
    pub quantity: i64,
    #[serde(default)]
    pub location: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IntakeItemStatus {
    pub item_id: i64,
    pub vintage_id: i64,
    pub expected_quantity: i64,
    pub received_quantity: i64,
    pub outstanding_quantity: i64,
    pub location: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IntakeStatusReport {
    pub order_id: i64,
    pub status: IntakeStatus,
    pub items: Vec<IntakeItemStatus>,
}

impl InventoryManager {
    /// Record a planned receipt. Upserts Wine/Vintage shells, creates the
    /// order in ORDERED state. No stock movement happens here.
    pub fn intake(&self, request: &IntakeRequest, created_by: &str) -> CoreResult<IntakeReceipt> {
        if request.items.is_empty() {
            return Err(CoreError::invalid("intake requires at least one item"));
        }
        for item in &request.items {
            if item.wine.name.trim().is_empty() || item.wine.producer.trim().is_empty() {
                return Err(CoreError::invalid("wine name and producer are required"));
            }
            if !vintage_year_valid(item.year) {
                return Err(CoreError::invalid(format!("vintage year {}", item.year)));
            }
            if item.expected_quantity <= 0 {
                return Err(CoreError::invalid("expected_quantity must be positive"));
            }
        }

        let receipt = self.store().with_transaction(|conn| {
            let supplier_id = match request.supplier.as_deref().map(str::trim) {
                Some(name) if !name.is_empty() => Some(upsert_supplier(conn, name)?),
                _ => None,
            };

            conn.execute(
                "INSERT INTO intake_orders (supplier_id, order_date, expected_delivery, \
                                            status, notes, updated_at, updated_by) \
                 VALUES (?1, ?2, ?3, 'ORDERED', ?4, strftime('%s', 'now'), ?5)",
                params![
                    supplier_id,
                    request.order_date,
                    request.expected_delivery,
                    request.notes,
                    created_by,
                ],
            )?;
            let order_id = conn.last_insert_rowid();

            let mut items = Vec::with_capacity(request.items.len());
            for item in &request.items {
                let wine_id = upsert_wine(conn, &item.wine, created_by)?;
                let vintage_id = upsert_vintage(conn, wine_id, item.year, created_by)?;
                conn.execute(
                    "INSERT INTO intake_items (order_id, vintage_id, expected_quantity, \
                                               unit_cost, location) \
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        order_id,
                        vintage_id,
                        item.expected_quantity,
                        item.unit_cost,
                        item.location.as_deref().map(str::trim),
                    ],
                )?;
                items.push(IntakeItemRef {
                    item_id: conn.last_insert_rowid(),
                    vintage_id,
                    wine_id,
                });
            }

            Ok(IntakeReceipt { order_id, items })
        })?;

        self.record_op_metrics();
        info!(
            order_id = receipt.order_id,
            items = receipt.items.len(),
            "🍷 Intake order created"
        );
        Ok(receipt)
    }

    /// Receive deliveries against an order. Each line appends a RECEIVE
    /// ledger entry referencing the intake item and bumps the stock row.
    pub fn receive(
        &self,
        order_id: i64,
        receipts: &[ReceiptLine],
        notes: Option<String>,
        created_by: &str,
    ) -> CoreResult<IntakeStatusReport> {
        if receipts.is_empty() {
            return Err(CoreError::invalid("receive requires at least one line"));
        }

        let (report, actions) = self.store().with_transaction(|conn| {
            let status = order_status_row(conn, order_id)?;
            if status == IntakeStatus::Cancelled {
                return Err(CoreError::conflict(format!(
                    "order {order_id} is cancelled"
                )));
            }

            let mut actions = Vec::with_capacity(receipts.len());
            for line in receipts {
                if line.quantity <= 0 {
                    return Err(CoreError::invalid("receipt quantity must be positive"));
                }
                let item = load_item(conn, order_id, line.item_id)?;

                // Receipt location wins; fall back to the item's declared
                // location; neither present is a validation error.
                let location = line
                    .location
                    .as_deref()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .map(str::to_string)
                    .or_else(|| item.location.clone())
                    .ok_or_else(|| {
                        CoreError::invalid(format!(
                            "receipt for item {} has no location",
                            line.item_id
                        ))
                    })?;

                ledger::append(
                    conn,
                    &Movement {
                        vintage_id: item.vintage_id,
                        transaction_type: TransactionType::Receive,
                        location: location.clone(),
                        quantity: line.quantity,
                        unit_cost: item.unit_cost,
                        reference_id: Some(item.item_id),
                        notes: notes.clone(),
                        created_by: created_by.to_string(),
                    },
                )?;
                actions.push(InventoryAction {
                    action: "add".to_string(),
                    vintage_id: item.vintage_id,
                    location,
                    quantity: line.quantity,
                    to_location: None,
                    created_by: created_by.to_string(),
                });
            }

            let report = derive_status(conn, order_id)?;
            conn.execute(
                "UPDATE intake_orders SET status = ?1, updated_at = strftime('%s', 'now'), \
                        updated_by = ?2 WHERE id = ?3",
                params![report.status.as_str(), created_by, order_id],
            )?;
            Ok((report, actions))
        })?;

        self.record_op_metrics();
        for action in actions {
            self.publish_action(action);
        }
        Ok(report)
    }

    /// Outstanding quantities + derived status for an order.
    pub fn get_intake_status(&self, order_id: i64) -> CoreResult<IntakeStatusReport> {
        self.store().read(|conn| {
            order_status_row(conn, order_id)?;
            derive_status(conn, order_id)
        })
    }

    /// Cancel an order that has not received anything yet.
    pub fn cancel_intake(&self, order_id: i64, cancelled_by: &str) -> CoreResult<()> {
        self.store().with_transaction(|conn| {
            let report = derive_status(conn, order_id)?;
            if report.items.iter().any(|i| i.received_quantity > 0) {
                return Err(CoreError::conflict(format!(
                    "order {order_id} already has receipts"
                )));
            }
            conn.execute(
                "UPDATE intake_orders SET status = 'CANCELLED', \
                        updated_at = strftime('%s', 'now'), updated_by = ?1 \
                 WHERE id = ?2",
                params![cancelled_by, order_id],
            )?;
            Ok(())
        })
    }
}

struct ItemRow {
    item_id: i64,
    vintage_id: i64,
    expected_quantity: i64,
    unit_cost: Option<f64>,
    location: Option<String>,
}

fn order_status_row(conn: &Connection, order_id: i64) -> CoreResult<IntakeStatus> {
    let status: Option<String> = conn
        .prepare_cached("SELECT status FROM intake_orders WHERE id = ?1")?
        .query_row(params![order_id], |row| row.get(0))
        .optional()?;
    match status {
        Some(s) => IntakeStatus::parse(&s)
            .ok_or_else(|| CoreError::Storage(format!("bad order status '{s}'"))),
        None => Err(CoreError::not_found(format!("intake order {order_id}"))),
    }
}

fn load_item(conn: &Connection, order_id: i64, item_id: i64) -> CoreResult<ItemRow> {
    let row = conn
        .prepare_cached(
            "SELECT id, vintage_id, expected_quantity, unit_cost, location \
             FROM intake_items WHERE id = ?1 AND order_id = ?2",
        )?
        .query_row(params![item_id, order_id], |row| {
            Ok(ItemRow {
                item_id: row.get(0)?,
                vintage_id: row.get(1)?,
                expected_quantity: row.get(2)?,
                unit_cost: row.get(3)?,
                location: row.get(4)?,
            })
        })
        .optional()?;
    row.ok_or_else(|| {
        CoreError::not_found(format!("intake item {item_id} on order {order_id}"))
    })
}

fn derive_status(conn: &Connection, order_id: i64) -> CoreResult<IntakeStatusReport> {
    let stored = order_status_row(conn, order_id)?;

    let mut stmt = conn.prepare_cached(
        "SELECT id, vintage_id, expected_quantity, unit_cost, location \
         FROM intake_items WHERE order_id = ?1 ORDER BY id",
    )?;
    let items: Vec<ItemRow> = stmt
        .query_map(params![order_id], |row| {
            Ok(ItemRow {
                item_id: row.get(0)?,
                vintage_id: row.get(1)?,
                expected_quantity: row.get(2)?,
                unit_cost: row.get(3)?,
                location: row.get(4)?,
            })
        })?
        .collect::<Result<_, _>>()?;

    let mut statuses = Vec::with_capacity(items.len());
    let mut any_received = false;
    let mut all_received = !items.is_empty();
    for item in &items {
        let received = ledger::received_for_item(conn, item.item_id)?;
        if received > 0 {
            any_received = true;
        }
        if received < item.expected_quantity {
            all_received = false;
        }
        statuses.push(IntakeItemStatus {
            item_id: item.item_id,
            vintage_id: item.vintage_id,
            expected_quantity: item.expected_quantity,
            received_quantity: received,
            outstanding_quantity: (item.expected_quantity - received).max(0),
            location: item.location.clone(),
        });
    }

    let status = if stored == IntakeStatus::Cancelled {
        IntakeStatus::Cancelled
    } else if all_received {
        IntakeStatus::Received
    } else if any_received {
        IntakeStatus::PartiallyReceived
    } else {
        IntakeStatus::Ordered
    };

    Ok(IntakeStatusReport {
        order_id,
        status,
        items: statuses,
    })
}

fn upsert_supplier(conn: &Connection, name: &str) -> CoreResult<i64> {
    let existing: Option<i64> = conn
        .prepare_cached("SELECT id FROM suppliers WHERE name = ?1")?
        .query_row(params![name], |row| row.get(0))
        .optional()?;
    if let Some(id) = existing {
        return Ok(id);
    }
    conn.execute("INSERT INTO suppliers (name) VALUES (?1)", params![name])?;
    Ok(conn.last_insert_rowid())
}

fn upsert_wine(conn: &Connection, spec: &WineSpec, created_by: &str) -> CoreResult<i64> {
    let name = spec.name.trim();
    let producer = spec.producer.trim();
    let existing: Option<i64> = conn
        .prepare_cached("SELECT id FROM wines WHERE name = ?1 AND producer = ?2")?
        .query_row(params![name, producer], |row| row.get(0))
        .optional()?;
    if let Some(id) = existing {
        return Ok(id);
    }

    let varieties = serde_json::to_string(&spec.grape_varieties)
        .map_err(|e| CoreError::Storage(e.to_string()))?;
    conn.execute(
        "INSERT INTO wines (name, producer, region, country, wine_type, grape_varieties, \
                            style, tasting_notes, food_pairings, updated_at, updated_by) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, strftime('%s', 'now'), ?10)",
        params![
            name,
            producer,
            spec.region.trim(),
            spec.country.trim(),
            spec.wine_type.as_str(),
            varieties,
            spec.style,
            spec.tasting_notes,
            spec.food_pairings,
            created_by,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn upsert_vintage(conn: &Connection, wine_id: i64, year: i32, created_by: &str) -> CoreResult<i64> {
    let existing: Option<i64> = conn
        .prepare_cached("SELECT id FROM vintages WHERE wine_id = ?1 AND year = ?2")?
        .query_row(params![wine_id, year], |row| row.get(0))
        .optional()?;
    if let Some(id) = existing {
        return Ok(id);
    }
    conn.execute(
        "INSERT INTO vintages (wine_id, year, updated_at, updated_by) \
         VALUES (?1, ?2, strftime('%s', 'now'), ?3)",
        params![wine_id, year, created_by],
    )?;
    Ok(conn.last_insert_rowid())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Store;
    use crate::events::RecordingSink;
    use crate::metrics::MetricsTracker;
    use std::sync::Arc;

    fn manager() -> (tempfile::TempDir, InventoryManager) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("intake.db");
        let store = Store::open(path.to_str().unwrap()).unwrap();
        let mgr = InventoryManager::new(
            store,
            Arc::new(RecordingSink::default()),
            Arc::new(MetricsTracker::new(100)),
        );
        (dir, mgr)
    }

    fn sample_request() -> IntakeRequest {
        IntakeRequest {
            supplier: Some("Maison Bordelaise".to_string()),
            order_date: 1_700_000_000,
            expected_delivery: Some(1_700_600_000),
            items: vec![
                IntakeItemSpec {
                    wine: WineSpec {
                        name: "Pauillac Grand Cru".to_string(),
                        producer: "Château Latour".to_string(),
                        region: "Bordeaux".to_string(),
                        country: "France".to_string(),
                        wine_type: WineType::Red,
                        grape_varieties: vec!["Cabernet Sauvignon".into(), "Merlot".into()],
                        style: None,
                        tasting_notes: None,
                        food_pairings: None,
                    },
                    year: 2016,
                    expected_quantity: 12,
                    unit_cost: Some(850.0),
                    location: Some("main-cellar".to_string()),
                },
                IntakeItemSpec {
                    wine: WineSpec {
                        name: "Chablis Premier Cru".to_string(),
                        producer: "Domaine Raveneau".to_string(),
                        region: "Burgundy".to_string(),
                        country: "France".to_string(),
                        wine_type: WineType::White,
                        grape_varieties: vec!["Chardonnay".into()],
                        style: None,
                        tasting_notes: None,
                        food_pairings: None,
                    },
                    year: 2020,
                    expected_quantity: 6,
                    unit_cost: Some(120.0),
                    location: None,
                },
            ],
            notes: None,
        }
    }

    #[test]
    fn intake_creates_no_stock() {
        let (_dir, mgr) = manager();
        let receipt = mgr.intake(&sample_request(), "purser").unwrap();
        assert_eq!(receipt.items.len(), 2);

        let report = mgr.get_intake_status(receipt.order_id).unwrap();
        assert_eq!(report.status, IntakeStatus::Ordered);
        assert_eq!(report.items[0].outstanding_quantity, 12);

        let stock = mgr
            .get_stock(&crate::inventory::manager::StockFilters::default())
            .unwrap();
        assert!(stock.is_empty());
    }

    #[test]
    fn intake_reuses_existing_wine() {
        let (_dir, mgr) = manager();
        let first = mgr.intake(&sample_request(), "purser").unwrap();
        let second = mgr.intake(&sample_request(), "purser").unwrap();
        assert_eq!(first.items[0].vintage_id, second.items[0].vintage_id);
        assert_ne!(first.order_id, second.order_id);
    }

    #[test]
    fn receive_partial_then_full() {
        let (_dir, mgr) = manager();
        let receipt = mgr.intake(&sample_request(), "purser").unwrap();
        let item = &receipt.items[0];

        let report = mgr
            .receive(
                receipt.order_id,
                &[ReceiptLine {
                    item_id: item.item_id,
                    quantity: 5,
                    location: None,
                }],
                None,
                "deckhand",
            )
            .unwrap();
        assert_eq!(report.status, IntakeStatus::PartiallyReceived);
        assert_eq!(report.items[0].received_quantity, 5);
        assert_eq!(report.items[0].outstanding_quantity, 7);

        let view = mgr
            .get_stock_view(item.vintage_id, "main-cellar")
            .unwrap()
            .unwrap();
        assert_eq!(view.quantity, 5);

        let report = mgr
            .receive(
                receipt.order_id,
                &[
                    ReceiptLine {
                        item_id: item.item_id,
                        quantity: 7,
                        location: None,
                    },
                    ReceiptLine {
                        item_id: receipt.items[1].item_id,
                        quantity: 6,
                        location: Some("service-bar".to_string()),
                    },
                ],
                None,
                "deckhand",
            )
            .unwrap();
        assert_eq!(report.status, IntakeStatus::Received);
    }

    #[test]
    fn receive_without_location_rejected() {
        let (_dir, mgr) = manager();
        let receipt = mgr.intake(&sample_request(), "purser").unwrap();
        // Second item has no declared location; a line without one must fail.
        let result = mgr.receive(
            receipt.order_id,
            &[ReceiptLine {
                item_id: receipt.items[1].item_id,
                quantity: 1,
                location: None,
            }],
            None,
            "deckhand",
        );
        assert!(matches!(result, Err(CoreError::InvalidArgument(_))));
    }

    #[test]
    fn receive_unknown_order_or_item() {
        let (_dir, mgr) = manager();
        let receipt = mgr.intake(&sample_request(), "purser").unwrap();

        let result = mgr.receive(
            999,
            &[ReceiptLine {
                item_id: 1,
                quantity: 1,
                location: None,
            }],
            None,
            "x",
        );
        assert!(matches!(result, Err(CoreError::NotFound(_))));

        let result = mgr.receive(
            receipt.order_id,
            &[ReceiptLine {
                item_id: 9999,
                quantity: 1,
                location: None,
            }],
            None,
            "x",
        );
        assert!(matches!(result, Err(CoreError::NotFound(_))));
    }

    #[test]
    fn cancel_blocks_receive() {
        let (_dir, mgr) = manager();
        let receipt = mgr.intake(&sample_request(), "purser").unwrap();
        mgr.cancel_intake(receipt.order_id, "purser").unwrap();

        let result = mgr.receive(
            receipt.order_id,
            &[ReceiptLine {
                item_id: receipt.items[0].item_id,
                quantity: 1,
                location: None,
            }],
            None,
            "deckhand",
        );
        assert!(matches!(result, Err(CoreError::InventoryConflict(_))));

        let report = mgr.get_intake_status(receipt.order_id).unwrap();
        assert_eq!(report.status, IntakeStatus::Cancelled);
    }

    #[test]
    fn cancel_after_receipt_rejected() {
        let (_dir, mgr) = manager();
        let receipt = mgr.intake(&sample_request(), "purser").unwrap();
        mgr.receive(
            receipt.order_id,
            &[ReceiptLine {
                item_id: receipt.items[0].item_id,
                quantity: 1,
                location: None,
            }],
            None,
            "deckhand",
        )
        .unwrap();

        let result = mgr.cancel_intake(receipt.order_id, "purser");
        assert!(matches!(result, Err(CoreError::InventoryConflict(_))));
    }
}
