//! Server-side reconciliation of client-originated mutations.
//!
//! Three rules make reconvergence order-independent:
//!   1. idempotence by op_id (applied_ops table, replay is a no-op),
//!   2. last-write-wins on metadata rows, tie broken by origin,
//!   3. additive deltas on inventory quantities, never LWW.
//!
//! Each mutation is its own transaction; a batch is deliberately not atomic
//! so partial progress survives intermittent connectivity.

use crate::config::SyncTiebreaker;
use crate::db::Store;
use crate::error::{CoreError, CoreResult};
use crate::events::{EventSink, ROOM_INVENTORY};
use crate::inventory::ledger::{self, Movement};
use crate::inventory::manager::ensure_vintage_exists;
use crate::metrics::MetricsTracker;
use crate::models::{InventoryAction, ServerFrame, TransactionType, WineType};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// One client-side mutation as shipped by the offline queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientOperation {
    pub op_id: String,
    pub updated_at: i64,
    #[serde(default)]
    pub updated_by: String,
    pub origin: String,
    pub endpoint: String,
    pub method: String,
    pub payload: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpStatus {
    Applied,
    Duplicate,
    Rejected,
}

/// Per-op outcome returned to the client and stored for replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpOutcome {
    pub op_id: String,
    pub status: OpStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_updated_at: Option<i64>,
}

impl OpOutcome {
    fn applied(op_id: &str, server_updated_at: i64) -> Self {
        Self {
            op_id: op_id.to_string(),
            status: OpStatus::Applied,
            code: None,
            reason: None,
            server_updated_at: Some(server_updated_at),
        }
    }

    fn rejected(op_id: &str, error: &CoreError) -> Self {
        Self {
            op_id: op_id.to_string(),
            status: OpStatus::Rejected,
            code: Some(error.code().to_string()),
            reason: Some(error.to_string()),
            server_updated_at: None,
        }
    }
}

/// Mutation decoded from (endpoint, method, payload).
#[derive(Debug, Clone)]
enum ParsedOp {
    Delta {
        transaction_type: TransactionType,
        vintage_id: i64,
        location: String,
        quantity: i64,
        notes: Option<String>,
    },
    Move {
        vintage_id: i64,
        from: String,
        to: String,
        quantity: i64,
        notes: Option<String>,
    },
    WineMetadata {
        wine_id: i64,
        fields: serde_json::Map<String, Value>,
    },
    VintageMetadata {
        vintage_id: i64,
        fields: serde_json::Map<String, Value>,
    },
}

impl ParsedOp {
    /// Delta ops on the same key are reordered by op_id within a batch so the
    /// accept/reject decision is reproducible regardless of arrival order.
    fn delta_key(&self) -> Option<(i64, String)> {
        match self {
            ParsedOp::Delta {
                vintage_id,
                location,
                ..
            } => Some((*vintage_id, location.clone())),
            ParsedOp::Move { vintage_id, from, .. } => Some((*vintage_id, from.clone())),
            _ => None,
        }
    }
}

pub struct SyncReconciler {
    store: Store,
    sink: Arc<dyn EventSink>,
    metrics: Arc<MetricsTracker>,
    tiebreaker: SyncTiebreaker,
}

impl SyncReconciler {
    pub fn new(
        store: Store,
        sink: Arc<dyn EventSink>,
        metrics: Arc<MetricsTracker>,
        tiebreaker: SyncTiebreaker,
    ) -> Self {
        Self {
            store,
            sink,
            metrics,
            tiebreaker,
        }
    }

    /// Apply a batch of client mutations. Ops are applied in client order,
    /// except that delta ops sharing a (vintage, location) are ordered among
    /// themselves by op_id. Failures never poison sibling ops.
    pub fn apply_batch(&self, operations: &[ClientOperation]) -> Vec<OpOutcome> {
        let ordered = order_batch(operations);
        let mut outcomes: HashMap<usize, OpOutcome> = HashMap::with_capacity(ordered.len());

        for (index, op) in ordered {
            let outcome = self.apply_one(op);
            match outcome.status {
                OpStatus::Applied => self.metrics.record_sync_outcome(true, false),
                OpStatus::Duplicate => self.metrics.record_sync_outcome(false, true),
                OpStatus::Rejected => self.metrics.record_sync_outcome(false, false),
            }
            outcomes.insert(index, outcome);
        }

        // Report in the client's original order.
        (0..operations.len())
            .map(|i| outcomes.remove(&i).expect("outcome per op"))
            .collect()
    }

    fn apply_one(&self, op: &ClientOperation) -> OpOutcome {
        if op.op_id.trim().is_empty() || op.origin.trim().is_empty() {
            return OpOutcome::rejected(
                &op.op_id,
                &CoreError::invalid("op_id and origin are required"),
            );
        }

        let hash = payload_hash(op);

        // Fast path: already committed.
        match self.lookup_applied(&op.op_id) {
            Ok(Some((stored_hash, original))) => {
                if stored_hash != hash {
                    // Same op_id, different payload: a client bug, never a replay.
                    return OpOutcome::rejected(
                        &op.op_id,
                        &CoreError::invalid(format!("op_id '{}' reused with a different payload", op.op_id)),
                    );
                }
                debug!(op_id = %op.op_id, "↩️ Sync replay skipped");
                return OpOutcome {
                    status: OpStatus::Duplicate,
                    ..original
                };
            }
            Ok(None) => {}
            Err(e) => return OpOutcome::rejected(&op.op_id, &e),
        }

        let parsed = match parse_operation(op) {
            Ok(parsed) => parsed,
            Err(e) => return OpOutcome::rejected(&op.op_id, &e),
        };

        let result = self.store.with_transaction(|conn| {
            // Mutation and idempotence record commit together; a concurrent
            // replay of the same op_id loses the PK race and rolls back.
            let server_updated_at = Utc::now().timestamp();
            let actions = self.dispatch(conn, op, &parsed)?;
            let outcome = OpOutcome::applied(&op.op_id, server_updated_at);
            record_applied(conn, &op.op_id, &hash, &outcome)?;
            Ok((outcome, actions))
        });

        match result {
            Ok((outcome, actions)) => {
                for action in actions {
                    self.sink.publish(
                        ROOM_INVENTORY,
                        ServerFrame::InventoryAction {
                            action,
                            timestamp: Utc::now().timestamp(),
                        },
                    );
                }
                outcome
            }
            Err(CoreError::SyncDuplicate(_)) => {
                // Lost the applied_ops PK race to a concurrent replay of the
                // same op; report what the winner committed.
                match self.lookup_applied(&op.op_id) {
                    Ok(Some((_, original))) => OpOutcome {
                        status: OpStatus::Duplicate,
                        ..original
                    },
                    _ => OpOutcome {
                        op_id: op.op_id.clone(),
                        status: OpStatus::Duplicate,
                        code: None,
                        reason: None,
                        server_updated_at: None,
                    },
                }
            }
            Err(e) => {
                if matches!(e, CoreError::InventoryConflict(_)) {
                    self.metrics.record_inventory_conflict();
                    warn!(op_id = %op.op_id, error = %e, "⚠️ Sync delta rejected");
                }
                OpOutcome::rejected(&op.op_id, &e)
            }
        }
    }

    fn lookup_applied(&self, op_id: &str) -> CoreResult<Option<(String, OpOutcome)>> {
        self.store.read(|conn| {
            let row: Option<(String, String)> = conn
                .prepare_cached(
                    "SELECT payload_hash, outcome FROM applied_ops WHERE op_id = ?1",
                )?
                .query_row(params![op_id], |row| Ok((row.get(0)?, row.get(1)?)))
                .optional()?;
            match row {
                Some((hash, outcome_json)) => {
                    let outcome: OpOutcome = serde_json::from_str(&outcome_json)
                        .map_err(|e| CoreError::Storage(format!("bad stored outcome: {e}")))?;
                    Ok(Some((hash, outcome)))
                }
                None => Ok(None),
            }
        })
    }

    fn dispatch(
        &self,
        conn: &Connection,
        op: &ClientOperation,
        parsed: &ParsedOp,
    ) -> CoreResult<Vec<InventoryAction>> {
        match parsed {
            ParsedOp::Delta {
                transaction_type,
                vintage_id,
                location,
                quantity,
                notes,
            } => {
                ensure_vintage_exists(conn, *vintage_id)?;
                ledger::append(
                    conn,
                    &Movement {
                        vintage_id: *vintage_id,
                        transaction_type: *transaction_type,
                        location: location.clone(),
                        quantity: *quantity,
                        unit_cost: None,
                        reference_id: None,
                        notes: notes.clone(),
                        created_by: op.updated_by.clone(),
                    },
                )?;
                Ok(vec![InventoryAction {
                    action: delta_action_name(*transaction_type).to_string(),
                    vintage_id: *vintage_id,
                    location: location.clone(),
                    quantity: *quantity,
                    to_location: None,
                    created_by: op.updated_by.clone(),
                }])
            }
            ParsedOp::Move {
                vintage_id,
                from,
                to,
                quantity,
                notes,
            } => {
                ensure_vintage_exists(conn, *vintage_id)?;
                for (transaction_type, location) in [
                    (TransactionType::MoveOut, from),
                    (TransactionType::MoveIn, to),
                ] {
                    ledger::append(
                        conn,
                        &Movement {
                            vintage_id: *vintage_id,
                            transaction_type,
                            location: location.clone(),
                            quantity: *quantity,
                            unit_cost: None,
                            reference_id: None,
                            notes: notes.clone(),
                            created_by: op.updated_by.clone(),
                        },
                    )?;
                }
                Ok(vec![InventoryAction {
                    action: "move".to_string(),
                    vintage_id: *vintage_id,
                    location: from.clone(),
                    quantity: *quantity,
                    to_location: Some(to.clone()),
                    created_by: op.updated_by.clone(),
                }])
            }
            ParsedOp::WineMetadata { wine_id, fields } => {
                self.merge_metadata(conn, op, "wines", *wine_id, fields, WINE_METADATA_FIELDS)?;
                Ok(Vec::new())
            }
            ParsedOp::VintageMetadata { vintage_id, fields } => {
                self.merge_metadata(
                    conn,
                    op,
                    "vintages",
                    *vintage_id,
                    fields,
                    VINTAGE_METADATA_FIELDS,
                )?;
                Ok(Vec::new())
            }
        }
    }

    /// Row-level last-write-wins merge. The incoming op either wins the whole
    /// field set or keeps the server row untouched.
    fn merge_metadata(
        &self,
        conn: &Connection,
        op: &ClientOperation,
        table: &str,
        row_id: i64,
        fields: &serde_json::Map<String, Value>,
        allowed: &[(&str, MetadataKind)],
    ) -> CoreResult<()> {
        let stored: Option<(i64, String)> = conn
            .prepare_cached(&format!(
                "SELECT updated_at, origin FROM {table} WHERE id = ?1"
            ))?
            .query_row(params![row_id], |row| Ok((row.get(0)?, row.get(1)?)))
            .optional()?;
        let (stored_at, stored_origin) =
            stored.ok_or_else(|| CoreError::not_found(format!("{table} row {row_id}")))?;

        let wins = match op.updated_at.cmp(&stored_at) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => match self.tiebreaker {
                SyncTiebreaker::OriginLex => op.origin > stored_origin,
                SyncTiebreaker::ServerWins => false,
            },
        };
        if !wins {
            debug!(
                table,
                row_id,
                incoming = op.updated_at,
                stored = stored_at,
                "🕰️ LWW keeps server value"
            );
            return Ok(());
        }

        let mut sets = Vec::new();
        let mut args: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
        for (key, value) in fields {
            let Some((column, kind)) = allowed.iter().find(|(name, _)| name == key) else {
                return Err(CoreError::invalid(format!(
                    "field '{key}' is not client-mutable on {table}"
                )));
            };
            let boxed = kind.coerce(key, value)?;
            sets.push(format!("{column} = ?{}", args.len() + 1));
            args.push(boxed);
        }
        if sets.is_empty() {
            return Err(CoreError::invalid("metadata update carries no fields"));
        }

        sets.push(format!("updated_at = ?{}", args.len() + 1));
        args.push(Box::new(op.updated_at));
        sets.push(format!("updated_by = ?{}", args.len() + 1));
        args.push(Box::new(op.updated_by.clone()));
        sets.push(format!("op_id = ?{}", args.len() + 1));
        args.push(Box::new(op.op_id.clone()));
        sets.push(format!("origin = ?{}", args.len() + 1));
        args.push(Box::new(op.origin.clone()));

        let sql = format!(
            "UPDATE {table} SET {} WHERE id = ?{}",
            sets.join(", "),
            args.len() + 1
        );
        args.push(Box::new(row_id));
        conn.execute(
            &sql,
            rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
        )?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum MetadataKind {
    Text,
    Number,
    WineType,
    TextArray,
    Json,
}

impl MetadataKind {
    fn coerce(
        &self,
        key: &str,
        value: &Value,
    ) -> CoreResult<Box<dyn rusqlite::types::ToSql>> {
        match self {
            MetadataKind::Text => match value {
                Value::String(s) => Ok(Box::new(s.clone())),
                Value::Null => Ok(Box::new(None::<String>)),
                _ => Err(CoreError::invalid(format!("field '{key}' must be text"))),
            },
            MetadataKind::Number => match value.as_f64() {
                Some(n) => Ok(Box::new(n)),
                None if value.is_null() => Ok(Box::new(None::<f64>)),
                None => Err(CoreError::invalid(format!("field '{key}' must be numeric"))),
            },
            MetadataKind::WineType => {
                let text = value
                    .as_str()
                    .and_then(WineType::parse)
                    .ok_or_else(|| CoreError::invalid(format!("bad wine_type in '{key}'")))?;
                Ok(Box::new(text.as_str().to_string()))
            }
            MetadataKind::TextArray => {
                if !value.is_array() {
                    return Err(CoreError::invalid(format!("field '{key}' must be an array")));
                }
                Ok(Box::new(value.to_string()))
            }
            MetadataKind::Json => Ok(Box::new(value.to_string())),
        }
    }
}

const WINE_METADATA_FIELDS: &[(&str, MetadataKind)] = &[
    ("region", MetadataKind::Text),
    ("country", MetadataKind::Text),
    ("wine_type", MetadataKind::WineType),
    ("grape_varieties", MetadataKind::TextArray),
    ("style", MetadataKind::Text),
    ("tasting_notes", MetadataKind::Text),
    ("food_pairings", MetadataKind::Text),
    ("serving_temp_min", MetadataKind::Number),
    ("serving_temp_max", MetadataKind::Number),
];

const VINTAGE_METADATA_FIELDS: &[(&str, MetadataKind)] = &[
    ("quality_score", MetadataKind::Number),
    ("critic_score", MetadataKind::Number),
    ("peak_drinking_start", MetadataKind::Number),
    ("peak_drinking_end", MetadataKind::Number),
    ("production_notes", MetadataKind::Json),
];

fn delta_action_name(transaction_type: TransactionType) -> &'static str {
    match transaction_type {
        TransactionType::Consume => "remove",
        TransactionType::Receive | TransactionType::Intake => "add",
        TransactionType::Reserve => "reserve",
        TransactionType::Unreserve => "unreserve",
        _ => "adjust",
    }
}

/// Stable reorder: client order everywhere, except delta ops sharing a key
/// are sorted among themselves by op_id.
fn order_batch(operations: &[ClientOperation]) -> Vec<(usize, &ClientOperation)> {
    let mut slots: Vec<(usize, &ClientOperation)> =
        operations.iter().enumerate().collect();

    let mut groups: HashMap<(i64, String), Vec<usize>> = HashMap::new();
    for (slot, (_, op)) in slots.iter().enumerate() {
        if let Ok(parsed) = parse_operation(op) {
            if let Some(key) = parsed.delta_key() {
                groups.entry(key).or_default().push(slot);
            }
        }
    }

    for positions in groups.values() {
        if positions.len() < 2 {
            continue;
        }
        let mut members: Vec<(usize, &ClientOperation)> =
            positions.iter().map(|&slot| slots[slot]).collect();
        members.sort_by(|a, b| a.1.op_id.cmp(&b.1.op_id));
        for (&slot, member) in positions.iter().zip(members) {
            slots[slot] = member;
        }
    }

    slots
}

fn payload_hash(op: &ClientOperation) -> String {
    let mut hasher = Sha256::new();
    hasher.update(op.method.to_ascii_uppercase().as_bytes());
    hasher.update(b"\0");
    hasher.update(op.endpoint.as_bytes());
    hasher.update(b"\0");
    hasher.update(op.payload.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

fn record_applied(
    conn: &Connection,
    op_id: &str,
    hash: &str,
    outcome: &OpOutcome,
) -> CoreResult<()> {
    let outcome_json =
        serde_json::to_string(outcome).map_err(|e| CoreError::Storage(e.to_string()))?;
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO applied_ops (op_id, payload_hash, outcome, applied_at) \
         VALUES (?1, ?2, ?3, strftime('%s', 'now'))",
        params![op_id, hash, outcome_json],
    )?;
    if inserted == 0 {
        // Another writer committed this op_id between our lookup and now.
        return Err(CoreError::SyncDuplicate(op_id.to_string()));
    }
    Ok(())
}

fn required_i64(payload: &Value, key: &str) -> CoreResult<i64> {
    payload
        .get(key)
        .and_then(Value::as_i64)
        .ok_or_else(|| CoreError::invalid(format!("missing or non-integer '{key}'")))
}

fn required_text(payload: &Value, key: &str) -> CoreResult<String> {
    payload
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| CoreError::invalid(format!("missing or empty '{key}'")))
}

fn optional_text(payload: &Value, key: &str) -> Option<String> {
    payload
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn parse_operation(op: &ClientOperation) -> CoreResult<ParsedOp> {
    let method = op.method.to_ascii_uppercase();
    let endpoint = op.endpoint.trim_end_matches('/');

    match (method.as_str(), endpoint) {
        ("POST", "/api/inventory/consume") => Ok(ParsedOp::Delta {
            transaction_type: TransactionType::Consume,
            vintage_id: required_i64(&op.payload, "vintage_id")?,
            location: required_text(&op.payload, "location")?,
            quantity: required_i64(&op.payload, "quantity")?,
            notes: optional_text(&op.payload, "notes"),
        }),
        ("POST", "/api/inventory/receive") => Ok(ParsedOp::Delta {
            transaction_type: TransactionType::Receive,
            vintage_id: required_i64(&op.payload, "vintage_id")?,
            location: required_text(&op.payload, "location")?,
            quantity: required_i64(&op.payload, "quantity")?,
            notes: optional_text(&op.payload, "notes"),
        }),
        ("POST", "/api/inventory/reserve") => Ok(ParsedOp::Delta {
            transaction_type: TransactionType::Reserve,
            vintage_id: required_i64(&op.payload, "vintage_id")?,
            location: required_text(&op.payload, "location")?,
            quantity: required_i64(&op.payload, "quantity")?,
            notes: optional_text(&op.payload, "notes"),
        }),
        ("POST", "/api/inventory/unreserve") => Ok(ParsedOp::Delta {
            transaction_type: TransactionType::Unreserve,
            vintage_id: required_i64(&op.payload, "vintage_id")?,
            location: required_text(&op.payload, "location")?,
            quantity: required_i64(&op.payload, "quantity")?,
            notes: optional_text(&op.payload, "notes"),
        }),
        ("POST", "/api/inventory/move") => {
            let from = required_text(&op.payload, "from_location")?;
            let to = required_text(&op.payload, "to_location")?;
            if from == to {
                return Err(CoreError::invalid("move across the same location"));
            }
            Ok(ParsedOp::Move {
                vintage_id: required_i64(&op.payload, "vintage_id")?,
                from,
                to,
                quantity: required_i64(&op.payload, "quantity")?,
                notes: optional_text(&op.payload, "notes"),
            })
        }
        ("PUT" | "PATCH", _) if endpoint.starts_with("/api/wine/") => {
            let wine_id = endpoint
                .rsplit('/')
                .next()
                .and_then(|s| s.parse::<i64>().ok())
                .ok_or_else(|| CoreError::invalid("bad wine id in endpoint"))?;
            let fields = op
                .payload
                .as_object()
                .cloned()
                .ok_or_else(|| CoreError::invalid("metadata payload must be an object"))?;
            Ok(ParsedOp::WineMetadata { wine_id, fields })
        }
        ("PUT" | "PATCH", _) if endpoint.starts_with("/api/vintage/") => {
            let vintage_id = endpoint
                .rsplit('/')
                .next()
                .and_then(|s| s.parse::<i64>().ok())
                .ok_or_else(|| CoreError::invalid("bad vintage id in endpoint"))?;
            let fields = op
                .payload
                .as_object()
                .cloned()
                .ok_or_else(|| CoreError::invalid("metadata payload must be an object"))?;
            Ok(ParsedOp::VintageMetadata { vintage_id, fields })
        }
        _ => Err(CoreError::invalid(format!(
            "unsupported sync endpoint {} {}",
            method, op.endpoint
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NullSink;

    fn fixture() -> (tempfile::TempDir, SyncReconciler, Store) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.db");
        let store = Store::open(path.to_str().unwrap()).unwrap();
        store
            .with_transaction(|conn| {
                conn.execute(
                    "INSERT INTO wines (id, name, producer, region, wine_type, \
                                        tasting_notes, updated_at, origin) \
                     VALUES (7, 'Barolo Riserva', 'Giacomo Conterno', 'Piedmont', 'red', \
                             'A', 100, 'server')",
                    [],
                )?;
                conn.execute(
                    "INSERT INTO vintages (id, wine_id, year, updated_at) VALUES (42, 7, 2015, 0)",
                    [],
                )?;
                conn.execute(
                    "INSERT INTO ledger (vintage_id, transaction_type, location, quantity, \
                                         created_by, created_at) \
                     VALUES (42, 'RECEIVE', 'main-cellar', 5, 'seed', 0)",
                    [],
                )?;
                conn.execute(
                    "INSERT INTO stock (vintage_id, location, quantity, updated_at) \
                     VALUES (42, 'main-cellar', 5, 0)",
                    [],
                )?;
                Ok(())
            })
            .unwrap();
        let reconciler = SyncReconciler::new(
            store.clone(),
            Arc::new(NullSink),
            Arc::new(MetricsTracker::new(100)),
            SyncTiebreaker::OriginLex,
        );
        (dir, reconciler, store)
    }

    fn consume_op(op_id: &str, origin: &str, quantity: i64) -> ClientOperation {
        ClientOperation {
            op_id: op_id.to_string(),
            updated_at: 1_700_000_000,
            updated_by: "steward".to_string(),
            origin: origin.to_string(),
            endpoint: "/api/inventory/consume".to_string(),
            method: "POST".to_string(),
            payload: serde_json::json!({
                "vintage_id": 42,
                "location": "main-cellar",
                "quantity": quantity,
            }),
        }
    }

    fn quantity(store: &Store) -> i64 {
        store
            .read(|conn| Ok(ledger::balance(conn, 42, "main-cellar")?.quantity))
            .unwrap()
    }

    #[test]
    fn replay_is_idempotent() {
        let (_dir, reconciler, store) = fixture();
        let batch = vec![consume_op("X", "tablet-1", 1)];

        let first = reconciler.apply_batch(&batch);
        assert_eq!(first[0].status, OpStatus::Applied);
        assert_eq!(quantity(&store), 4);

        let second = reconciler.apply_batch(&batch);
        assert_eq!(second[0].status, OpStatus::Duplicate);
        assert_eq!(quantity(&store), 4, "exactly one -1 applied");
    }

    #[test]
    fn op_id_reuse_with_other_payload_rejected() {
        let (_dir, reconciler, _store) = fixture();
        reconciler.apply_batch(&[consume_op("X", "tablet-1", 1)]);

        let outcomes = reconciler.apply_batch(&[consume_op("X", "tablet-1", 2)]);
        assert_eq!(outcomes[0].status, OpStatus::Rejected);
        assert_eq!(outcomes[0].code.as_deref(), Some("invalid_argument"));
    }

    #[test]
    fn concurrent_deltas_converge_by_op_id() {
        let (_dir, reconciler, store) = fixture();
        // A(q=2) then B(q=4) against 5 bottles: A lands, B would go negative.
        let forward = vec![consume_op("A", "tablet-1", 2), consume_op("B", "tablet-2", 4)];
        let outcomes = reconciler.apply_batch(&forward);
        assert_eq!(outcomes[0].status, OpStatus::Applied);
        assert_eq!(outcomes[1].status, OpStatus::Rejected);
        assert_eq!(outcomes[1].code.as_deref(), Some("inventory_conflict"));
        assert_eq!(quantity(&store), 3);

        // Reversed arrival order makes the same decision.
        let (_dir2, reconciler2, store2) = fixture();
        let reversed = vec![consume_op("B", "tablet-2", 4), consume_op("A", "tablet-1", 2)];
        let outcomes = reconciler2.apply_batch(&reversed);
        assert_eq!(outcomes[0].status, OpStatus::Rejected, "B still loses");
        assert_eq!(outcomes[1].status, OpStatus::Applied);
        assert_eq!(quantity(&store2), 3);
    }

    #[test]
    fn both_deltas_apply_when_stock_allows() {
        let (_dir, reconciler, store) = fixture();
        let outcomes = reconciler.apply_batch(&[
            consume_op("A", "tablet-1", 2),
            consume_op("B", "tablet-2", 2),
        ]);
        assert!(outcomes.iter().all(|o| o.status == OpStatus::Applied));
        assert_eq!(quantity(&store), 1);
    }

    #[test]
    fn rejection_does_not_poison_batch() {
        let (_dir, reconciler, store) = fixture();
        let mut bad = consume_op("BAD", "tablet-1", 1);
        bad.payload = serde_json::json!({"vintage_id": 42});
        let outcomes = reconciler.apply_batch(&[
            bad,
            consume_op("OK", "tablet-1", 1),
        ]);
        assert_eq!(outcomes[0].status, OpStatus::Rejected);
        assert_eq!(outcomes[1].status, OpStatus::Applied);
        assert_eq!(quantity(&store), 4);
    }

    fn metadata_op(op_id: &str, origin: &str, updated_at: i64, notes: &str) -> ClientOperation {
        ClientOperation {
            op_id: op_id.to_string(),
            updated_at,
            updated_by: "steward".to_string(),
            origin: origin.to_string(),
            endpoint: "/api/wine/7".to_string(),
            method: "PUT".to_string(),
            payload: serde_json::json!({ "tasting_notes": notes }),
        }
    }

    fn tasting_notes(store: &Store) -> (String, i64) {
        store
            .read(|conn| {
                Ok(conn.query_row(
                    "SELECT tasting_notes, updated_at FROM wines WHERE id = 7",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )?)
            })
            .unwrap()
    }

    #[test]
    fn lww_stale_update_discarded() {
        let (_dir, reconciler, store) = fixture();
        // Stored updated_at=100. Incoming 50 loses, incoming 150 wins.
        let outcomes = reconciler.apply_batch(&[metadata_op("m1", "tablet-1", 50, "B")]);
        assert_eq!(outcomes[0].status, OpStatus::Applied);
        assert_eq!(tasting_notes(&store), ("A".to_string(), 100));

        reconciler.apply_batch(&[metadata_op("m2", "tablet-1", 150, "C")]);
        assert_eq!(tasting_notes(&store), ("C".to_string(), 150));
    }

    #[test]
    fn lww_order_independent() {
        let (_dir, reconciler, store) = fixture();
        reconciler.apply_batch(&[
            metadata_op("m1", "tablet-1", 300, "newer"),
            metadata_op("m2", "tablet-2", 200, "older"),
        ]);
        assert_eq!(tasting_notes(&store).0, "newer");

        let (_dir2, reconciler2, store2) = fixture();
        reconciler2.apply_batch(&[
            metadata_op("m2", "tablet-2", 200, "older"),
            metadata_op("m1", "tablet-1", 300, "newer"),
        ]);
        assert_eq!(tasting_notes(&store2).0, "newer");
    }

    #[test]
    fn lww_tie_breaks_by_origin() {
        let (_dir, reconciler, store) = fixture();
        reconciler.apply_batch(&[
            metadata_op("m1", "tablet-a", 500, "from-a"),
            metadata_op("m2", "tablet-b", 500, "from-b"),
        ]);
        // tablet-b > tablet-a lexicographically, so b wins regardless of order.
        assert_eq!(tasting_notes(&store).0, "from-b");

        let (_dir2, reconciler2, store2) = fixture();
        reconciler2.apply_batch(&[
            metadata_op("m2", "tablet-b", 500, "from-b"),
            metadata_op("m1", "tablet-a", 500, "from-a"),
        ]);
        assert_eq!(tasting_notes(&store2).0, "from-b");
    }

    #[test]
    fn unknown_metadata_field_rejected() {
        let (_dir, reconciler, _store) = fixture();
        let mut op = metadata_op("m1", "tablet-1", 500, "x");
        op.payload = serde_json::json!({ "producer": "someone else" });
        let outcomes = reconciler.apply_batch(&[op]);
        assert_eq!(outcomes[0].status, OpStatus::Rejected);
        assert_eq!(outcomes[0].code.as_deref(), Some("invalid_argument"));
    }

    #[test]
    fn reapplying_batch_reaches_same_state() {
        let (_dir, reconciler, store) = fixture();
        let batch = vec![
            consume_op("A", "tablet-1", 2),
            consume_op("B", "tablet-2", 4),
            metadata_op("M", "tablet-1", 150, "C"),
        ];
        let first = reconciler.apply_batch(&batch);
        let state_one = (quantity(&store), tasting_notes(&store));

        let second = reconciler.apply_batch(&batch);
        let state_two = (quantity(&store), tasting_notes(&store));
        assert_eq!(state_one, state_two);

        // Applied ops replay as duplicates; the conflicted op is rejected again.
        let rejected: Vec<_> = first
            .iter()
            .zip(&second)
            .filter(|(f, _)| f.status == OpStatus::Rejected)
            .collect();
        for (f, s) in rejected {
            assert_eq!(f.op_id, s.op_id);
            assert_eq!(s.status, OpStatus::Rejected);
        }
    }
}
