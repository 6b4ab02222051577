//! Append-only stock movement ledger.
//!
//! Every mutation of a (vintage, location) balance goes through `append`,
//! inside the caller's transaction. The materialized `stock` row is a cache;
//! the ledger is the source of truth and `rebuild_stock` can reconstruct the
//! whole table from it.
//!
//! Signed quantity convention (see `TransactionType::sign`):
//!   INTAKE, RECEIVE, MOVE_IN, UNRESERVE  -> +q
//!   CONSUME, MOVE_OUT, RESERVE           -> -q
//!   ADJUST                               -> signed as given
//!
//! Physical quantity sums the non-reservation entries; reserved_quantity is
//! the negated sum of RESERVE/UNRESERVE entries.

use crate::error::{CoreError, CoreResult};
use crate::models::{LedgerEntry, TransactionType};
use rusqlite::{params, Connection};

/// Movement to append. Quantity is the unsigned magnitude except for ADJUST,
/// which passes its own sign through.
#[derive(Debug, Clone)]
pub struct Movement {
    pub vintage_id: i64,
    pub transaction_type: TransactionType,
    pub location: String,
    pub quantity: i64,
    pub unit_cost: Option<f64>,
    pub reference_id: Option<i64>,
    pub notes: Option<String>,
    pub created_by: String,
}

/// Balance derived from (or cached for) one (vintage, location).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Balance {
    pub quantity: i64,
    pub reserved_quantity: i64,
}

impl Balance {
    pub fn available(&self) -> i64 {
        self.quantity - self.reserved_quantity
    }

    fn valid(&self) -> bool {
        self.quantity >= 0
            && self.reserved_quantity >= 0
            && self.reserved_quantity <= self.quantity
    }
}

/// Signed quantity a movement contributes to the ledger row.
fn signed_quantity(transaction_type: TransactionType, quantity: i64) -> CoreResult<i64> {
    match transaction_type {
        TransactionType::Adjust => {
            if quantity == 0 {
                return Err(CoreError::invalid("adjust quantity must be non-zero"));
            }
            Ok(quantity)
        }
        other => {
            if quantity <= 0 {
                return Err(CoreError::invalid(format!(
                    "{} quantity must be positive",
                    other.as_str()
                )));
            }
            Ok(quantity * other.sign())
        }
    }
}

/// Append one ledger entry within the caller's transaction and fold it into
/// the materialized stock row. Rejects any movement that would leave the
/// balance invalid. Returns the new ledger entry id.
pub fn append(conn: &Connection, movement: &Movement) -> CoreResult<i64> {
    let signed = signed_quantity(movement.transaction_type, movement.quantity)?;

    let current = balance(conn, movement.vintage_id, &movement.location)?;
    let next = if movement.transaction_type.affects_reservation() {
        Balance {
            quantity: current.quantity,
            reserved_quantity: current.reserved_quantity - signed,
        }
    } else {
        Balance {
            quantity: current.quantity + signed,
            reserved_quantity: current.reserved_quantity,
        }
    };

    if !next.valid() {
        return Err(CoreError::conflict(format!(
            "{} of {} at '{}' would leave quantity={} reserved={}",
            movement.transaction_type.as_str(),
            movement.quantity.abs(),
            movement.location,
            next.quantity,
            next.reserved_quantity,
        )));
    }

    conn.execute(
        "INSERT INTO ledger (vintage_id, transaction_type, location, quantity, \
                             unit_cost, reference_id, notes, created_by, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, strftime('%s', 'now'))",
        params![
            movement.vintage_id,
            movement.transaction_type.as_str(),
            movement.location,
            signed,
            movement.unit_cost,
            movement.reference_id,
            movement.notes,
            movement.created_by,
        ],
    )?;
    let entry_id = conn.last_insert_rowid();

    upsert_stock(conn, movement, next)?;

    Ok(entry_id)
}

fn upsert_stock(conn: &Connection, movement: &Movement, next: Balance) -> CoreResult<()> {
    conn.execute(
        "INSERT INTO stock (vintage_id, location, quantity, reserved_quantity, \
                            cost_per_bottle, updated_at, updated_by) \
         VALUES (?1, ?2, ?3, ?4, ?5, strftime('%s', 'now'), ?6) \
         ON CONFLICT(vintage_id, location) DO UPDATE SET \
            quantity = ?3, \
            reserved_quantity = ?4, \
            cost_per_bottle = COALESCE(?5, cost_per_bottle), \
            updated_at = strftime('%s', 'now'), \
            updated_by = ?6",
        params![
            movement.vintage_id,
            movement.location,
            next.quantity,
            next.reserved_quantity,
            movement.unit_cost,
            movement.created_by,
        ],
    )?;
    Ok(())
}

/// Current balance for (vintage, location), read from the materialized row.
/// Absent row means zero; rows persist at zero quantity for history.
pub fn balance(conn: &Connection, vintage_id: i64, location: &str) -> CoreResult<Balance> {
    let mut stmt = conn.prepare_cached(
        "SELECT quantity, reserved_quantity FROM stock \
         WHERE vintage_id = ?1 AND location = ?2 LIMIT 1",
    )?;
    let mut rows = stmt.query(params![vintage_id, location])?;
    match rows.next()? {
        Some(row) => Ok(Balance {
            quantity: row.get(0)?,
            reserved_quantity: row.get(1)?,
        }),
        None => Ok(Balance::default()),
    }
}

/// Balance derived by summing ledger entries. Must equal `balance` at all
/// times; used by consistency checks and the repair path.
pub fn ledger_balance(conn: &Connection, vintage_id: i64, location: &str) -> CoreResult<Balance> {
    let mut stmt = conn.prepare_cached(
        "SELECT \
            COALESCE(SUM(CASE WHEN transaction_type NOT IN ('RESERVE','UNRESERVE') \
                              THEN quantity ELSE 0 END), 0), \
            COALESCE(SUM(CASE WHEN transaction_type IN ('RESERVE','UNRESERVE') \
                              THEN -quantity ELSE 0 END), 0) \
         FROM ledger WHERE vintage_id = ?1 AND location = ?2",
    )?;
    let (quantity, reserved_quantity) =
        stmt.query_row(params![vintage_id, location], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
        })?;
    Ok(Balance {
        quantity,
        reserved_quantity,
    })
}

/// Movement history, newest first.
pub fn list_entries(
    conn: &Connection,
    vintage_id: Option<i64>,
    location: Option<&str>,
    limit: usize,
) -> CoreResult<Vec<LedgerEntry>> {
    let limit = limit.clamp(1, 1000) as i64;
    let mut sql = String::from(
        "SELECT id, vintage_id, transaction_type, location, quantity, unit_cost, \
                reference_id, notes, created_by, created_at \
         FROM ledger WHERE 1=1",
    );
    let mut args: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
    if let Some(v) = vintage_id {
        sql.push_str(&format!(" AND vintage_id = ?{}", args.len() + 1));
        args.push(Box::new(v));
    }
    if let Some(l) = location {
        sql.push_str(&format!(" AND location = ?{}", args.len() + 1));
        args.push(Box::new(l.to_string()));
    }
    sql.push_str(&format!(" ORDER BY id DESC LIMIT ?{}", args.len() + 1));
    args.push(Box::new(limit));

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(
        rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
        row_to_entry,
    )?;
    let mut entries = Vec::new();
    for row in rows {
        entries.push(row?);
    }
    Ok(entries)
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<LedgerEntry> {
    let type_text: String = row.get(2)?;
    Ok(LedgerEntry {
        id: row.get(0)?,
        vintage_id: row.get(1)?,
        transaction_type: TransactionType::parse(&type_text).unwrap_or(TransactionType::Adjust),
        location: row.get(3)?,
        quantity: row.get(4)?,
        unit_cost: row.get(5)?,
        reference_id: row.get(6)?,
        notes: row.get(7)?,
        created_by: row.get(8)?,
        created_at: row.get(9)?,
    })
}

/// Rebuild the materialized stock table from the ledger. Returns the number
/// of (vintage, location) pairs written. Run inside a transaction.
pub fn rebuild_stock(conn: &Connection) -> CoreResult<usize> {
    conn.execute("UPDATE stock SET quantity = 0, reserved_quantity = 0", [])?;

    let mut stmt = conn.prepare(
        "SELECT vintage_id, location, \
            COALESCE(SUM(CASE WHEN transaction_type NOT IN ('RESERVE','UNRESERVE') \
                              THEN quantity ELSE 0 END), 0), \
            COALESCE(SUM(CASE WHEN transaction_type IN ('RESERVE','UNRESERVE') \
                              THEN -quantity ELSE 0 END), 0) \
         FROM ledger GROUP BY vintage_id, location",
    )?;
    let rows: Vec<(i64, String, i64, i64)> = stmt
        .query_map([], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
        })?
        .collect::<Result<_, _>>()?;

    let mut written = 0usize;
    for (vintage_id, location, quantity, reserved) in rows {
        conn.execute(
            "INSERT INTO stock (vintage_id, location, quantity, reserved_quantity, \
                                updated_at, updated_by) \
             VALUES (?1, ?2, ?3, ?4, strftime('%s', 'now'), 'repair') \
             ON CONFLICT(vintage_id, location) DO UPDATE SET \
                quantity = ?3, \
                reserved_quantity = ?4, \
                updated_at = strftime('%s', 'now'), \
                updated_by = 'repair'",
            params![vintage_id, location, quantity, reserved],
        )?;
        written += 1;
    }
    Ok(written)
}

/// Quantity already received against an intake item, from RECEIVE entries
/// referencing it.
pub fn received_for_item(conn: &Connection, item_id: i64) -> CoreResult<i64> {
    let mut stmt = conn.prepare_cached(
        "SELECT COALESCE(SUM(quantity), 0) FROM ledger \
         WHERE transaction_type = 'RECEIVE' AND reference_id = ?1",
    )?;
    let total: i64 = stmt.query_row(params![item_id], |row| row.get(0))?;
    Ok(total)
}
