//! Core domain types shared across components.
//!
//! Inventory entities are plain data values; persistence owns nothing beyond
//! the rows. WebSocket frames are closed tagged enums so handling stays
//! exhaustive at compile time.

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Wine style classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WineType {
    Red,
    White,
    Rose,
    Sparkling,
    Dessert,
    Fortified,
}

impl WineType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WineType::Red => "red",
            WineType::White => "white",
            WineType::Rose => "rose",
            WineType::Sparkling => "sparkling",
            WineType::Dessert => "dessert",
            WineType::Fortified => "fortified",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "red" => Some(Self::Red),
            "white" => Some(Self::White),
            "rose" | "rosé" => Some(Self::Rose),
            "sparkling" => Some(Self::Sparkling),
            "dessert" => Some(Self::Dessert),
            "fortified" => Some(Self::Fortified),
            _ => None,
        }
    }
}

/// Ledger movement kinds. The sign convention lives in `TransactionType::sign`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionType {
    Intake,
    Receive,
    Consume,
    MoveOut,
    MoveIn,
    Reserve,
    Unreserve,
    Adjust,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Intake => "INTAKE",
            TransactionType::Receive => "RECEIVE",
            TransactionType::Consume => "CONSUME",
            TransactionType::MoveOut => "MOVE_OUT",
            TransactionType::MoveIn => "MOVE_IN",
            TransactionType::Reserve => "RESERVE",
            TransactionType::Unreserve => "UNRESERVE",
            TransactionType::Adjust => "ADJUST",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "INTAKE" => Some(Self::Intake),
            "RECEIVE" => Some(Self::Receive),
            "CONSUME" => Some(Self::Consume),
            "MOVE_OUT" => Some(Self::MoveOut),
            "MOVE_IN" => Some(Self::MoveIn),
            "RESERVE" => Some(Self::Reserve),
            "UNRESERVE" => Some(Self::Unreserve),
            "ADJUST" => Some(Self::Adjust),
            _ => None,
        }
    }

    /// +1 for movements that increase available quantity, -1 for those that
    /// decrease it. ADJUST carries its own sign in the quantity.
    pub fn sign(&self) -> i64 {
        match self {
            TransactionType::Intake
            | TransactionType::Receive
            | TransactionType::MoveIn
            | TransactionType::Unreserve => 1,
            TransactionType::Consume
            | TransactionType::MoveOut
            | TransactionType::Reserve => -1,
            TransactionType::Adjust => 1,
        }
    }

    /// RESERVE/UNRESERVE move bottles between reserved and available without
    /// changing the physical count.
    pub fn affects_reservation(&self) -> bool {
        matches!(self, TransactionType::Reserve | TransactionType::Unreserve)
    }
}

/// Sync metadata carried on every mutable row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMeta {
    pub updated_at: i64,
    pub updated_by: String,
    pub op_id: String,
    pub origin: String,
}

impl SyncMeta {
    pub fn server(updated_by: &str, op_id: &str) -> Self {
        Self {
            updated_at: Utc::now().timestamp(),
            updated_by: updated_by.to_string(),
            op_id: op_id.to_string(),
            origin: "server".to_string(),
        }
    }
}

/// A producer/label identity. Identity fields are immutable once created;
/// metadata is LWW-merged during sync.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wine {
    pub id: i64,
    pub name: String,
    pub producer: String,
    pub region: String,
    pub country: String,
    pub wine_type: WineType,
    pub grape_varieties: Vec<String>,
    pub style: Option<String>,
    pub tasting_notes: Option<String>,
    pub food_pairings: Option<String>,
    pub serving_temp_min: Option<f64>,
    pub serving_temp_max: Option<f64>,
    pub sync: SyncMeta,
}

/// A Wine x year. Unique per (wine_id, year).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vintage {
    pub id: i64,
    pub wine_id: i64,
    pub year: i32,
    pub quality_score: Option<f64>,
    pub critic_score: Option<f64>,
    pub weather_score: Option<f64>,
    pub peak_drinking_start: Option<i32>,
    pub peak_drinking_end: Option<i32>,
    /// Opaque JSON blob at persistence; tagged record at the API boundary.
    pub production_notes: Option<serde_json::Value>,
    pub sync: SyncMeta,
}

/// Earliest year a vintage may carry.
pub const MIN_VINTAGE_YEAR: i32 = 1800;

pub fn vintage_year_valid(year: i32) -> bool {
    let max = Utc::now().format("%Y").to_string().parse::<i32>().unwrap_or(2100) + 1;
    (MIN_VINTAGE_YEAR..=max).contains(&year)
}

/// Materialized balance per (vintage, location). The ledger is the source of
/// truth; this row is a cache that must equal the ledger sum.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stock {
    pub vintage_id: i64,
    pub location: String,
    pub quantity: i64,
    pub reserved_quantity: i64,
    pub cost_per_bottle: Option<f64>,
    pub sync: SyncMeta,
}

impl Stock {
    pub fn available(&self) -> i64 {
        self.quantity - self.reserved_quantity
    }
}

/// Append-only movement record. Never updated or deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: i64,
    pub vintage_id: i64,
    pub transaction_type: TransactionType,
    pub location: String,
    /// Signed per `TransactionType::sign`.
    pub quantity: i64,
    pub unit_cost: Option<f64>,
    pub reference_id: Option<i64>,
    pub notes: Option<String>,
    pub created_by: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Supplier {
    pub id: i64,
    pub name: String,
    pub contact: Option<String>,
    pub rating: Option<f64>,
    pub active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IntakeStatus {
    Ordered,
    PartiallyReceived,
    Received,
    Cancelled,
}

impl IntakeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntakeStatus::Ordered => "ORDERED",
            IntakeStatus::PartiallyReceived => "PARTIALLY_RECEIVED",
            IntakeStatus::Received => "RECEIVED",
            IntakeStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ORDERED" => Some(Self::Ordered),
            "PARTIALLY_RECEIVED" => Some(Self::PartiallyReceived),
            "RECEIVED" => Some(Self::Received),
            "CANCELLED" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntakeOrder {
    pub id: i64,
    pub supplier_id: Option<i64>,
    pub order_date: i64,
    pub expected_delivery: Option<i64>,
    pub status: IntakeStatus,
    pub notes: Option<String>,
    pub sync: SyncMeta,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntakeItem {
    pub id: i64,
    pub order_id: i64,
    pub vintage_id: i64,
    pub expected_quantity: i64,
    pub unit_cost: Option<f64>,
    pub location: Option<String>,
}

/// Joined Wine/Vintage/Stock view returned by stock listings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StockView {
    pub vintage_id: i64,
    pub wine_id: i64,
    pub wine_name: String,
    pub producer: String,
    pub region: String,
    pub country: String,
    pub wine_type: WineType,
    pub year: i32,
    pub location: String,
    pub quantity: i64,
    pub reserved_quantity: i64,
    pub available: i64,
    pub cost_per_bottle: Option<f64>,
    pub quality_score: Option<f64>,
    pub weather_score: Option<f64>,
}

/// Inventory mutation payload attached to broadcast events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventoryAction {
    pub action: String,
    pub vintage_id: i64,
    pub location: String,
    pub quantity: i64,
    pub to_location: Option<String>,
    pub created_by: String,
}

/// Server-sent WebSocket frames. Closed set so fan-out handling is exhaustive.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerFrame {
    ConnectionEstablished {
        client_id: String,
        capabilities: Vec<String>,
        timestamp: i64,
    },
    RoomJoined {
        room: String,
        timestamp: i64,
    },
    Ping {
        timestamp: i64,
    },
    InventoryUpdate {
        stock: Vec<StockView>,
        timestamp: i64,
    },
    InventoryAction {
        action: InventoryAction,
        timestamp: i64,
    },
    SystemNotification {
        message: String,
        timestamp: i64,
    },
}

/// Client-sent WebSocket frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Join { room: String },
    Leave { room: String },
    Ping,
    Pong,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transaction_signs() {
        assert_eq!(TransactionType::Receive.sign(), 1);
        assert_eq!(TransactionType::Consume.sign(), -1);
        assert_eq!(TransactionType::MoveOut.sign(), -1);
        assert_eq!(TransactionType::MoveIn.sign(), 1);
        assert_eq!(TransactionType::Reserve.sign(), -1);
        assert_eq!(TransactionType::Unreserve.sign(), 1);
    }

    #[test]
    fn transaction_roundtrip() {
        for t in [
            TransactionType::Intake,
            TransactionType::Receive,
            TransactionType::Consume,
            TransactionType::MoveOut,
            TransactionType::MoveIn,
            TransactionType::Reserve,
            TransactionType::Unreserve,
            TransactionType::Adjust,
        ] {
            assert_eq!(TransactionType::parse(t.as_str()), Some(t));
        }
    }

    #[test]
    fn wine_type_parse_accepts_accent() {
        assert_eq!(WineType::parse("Rosé"), Some(WineType::Rose));
        assert_eq!(WineType::parse("RED"), Some(WineType::Red));
        assert_eq!(WineType::parse("orange"), None);
    }

    #[test]
    fn client_frame_deserializes() {
        let f: ClientFrame = serde_json::from_str(r#"{"type":"join","room":"inventory_updates"}"#)
            .unwrap();
        assert!(matches!(f, ClientFrame::Join { room } if room == "inventory_updates"));
    }

    #[test]
    fn vintage_year_bounds() {
        assert!(vintage_year_valid(1800));
        assert!(vintage_year_valid(2020));
        assert!(!vintage_year_valid(1799));
        assert!(!vintage_year_valid(3000));
    }
}
