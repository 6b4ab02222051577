//! Inventory state engine: append-only ledger plus the manager that owns all
//! Stock mutations.

pub mod intake;
pub mod ledger;
pub mod manager;

pub use intake::{IntakeItemSpec, IntakeReceipt, IntakeRequest, IntakeStatusReport, ReceiptLine, WineSpec};
pub use ledger::{Balance, Movement};
pub use manager::{InventoryManager, StockFilters, StockSummary};
