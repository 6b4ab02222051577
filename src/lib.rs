//! SommOS Backend Library
//!
//! Wine cellar management core for yachts with intermittent connectivity:
//! append-ledger inventory, offline sync reconciliation, AI-assisted
//! pairings, vintage weather enrichment, and a realtime broadcast hub.
//! The binary wires these together; tests drive them through `AppState`.

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod inventory;
pub mod metrics;
pub mod middleware;
pub mod models;
pub mod pairing;
pub mod realtime;
pub mod state;
pub mod sync;
pub mod weather;

pub use config::Config;
pub use error::{CoreError, CoreResult};
pub use state::AppState;
