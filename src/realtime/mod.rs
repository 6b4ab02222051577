//! Real-time broadcast fabric.

pub mod hub;

pub use hub::{ConnectionId, HubConfig, RealtimeHub};
