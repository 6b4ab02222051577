//! Narrow broadcast seam between mutation sources and the realtime hub.
//!
//! InventoryManager and the background tasks publish through this trait, not
//! through the hub type, so the dependency arrow points one way only.

use crate::models::ServerFrame;

/// Room every inventory mutation is fanned out to.
pub const ROOM_INVENTORY: &str = "inventory_updates";

/// Room for operator-facing notices (enrichment sweeps, capacity warnings).
pub const ROOM_SYSTEM: &str = "system";

pub trait EventSink: Send + Sync {
    fn publish(&self, room: &str, frame: ServerFrame);
}

/// Sink that drops everything. Used in tests and CLI contexts with no hub.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn publish(&self, _room: &str, _frame: ServerFrame) {}
}

/// Sink that records frames in memory for test assertions.
#[derive(Debug, Default)]
pub struct RecordingSink {
    frames: parking_lot::Mutex<Vec<(String, ServerFrame)>>,
}

impl RecordingSink {
    pub fn take(&self) -> Vec<(String, ServerFrame)> {
        std::mem::take(&mut *self.frames.lock())
    }

    pub fn count(&self) -> usize {
        self.frames.lock().len()
    }
}

impl EventSink for RecordingSink {
    fn publish(&self, room: &str, frame: ServerFrame) {
        self.frames.lock().push((room.to_string(), frame));
    }
}
