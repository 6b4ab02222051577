//! Connection registry, room membership, and fan-out broadcast.
//!
//! Each connection owns a bounded outbound queue consumed by its socket task.
//! The registry lock is held only long enough to snapshot recipients; sends
//! happen outside it, and a full buffer drops the connection instead of
//! blocking the broadcast loop.

use crate::error::{CoreError, CoreResult};
use crate::events::EventSink;
use crate::models::ServerFrame;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Per-connection outbound queue depth before backpressure drops it.
const OUTBOUND_BUFFER: usize = 64;

/// WebSocket close codes the hub hands to the socket loop.
pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_CAPACITY_EXCEEDED: u16 = 4001;
pub const CLOSE_HEARTBEAT_TIMEOUT: u16 = 4002;

pub type ConnectionId = u64;

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub max_connections: usize,
    pub heartbeat_interval: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            max_connections: 1000,
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

struct ConnectionHandle {
    client_id: String,
    rooms: HashSet<String>,
    sender: mpsc::Sender<ServerFrame>,
}

pub struct RealtimeHub {
    config: HubConfig,
    connections: RwLock<HashMap<ConnectionId, ConnectionHandle>>,
    next_id: AtomicU64,
}

/// What `register` hands to the socket loop.
pub struct Registration {
    pub connection_id: ConnectionId,
    pub client_id: String,
    pub outbound: mpsc::Receiver<ServerFrame>,
}

impl RealtimeHub {
    pub fn new(config: HubConfig) -> Self {
        Self {
            config,
            connections: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.config.heartbeat_interval
    }

    /// Admit a new connection, enforcing the ceiling.
    pub fn register(&self) -> CoreResult<Registration> {
        let mut connections = self.connections.write();
        if connections.len() >= self.config.max_connections {
            warn!(
                ceiling = self.config.max_connections,
                "🚧 Connection refused: capacity exceeded"
            );
            return Err(CoreError::CapacityExceeded);
        }

        let connection_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let client_id = Uuid::new_v4().to_string();
        let (sender, outbound) = mpsc::channel(OUTBOUND_BUFFER);
        connections.insert(
            connection_id,
            ConnectionHandle {
                client_id: client_id.clone(),
                rooms: HashSet::new(),
                sender,
            },
        );
        info!(connection_id, client_id = %client_id, total = connections.len(), "🔌 Client connected");
        Ok(Registration {
            connection_id,
            client_id,
            outbound,
        })
    }

    pub fn unregister(&self, connection_id: ConnectionId) {
        let mut connections = self.connections.write();
        if connections.remove(&connection_id).is_some() {
            info!(connection_id, total = connections.len(), "🔌 Client disconnected");
        }
    }

    /// Idempotent room join.
    pub fn join(&self, connection_id: ConnectionId, room: &str) -> CoreResult<()> {
        let mut connections = self.connections.write();
        let handle = connections
            .get_mut(&connection_id)
            .ok_or_else(|| CoreError::not_found(format!("connection {connection_id}")))?;
        handle.rooms.insert(room.to_string());
        Ok(())
    }

    /// Idempotent room leave.
    pub fn leave(&self, connection_id: ConnectionId, room: &str) -> CoreResult<()> {
        let mut connections = self.connections.write();
        let handle = connections
            .get_mut(&connection_id)
            .ok_or_else(|| CoreError::not_found(format!("connection {connection_id}")))?;
        handle.rooms.remove(room);
        Ok(())
    }

    /// Direct frame to one connection (connection_established, ping).
    pub fn send_to(&self, connection_id: ConnectionId, frame: ServerFrame) {
        let sender = {
            let connections = self.connections.read();
            connections
                .get(&connection_id)
                .map(|handle| handle.sender.clone())
        };
        if let Some(sender) = sender {
            if sender.try_send(frame).is_err() {
                debug!(connection_id, "send buffer full, dropping connection");
                self.unregister(connection_id);
            }
        }
    }

    /// Deliver to every member of `room`. Recipients are snapshotted under
    /// the lock; delivery runs outside it. Connections with a full buffer
    /// are dropped rather than blocking the loop.
    pub fn broadcast(&self, room: &str, frame: &ServerFrame) -> usize {
        let recipients: Vec<(ConnectionId, mpsc::Sender<ServerFrame>)> = {
            let connections = self.connections.read();
            connections
                .iter()
                .filter(|(_, handle)| handle.rooms.contains(room))
                .map(|(&id, handle)| (id, handle.sender.clone()))
                .collect()
        };

        let mut delivered = 0usize;
        let mut dropped: Vec<ConnectionId> = Vec::new();
        for (connection_id, sender) in recipients {
            match sender.try_send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(_) => dropped.push(connection_id),
            }
        }
        for connection_id in dropped {
            warn!(connection_id, room, "⚠️ Slow consumer dropped during broadcast");
            self.unregister(connection_id);
        }
        delivered
    }

    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }

    pub fn client_id(&self, connection_id: ConnectionId) -> Option<String> {
        self.connections
            .read()
            .get(&connection_id)
            .map(|handle| handle.client_id.clone())
    }

    /// Rooms a connection currently belongs to (diagnostics).
    pub fn rooms_of(&self, connection_id: ConnectionId) -> Vec<String> {
        self.connections
            .read()
            .get(&connection_id)
            .map(|handle| handle.rooms.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Server capabilities advertised on connect.
    pub fn capabilities() -> Vec<String> {
        vec![
            "inventory_updates".to_string(),
            "system".to_string(),
            "heartbeat".to_string(),
        ]
    }
}

impl EventSink for RealtimeHub {
    fn publish(&self, room: &str, frame: ServerFrame) {
        self.broadcast(room, &frame);
    }
}
