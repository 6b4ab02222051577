//! Client-side durable operation queue, modeled server-side.
//!
//! The yacht clients keep this queue in local storage; the server carries a
//! faithful simulator so reconciliation behavior can be exercised end to end
//! without a browser. Records drain FIFO with per-(vintage, location)
//! serialization, exponential backoff on transport failure, and a dead-letter
//! store once max attempts are reached. Reads never enter the queue.

use crate::sync::reconciler::{ClientOperation, OpOutcome, OpStatus};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{debug, warn};

const DEFAULT_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_BASE_BACKOFF_SECS: i64 = 2;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedOperation {
    pub operation: ClientOperation,
    pub enqueued_at: i64,
    pub attempts: u32,
    /// Earliest time the record may be retried. Zero means immediately.
    pub next_attempt_at: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeadLetter {
    pub operation: ClientOperation,
    pub attempts: u32,
    pub last_error: String,
}

/// Result of draining once: definitive outcomes plus what remains queued.
#[derive(Debug, Default)]
pub struct DrainReport {
    pub outcomes: Vec<OpOutcome>,
    pub retried: usize,
    pub dead_lettered: usize,
}

#[derive(Debug)]
pub struct OfflineQueue {
    pending: VecDeque<QueuedOperation>,
    dead: Vec<DeadLetter>,
    max_attempts: u32,
    base_backoff_secs: i64,
}

impl Default for OfflineQueue {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS, DEFAULT_BASE_BACKOFF_SECS)
    }
}

impl OfflineQueue {
    pub fn new(max_attempts: u32, base_backoff_secs: i64) -> Self {
        Self {
            pending: VecDeque::new(),
            dead: Vec::new(),
            max_attempts: max_attempts.max(1),
            base_backoff_secs: base_backoff_secs.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn dead_letters(&self) -> &[DeadLetter] {
        &self.dead
    }

    /// Queue a mutation. A record with the same op_id is replaced in place so
    /// the latest payload wins while keeping its queue position.
    pub fn enqueue(&mut self, operation: ClientOperation, now: i64) {
        if let Some(existing) = self
            .pending
            .iter_mut()
            .find(|record| record.operation.op_id == operation.op_id)
        {
            debug!(op_id = %operation.op_id, "offline queue: replaced pending payload");
            existing.operation = operation;
            existing.attempts = 0;
            existing.next_attempt_at = 0;
            return;
        }
        self.pending.push_back(QueuedOperation {
            operation,
            enqueued_at: now,
            attempts: 0,
            next_attempt_at: 0,
        });
    }

    /// Drain records due at `now` in FIFO order. `transport` models one
    /// attempt at shipping a record to the server: `Ok(outcome)` is a
    /// definitive per-op answer (applied, duplicate, or rejected — the server
    /// decided); `Err` is a transport failure and the record backs off.
    ///
    /// A record that is not yet due blocks every later record targeting the
    /// same (vintage, location), preserving delta order per balance.
    pub fn drain(
        &mut self,
        now: i64,
        mut transport: impl FnMut(&ClientOperation) -> Result<OpOutcome, String>,
    ) -> DrainReport {
        let mut report = DrainReport::default();
        let mut requeue: Vec<QueuedOperation> = Vec::new();
        let mut blocked_keys: Vec<Option<(i64, String)>> = Vec::new();

        while let Some(mut record) = self.pending.pop_front() {
            let key = delta_key(&record.operation);

            let blocked_behind_key = key
                .as_ref()
                .map(|k| blocked_keys.iter().flatten().any(|b| b == k))
                .unwrap_or(false);
            if record.next_attempt_at > now || blocked_behind_key {
                blocked_keys.push(key);
                requeue.push(record);
                continue;
            }

            match transport(&record.operation) {
                Ok(outcome) => {
                    if outcome.status == OpStatus::Rejected {
                        // Definitive server decision; the client owns the
                        // follow-up, no automatic retry.
                        debug!(op_id = %outcome.op_id, "offline queue: op rejected by server");
                    }
                    report.outcomes.push(outcome);
                }
                Err(error) => {
                    record.attempts += 1;
                    if record.attempts >= self.max_attempts {
                        warn!(
                            op_id = %record.operation.op_id,
                            attempts = record.attempts,
                            "offline queue: moved to dead letters"
                        );
                        report.dead_lettered += 1;
                        self.dead.push(DeadLetter {
                            operation: record.operation,
                            attempts: record.attempts,
                            last_error: error,
                        });
                    } else {
                        let backoff =
                            self.base_backoff_secs << (record.attempts.saturating_sub(1).min(16));
                        record.next_attempt_at = now + backoff;
                        report.retried += 1;
                        blocked_keys.push(key);
                        requeue.push(record);
                    }
                }
            }
        }

        for record in requeue {
            self.pending.push_back(record);
        }
        report
    }
}

fn delta_key(operation: &ClientOperation) -> Option<(i64, String)> {
    if operation.method.to_ascii_uppercase() != "POST" {
        return None;
    }
    let vintage_id = operation.payload.get("vintage_id")?.as_i64()?;
    let location = operation
        .payload
        .get("location")
        .or_else(|| operation.payload.get("from_location"))?
        .as_str()?;
    Some((vintage_id, location.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(op_id: &str, quantity: i64) -> ClientOperation {
        ClientOperation {
            op_id: op_id.to_string(),
            updated_at: 1_700_000_000,
            updated_by: "steward".to_string(),
            origin: "tablet-1".to_string(),
            endpoint: "/api/inventory/consume".to_string(),
            method: "POST".to_string(),
            payload: serde_json::json!({
                "vintage_id": 42,
                "location": "main-cellar",
                "quantity": quantity,
            }),
        }
    }

    fn applied(op_id: &str) -> OpOutcome {
        OpOutcome {
            op_id: op_id.to_string(),
            status: OpStatus::Applied,
            code: None,
            reason: None,
            server_updated_at: Some(0),
        }
    }

    #[test]
    fn enqueue_replaces_same_op_id() {
        let mut queue = OfflineQueue::default();
        queue.enqueue(op("X", 1), 0);
        queue.enqueue(op("Y", 1), 0);
        queue.enqueue(op("X", 3), 0);

        assert_eq!(queue.len(), 2);
        // X kept its position at the head with the new payload.
        let report = queue.drain(0, |operation| {
            if operation.op_id == "X" {
                assert_eq!(operation.payload["quantity"], 3);
            }
            Ok(applied(&operation.op_id))
        });
        assert_eq!(report.outcomes[0].op_id, "X");
        assert_eq!(report.outcomes[1].op_id, "Y");
    }

    #[test]
    fn transport_failure_backs_off_then_dead_letters() {
        let mut queue = OfflineQueue::new(3, 2);
        queue.enqueue(op("X", 1), 0);

        let report = queue.drain(0, |_| Err("satellite down".to_string()));
        assert_eq!(report.retried, 1);
        assert_eq!(queue.len(), 1);

        // Not yet due: nothing happens.
        let report = queue.drain(1, |_| panic!("should not be attempted"));
        assert!(report.outcomes.is_empty());

        // Due again at t=2 (backoff 2s), fails, backoff doubles to 4s.
        let report = queue.drain(2, |_| Err("still down".to_string()));
        assert_eq!(report.retried, 1);

        let report = queue.drain(6, |_| Err("gone".to_string()));
        assert_eq!(report.dead_lettered, 1);
        assert!(queue.is_empty());
        assert_eq!(queue.dead_letters().len(), 1);
        assert_eq!(queue.dead_letters()[0].attempts, 3);
    }

    #[test]
    fn same_balance_stays_ordered_behind_backoff() {
        let mut queue = OfflineQueue::new(5, 10);
        queue.enqueue(op("A", 1), 0);
        queue.enqueue(op("B", 1), 0);

        // A fails transport; B targets the same (vintage, location) so it
        // must not jump ahead.
        let mut attempted = Vec::new();
        queue.drain(0, |operation| {
            attempted.push(operation.op_id.clone());
            Err("down".to_string())
        });
        assert_eq!(attempted, vec!["A"]);

        // Once A is due and succeeds, B follows in order.
        let mut attempted = Vec::new();
        queue.drain(10, |operation| {
            attempted.push(operation.op_id.clone());
            Ok(applied(&operation.op_id))
        });
        assert_eq!(attempted, vec!["A", "B"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn different_balances_drain_independently() {
        let mut queue = OfflineQueue::new(5, 10);
        queue.enqueue(op("A", 1), 0);
        let mut other = op("C", 1);
        other.payload = serde_json::json!({
            "vintage_id": 43,
            "location": "service-bar",
            "quantity": 1,
        });
        queue.enqueue(other, 0);

        let mut attempted = Vec::new();
        queue.drain(0, |operation| {
            attempted.push(operation.op_id.clone());
            if operation.op_id == "A" {
                Err("down".to_string())
            } else {
                Ok(applied(&operation.op_id))
            }
        });
        // C is unrelated to A's balance and goes through.
        assert_eq!(attempted, vec!["A", "C"]);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn rejected_outcome_is_not_retried() {
        let mut queue = OfflineQueue::default();
        queue.enqueue(op("X", 99), 0);
        let report = queue.drain(0, |operation| {
            Ok(OpOutcome {
                op_id: operation.op_id.clone(),
                status: OpStatus::Rejected,
                code: Some("inventory_conflict".to_string()),
                reason: Some("would go negative".to_string()),
                server_updated_at: None,
            })
        });
        assert_eq!(report.outcomes.len(), 1);
        assert!(queue.is_empty(), "server decision removes the record");
        assert!(queue.dead_letters().is_empty());
    }
}
