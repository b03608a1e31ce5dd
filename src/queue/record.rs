//! Outbound message records

use chrono::{DateTime, Utc};
use serde_json::Value;

/// Delivery class of an outbound CALL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Persisted before the enqueue returns; delivered at-least-once,
    /// surviving restarts and offline periods.
    Transactional,
    /// In-memory only; gated while the connection is unstable.
    Normal,
    /// Response to a CSMS TriggerMessage; in-memory, prioritized over
    /// Normal but not over Transactional.
    Triggered,
}

/// Options controlling how an envelope is enqueued.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Transaction this message belongs to, for durability bookkeeping and
    /// CSMS id substitution.
    pub transaction_id: Option<String>,
    /// Hold the message until its transaction id has been resolved to the
    /// CSMS-assigned one (OCPP 1.6 StartTransaction flow).
    pub held: bool,
}

/// One queued outbound CALL.
#[derive(Debug, Clone)]
pub struct QueueRecord {
    pub unique_id: String,
    pub action: String,
    pub payload: Value,
    pub kind: MessageKind,
    pub transaction_id: Option<String>,
    /// Blocked from sending until its transaction id is resolved.
    pub held: bool,
    pub attempts: u32,
    pub next_attempt_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl QueueRecord {
    pub fn new(
        unique_id: String,
        action: String,
        payload: Value,
        kind: MessageKind,
        transaction_id: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            unique_id,
            action,
            payload,
            kind,
            transaction_id,
            held: false,
            attempts: 0,
            next_attempt_at: now,
            created_at: now,
        }
    }

    pub fn due(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at <= now
    }
}

/// How an in-flight CALL concluded.
#[derive(Debug)]
pub enum CallConclusion {
    /// CALLRESULT payload.
    Result(Value),
    /// CALLERROR from the CSMS.
    Error {
        code: String,
        description: String,
    },
    /// The connection dropped while the CALL was in flight.
    Disconnected,
}
