//! Message queue
//!
//! The rendezvous between the functional blocks and the WebSocket. Orders,
//! persists, retries and dispatches outbound CALLs, matches CALLRESULT /
//! CALLERROR frames to in-flight records, and serializes inbound CALL
//! handling. Exactly one outbound CALL is in flight at a time (OCPP-J
//! synchronicity); responses to inbound CALLs bypass the queue entirely.
//!
//! Delivery guarantees: a Transactional envelope is persisted before
//! `enqueue` returns and is delivered at-least-once; re-sends carry the
//! same unique id. Normal and Triggered envelopes are in-memory only.

pub mod record;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use rand::Rng;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::device_model::{variables, DeviceModel};
use crate::domain::{AppError, DomainError};
use crate::infrastructure::database::DatabaseHandler;
use crate::support::{OcppFrame, RpcErrorCode};
use record::{CallConclusion, EnqueueOptions, MessageKind, QueueRecord};

// ── State machine ──────────────────────────────────────────────

/// Connection-coupled queue state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    Disconnected,
    Connecting,
    /// WebSocket open, BootNotification not yet accepted: only Triggered
    /// traffic may leave the station.
    Connected,
    /// BootNotification accepted: all kinds flow.
    Booted,
    /// Graceful stop: pending Transactional records are flushed for a
    /// bounded grace period.
    Draining,
}

type SendFn = dyn Fn(String) -> bool + Send + Sync;
/// Inbound CALL handler: `(unique_id, action, payload)` to a response frame.
type CallHandler = dyn Fn(String, String, Value) -> BoxFuture<'static, OcppFrame> + Send + Sync;

struct InFlight {
    unique_id: String,
    conclude: oneshot::Sender<CallConclusion>,
}

struct QueueInner {
    state: QueueState,
    paused: bool,
    transactional: VecDeque<QueueRecord>,
    triggered: VecDeque<QueueRecord>,
    normal: VecDeque<QueueRecord>,
    in_flight: Option<InFlight>,
}

impl QueueInner {
    fn lane(&mut self, kind: MessageKind) -> &mut VecDeque<QueueRecord> {
        match kind {
            MessageKind::Transactional => &mut self.transactional,
            MessageKind::Triggered => &mut self.triggered,
            MessageKind::Normal => &mut self.normal,
        }
    }

    /// Which kinds may leave the station in the current state.
    fn kind_allowed(&self, kind: MessageKind) -> bool {
        match self.state {
            QueueState::Disconnected | QueueState::Connecting => false,
            QueueState::Connected => kind == MessageKind::Triggered,
            QueueState::Booted => kind != MessageKind::Normal || !self.paused,
            QueueState::Draining => kind == MessageKind::Transactional,
        }
    }

    /// The next record to send, honoring kind priority (Transactional,
    /// then Triggered, then Normal) and strict FIFO within each kind.
    /// Only the head of each lane is a candidate, so enqueue order is
    /// never inverted by retry scheduling.
    fn next_due(&self, now: DateTime<Utc>) -> Option<QueueRecord> {
        for kind in [
            MessageKind::Transactional,
            MessageKind::Triggered,
            MessageKind::Normal,
        ] {
            if !self.kind_allowed(kind) {
                continue;
            }
            let lane = match kind {
                MessageKind::Transactional => &self.transactional,
                MessageKind::Triggered => &self.triggered,
                MessageKind::Normal => &self.normal,
            };
            if let Some(head) = lane.front() {
                if head.due(now) && !head.held {
                    return Some(head.clone());
                }
            }
        }
        None
    }

    /// Earliest instant at which a currently blocked head becomes due.
    fn next_wakeup(&self) -> Option<DateTime<Utc>> {
        [
            self.transactional.front(),
            self.triggered.front(),
            self.normal.front(),
        ]
        .into_iter()
        .flatten()
        .map(|r| r.next_attempt_at)
        .min()
    }

    fn remove(&mut self, unique_id: &str) -> Option<QueueRecord> {
        for lane in [
            &mut self.transactional,
            &mut self.triggered,
            &mut self.normal,
        ] {
            if let Some(pos) = lane.iter().position(|r| r.unique_id == unique_id) {
                return lane.remove(pos);
            }
        }
        None
    }

    fn find_mut(&mut self, unique_id: &str) -> Option<&mut QueueRecord> {
        self.transactional
            .iter_mut()
            .chain(self.triggered.iter_mut())
            .chain(self.normal.iter_mut())
            .find(|r| r.unique_id == unique_id)
    }
}

// ── MessageQueue ───────────────────────────────────────────────

pub struct MessageQueue {
    db: Arc<DatabaseHandler>,
    device_model: Arc<DeviceModel>,
    inner: Mutex<QueueInner>,
    wake: Notify,
    /// Functional blocks awaiting the CALLRESULT of an enqueued CALL.
    pending_callers: DashMap<String, oneshot::Sender<Result<Value, DomainError>>>,
    send_fn: Mutex<Option<Arc<SendFn>>>,
    call_handler: Mutex<Option<Arc<CallHandler>>>,
    inbound_tx: mpsc::UnboundedSender<(String, String, Value)>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<(String, String, Value)>>>,
}

impl MessageQueue {
    pub fn new(db: Arc<DatabaseHandler>, device_model: Arc<DeviceModel>) -> Arc<Self> {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            db,
            device_model,
            inner: Mutex::new(QueueInner {
                state: QueueState::Disconnected,
                paused: false,
                transactional: VecDeque::new(),
                triggered: VecDeque::new(),
                normal: VecDeque::new(),
                in_flight: None,
            }),
            wake: Notify::new(),
            pending_callers: DashMap::new(),
            send_fn: Mutex::new(None),
            call_handler: Mutex::new(None),
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
        })
    }

    // ── Wiring ─────────────────────────────────────────────

    pub fn set_send_fn(&self, f: impl Fn(String) -> bool + Send + Sync + 'static) {
        *self.send_fn.lock().unwrap() = Some(Arc::new(f));
    }

    pub fn set_call_handler(
        &self,
        f: impl Fn(String, String, Value) -> BoxFuture<'static, OcppFrame> + Send + Sync + 'static,
    ) {
        *self.call_handler.lock().unwrap() = Some(Arc::new(f));
    }

    /// Spawn the worker (outbound pacing) and the serialized inbound CALL
    /// processor.
    pub fn start(self: &Arc<Self>) {
        let worker = self.clone();
        tokio::spawn(async move {
            worker.run_worker().await;
        });

        let processor = self.clone();
        let mut rx = self
            .inbound_rx
            .lock()
            .unwrap()
            .take()
            .expect("queue started twice");
        tokio::spawn(async move {
            // inbound CALLs are handled strictly one at a time: handler
            // N+1 never starts until N has produced its reply
            while let Some((unique_id, action, payload)) = rx.recv().await {
                processor.process_inbound_call(unique_id, action, payload).await;
            }
        });
    }

    /// Load persisted transactional records into the queue; called once on
    /// boot before connecting.
    pub async fn restore_pending(&self) -> Result<usize, AppError> {
        let pending = self.db.queue_pending().await.map_err(crate::domain::InfraError::from)?;
        let count = pending.len();
        let mut inner = self.inner.lock().unwrap();
        for message in pending {
            let mut restored = QueueRecord::new(
                message.unique_id,
                message.action,
                message.payload,
                MessageKind::Transactional,
                message.transaction_id,
            );
            restored.attempts = message.attempts.max(0) as u32;
            inner.transactional.push_back(restored);
        }
        if count > 0 {
            info!(count, "Restored pending transactional messages");
        }
        Ok(count)
    }

    // ── Enqueue / cancel ───────────────────────────────────

    /// Enqueue a CALL. For the Transactional kind the envelope is durable
    /// before the id is returned.
    pub async fn enqueue(
        &self,
        action: &str,
        payload: Value,
        kind: MessageKind,
        options: EnqueueOptions,
    ) -> Result<String, AppError> {
        let unique_id = Uuid::new_v4().to_string();
        self.enqueue_with_id(unique_id.clone(), action, payload, kind, options)
            .await?;
        Ok(unique_id)
    }

    async fn enqueue_with_id(
        &self,
        unique_id: String,
        action: &str,
        payload: Value,
        kind: MessageKind,
        options: EnqueueOptions,
    ) -> Result<(), AppError> {
        if kind == MessageKind::Transactional {
            self.db
                .queue_insert(
                    &unique_id,
                    action,
                    &payload,
                    options.transaction_id.as_deref(),
                )
                .await
                .map_err(crate::domain::InfraError::from)?;
        }
        let mut record = QueueRecord::new(
            unique_id.clone(),
            action.to_string(),
            payload,
            kind,
            options.transaction_id.clone(),
        );
        record.held = options.held;
        {
            let mut inner = self.inner.lock().unwrap();
            inner.lane(kind).push_back(record);
        }
        debug!(unique_id = unique_id.as_str(), action, ?kind, "Enqueued");
        self.wake.notify_one();
        Ok(())
    }

    /// Enqueue and receive the eventual CALLRESULT payload (or the mapped
    /// failure) through a oneshot channel. The caller is registered before
    /// the record becomes sendable so a fast response cannot be lost.
    pub async fn enqueue_with_response(
        &self,
        action: &str,
        payload: Value,
        kind: MessageKind,
        options: EnqueueOptions,
    ) -> Result<(String, oneshot::Receiver<Result<Value, DomainError>>), AppError> {
        let unique_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending_callers.insert(unique_id.clone(), tx);
        if let Err(e) = self
            .enqueue_with_id(unique_id.clone(), action, payload, kind, options)
            .await
        {
            self.pending_callers.remove(&unique_id);
            return Err(e);
        }
        Ok((unique_id, rx))
    }

    /// Register interest in the response of an already queued message
    /// (restored records have no caller attached).
    pub fn watch_response(
        &self,
        unique_id: &str,
    ) -> oneshot::Receiver<Result<Value, DomainError>> {
        let (tx, rx) = oneshot::channel();
        self.pending_callers.insert(unique_id.to_string(), tx);
        rx
    }

    /// Cancel an in-memory message that has not been sent yet.
    pub fn drop_by_message_id(&self, unique_id: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let in_flight = inner
            .in_flight
            .as_ref()
            .map(|f| f.unique_id == unique_id)
            .unwrap_or(false);
        if in_flight {
            return false;
        }
        let removed = {
            let lane_hit = inner
                .triggered
                .iter()
                .position(|r| r.unique_id == unique_id)
                .map(|pos| (MessageKind::Triggered, pos))
                .or_else(|| {
                    inner
                        .normal
                        .iter()
                        .position(|r| r.unique_id == unique_id)
                        .map(|pos| (MessageKind::Normal, pos))
                });
            match lane_hit {
                Some((kind, pos)) => {
                    inner.lane(kind).remove(pos);
                    true
                }
                None => false,
            }
        };
        if removed {
            self.pending_callers.remove(unique_id);
        }
        removed
    }

    // ── Gating & state transitions ─────────────────────────

    pub fn pause(&self) {
        self.inner.lock().unwrap().paused = true;
    }

    pub fn resume(&self) {
        self.inner.lock().unwrap().paused = false;
        self.wake.notify_one();
    }

    pub fn state(&self) -> QueueState {
        self.inner.lock().unwrap().state
    }

    pub fn on_connecting(&self) {
        self.transition(QueueState::Connecting);
    }

    pub fn on_connected(&self) {
        self.transition(QueueState::Connected);
    }

    pub fn on_booted(&self) {
        self.transition(QueueState::Booted);
    }

    /// The WebSocket dropped: the in-flight record (if any) is concluded as
    /// disconnected and will be retried on reconnect without attempt
    /// penalty.
    pub fn on_disconnected(&self) {
        let in_flight = {
            let mut inner = self.inner.lock().unwrap();
            inner.state = QueueState::Disconnected;
            inner.in_flight.take()
        };
        if let Some(flight) = in_flight {
            let _ = flight.conclude.send(CallConclusion::Disconnected);
        }
        self.wake.notify_one();
    }

    fn transition(&self, state: QueueState) {
        {
            let mut inner = self.inner.lock().unwrap();
            debug!(from = ?inner.state, to = ?state, "Queue state transition");
            inner.state = state;
        }
        self.wake.notify_one();
    }

    /// Graceful stop: flush pending Transactional records for up to
    /// `grace`, then close the queue.
    pub async fn drain(&self, grace: Duration) {
        self.transition(QueueState::Draining);
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let empty = {
                let inner = self.inner.lock().unwrap();
                inner.transactional.is_empty() && inner.in_flight.is_none()
            };
            if empty {
                break;
            }
            if tokio::time::timeout_at(deadline, self.wake.notified())
                .await
                .is_err()
            {
                warn!("Drain grace period elapsed with messages still pending");
                break;
            }
        }
        self.on_disconnected();
    }

    // ── Transaction id resolution (OCPP 1.6) ───────────────

    /// Mark restored records of an unresolved transaction held. The first
    /// matching record (FIFO, the StartTransaction itself) stays eligible
    /// so the id resolution can make progress; everything behind it waits.
    pub fn hold_transaction(&self, local_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        let mut first_seen = false;
        for queued in inner.transactional.iter_mut() {
            if queued.transaction_id.as_deref() == Some(local_id) {
                if first_seen {
                    queued.held = true;
                } else {
                    first_seen = true;
                }
            }
        }
    }

    /// The StartTransactionResponse arrived: rewrite all pending records
    /// that referred to the local id, substituting the CSMS id, then
    /// release them.
    pub async fn resolve_transaction_id(
        &self,
        local_id: &str,
        csms_id: &str,
        rewrite: impl Fn(&mut Value),
    ) -> Result<usize, AppError> {
        let rewritten = self
            .db
            .queue_rewrite_transaction_id(local_id, csms_id, &rewrite)
            .await
            .map_err(crate::domain::InfraError::from)?;
        {
            let mut guard = self.inner.lock().unwrap();
            let inner = &mut *guard;
            for lane in [
                &mut inner.transactional,
                &mut inner.triggered,
                &mut inner.normal,
            ] {
                for queued in lane.iter_mut() {
                    if queued.transaction_id.as_deref() == Some(local_id) {
                        rewrite(&mut queued.payload);
                        queued.transaction_id = Some(csms_id.to_string());
                        queued.held = false;
                    }
                }
            }
        }
        info!(local_id, csms_id, rewritten, "Resolved CSMS transaction id");
        self.wake.notify_one();
        Ok(rewritten)
    }

    // ── Wire demultiplexing ────────────────────────────────

    /// Entry point for every text frame arriving from the WebSocket.
    pub fn on_wire_message(&self, text: &str) {
        let frame = match OcppFrame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Malformed inbound frame");
                // peer misbehaviour never fails the queue; answer with a
                // protocol-level CALLERROR
                self.send_frame(&OcppFrame::error("-1", RpcErrorCode::ProtocolError, e.to_string()));
                return;
            }
        };
        match frame {
            OcppFrame::Call {
                unique_id,
                action,
                payload,
            } => {
                let _ = self.inbound_tx.send((unique_id, action, payload));
            }
            OcppFrame::CallResult { unique_id, payload } => {
                self.conclude_in_flight(&unique_id, CallConclusion::Result(payload));
            }
            OcppFrame::CallError {
                unique_id,
                error_code,
                error_description,
                ..
            } => {
                self.conclude_in_flight(
                    &unique_id,
                    CallConclusion::Error {
                        code: error_code,
                        description: error_description,
                    },
                );
            }
        }
    }

    fn conclude_in_flight(&self, unique_id: &str, conclusion: CallConclusion) {
        let flight = {
            let mut inner = self.inner.lock().unwrap();
            match &inner.in_flight {
                Some(f) if f.unique_id == unique_id => inner.in_flight.take(),
                _ => None,
            }
        };
        match flight {
            Some(flight) => {
                let _ = flight.conclude.send(conclusion);
            }
            None => {
                // duplicate or orphan response: protocol error, queue state
                // is not mutated
                warn!(unique_id, "Orphan CALLRESULT/CALLERROR, ignoring");
            }
        }
    }

    fn send_frame(&self, frame: &OcppFrame) -> bool {
        let send = self.send_fn.lock().unwrap().clone();
        match send {
            Some(send) => send(frame.serialize()),
            None => false,
        }
    }

    // ── Inbound CALL processing ────────────────────────────

    async fn process_inbound_call(&self, unique_id: String, action: String, payload: Value) {
        let handler = self.call_handler.lock().unwrap().clone();
        let response = match handler {
            Some(handler) => handler(unique_id.clone(), action.clone(), payload).await,
            None => OcppFrame::error(
                unique_id.clone(),
                RpcErrorCode::NotImplemented,
                format!("No handler for {}", action),
            ),
        };
        // the reply never waits behind queued CALLs
        if !self.send_frame(&response) {
            warn!(unique_id = unique_id.as_str(), action = action.as_str(),
                  "Failed to send response to inbound CALL");
        }
    }

    // ── Outbound worker ────────────────────────────────────

    async fn run_worker(self: Arc<Self>) {
        loop {
            let now = Utc::now();
            let due = {
                let inner = self.inner.lock().unwrap();
                if inner.in_flight.is_some() {
                    None
                } else {
                    inner.next_due(now)
                }
            };

            let Some(outbound) = due else {
                let sleep_for = {
                    let inner = self.inner.lock().unwrap();
                    inner
                        .next_wakeup()
                        .map(|at| (at - Utc::now()).to_std().unwrap_or(Duration::ZERO))
                        .unwrap_or(Duration::from_secs(60))
                        .min(Duration::from_secs(60))
                };
                let _ = tokio::time::timeout(sleep_for, self.wake.notified()).await;
                continue;
            };

            self.dispatch(outbound).await;
        }
    }

    async fn dispatch(&self, outbound: QueueRecord) {
        let frame = OcppFrame::Call {
            unique_id: outbound.unique_id.clone(),
            action: outbound.action.clone(),
            payload: outbound.payload.clone(),
        };

        // register before sending: the response may race the send returning
        let (conclude_tx, mut conclude_rx) = oneshot::channel();
        {
            let mut inner = self.inner.lock().unwrap();
            inner.in_flight = Some(InFlight {
                unique_id: outbound.unique_id.clone(),
                conclude: conclude_tx,
            });
        }

        if !self.send_frame(&frame) {
            // transport refused; behave like a disconnect for this record
            debug!(unique_id = outbound.unique_id.as_str(), "Send failed, staying queued");
            {
                let mut inner = self.inner.lock().unwrap();
                if inner
                    .in_flight
                    .as_ref()
                    .map(|f| f.unique_id == outbound.unique_id)
                    .unwrap_or(false)
                {
                    inner.in_flight = None;
                }
            }
            let _ = tokio::time::timeout(Duration::from_secs(1), self.wake.notified()).await;
            return;
        }

        let timeout = Duration::from_secs(
            self.device_model
                .get_int(&variables::MESSAGE_TIMEOUT)
                .unwrap_or(30)
                .max(1) as u64,
        );

        let conclusion = match tokio::time::timeout(timeout, &mut conclude_rx).await {
            Ok(Ok(conclusion)) => conclusion,
            Ok(Err(_)) => CallConclusion::Disconnected,
            Err(_elapsed) => {
                // take the in-flight marker back; a response racing with
                // the timeout may already have concluded it
                let taken = {
                    let mut inner = self.inner.lock().unwrap();
                    match &inner.in_flight {
                        Some(f) if f.unique_id == outbound.unique_id => {
                            inner.in_flight.take();
                            true
                        }
                        _ => false,
                    }
                };
                if taken {
                    debug!(unique_id = outbound.unique_id.as_str(), "CALL timed out");
                    self.schedule_retry(&outbound, "timeout").await;
                    return;
                }
                match conclude_rx.try_recv() {
                    Ok(conclusion) => conclusion,
                    Err(_) => CallConclusion::Disconnected,
                }
            }
        };

        match conclusion {
            CallConclusion::Result(payload) => self.complete(&outbound, Ok(payload)).await,
            CallConclusion::Error { code, description } => {
                if is_retryable_error(&code) {
                    self.schedule_retry(&outbound, &code).await;
                } else {
                    self.complete(
                        &outbound,
                        Err(DomainError::CallError {
                            action: outbound.action.clone(),
                            code,
                            description,
                        }),
                    )
                    .await;
                }
            }
            CallConclusion::Disconnected => {
                // cleared without attempt penalty; retried on reconnect
                debug!(unique_id = outbound.unique_id.as_str(), "In-flight cleared by disconnect");
            }
        }
    }

    /// Remove the record everywhere and notify the waiting caller.
    async fn complete(&self, outbound: &QueueRecord, result: Result<Value, DomainError>) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.remove(&outbound.unique_id);
        }
        if outbound.kind == MessageKind::Transactional {
            if let Err(e) = self.db.queue_remove(&outbound.unique_id).await {
                error!(unique_id = outbound.unique_id.as_str(), error = %e,
                       "Failed to delete acknowledged queue record");
            }
        }
        if let Some((_, caller)) = self.pending_callers.remove(&outbound.unique_id) {
            let _ = caller.send(result);
        }
        self.wake.notify_one();
    }

    async fn schedule_retry(&self, outbound: &QueueRecord, why: &str) {
        let attempts = outbound.attempts + 1;
        let exhausted = match outbound.kind {
            MessageKind::Transactional => {
                let budget = self
                    .device_model
                    .get_int(&variables::MESSAGE_ATTEMPTS_TRANSACTION)
                    .unwrap_or(5)
                    .max(1) as u32;
                attempts > budget
            }
            MessageKind::Normal | MessageKind::Triggered => {
                let budget = self
                    .device_model
                    .get_int(&variables::RETRY_BACK_OFF_REPEAT_TIMES)
                    .unwrap_or(3)
                    .max(0) as u32;
                attempts > budget
            }
        };

        if exhausted {
            warn!(unique_id = outbound.unique_id.as_str(), action = outbound.action.as_str(),
                  attempts, why, "Attempt budget exhausted, surfacing failure");
            // the record leaves the queue; a transaction row it belongs to
            // stays in the database for operator inspection
            self.complete(outbound, Err(DomainError::Timeout(outbound.action.clone())))
                .await;
            return;
        }

        let delay = match outbound.kind {
            MessageKind::Transactional => {
                let interval = self
                    .device_model
                    .get_int(&variables::MESSAGE_ATTEMPT_INTERVAL_TRANSACTION)
                    .unwrap_or(10)
                    .max(0) as u64;
                Duration::from_secs(interval * attempts as u64)
            }
            MessageKind::Normal | MessageKind::Triggered => {
                let minimum = self
                    .device_model
                    .get_int(&variables::RETRY_BACK_OFF_WAIT_MINIMUM)
                    .unwrap_or(3)
                    .max(0) as u64;
                let random_range = self
                    .device_model
                    .get_int(&variables::RETRY_BACK_OFF_RANDOM_RANGE)
                    .unwrap_or(0)
                    .max(0) as u64;
                let jitter = if random_range > 0 {
                    rand::thread_rng().gen_range(0..=random_range)
                } else {
                    0
                };
                Duration::from_secs(minimum * (1 << (attempts - 1).min(16)) + jitter)
            }
        };

        debug!(unique_id = outbound.unique_id.as_str(), attempts, delay_s = delay.as_secs(),
               why, "Scheduling retry");
        {
            let mut inner = self.inner.lock().unwrap();
            if let Some(queued) = inner.find_mut(&outbound.unique_id) {
                queued.attempts = attempts;
                queued.next_attempt_at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
            }
        }
        if outbound.kind == MessageKind::Transactional {
            if let Err(e) = self
                .db
                .queue_update_attempts(&outbound.unique_id, attempts as i32)
                .await
            {
                warn!(error = %e, "Failed to persist attempt counter");
            }
        }
        self.wake.notify_one();
    }
}

fn is_retryable_error(code: &str) -> bool {
    matches!(code, "GenericError" | "InternalError")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::database::{init_database, DatabaseConfig};
    use std::sync::Mutex as StdMutex;

    struct Harness {
        queue: Arc<MessageQueue>,
        sent: Arc<StdMutex<Vec<OcppFrame>>>,
        db: Arc<DatabaseHandler>,
        model: Arc<DeviceModel>,
    }

    async fn harness() -> Harness {
        let db = Arc::new(DatabaseHandler::new(
            init_database(&DatabaseConfig::in_memory()).await.unwrap(),
        ));
        let model = Arc::new(DeviceModel::with_defaults());
        let queue = MessageQueue::new(db.clone(), model.clone());
        let sent: Arc<StdMutex<Vec<OcppFrame>>> = Arc::new(StdMutex::new(Vec::new()));
        let sent_clone = sent.clone();
        queue.set_send_fn(move |text| {
            sent_clone
                .lock()
                .unwrap()
                .push(OcppFrame::parse(&text).unwrap());
            true
        });
        queue.start();
        Harness {
            queue,
            sent,
            db,
            model,
        }
    }

    fn sent_actions(sent: &Arc<StdMutex<Vec<OcppFrame>>>) -> Vec<String> {
        sent.lock()
            .unwrap()
            .iter()
            .filter_map(|f| match f {
                OcppFrame::Call { action, .. } => Some(action.clone()),
                _ => None,
            })
            .collect()
    }

    fn last_sent_call_id(sent: &Arc<StdMutex<Vec<OcppFrame>>>) -> Option<String> {
        sent.lock()
            .unwrap()
            .iter()
            .rev()
            .find_map(|f| match f {
                OcppFrame::Call { unique_id, .. } => Some(unique_id.clone()),
                _ => None,
            })
    }

    #[tokio::test]
    async fn transactional_enqueue_is_durable_before_return() {
        let h = harness().await;
        let id = h
            .queue
            .enqueue(
                "StartTransaction",
                serde_json::json!({"connectorId": 1}),
                MessageKind::Transactional,
                EnqueueOptions {
                    transaction_id: Some("tx-1".into()),
                    held: false,
                },
            )
            .await
            .unwrap();
        let pending = h.db.queue_pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].unique_id, id);
    }

    #[tokio::test]
    async fn call_result_resolves_caller_and_deletes_record() {
        let h = harness().await;
        h.queue.on_booted();
        let (id, rx) = h
            .queue
            .enqueue_with_response(
                "StopTransaction",
                serde_json::json!({"transactionId": 7}),
                MessageKind::Transactional,
                EnqueueOptions::default(),
            )
            .await
            .unwrap();

        // wait for the worker to put it on the wire
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(last_sent_call_id(&h.sent), Some(id.clone()));

        h.queue.on_wire_message(
            &OcppFrame::result(id.clone(), serde_json::json!({"idTagInfo": {"status": "Accepted"}}))
                .serialize(),
        );
        let result = rx.await.unwrap().unwrap();
        assert_eq!(result["idTagInfo"]["status"], "Accepted");

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.db.queue_pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn normal_gated_until_booted_and_kind_priority_holds() {
        let h = harness().await;
        h.queue
            .enqueue("Heartbeat", serde_json::json!({}), MessageKind::Normal, EnqueueOptions::default())
            .await
            .unwrap();
        h.queue
            .enqueue(
                "StatusNotification",
                serde_json::json!({"connectorId": 1}),
                MessageKind::Triggered,
                EnqueueOptions::default(),
            )
            .await
            .unwrap();
        h.queue
            .enqueue(
                "StartTransaction",
                serde_json::json!({"connectorId": 1}),
                MessageKind::Transactional,
                EnqueueOptions::default(),
            )
            .await
            .unwrap();

        // still disconnected: nothing leaves
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(sent_actions(&h.sent).is_empty());

        // connected pre-boot: only Triggered flows
        h.queue.on_connected();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sent_actions(&h.sent), vec!["StatusNotification"]);
        // answer it so the queue moves on
        let id = last_sent_call_id(&h.sent).unwrap();
        h.queue
            .on_wire_message(&OcppFrame::result(id, serde_json::json!({})).serialize());

        // booted: Transactional outranks Normal
        h.queue.on_booted();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            sent_actions(&h.sent),
            vec!["StatusNotification", "StartTransaction"]
        );
        let id = last_sent_call_id(&h.sent).unwrap();
        h.queue
            .on_wire_message(&OcppFrame::result(id, serde_json::json!({})).serialize());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            sent_actions(&h.sent),
            vec!["StatusNotification", "StartTransaction", "Heartbeat"]
        );
    }

    #[tokio::test]
    async fn orphan_call_result_does_not_disturb_queue() {
        let h = harness().await;
        h.queue.on_booted();
        h.queue
            .on_wire_message(&OcppFrame::result("no-such-id", serde_json::json!({})).serialize());
        // still operational afterwards
        let (_, rx) = h
            .queue
            .enqueue_with_response(
                "Heartbeat",
                serde_json::json!({}),
                MessageKind::Normal,
                EnqueueOptions::default(),
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let id = last_sent_call_id(&h.sent).unwrap();
        h.queue.on_wire_message(
            &OcppFrame::result(id, serde_json::json!({"currentTime": "2025-03-01T00:00:00Z"}))
                .serialize(),
        );
        assert!(rx.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn malformed_inbound_call_answered_with_call_error() {
        let h = harness().await;
        h.queue.on_wire_message("this is not json");
        tokio::time::sleep(Duration::from_millis(20)).await;
        let frames = h.sent.lock().unwrap();
        assert!(matches!(
            frames.last(),
            Some(OcppFrame::CallError { error_code, .. }) if error_code == "ProtocolError"
        ));
    }

    #[tokio::test]
    async fn inbound_call_without_handler_answers_not_implemented() {
        let h = harness().await;
        h.queue.on_wire_message(
            &OcppFrame::Call {
                unique_id: "in-1".into(),
                action: "FancyNewAction".into(),
                payload: serde_json::json!({}),
            }
            .serialize(),
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
        let frames = h.sent.lock().unwrap();
        assert!(matches!(
            frames.last(),
            Some(OcppFrame::CallError { unique_id, error_code, .. })
                if unique_id == "in-1" && error_code == "NotImplemented"
        ));
    }

    #[tokio::test]
    async fn held_messages_wait_for_transaction_id_resolution() {
        let h = harness().await;
        h.queue.on_booted();

        let (start_id, _start_rx) = h
            .queue
            .enqueue_with_response(
                "StartTransaction",
                serde_json::json!({"connectorId": 1, "idTag": "ABCD"}),
                MessageKind::Transactional,
                EnqueueOptions {
                    transaction_id: Some("local-1".into()),
                    held: false,
                },
            )
            .await
            .unwrap();
        h.queue.hold_transaction("local-1");
        h.queue
            .enqueue(
                "StopTransaction",
                serde_json::json!({"transactionId": "local-1", "meterStop": 900}),
                MessageKind::Transactional,
                EnqueueOptions {
                    transaction_id: Some("local-1".into()),
                    held: true,
                },
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sent_actions(&h.sent), vec!["StartTransaction"]);

        // CSMS assigns transaction id 4711
        h.queue.on_wire_message(
            &OcppFrame::result(
                start_id,
                serde_json::json!({"transactionId": 4711, "idTagInfo": {"status": "Accepted"}}),
            )
            .serialize(),
        );
        h.queue
            .resolve_transaction_id("local-1", "4711", |payload| {
                payload["transactionId"] = serde_json::json!(4711);
            })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sent_actions(&h.sent), vec!["StartTransaction", "StopTransaction"]);
        let frames = h.sent.lock().unwrap();
        let stop = frames
            .iter()
            .find_map(|f| match f {
                OcppFrame::Call { action, payload, .. } if action == "StopTransaction" => {
                    Some(payload.clone())
                }
                _ => None,
            })
            .unwrap();
        assert_eq!(stop["transactionId"], 4711);
        assert_eq!(stop["meterStop"], 900);
    }

    #[tokio::test(start_paused = true)]
    async fn transactional_retry_uses_linear_interval_and_same_unique_id() {
        let h = harness().await;
        h.model
            .set_internal(&variables::MESSAGE_TIMEOUT, crate::device_model::VariableValue::Int(5));
        h.queue.on_booted();
        let id = h
            .queue
            .enqueue(
                "MeterValues",
                serde_json::json!({"connectorId": 1}),
                MessageKind::Transactional,
                EnqueueOptions::default(),
            )
            .await
            .unwrap();

        // first send, then timeout, then linear backoff (10s * attempts)
        tokio::time::sleep(Duration::from_secs(40)).await;
        let calls: Vec<String> = h
            .sent
            .lock()
            .unwrap()
            .iter()
            .filter_map(|f| match f {
                OcppFrame::Call { unique_id, .. } => Some(unique_id.clone()),
                _ => None,
            })
            .collect();
        assert!(calls.len() >= 2, "expected re-sends, got {}", calls.len());
        // duplicates carry the same unique id
        assert!(calls.iter().all(|c| *c == id));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_transactional_budget_surfaces_failure_and_clears_queue() {
        let h = harness().await;
        h.model
            .set_internal(&variables::MESSAGE_TIMEOUT, crate::device_model::VariableValue::Int(2));
        h.model.set_internal(
            &variables::MESSAGE_ATTEMPTS_TRANSACTION,
            crate::device_model::VariableValue::Int(2),
        );
        h.model.set_internal(
            &variables::MESSAGE_ATTEMPT_INTERVAL_TRANSACTION,
            crate::device_model::VariableValue::Int(1),
        );
        h.queue.on_booted();
        let (_, rx) = h
            .queue
            .enqueue_with_response(
                "MeterValues",
                serde_json::json!({"connectorId": 1}),
                MessageKind::Transactional,
                EnqueueOptions::default(),
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(60)).await;
        let result = rx.await.unwrap();
        assert!(matches!(result, Err(DomainError::Timeout(_))));
        assert!(h.db.queue_pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn disconnect_clears_in_flight_and_resends_after_reconnect() {
        let h = harness().await;
        h.queue.on_booted();
        h.queue
            .enqueue(
                "StartTransaction",
                serde_json::json!({"connectorId": 2}),
                MessageKind::Transactional,
                EnqueueOptions::default(),
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sent_actions(&h.sent).len(), 1);

        h.queue.on_disconnected();
        tokio::time::sleep(Duration::from_millis(50)).await;

        h.queue.on_booted();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let actions = sent_actions(&h.sent);
        assert_eq!(actions, vec!["StartTransaction", "StartTransaction"]);
    }

    #[tokio::test]
    async fn drop_by_message_id_cancels_unsent_normal() {
        let h = harness().await;
        let id = h
            .queue
            .enqueue(
                "Heartbeat",
                serde_json::json!({}),
                MessageKind::Normal,
                EnqueueOptions::default(),
            )
            .await
            .unwrap();
        assert!(h.queue.drop_by_message_id(&id));
        h.queue.on_booted();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(sent_actions(&h.sent).is_empty());
    }

    #[tokio::test]
    async fn pause_gates_normal_but_not_transactional() {
        let h = harness().await;
        h.queue.on_booted();
        h.queue.pause();
        h.queue
            .enqueue("Heartbeat", serde_json::json!({}), MessageKind::Normal, EnqueueOptions::default())
            .await
            .unwrap();
        h.queue
            .enqueue(
                "StartTransaction",
                serde_json::json!({"connectorId": 1}),
                MessageKind::Transactional,
                EnqueueOptions::default(),
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sent_actions(&h.sent), vec!["StartTransaction"]);
        let id = last_sent_call_id(&h.sent).unwrap();
        h.queue
            .on_wire_message(&OcppFrame::result(id, serde_json::json!({})).serialize());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sent_actions(&h.sent), vec!["StartTransaction"]);

        h.queue.resume();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sent_actions(&h.sent), vec!["StartTransaction", "Heartbeat"]);
    }

    #[tokio::test]
    async fn restore_pending_reloads_transactional_lane() {
        let h = harness().await;
        h.db
            .queue_insert("persisted-1", "StopTransaction", &serde_json::json!({"transactionId": 1}), None)
            .await
            .unwrap();
        let restored = h.queue.restore_pending().await.unwrap();
        assert_eq!(restored, 1);
        h.queue.on_booted();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sent_actions(&h.sent), vec!["StopTransaction"]);
        assert_eq!(last_sent_call_id(&h.sent), Some("persisted-1".into()));
    }
}
