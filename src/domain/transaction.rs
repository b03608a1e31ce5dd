//! Charging transaction lifecycle record
//!
//! A transaction is created on authorized plug-in, mutated by meter samples
//! and state transitions, and kept in the database after stopping until all
//! of its queued messages have been acknowledged by the CSMS. On boot,
//! transactions are resurrected from the database so that a StopTransaction
//! lost to a power cut is still delivered.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Reason a transaction stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    EmergencyStop,
    EVDisconnected,
    HardReset,
    Local,
    Other,
    PowerLoss,
    Reboot,
    Remote,
    SoftReset,
    UnlockCommand,
    DeAuthorized,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EmergencyStop => "EmergencyStop",
            Self::EVDisconnected => "EVDisconnected",
            Self::HardReset => "HardReset",
            Self::Local => "Local",
            Self::Other => "Other",
            Self::PowerLoss => "PowerLoss",
            Self::Reboot => "Reboot",
            Self::Remote => "Remote",
            Self::SoftReset => "SoftReset",
            Self::UnlockCommand => "UnlockCommand",
            Self::DeAuthorized => "DeAuthorized",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "EmergencyStop" => Self::EmergencyStop,
            "EVDisconnected" => Self::EVDisconnected,
            "HardReset" => Self::HardReset,
            "Local" => Self::Local,
            "Other" => Self::Other,
            "PowerLoss" => Self::PowerLoss,
            "Reboot" => Self::Reboot,
            "Remote" => Self::Remote,
            "SoftReset" => Self::SoftReset,
            "UnlockCommand" => Self::UnlockCommand,
            "DeAuthorized" => Self::DeAuthorized,
            _ => return None,
        })
    }
}

/// A charging session on one connector.
///
/// `transaction_id` starts out as a station-generated id. In OCPP 1.6 the
/// CSMS assigns the real id in StartTransactionResponse and the queue
/// rewrites pending messages; in 2.0.1 the station id is authoritative.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub transaction_id: String,
    pub evse_id: i32,
    pub connector_id: i32,
    pub id_token: String,
    pub group_id_token: Option<String>,
    pub reservation_id: Option<i32>,
    pub remote_start_id: Option<i32>,
    pub start_time: DateTime<Utc>,
    /// Meter reading at session start, Wh.
    pub start_meter_wh: f64,
    /// Sequence number of the last transaction message sent (2.0.1
    /// TransactionEvent seqNo). Incremented per message.
    pub seq_no: i32,
    pub active: bool,
    pub stop_time: Option<DateTime<Utc>>,
    pub stop_meter_wh: Option<f64>,
    pub stop_reason: Option<StopReason>,
}

impl Transaction {
    pub fn new(
        transaction_id: impl Into<String>,
        evse_id: i32,
        connector_id: i32,
        id_token: impl Into<String>,
        start_time: DateTime<Utc>,
        start_meter_wh: f64,
    ) -> Self {
        Self {
            transaction_id: transaction_id.into(),
            evse_id,
            connector_id,
            id_token: id_token.into(),
            group_id_token: None,
            reservation_id: None,
            remote_start_id: None,
            start_time,
            start_meter_wh,
            seq_no: 0,
            active: true,
            stop_time: None,
            stop_meter_wh: None,
            stop_reason: None,
        }
    }

    /// Take the next message sequence number.
    pub fn next_seq_no(&mut self) -> i32 {
        let seq = self.seq_no;
        self.seq_no += 1;
        seq
    }

    /// Mark the transaction stopped. The record stays around until its
    /// queued messages are acknowledged.
    pub fn stop(&mut self, time: DateTime<Utc>, meter_wh: f64, reason: StopReason) {
        self.active = false;
        self.stop_time = Some(time);
        self.stop_meter_wh = Some(meter_wh);
        self.stop_reason = Some(reason);
    }

    /// A transaction that stopped but whose StopTransaction was never
    /// acknowledged; found during boot-time resurrection.
    pub fn has_unreported_stop(&self) -> bool {
        !self.active && self.stop_time.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seq_no_increments() {
        let mut tx = Transaction::new("tx-1", 1, 1, "TOKEN", Utc::now(), 100.0);
        assert_eq!(tx.next_seq_no(), 0);
        assert_eq!(tx.next_seq_no(), 1);
        assert_eq!(tx.seq_no, 2);
    }

    #[test]
    fn stop_marks_inactive_and_unreported() {
        let mut tx = Transaction::new("tx-1", 1, 1, "TOKEN", Utc::now(), 100.0);
        assert!(!tx.has_unreported_stop());
        tx.stop(Utc::now(), 2500.0, StopReason::PowerLoss);
        assert!(!tx.active);
        assert!(tx.has_unreported_stop());
        assert_eq!(tx.stop_reason, Some(StopReason::PowerLoss));
    }

    #[test]
    fn stop_reason_string_roundtrip() {
        for r in [
            StopReason::EmergencyStop,
            StopReason::PowerLoss,
            StopReason::DeAuthorized,
        ] {
            assert_eq!(StopReason::parse(r.as_str()), Some(r));
        }
        assert_eq!(StopReason::parse("NotAReason"), None);
    }
}
