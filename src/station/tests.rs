//! End-to-end exercises of the facade over an in-memory transport: boot
//! handshake, restart resurrection, inbound dispatch and the 1.6
//! transaction-id assignment flow.

use super::*;
use crate::connectivity::websocket::{ConnectionEvent, WebSocketConnection, WebSocketTransport};
use crate::domain::{BasicAuthCredentials, InfraError, SecurityProfileLevel};
use crate::support::OcppFrame;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Mutex as StdMutex;
use tokio::sync::mpsc;

// ── In-memory transport ────────────────────────────────────────

/// The CSMS side of an accepted in-memory connection.
struct Csms {
    from_station: mpsc::UnboundedReceiver<String>,
    to_station: mpsc::UnboundedSender<ConnectionEvent>,
}

impl Csms {
    /// Wait for the next CALL with `action`. Other CALLs (heartbeats,
    /// status notifications) are acknowledged with an empty result.
    async fn expect_call(&mut self, action: &str) -> (String, Value) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let frame = tokio::time::timeout_at(deadline, self.from_station.recv())
                .await
                .unwrap_or_else(|_| panic!("timed out waiting for {}", action))
                .expect("station hung up");
            match OcppFrame::parse(&frame).expect("station sent invalid frame") {
                OcppFrame::Call {
                    unique_id,
                    action: got,
                    payload,
                } => {
                    if got == action {
                        return (unique_id, payload);
                    }
                    self.reply(&unique_id, serde_json::json!({}));
                }
                _ => continue,
            }
        }
    }

    fn reply(&self, unique_id: &str, payload: Value) {
        let frame = OcppFrame::result(unique_id, payload);
        let _ = self
            .to_station
            .send(ConnectionEvent::Message(frame.serialize()));
    }

    fn call(&self, action: &str, payload: Value) -> String {
        let frame = OcppFrame::new_call(action, payload);
        let unique_id = frame.unique_id().to_string();
        let _ = self
            .to_station
            .send(ConnectionEvent::Message(frame.serialize()));
        unique_id
    }

    async fn expect_result(&mut self, wanted_id: &str) -> Value {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let frame = tokio::time::timeout_at(deadline, self.from_station.recv())
                .await
                .expect("timed out waiting for CALLRESULT")
                .expect("station hung up");
            match OcppFrame::parse(&frame).unwrap() {
                OcppFrame::CallResult { unique_id, payload } if unique_id == wanted_id => {
                    return payload;
                }
                OcppFrame::Call { unique_id, .. } => {
                    self.reply(&unique_id, serde_json::json!({}));
                }
                _ => continue,
            }
        }
    }

    async fn expect_call_error(&mut self, wanted_id: &str) -> String {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let frame = tokio::time::timeout_at(deadline, self.from_station.recv())
                .await
                .expect("timed out waiting for CALLERROR")
                .expect("station hung up");
            match OcppFrame::parse(&frame).unwrap() {
                OcppFrame::CallError {
                    unique_id,
                    error_code,
                    ..
                } if unique_id == wanted_id => return error_code,
                OcppFrame::Call { unique_id, .. } => {
                    self.reply(&unique_id, serde_json::json!({}));
                }
                _ => continue,
            }
        }
    }
}

#[derive(Default)]
struct TestTransport {
    waiting: StdMutex<Option<Csms>>,
}

#[async_trait]
impl WebSocketTransport for TestTransport {
    async fn connect(
        &self,
        _profile: &crate::domain::ConnectionProfile,
        _version: OcppVersion,
    ) -> Result<WebSocketConnection, InfraError> {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        *self.waiting.lock().unwrap() = Some(Csms {
            from_station: out_rx,
            to_station: event_tx,
        });
        Ok(WebSocketConnection {
            outbound: out_tx,
            events: event_rx,
        })
    }
}

impl TestTransport {
    async fn accept(&self) -> Csms {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(csms) = self.waiting.lock().unwrap().take() {
                return csms;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("station never connected");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

// ── Harness ────────────────────────────────────────────────────

fn config(version: OcppVersion, database: DatabaseConfig) -> StationConfig {
    let mut evse_structure = BTreeMap::new();
    evse_structure.insert(1, 1);
    evse_structure.insert(2, 1);
    let mut connector_types = HashMap::new();
    connector_types.insert(1, vec![(1, "cType2".to_string())]);
    connector_types.insert(2, vec![(1, "cType2".to_string())]);
    StationConfig {
        station_id: "station-001".to_string(),
        vendor: "UnitTest".to_string(),
        model: "Bench".to_string(),
        firmware_version: Some("1.0.0".to_string()),
        version,
        evse_structure,
        connector_types,
        connection_profiles: vec![ConnectionProfile {
            slot: 1,
            priority: 1,
            csms_url: "ws://csms.test/ocpp".to_string(),
            security_profile: SecurityProfileLevel::BasicUnsecured,
            interface: None,
            basic_auth: Some(BasicAuthCredentials {
                username: "station-001".to_string(),
                password: "secret".to_string(),
            }),
        }],
        database,
        certificate_store_dir: std::env::temp_dir()
            .join(format!("station-certs-{}", Uuid::new_v4())),
    }
}

/// Route the crate's tracing output through the test writer so
/// `cargo test -- --nocapture` shows it. Repeat installs are no-ops.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_test_writer()
        .try_init();
}

async fn start_station(
    version: OcppVersion,
    database: DatabaseConfig,
) -> (Arc<ChargePoint>, Arc<TestTransport>) {
    init_tracing();
    let transport = Arc::new(TestTransport::default());
    let cp = ChargePoint::with_transport(
        config(version, database),
        StationCallbacks::default(),
        Arc::new(DeviceModel::with_defaults()),
        transport.clone(),
    )
    .await
    .unwrap();
    cp.start().await.unwrap();
    (cp, transport)
}

async fn boot(csms: &mut Csms) {
    let (unique_id, payload) = csms.expect_call("BootNotification").await;
    assert!(payload.get("chargingStation").is_some() || payload.get("chargePointVendor").is_some());
    csms.reply(
        &unique_id,
        serde_json::json!({
            "status": "Accepted",
            "interval": 300,
            "currentTime": Utc::now().to_rfc3339(),
        }),
    );
}

// ── Tests ──────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn boot_then_status_advertisement() {
    let (_cp, transport) = start_station(OcppVersion::V201, DatabaseConfig::in_memory()).await;
    let mut csms = transport.accept().await;
    boot(&mut csms).await;

    // both connectors advertise after the first boot
    let mut seen = Vec::new();
    for _ in 0..2 {
        let (unique_id, payload) = csms.expect_call("StatusNotification").await;
        seen.push((
            payload["evseId"].as_i64().unwrap(),
            payload["connectorStatus"].as_str().unwrap().to_string(),
        ));
        csms.reply(&unique_id, serde_json::json!({}));
    }
    seen.sort();
    assert_eq!(
        seen,
        vec![(1, "Available".to_string()), (2, "Available".to_string())]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn s1_stop_transaction_resurrected_after_restart() {
    // a previous life: one transaction stopped on PowerLoss, never reported
    let db_path = std::env::temp_dir().join(format!("station-s1-{}.db", Uuid::new_v4()));
    let database = DatabaseConfig::sqlite(db_path.to_str().unwrap());
    {
        let handler = DatabaseHandler::new(init_database(&database).await.unwrap());
        let mut tx = Transaction::new("4711", 1, 1, "TOKEN-1", Utc::now(), 100.0);
        tx.stop(Utc::now(), 5000.0, StopReason::PowerLoss);
        handler.insert_transaction(&tx).await.unwrap();
    }

    let (_cp, transport) = start_station(OcppVersion::V16, database.clone()).await;
    let mut csms = transport.accept().await;
    boot(&mut csms).await;

    let (unique_id, payload) = csms.expect_call("StopTransaction").await;
    assert_eq!(payload["transactionId"], 4711);
    assert_eq!(payload["reason"], "PowerLoss");
    assert_eq!(payload["meterStop"], 5000);
    csms.reply(&unique_id, serde_json::json!({}));

    // on acknowledgement the record is deleted
    tokio::time::sleep(Duration::from_millis(200)).await;
    let handler = DatabaseHandler::new(init_database(&database).await.unwrap());
    assert!(handler.all_transactions().await.unwrap().is_empty());
    let _ = std::fs::remove_file(db_path);
}

#[tokio::test(flavor = "multi_thread")]
async fn v16_transaction_id_assignment_flow() {
    let (cp, transport) = start_station(OcppVersion::V16, DatabaseConfig::in_memory()).await;
    let mut csms = transport.accept().await;
    boot(&mut csms).await;

    cp.on_session_started(1, 1, "TOKEN-1", 100.0, None, None)
        .await
        .unwrap();

    let (unique_id, payload) = csms.expect_call("StartTransaction").await;
    assert_eq!(payload["connectorId"], 1);
    assert_eq!(payload["idTag"], "TOKEN-1");
    assert_eq!(payload["meterStart"], 100);
    csms.reply(
        &unique_id,
        serde_json::json!({"transactionId": 77, "idTagInfo": {"status": "Accepted"}}),
    );
    tokio::time::sleep(Duration::from_millis(200)).await;

    cp.on_session_finished(1, 2600.0, StopReason::Local)
        .await
        .unwrap();
    let (unique_id, payload) = csms.expect_call("StopTransaction").await;
    // the CSMS-assigned id travels in the stop
    assert_eq!(payload["transactionId"], 77);
    assert_eq!(payload["meterStop"], 2600);
    assert_eq!(payload["reason"], "Local");
    csms.reply(&unique_id, serde_json::json!({}));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(cp.db.all_transactions().await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn v201_session_emits_transaction_events() {
    let (cp, transport) = start_station(OcppVersion::V201, DatabaseConfig::in_memory()).await;
    let mut csms = transport.accept().await;
    boot(&mut csms).await;

    let tx_id = cp
        .on_session_started(1, 1, "TOKEN-2", 0.0, None, None)
        .await
        .unwrap();

    let (unique_id, payload) = csms.expect_call("TransactionEvent").await;
    assert_eq!(payload["eventType"], "Started");
    assert_eq!(payload["seqNo"], 0);
    assert_eq!(payload["transactionInfo"]["transactionId"], tx_id.as_str());
    assert_eq!(payload["evse"]["id"], 1);
    csms.reply(&unique_id, serde_json::json!({}));

    cp.on_meter_value(1, energy_sample(1200.0)).await.unwrap();
    let (unique_id, payload) = csms.expect_call("TransactionEvent").await;
    assert_eq!(payload["eventType"], "Updated");
    assert_eq!(payload["seqNo"], 1);
    assert_eq!(
        payload["meterValue"][0]["sampledValue"][0]["value"],
        1200.0
    );
    csms.reply(&unique_id, serde_json::json!({}));

    cp.on_session_finished(1, 2400.0, StopReason::EVDisconnected)
        .await
        .unwrap();
    let (unique_id, payload) = csms.expect_call("TransactionEvent").await;
    assert_eq!(payload["eventType"], "Ended");
    assert_eq!(payload["transactionInfo"]["stoppedReason"], "EVDisconnected");
    csms.reply(&unique_id, serde_json::json!({}));

    // graceful stop drains the (now empty) queue and signals embedder tasks
    cp.stop(Duration::from_millis(500)).await;
    assert!(cp.shutdown_signal().is_triggered());
}

#[tokio::test(flavor = "multi_thread")]
async fn inbound_change_availability_and_unknown_action() {
    let (cp, transport) = start_station(OcppVersion::V201, DatabaseConfig::in_memory()).await;
    let mut csms = transport.accept().await;
    boot(&mut csms).await;

    let call_id = csms.call(
        "ChangeAvailability",
        serde_json::json!({"operationalStatus": "Inoperative", "evse": {"id": 1}}),
    );
    let result = csms.expect_result(&call_id).await;
    assert_eq!(result["status"], "Accepted");
    assert_eq!(
        cp.connector_status(1, 1).unwrap(),
        crate::domain::ConnectorStatus::Unavailable
    );

    let call_id = csms.call("MadeUpAction", serde_json::json!({}));
    let code = csms.expect_call_error(&call_id).await;
    assert_eq!(code, "NotImplemented");
}

#[tokio::test(flavor = "multi_thread")]
async fn inbound_get_variables_reads_device_model() {
    let (_cp, transport) = start_station(OcppVersion::V201, DatabaseConfig::in_memory()).await;
    let mut csms = transport.accept().await;
    boot(&mut csms).await;

    let call_id = csms.call(
        "GetVariables",
        serde_json::json!({"getVariableData": [
            {"component": {"name": "OCPPCommCtrlr"}, "variable": {"name": "HeartbeatInterval"}},
            {"component": {"name": "OCPPCommCtrlr"}, "variable": {"name": "NoSuchVariable"}},
        ]}),
    );
    let result = csms.expect_result(&call_id).await;
    let results = result["getVariableResult"].as_array().unwrap();
    assert_eq!(results[0]["attributeStatus"], "Accepted");
    assert_eq!(results[0]["attributeValue"], "300");
    assert_eq!(results[1]["attributeStatus"], "UnknownVariable");
}
