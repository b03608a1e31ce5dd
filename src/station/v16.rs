//! OCPP 1.6 wire glue
//!
//! Payload construction and inbound CALL dispatch for OCPP 1.6. The 1.6
//! wire has no EVSE concept: connector `c` on the wire maps to this
//! library's EVSE `c`, connector 1, and connector 0 addresses the whole
//! charge point. Typed request/response structs come from `rust_ocpp`
//! where the shapes are settled; the remaining payloads are built as wire
//! JSON directly.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_ocpp::v1_6::messages::authorize::{AuthorizeRequest, AuthorizeResponse};
use rust_ocpp::v1_6::messages::reserve_now::ReserveNowRequest;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::authorization::{AuthorizeWire, LocalListEntry};
use crate::availability::AvailabilityScope;
use crate::device_model::{Mutability, SetVariableOutcome};
use crate::domain::{
    AuthorizationStatus, ChargingProfilePurpose, ConnectorStatus, IdTokenInfo, MeterValue,
    OperationalStatus, Transaction,
};
use crate::infrastructure::database::handler::ProfileFilter;
use crate::queue::record::MessageKind;
use crate::reservation::{CancelReservationStatus, ReservationRequest, ReserveNowStatus};
use crate::station::callbacks::ResetKind;
use crate::station::ChargePoint;
use crate::support::{OcppFrame, RpcErrorCode};

// ── AuthorizeWire ──────────────────────────────────────────────

pub struct V16Wire;

impl AuthorizeWire for V16Wire {
    fn build_request(&self, id_token: &str, _certificate: Option<&str>) -> (&'static str, Value) {
        let request = AuthorizeRequest {
            id_tag: id_token.to_string(),
        };
        ("Authorize", serde_json::to_value(&request).unwrap_or_default())
    }

    fn parse_response(&self, payload: &Value) -> Option<IdTokenInfo> {
        let response: AuthorizeResponse = serde_json::from_value(payload.clone()).ok()?;
        let status = AuthorizationStatus::parse(&format!("{:?}", response.id_tag_info.status))?;
        Some(IdTokenInfo {
            status,
            cache_expiry: response.id_tag_info.expiry_date,
            parent_id_token: response.id_tag_info.parent_id_tag,
        })
    }
}

// ── Wire mappings ──────────────────────────────────────────────

/// Wire connector number for an (EVSE, connector) pair.
pub(super) fn wire_connector(evse_id: i32, _connector_id: i32) -> i32 {
    evse_id
}

fn status_str(status: ConnectorStatus) -> &'static str {
    match status {
        ConnectorStatus::Available => "Available",
        // 1.6 has no Occupied; a plugged-in connector reports Preparing
        ConnectorStatus::Occupied => "Preparing",
        ConnectorStatus::Reserved => "Reserved",
        ConnectorStatus::Unavailable => "Unavailable",
        ConnectorStatus::Faulted => "Faulted",
    }
}

// ── Outbound payloads ──────────────────────────────────────────

pub(super) fn boot_notification(vendor: &str, model: &str, firmware: Option<&str>) -> Value {
    let mut payload = json!({
        "chargePointVendor": vendor,
        "chargePointModel": model,
    });
    if let Some(firmware) = firmware {
        payload["firmwareVersion"] = json!(firmware);
    }
    payload
}

pub(super) fn status_notification(evse_id: i32, connector_id: i32, status: ConnectorStatus) -> Value {
    json!({
        "connectorId": wire_connector(evse_id, connector_id),
        "errorCode": if status == ConnectorStatus::Faulted { "OtherError" } else { "NoError" },
        "status": status_str(status),
        "timestamp": Utc::now().to_rfc3339(),
    })
}

pub(super) fn start_transaction(tx: &Transaction) -> Value {
    let mut payload = json!({
        "connectorId": wire_connector(tx.evse_id, tx.connector_id),
        "idTag": tx.id_token,
        "meterStart": tx.start_meter_wh.round() as i64,
        "timestamp": tx.start_time.to_rfc3339(),
    });
    if let Some(reservation_id) = tx.reservation_id {
        payload["reservationId"] = json!(reservation_id);
    }
    payload
}

/// `wire_tx_id`: the CSMS-assigned integer when known, else the local
/// placeholder that the queue rewrites on StartTransactionResponse.
pub(super) fn stop_transaction(tx: &Transaction, wire_tx_id: Value) -> Value {
    let mut payload = json!({
        "transactionId": wire_tx_id,
        "idTag": tx.id_token,
        "meterStop": tx.stop_meter_wh.unwrap_or(tx.start_meter_wh).round() as i64,
        "timestamp": tx.stop_time.unwrap_or_else(Utc::now).to_rfc3339(),
    });
    if let Some(reason) = tx.stop_reason {
        payload["reason"] = json!(reason.as_str());
    }
    payload
}

pub(super) fn meter_values(tx: &Transaction, wire_tx_id: Value, sample: &MeterValue) -> Value {
    json!({
        "connectorId": wire_connector(tx.evse_id, tx.connector_id),
        "transactionId": wire_tx_id,
        "meterValue": [meter_value_json(sample)],
    })
}

fn meter_value_json(sample: &MeterValue) -> Value {
    let sampled: Vec<Value> = sample
        .sampled_values
        .iter()
        .map(|sv| {
            let mut out = json!({
                // 1.6 sampled values are strings on the wire
                "value": format!("{}", sv.value),
                "measurand": sv.measurand.as_str(),
            });
            if let Some(phase) = &sv.phase {
                out["phase"] = json!(phase);
            }
            if let Some(unit) = &sv.unit {
                out["unit"] = json!(unit);
            }
            if let Some(context) = &sv.context {
                out["context"] = json!(context.as_str());
            }
            out
        })
        .collect();
    json!({
        "timestamp": sample.timestamp.to_rfc3339(),
        "sampledValue": sampled,
    })
}

// ── Inbound dispatch ───────────────────────────────────────────

pub(super) async fn dispatch(
    cp: Arc<ChargePoint>,
    unique_id: String,
    action: String,
    payload: Value,
) -> OcppFrame {
    match action.as_str() {
        "ChangeAvailability" => change_availability(&cp, &unique_id, &payload).await,
        "ReserveNow" => reserve_now(&cp, &unique_id, &payload),
        "CancelReservation" => cancel_reservation(&cp, &unique_id, &payload),
        "SetChargingProfile" => set_charging_profile(&cp, &unique_id, &payload).await,
        "ClearChargingProfile" => clear_charging_profile(&cp, &unique_id, &payload).await,
        "GetCompositeSchedule" => get_composite_schedule(&cp, &unique_id, &payload),
        "TriggerMessage" => trigger_message(&cp, &unique_id, &payload).await,
        "Reset" => reset(&cp, &unique_id, &payload),
        "UnlockConnector" => unlock_connector(&cp, &unique_id, &payload),
        "RemoteStartTransaction" => remote_start(&cp, &unique_id, &payload),
        "RemoteStopTransaction" => remote_stop(&cp, &unique_id, &payload),
        "ClearCache" => clear_cache(&cp, &unique_id).await,
        "SendLocalList" => send_local_list(&cp, &unique_id, &payload),
        "GetLocalListVersion" => OcppFrame::result(
            unique_id,
            json!({"listVersion": cp.authorization.local_list_version()}),
        ),
        "GetConfiguration" => get_configuration(&cp, &unique_id, &payload),
        "ChangeConfiguration" => change_configuration(&cp, &unique_id, &payload),
        "CertificateSigned" => certificate_signed(&cp, &unique_id, &payload).await,
        "DataTransfer" => OcppFrame::result(unique_id, json!({"status": "UnknownVendorId"})),
        "UpdateFirmware" => update_firmware(&cp, &unique_id, &payload),
        _ => OcppFrame::error(
            unique_id,
            RpcErrorCode::NotImplemented,
            format!("Action {} is not implemented", action),
        ),
    }
}

fn format_violation(unique_id: &str, what: &str) -> OcppFrame {
    OcppFrame::error(unique_id, RpcErrorCode::FormatViolation, what)
}

async fn change_availability(cp: &Arc<ChargePoint>, unique_id: &str, payload: &Value) -> OcppFrame {
    let Some(connector_id) = payload["connectorId"].as_i64() else {
        return format_violation(unique_id, "connectorId missing");
    };
    let status = match payload["type"].as_str() {
        Some("Operative") => OperationalStatus::Operative,
        Some("Inoperative") => OperationalStatus::Inoperative,
        _ => return format_violation(unique_id, "type must be Operative or Inoperative"),
    };
    let scope = if connector_id == 0 {
        AvailabilityScope::station()
    } else {
        AvailabilityScope::evse(connector_id as i32)
    };
    let result = cp.availability.change_availability(scope, status).await;
    OcppFrame::result(unique_id, json!({"status": format!("{:?}", result)}))
}

fn reserve_now(cp: &Arc<ChargePoint>, unique_id: &str, payload: &Value) -> OcppFrame {
    let request: ReserveNowRequest = match serde_json::from_value(payload.clone()) {
        Ok(r) => r,
        Err(e) => return format_violation(unique_id, &format!("ReserveNow: {}", e)),
    };
    let status = cp.reservation.reserve_now(ReservationRequest {
        id: request.reservation_id,
        evse_id: Some(request.connector_id as i32),
        connector_type: None,
        id_token: request.id_tag,
        group_id_token: request.parent_id_tag,
        expiry: request.expiry_date,
    });
    let status = match status {
        ReserveNowStatus::Accepted => "Accepted",
        ReserveNowStatus::Faulted => "Faulted",
        ReserveNowStatus::Occupied => "Occupied",
        ReserveNowStatus::Rejected => "Rejected",
        ReserveNowStatus::Unavailable => "Unavailable",
    };
    OcppFrame::result(unique_id, json!({"status": status}))
}

fn cancel_reservation(cp: &Arc<ChargePoint>, unique_id: &str, payload: &Value) -> OcppFrame {
    let Some(reservation_id) = payload["reservationId"].as_i64() else {
        return format_violation(unique_id, "reservationId missing");
    };
    let status = match cp.reservation.cancel_reservation(reservation_id as i32) {
        CancelReservationStatus::Accepted => "Accepted",
        CancelReservationStatus::Rejected => "Rejected",
    };
    OcppFrame::result(unique_id, json!({"status": status}))
}

/// Convert a 1.6 `csChargingProfiles` object into the internal profile
/// shape (2.x field names, string transaction ids).
fn convert_profile(mut wire: Value) -> Result<crate::domain::ChargingProfile, String> {
    if let Some(obj) = wire.as_object_mut() {
        if let Some(id) = obj.remove("chargingProfileId") {
            obj.insert("id".to_string(), id);
        }
        let numeric_tx = obj.get("transactionId").and_then(|t| t.as_i64());
        if let Some(tx_num) = numeric_tx {
            obj.insert("transactionId".to_string(), json!(tx_num.to_string()));
        }
    }
    serde_json::from_value(wire).map_err(|e| e.to_string())
}

async fn set_charging_profile(cp: &Arc<ChargePoint>, unique_id: &str, payload: &Value) -> OcppFrame {
    let Some(connector_id) = payload["connectorId"].as_i64() else {
        return format_violation(unique_id, "connectorId missing");
    };
    let profile = match convert_profile(payload["csChargingProfiles"].clone()) {
        Ok(p) => p,
        Err(e) => return format_violation(unique_id, &format!("csChargingProfiles: {}", e)),
    };
    let evse_id = connector_id as i32;
    let session = cp.session_context(evse_id);
    match cp
        .smart_charging
        .add_profile(
            profile,
            evse_id,
            crate::domain::ProfileSource::Ocpp,
            session.as_ref(),
        )
        .await
    {
        Ok(()) => {
            cp.notify_charging_limit_changed(evse_id);
            OcppFrame::result(unique_id, json!({"status": "Accepted"}))
        }
        Err(rejection) => {
            info!(code = rejection.code, detail = rejection.detail.as_str(),
                  "SetChargingProfile rejected");
            OcppFrame::result(unique_id, json!({"status": "Rejected"}))
        }
    }
}

async fn clear_charging_profile(
    cp: &Arc<ChargePoint>,
    unique_id: &str,
    payload: &Value,
) -> OcppFrame {
    let filter = ProfileFilter {
        profile_id: payload["id"].as_i64().map(|v| v as i32),
        evse_id: payload["connectorId"].as_i64().map(|v| v as i32),
        purpose: payload["chargingProfilePurpose"]
            .as_str()
            .and_then(ChargingProfilePurpose::parse),
        stack_level: payload["stackLevel"].as_i64().map(|v| v as i32),
        transaction_id: None,
    };
    let cleared = cp.smart_charging.clear_profiles(&filter).await;
    let status = if cleared > 0 { "Accepted" } else { "Unknown" };
    OcppFrame::result(unique_id, json!({"status": status}))
}

fn get_composite_schedule(cp: &Arc<ChargePoint>, unique_id: &str, payload: &Value) -> OcppFrame {
    let Some(connector_id) = payload["connectorId"].as_i64() else {
        return format_violation(unique_id, "connectorId missing");
    };
    let Some(duration) = payload["duration"].as_i64() else {
        return format_violation(unique_id, "duration missing");
    };
    let unit = payload["chargingRateUnit"]
        .as_str()
        .and_then(crate::domain::ChargingRateUnit::parse)
        .unwrap_or(crate::domain::ChargingRateUnit::A);

    let evse_id = connector_id as i32;
    let start = Utc::now();
    let end = start + chrono::Duration::seconds(duration);
    let session = cp.session_context(evse_id);
    let schedule = cp
        .smart_charging
        .get_composite_schedule(evse_id, start, end, unit, session.as_ref());

    let periods: Vec<Value> = schedule
        .charging_schedule_period
        .iter()
        .map(|p| {
            let mut out = json!({"startPeriod": p.start_period, "limit": p.limit});
            if let Some(phases) = p.number_phases {
                out["numberPhases"] = json!(phases);
            }
            out
        })
        .collect();
    OcppFrame::result(
        unique_id,
        json!({
            "status": "Accepted",
            "connectorId": connector_id,
            "scheduleStart": schedule.schedule_start.to_rfc3339(),
            "chargingSchedule": {
                "duration": schedule.duration,
                "startSchedule": schedule.schedule_start.to_rfc3339(),
                "chargingRateUnit": schedule.charging_rate_unit.as_str(),
                "chargingSchedulePeriod": periods,
            },
        }),
    )
}

async fn trigger_message(cp: &Arc<ChargePoint>, unique_id: &str, payload: &Value) -> OcppFrame {
    let Some(requested) = payload["requestedMessage"].as_str() else {
        return format_violation(unique_id, "requestedMessage missing");
    };
    let connector_id = payload["connectorId"].as_i64().map(|v| v as i32);
    match requested {
        "Heartbeat" => {
            cp.send_heartbeat(MessageKind::Triggered).await;
            OcppFrame::result(unique_id, json!({"status": "Accepted"}))
        }
        "StatusNotification" => {
            match connector_id {
                Some(connector) if connector > 0 => {
                    let _ = cp
                        .state
                        .send_status_notification_single_connector(connector, 1);
                }
                _ => cp.state.send_status_notification_all_connectors(),
            }
            OcppFrame::result(unique_id, json!({"status": "Accepted"}))
        }
        "BootNotification" => {
            cp.clone().spawn_boot_notification();
            OcppFrame::result(unique_id, json!({"status": "Accepted"}))
        }
        "MeterValues" => {
            cp.send_triggered_meter_values(connector_id).await;
            OcppFrame::result(unique_id, json!({"status": "Accepted"}))
        }
        "DiagnosticsStatusNotification" | "FirmwareStatusNotification" => {
            OcppFrame::result(unique_id, json!({"status": "NotImplemented"}))
        }
        _ => OcppFrame::result(unique_id, json!({"status": "NotImplemented"})),
    }
}

fn reset(cp: &Arc<ChargePoint>, unique_id: &str, payload: &Value) -> OcppFrame {
    let kind = match payload["type"].as_str() {
        Some("Hard") => ResetKind::Hard,
        Some("Soft") => ResetKind::Soft,
        _ => return format_violation(unique_id, "type must be Hard or Soft"),
    };
    let allowed = cp
        .callbacks
        .is_reset_allowed
        .as_ref()
        .map(|cb| cb(kind))
        .unwrap_or(false);
    if allowed {
        if let Some(do_reset) = cp.callbacks.do_reset.clone() {
            tokio::spawn(async move {
                do_reset(kind);
            });
        }
        OcppFrame::result(unique_id, json!({"status": "Accepted"}))
    } else {
        OcppFrame::result(unique_id, json!({"status": "Rejected"}))
    }
}

fn unlock_connector(cp: &Arc<ChargePoint>, unique_id: &str, payload: &Value) -> OcppFrame {
    let Some(connector_id) = payload["connectorId"].as_i64() else {
        return format_violation(unique_id, "connectorId missing");
    };
    let unlocked = cp
        .callbacks
        .unlock_connector
        .as_ref()
        .map(|cb| cb(connector_id as i32, 1))
        .unwrap_or(false);
    let status = if unlocked { "Unlocked" } else { "UnlockFailed" };
    OcppFrame::result(unique_id, json!({"status": status}))
}

fn remote_start(cp: &Arc<ChargePoint>, unique_id: &str, payload: &Value) -> OcppFrame {
    let Some(id_tag) = payload["idTag"].as_str() else {
        return format_violation(unique_id, "idTag missing");
    };
    let evse_id = payload["connectorId"].as_i64().unwrap_or(1) as i32;
    let accepted = cp
        .callbacks
        .remote_start
        .as_ref()
        .map(|cb| cb(evse_id, id_tag.to_string(), None))
        .unwrap_or(false);
    let status = if accepted { "Accepted" } else { "Rejected" };
    OcppFrame::result(unique_id, json!({"status": status}))
}

fn remote_stop(cp: &Arc<ChargePoint>, unique_id: &str, payload: &Value) -> OcppFrame {
    let Some(wire_tx_id) = payload["transactionId"].as_i64() else {
        return format_violation(unique_id, "transactionId missing");
    };
    let transaction = cp.find_transaction_by_wire_id(&wire_tx_id.to_string());
    let accepted = match transaction {
        Some(tx) => cp
            .callbacks
            .remote_stop
            .as_ref()
            .map(|cb| cb(tx.transaction_id))
            .unwrap_or(false),
        None => false,
    };
    let status = if accepted { "Accepted" } else { "Rejected" };
    OcppFrame::result(unique_id, json!({"status": status}))
}

async fn clear_cache(cp: &Arc<ChargePoint>, unique_id: &str) -> OcppFrame {
    let status = if cp.authorization.clear_cache().await {
        "Accepted"
    } else {
        "Rejected"
    };
    OcppFrame::result(unique_id, json!({"status": status}))
}

fn send_local_list(cp: &Arc<ChargePoint>, unique_id: &str, payload: &Value) -> OcppFrame {
    let Some(version) = payload["listVersion"].as_i64() else {
        return format_violation(unique_id, "listVersion missing");
    };
    let full_update = match payload["updateType"].as_str() {
        Some("Full") => true,
        Some("Differential") => false,
        _ => return format_violation(unique_id, "updateType must be Full or Differential"),
    };
    let entries: Vec<LocalListEntry> = payload["localAuthorizationList"]
        .as_array()
        .map(|list| {
            list.iter()
                .filter_map(|entry| {
                    let id_token = entry["idTag"].as_str()?.to_string();
                    let info = entry.get("idTagInfo").and_then(|info| {
                        let status = AuthorizationStatus::parse(info["status"].as_str()?)?;
                        Some(IdTokenInfo {
                            status,
                            cache_expiry: info["expiryDate"]
                                .as_str()
                                .and_then(|s| s.parse::<DateTime<Utc>>().ok()),
                            parent_id_token: info["parentIdTag"].as_str().map(|s| s.to_string()),
                        })
                    });
                    Some(LocalListEntry { id_token, info })
                })
                .collect()
        })
        .unwrap_or_default();
    let status = if cp
        .authorization
        .update_local_list(version as i32, entries, full_update)
    {
        "Accepted"
    } else {
        "NotSupported"
    };
    OcppFrame::result(unique_id, json!({"status": status}))
}

fn get_configuration(cp: &Arc<ChargePoint>, unique_id: &str, payload: &Value) -> OcppFrame {
    let requested: Option<Vec<&str>> = payload["key"]
        .as_array()
        .map(|keys| keys.iter().filter_map(|k| k.as_str()).collect());
    let snapshot = cp.device_model.snapshot();

    let mut configuration_key = Vec::new();
    let mut unknown_key: Vec<String> = Vec::new();
    match requested {
        None => {
            for (_, variable, entry) in snapshot {
                configuration_key.push(json!({
                    "key": variable,
                    "readonly": entry.mutability == Mutability::ReadOnly,
                    "value": entry.value.to_string(),
                }));
            }
        }
        Some(keys) => {
            for key in keys {
                match snapshot.iter().find(|(_, variable, _)| variable == key) {
                    Some((_, variable, entry)) => configuration_key.push(json!({
                        "key": variable,
                        "readonly": entry.mutability == Mutability::ReadOnly,
                        "value": entry.value.to_string(),
                    })),
                    None => unknown_key.push(key.to_string()),
                }
            }
        }
    }
    OcppFrame::result(
        unique_id,
        json!({"configurationKey": configuration_key, "unknownKey": unknown_key}),
    )
}

fn change_configuration(cp: &Arc<ChargePoint>, unique_id: &str, payload: &Value) -> OcppFrame {
    let (Some(key), Some(value)) = (payload["key"].as_str(), payload["value"].as_str()) else {
        return format_violation(unique_id, "key and value required");
    };
    // 1.6 keys are flat; resolve the owning component by variable name
    let component = cp
        .device_model
        .snapshot()
        .into_iter()
        .find(|(_, variable, _)| variable == key)
        .map(|(component, _, _)| component);
    let status = match component {
        None => "NotSupported",
        Some(component) => match cp.device_model.set_value(&component, key, value) {
            SetVariableOutcome::Accepted => "Accepted",
            SetVariableOutcome::ReadOnly | SetVariableOutcome::Rejected => "Rejected",
            SetVariableOutcome::UnknownComponent | SetVariableOutcome::UnknownVariable => {
                "NotSupported"
            }
        },
    };
    OcppFrame::result(unique_id, json!({"status": status}))
}

async fn certificate_signed(cp: &Arc<ChargePoint>, unique_id: &str, payload: &Value) -> OcppFrame {
    let Some(chain) = payload["certificateChain"].as_str() else {
        return format_violation(unique_id, "certificateChain missing");
    };
    let result = cp.security.on_certificate_signed(chain, None).await;
    OcppFrame::result(unique_id, json!({"status": format!("{:?}", result)}))
}

fn update_firmware(cp: &Arc<ChargePoint>, unique_id: &str, payload: &Value) -> OcppFrame {
    match (
        payload["location"].as_str(),
        cp.callbacks.update_firmware.clone(),
    ) {
        (Some(location), Some(hook)) => {
            let location = location.to_string();
            tokio::spawn(async move {
                hook(location);
            });
        }
        _ => warn!("UpdateFirmware ignored: no firmware hook installed"),
    }
    // the 1.6 UpdateFirmware.conf carries no status
    OcppFrame::result(unique_id, json!({}))
}
