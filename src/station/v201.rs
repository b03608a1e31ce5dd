//! OCPP 2.0.1 / 2.1 wire glue
//!
//! Payload construction and inbound CALL dispatch for the 2.x family. The
//! transaction lifecycle is carried by TransactionEvent; the device model
//! is addressed through GetVariables / SetVariables. Typed structs from
//! `rust_ocpp` are used where the shapes are settled (Authorize), the rest
//! is built as wire JSON directly.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_ocpp::v2_0_1::messages::authorize::AuthorizeResponse;
use serde_json::{json, Value};
use tracing::info;

use crate::authorization::{AuthorizeWire, LocalListEntry};
use crate::availability::AvailabilityScope;
use crate::device_model::SetVariableOutcome;
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

pub struct V201Wire;

impl AuthorizeWire for V201Wire {
    fn build_request(&self, id_token: &str, certificate: Option<&str>) -> (&'static str, Value) {
        let mut payload = json!({
            "idToken": {"idToken": id_token, "type": "ISO14443"},
        });
        if let Some(certificate) = certificate {
            payload["certificate"] = json!(certificate);
        }
        ("Authorize", payload)
    }

    fn parse_response(&self, payload: &Value) -> Option<IdTokenInfo> {
        let response: AuthorizeResponse = serde_json::from_value(payload.clone()).ok()?;
        let info = response.id_token_info;
        let status = AuthorizationStatus::parse(&format!("{:?}", info.status))?;
        Some(IdTokenInfo {
            status,
            cache_expiry: info.cache_expiry_date_time,
            parent_id_token: info.group_id_token.map(|t| t.id_token),
        })
    }
}

// ── Outbound payloads ──────────────────────────────────────────

pub(super) fn boot_notification(vendor: &str, model: &str, firmware: Option<&str>) -> Value {
    let mut station = json!({"model": model, "vendorName": vendor});
    if let Some(firmware) = firmware {
        station["firmwareVersion"] = json!(firmware);
    }
    json!({"chargingStation": station, "reason": "PowerUp"})
}

pub(super) fn status_notification(evse_id: i32, connector_id: i32, status: ConnectorStatus) -> Value {
    json!({
        "timestamp": Utc::now().to_rfc3339(),
        "connectorStatus": status.as_str(),
        "evseId": evse_id,
        "connectorId": connector_id,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum TxEventKind {
    Started,
    Updated,
    Ended,
}

pub(super) fn transaction_event(
    kind: TxEventKind,
    trigger_reason: &str,
    seq_no: i32,
    tx: &Transaction,
    sample: Option<&MeterValue>,
) -> Value {
    let event_type = match kind {
        TxEventKind::Started => "Started",
        TxEventKind::Updated => "Updated",
        TxEventKind::Ended => "Ended",
    };
    let mut transaction_info = json!({"transactionId": tx.transaction_id});
    if kind == TxEventKind::Ended {
        if let Some(reason) = tx.stop_reason {
            transaction_info["stoppedReason"] = json!(reason.as_str());
        }
    }
    let mut payload = json!({
        "eventType": event_type,
        "timestamp": Utc::now().to_rfc3339(),
        "triggerReason": trigger_reason,
        "seqNo": seq_no,
        "transactionInfo": transaction_info,
        "evse": {"id": tx.evse_id, "connectorId": tx.connector_id},
    });
    if kind == TxEventKind::Started {
        payload["idToken"] = json!({"idToken": tx.id_token, "type": "ISO14443"});
        if let Some(reservation_id) = tx.reservation_id {
            payload["reservationId"] = json!(reservation_id);
        }
        if let Some(remote_start_id) = tx.remote_start_id {
            payload["remoteStartId"] = json!(remote_start_id);
        }
    }
    if let Some(sample) = sample {
        payload["meterValue"] = json!([meter_value_json(sample)]);
    }
    payload
}

fn meter_value_json(sample: &MeterValue) -> Value {
    let sampled: Vec<Value> = sample
        .sampled_values
        .iter()
        .map(|sv| {
            let mut out = json!({
                "value": sv.value,
                "measurand": sv.measurand.as_str(),
            });
            if let Some(phase) = &sv.phase {
                out["phase"] = json!(phase);
            }
            if let Some(unit) = &sv.unit {
                out["unitOfMeasure"] = json!({"unit": unit});
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
        "GetChargingProfiles" => get_charging_profiles(&cp, &unique_id, &payload).await,
        "GetCompositeSchedule" => get_composite_schedule(&cp, &unique_id, &payload),
        "TriggerMessage" => trigger_message(&cp, &unique_id, &payload).await,
        "Reset" => reset(&cp, &unique_id, &payload),
        "UnlockConnector" => unlock_connector(&cp, &unique_id, &payload),
        "RequestStartTransaction" => request_start(&cp, &unique_id, &payload),
        "RequestStopTransaction" => request_stop(&cp, &unique_id, &payload),
        "ClearCache" => clear_cache(&cp, &unique_id).await,
        "SendLocalList" => send_local_list(&cp, &unique_id, &payload),
        "GetLocalListVersion" => OcppFrame::result(
            unique_id,
            json!({"versionNumber": cp.authorization.local_list_version()}),
        ),
        "GetVariables" => get_variables(&cp, &unique_id, &payload),
        "SetVariables" => set_variables(&cp, &unique_id, &payload),
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
    let status = match payload["operationalStatus"].as_str() {
        Some("Operative") => OperationalStatus::Operative,
        Some("Inoperative") => OperationalStatus::Inoperative,
        _ => return format_violation(unique_id, "operationalStatus missing"),
    };
    let scope = match payload.get("evse") {
        None => AvailabilityScope::station(),
        Some(evse) => {
            let Some(evse_id) = evse["id"].as_i64() else {
                return format_violation(unique_id, "evse.id missing");
            };
            match evse["connectorId"].as_i64() {
                Some(connector_id) => {
                    AvailabilityScope::connector(evse_id as i32, connector_id as i32)
                }
                None => AvailabilityScope::evse(evse_id as i32),
            }
        }
    };
    let result = cp.availability.change_availability(scope, status).await;
    OcppFrame::result(unique_id, json!({"status": format!("{:?}", result)}))
}

fn reserve_now(cp: &Arc<ChargePoint>, unique_id: &str, payload: &Value) -> OcppFrame {
    let (Some(id), Some(expiry), Some(id_token)) = (
        payload["id"].as_i64(),
        payload["expiryDateTime"]
            .as_str()
            .and_then(|s| s.parse::<DateTime<Utc>>().ok()),
        payload["idToken"]["idToken"].as_str(),
    ) else {
        return format_violation(unique_id, "id, expiryDateTime and idToken required");
    };
    let status = cp.reservation.reserve_now(ReservationRequest {
        id: id as i32,
        evse_id: payload["evseId"].as_i64().map(|v| v as i32),
        connector_type: payload["connectorType"].as_str().map(|s| s.to_string()),
        id_token: id_token.to_string(),
        group_id_token: payload["groupIdToken"]["idToken"].as_str().map(|s| s.to_string()),
        expiry,
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

/// Convert a 2.x `chargingProfile` object to the internal shape. The wire
/// carries `chargingSchedule` as an array; the first schedule is used.
fn convert_profile(mut wire: Value) -> Result<crate::domain::ChargingProfile, String> {
    if let Some(obj) = wire.as_object_mut() {
        if let Some(schedules) = obj.get_mut("chargingSchedule") {
            if let Some(first) = schedules.as_array().and_then(|a| a.first()).cloned() {
                *schedules = first;
            }
        }
    }
    serde_json::from_value(wire).map_err(|e| e.to_string())
}

async fn set_charging_profile(cp: &Arc<ChargePoint>, unique_id: &str, payload: &Value) -> OcppFrame {
    let Some(evse_id) = payload["evseId"].as_i64() else {
        return format_violation(unique_id, "evseId missing");
    };
    let profile = match convert_profile(payload["chargingProfile"].clone()) {
        Ok(p) => p,
        Err(e) => return format_violation(unique_id, &format!("chargingProfile: {}", e)),
    };
    let evse_id = evse_id as i32;
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
            OcppFrame::result(
                unique_id,
                json!({
                    "status": "Rejected",
                    "statusInfo": {"reasonCode": rejection.code, "additionalInfo": rejection.detail},
                }),
            )
        }
    }
}

async fn clear_charging_profile(
    cp: &Arc<ChargePoint>,
    unique_id: &str,
    payload: &Value,
) -> OcppFrame {
    let criteria = &payload["chargingProfileCriteria"];
    let filter = ProfileFilter {
        profile_id: payload["chargingProfileId"].as_i64().map(|v| v as i32),
        evse_id: criteria["evseId"].as_i64().map(|v| v as i32),
        purpose: criteria["chargingProfilePurpose"]
            .as_str()
            .and_then(ChargingProfilePurpose::parse),
        stack_level: criteria["stackLevel"].as_i64().map(|v| v as i32),
        transaction_id: None,
    };
    let cleared = cp.smart_charging.clear_profiles(&filter).await;
    let status = if cleared > 0 { "Accepted" } else { "Unknown" };
    OcppFrame::result(unique_id, json!({"status": status}))
}

async fn get_charging_profiles(
    cp: &Arc<ChargePoint>,
    unique_id: &str,
    payload: &Value,
) -> OcppFrame {
    let Some(request_id) = payload["requestId"].as_i64() else {
        return format_violation(unique_id, "requestId missing");
    };
    let criteria = &payload["chargingProfile"];
    let filter = ProfileFilter {
        profile_id: None,
        evse_id: payload["evseId"].as_i64().map(|v| v as i32),
        purpose: criteria["chargingProfilePurpose"]
            .as_str()
            .and_then(ChargingProfilePurpose::parse),
        stack_level: criteria["stackLevel"].as_i64().map(|v| v as i32),
        transaction_id: None,
    };
    let profiles = cp.smart_charging.get_reported_profiles(&filter);
    if profiles.is_empty() {
        return OcppFrame::result(unique_id, json!({"status": "NoProfiles"}));
    }

    // report asynchronously, one ReportChargingProfiles per EVSE grouping
    let queue = cp.queue.clone();
    tokio::spawn(async move {
        let mut by_evse: std::collections::BTreeMap<i32, Vec<Value>> = Default::default();
        for stored in &profiles {
            let mut profile = serde_json::to_value(&stored.profile).unwrap_or_default();
            // internal single schedule back to the wire's array form
            if let Some(obj) = profile.as_object_mut() {
                if let Some(schedule) = obj.remove("chargingSchedule") {
                    obj.insert("chargingSchedule".to_string(), json!([schedule]));
                }
            }
            by_evse.entry(stored.evse_id).or_default().push(profile);
        }
        for (evse_id, profiles) in by_evse {
            let _ = queue
                .enqueue(
                    "ReportChargingProfiles",
                    json!({
                        "requestId": request_id,
                        "chargingLimitSource": "CSO",
                        "evseId": evse_id,
                        "chargingProfile": profiles,
                    }),
                    MessageKind::Normal,
                    Default::default(),
                )
                .await;
        }
    });
    OcppFrame::result(unique_id, json!({"status": "Accepted"}))
}

fn get_composite_schedule(cp: &Arc<ChargePoint>, unique_id: &str, payload: &Value) -> OcppFrame {
    let (Some(evse_id), Some(duration)) =
        (payload["evseId"].as_i64(), payload["duration"].as_i64())
    else {
        return format_violation(unique_id, "evseId and duration required");
    };
    let unit = payload["chargingRateUnit"]
        .as_str()
        .and_then(crate::domain::ChargingRateUnit::parse)
        .unwrap_or(crate::domain::ChargingRateUnit::A);

    let evse_id = evse_id as i32;
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
            if let Some(phase) = p.phase_to_use {
                out["phaseToUse"] = json!(phase);
            }
            out
        })
        .collect();
    OcppFrame::result(
        unique_id,
        json!({
            "status": "Accepted",
            "schedule": {
                "evseId": evse_id,
                "duration": schedule.duration,
                "scheduleStart": schedule.schedule_start.to_rfc3339(),
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
    let evse_id = payload["evse"]["id"].as_i64().map(|v| v as i32);
    let connector_id = payload["evse"]["connectorId"].as_i64().map(|v| v as i32);
    match requested {
        "Heartbeat" => {
            cp.send_heartbeat(MessageKind::Triggered).await;
            OcppFrame::result(unique_id, json!({"status": "Accepted"}))
        }
        "StatusNotification" => {
            match (evse_id, connector_id) {
                (Some(evse), Some(connector)) => {
                    let _ = cp.state.send_status_notification_single_connector(evse, connector);
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
            cp.send_triggered_meter_values(evse_id).await;
            OcppFrame::result(unique_id, json!({"status": "Accepted"}))
        }
        "SignChargingStationCertificate" => {
            let cp = cp.clone();
            tokio::spawn(async move {
                let _ = cp
                    .security
                    .sign_certificate(
                        crate::infrastructure::security::CertificateSigningUse::ChargingStationCertificate,
                        &cp.config.station_id,
                    )
                    .await;
            });
            OcppFrame::result(unique_id, json!({"status": "Accepted"}))
        }
        "SignV2GCertificate" => {
            let cp = cp.clone();
            tokio::spawn(async move {
                let _ = cp
                    .security
                    .sign_certificate(
                        crate::infrastructure::security::CertificateSigningUse::V2GCertificate,
                        &cp.config.station_id,
                    )
                    .await;
            });
            OcppFrame::result(unique_id, json!({"status": "Accepted"}))
        }
        _ => OcppFrame::result(unique_id, json!({"status": "NotImplemented"})),
    }
}

fn reset(cp: &Arc<ChargePoint>, unique_id: &str, payload: &Value) -> OcppFrame {
    let kind = match payload["type"].as_str() {
        Some("Immediate") => ResetKind::Hard,
        Some("OnIdle") => ResetKind::Soft,
        _ => return format_violation(unique_id, "type must be Immediate or OnIdle"),
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
    let (Some(evse_id), Some(connector_id)) =
        (payload["evseId"].as_i64(), payload["connectorId"].as_i64())
    else {
        return format_violation(unique_id, "evseId and connectorId required");
    };
    let unlocked = cp
        .callbacks
        .unlock_connector
        .as_ref()
        .map(|cb| cb(evse_id as i32, connector_id as i32))
        .unwrap_or(false);
    let status = if unlocked { "Unlocked" } else { "UnlockFailed" };
    OcppFrame::result(unique_id, json!({"status": status}))
}

fn request_start(cp: &Arc<ChargePoint>, unique_id: &str, payload: &Value) -> OcppFrame {
    let (Some(id_token), Some(remote_start_id)) = (
        payload["idToken"]["idToken"].as_str(),
        payload["remoteStartId"].as_i64(),
    ) else {
        return format_violation(unique_id, "idToken and remoteStartId required");
    };
    let evse_id = payload["evseId"].as_i64().unwrap_or(1) as i32;
    let accepted = cp
        .callbacks
        .remote_start
        .as_ref()
        .map(|cb| cb(evse_id, id_token.to_string(), Some(remote_start_id as i32)))
        .unwrap_or(false);
    let status = if accepted { "Accepted" } else { "Rejected" };
    OcppFrame::result(unique_id, json!({"status": status}))
}

fn request_stop(cp: &Arc<ChargePoint>, unique_id: &str, payload: &Value) -> OcppFrame {
    let Some(transaction_id) = payload["transactionId"].as_str() else {
        return format_violation(unique_id, "transactionId missing");
    };
    let accepted = match cp.find_transaction_by_wire_id(transaction_id) {
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
    let Some(version) = payload["versionNumber"].as_i64() else {
        return format_violation(unique_id, "versionNumber missing");
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
                    let id_token = entry["idToken"]["idToken"].as_str()?.to_string();
                    let info = entry.get("idTokenInfo").and_then(|info| {
                        let status = AuthorizationStatus::parse(info["status"].as_str()?)?;
                        Some(IdTokenInfo {
                            status,
                            cache_expiry: info["cacheExpiryDateTime"]
                                .as_str()
                                .and_then(|s| s.parse::<DateTime<Utc>>().ok()),
                            parent_id_token: info["groupIdToken"]["idToken"]
                                .as_str()
                                .map(|s| s.to_string()),
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
        "Failed"
    };
    OcppFrame::result(unique_id, json!({"status": status}))
}

fn get_variables(cp: &Arc<ChargePoint>, unique_id: &str, payload: &Value) -> OcppFrame {
    let Some(requests) = payload["getVariableData"].as_array() else {
        return format_violation(unique_id, "getVariableData missing");
    };
    let snapshot = cp.device_model.snapshot();
    let results: Vec<Value> = requests
        .iter()
        .map(|request| {
            let component = request["component"]["name"].as_str().unwrap_or("");
            let variable = request["variable"]["name"].as_str().unwrap_or("");
            let hit = snapshot
                .iter()
                .find(|(c, v, _)| c == component && v == variable);
            match hit {
                Some((_, _, entry)) => json!({
                    "attributeStatus": "Accepted",
                    "attributeValue": entry.value.to_string(),
                    "component": {"name": component},
                    "variable": {"name": variable},
                }),
                None => {
                    let component_known = snapshot.iter().any(|(c, _, _)| c == component);
                    json!({
                        "attributeStatus": if component_known { "UnknownVariable" } else { "UnknownComponent" },
                        "component": {"name": component},
                        "variable": {"name": variable},
                    })
                }
            }
        })
        .collect();
    OcppFrame::result(unique_id, json!({"getVariableResult": results}))
}

fn set_variables(cp: &Arc<ChargePoint>, unique_id: &str, payload: &Value) -> OcppFrame {
    let Some(requests) = payload["setVariableData"].as_array() else {
        return format_violation(unique_id, "setVariableData missing");
    };
    let results: Vec<Value> = requests
        .iter()
        .map(|request| {
            let component = request["component"]["name"].as_str().unwrap_or("");
            let variable = request["variable"]["name"].as_str().unwrap_or("");
            let value = request["attributeValue"].as_str().unwrap_or("");
            let status = match cp.device_model.set_value(component, variable, value) {
                SetVariableOutcome::Accepted => "Accepted",
                SetVariableOutcome::Rejected => "Rejected",
                SetVariableOutcome::ReadOnly => "Rejected",
                SetVariableOutcome::UnknownComponent => "UnknownComponent",
                SetVariableOutcome::UnknownVariable => "UnknownVariable",
            };
            json!({
                "attributeStatus": status,
                "component": {"name": component},
                "variable": {"name": variable},
            })
        })
        .collect();
    OcppFrame::result(unique_id, json!({"setVariableResult": results}))
}

async fn certificate_signed(cp: &Arc<ChargePoint>, unique_id: &str, payload: &Value) -> OcppFrame {
    let Some(chain) = payload["certificateChain"].as_str() else {
        return format_violation(unique_id, "certificateChain missing");
    };
    let certificate_type = payload["certificateType"].as_str();
    let result = cp.security.on_certificate_signed(chain, certificate_type).await;
    OcppFrame::result(unique_id, json!({"status": format!("{:?}", result)}))
}

fn update_firmware(cp: &Arc<ChargePoint>, unique_id: &str, payload: &Value) -> OcppFrame {
    let location = payload["firmware"]["location"].as_str();
    match (location, cp.callbacks.update_firmware.clone()) {
        (Some(location), Some(hook)) => {
            let location = location.to_string();
            tokio::spawn(async move {
                hook(location);
            });
            OcppFrame::result(unique_id, json!({"status": "Accepted"}))
        }
        _ => OcppFrame::result(unique_id, json!({"status": "Rejected"})),
    }
}
