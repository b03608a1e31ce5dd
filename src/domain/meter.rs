//! Internal meter sample model
//!
//! The application hands meter readings to the station in this shape; the
//! per-version glue converts them to v1.6 MeterValues or 2.0.1
//! TransactionEvent sampled values at the wire boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Measurand {
    EnergyActiveImportRegister,
    PowerActiveImport,
    CurrentImport,
    CurrentOffered,
    Voltage,
    Frequency,
    SoC,
    Temperature,
}

impl Measurand {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EnergyActiveImportRegister => "Energy.Active.Import.Register",
            Self::PowerActiveImport => "Power.Active.Import",
            Self::CurrentImport => "Current.Import",
            Self::CurrentOffered => "Current.Offered",
            Self::Voltage => "Voltage",
            Self::Frequency => "Frequency",
            Self::SoC => "SoC",
            Self::Temperature => "Temperature",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadingContext {
    InterruptionBegin,
    InterruptionEnd,
    SampleClock,
    SamplePeriodic,
    TransactionBegin,
    TransactionEnd,
    Trigger,
    Other,
}

impl ReadingContext {
    /// Wire value (dotted per the OCPP enumeration).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InterruptionBegin => "Interruption.Begin",
            Self::InterruptionEnd => "Interruption.End",
            Self::SampleClock => "Sample.Clock",
            Self::SamplePeriodic => "Sample.Periodic",
            Self::TransactionBegin => "Transaction.Begin",
            Self::TransactionEnd => "Transaction.End",
            Self::Trigger => "Trigger",
            Self::Other => "Other",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampledValue {
    pub value: f64,
    pub measurand: Measurand,
    pub context: Option<ReadingContext>,
    /// L1/L2/L3/N phase designation when per-phase.
    pub phase: Option<String>,
    pub unit: Option<String>,
}

impl SampledValue {
    pub fn energy_wh(value: f64) -> Self {
        Self {
            value,
            measurand: Measurand::EnergyActiveImportRegister,
            context: None,
            phase: None,
            unit: Some("Wh".to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeterValue {
    pub timestamp: DateTime<Utc>,
    pub sampled_values: Vec<SampledValue>,
}

impl MeterValue {
    /// The energy register reading in this sample, if present.
    pub fn energy_wh(&self) -> Option<f64> {
        self.sampled_values
            .iter()
            .find(|s| s.measurand == Measurand::EnergyActiveImportRegister)
            .map(|s| s.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn energy_register_extracted() {
        let mv = MeterValue {
            timestamp: Utc::now(),
            sampled_values: vec![
                SampledValue {
                    value: 230.1,
                    measurand: Measurand::Voltage,
                    context: None,
                    phase: Some("L1".into()),
                    unit: Some("V".into()),
                },
                SampledValue::energy_wh(1500.0),
            ],
        };
        assert_eq!(mv.energy_wh(), Some(1500.0));
    }
}
