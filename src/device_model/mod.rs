//! Device model: the station's sole configuration surface
//!
//! A typed key/value store addressed by `(component, variable, attribute)`.
//! Every tunable the core reads (retry counts, backoff parameters, cache
//! sizes, feature gates) lives here as a named variable with a mutability
//! and an optional persistence flag. Sets arriving through OCPP are
//! validated against mutability and the stored type; internal writes may
//! update read-only variables (e.g. `AuthCacheStorage` tracking).

pub mod variables;

use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::DomainError;
use variables::ComponentVariable;

// ── Value & metadata types ─────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum VariableValue {
    Int(i64),
    Decimal(f64),
    Bool(bool),
    Text(String),
    DateTime(DateTime<Utc>),
    /// Comma-separated member list (OptionList / MemberList semantics).
    OptionList(Vec<String>),
}

impl VariableValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Int(_) => "integer",
            Self::Decimal(_) => "decimal",
            Self::Bool(_) => "boolean",
            Self::Text(_) => "string",
            Self::DateTime(_) => "dateTime",
            Self::OptionList(_) => "OptionList",
        }
    }

    /// Parse `text` as the same type as `self` (used by SetVariables).
    pub fn parse_as_same_type(&self, text: &str) -> Option<VariableValue> {
        match self {
            Self::Int(_) => text.trim().parse::<i64>().ok().map(VariableValue::Int),
            Self::Decimal(_) => text.trim().parse::<f64>().ok().map(VariableValue::Decimal),
            Self::Bool(_) => match text.trim() {
                "true" | "True" => Some(VariableValue::Bool(true)),
                "false" | "False" => Some(VariableValue::Bool(false)),
                _ => None,
            },
            Self::Text(_) => Some(VariableValue::Text(text.to_string())),
            Self::DateTime(_) => text
                .trim()
                .parse::<DateTime<Utc>>()
                .ok()
                .map(VariableValue::DateTime),
            Self::OptionList(_) => Some(VariableValue::OptionList(
                text.split(',').map(|s| s.trim().to_string()).collect(),
            )),
        }
    }
}

impl fmt::Display for VariableValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{}", v),
            Self::Decimal(v) => write!(f, "{}", v),
            Self::Bool(v) => write!(f, "{}", v),
            Self::Text(v) => f.write_str(v),
            Self::DateTime(v) => write!(f, "{}", v.to_rfc3339()),
            Self::OptionList(v) => f.write_str(&v.join(",")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mutability {
    ReadOnly,
    ReadWrite,
    WriteOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttributeKind {
    Actual,
    Target,
    MinSet,
    MaxSet,
}

impl Default for AttributeKind {
    fn default() -> Self {
        Self::Actual
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VariableEntry {
    pub value: VariableValue,
    pub mutability: Mutability,
    pub persistent: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct VariableKey {
    component: String,
    variable: String,
    attribute: AttributeKind,
}

/// Outcome of a SetVariables request for one variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetVariableOutcome {
    Accepted,
    Rejected,
    UnknownComponent,
    UnknownVariable,
    ReadOnly,
}

// ── DeviceModel ────────────────────────────────────────────────

pub struct DeviceModel {
    entries: RwLock<HashMap<VariableKey, VariableEntry>>,
}

impl DeviceModel {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// A model preloaded with the standardized controller variables this
    /// core reads, at their default values.
    pub fn with_defaults() -> Self {
        let model = Self::new();
        variables::install_defaults(&model);
        model
    }

    /// Register or replace a variable definition.
    pub fn register(
        &self,
        cv: &ComponentVariable,
        value: VariableValue,
        mutability: Mutability,
        persistent: bool,
    ) {
        let mut entries = self.entries.write().unwrap();
        entries.insert(
            VariableKey {
                component: cv.component.to_string(),
                variable: cv.variable.to_string(),
                attribute: AttributeKind::Actual,
            },
            VariableEntry {
                value,
                mutability,
                persistent,
            },
        );
    }

    fn lookup(&self, component: &str, variable: &str, attribute: AttributeKind) -> Option<VariableEntry> {
        let entries = self.entries.read().unwrap();
        entries
            .get(&VariableKey {
                component: component.to_string(),
                variable: variable.to_string(),
                attribute,
            })
            .cloned()
    }

    // ── Typed getters ──────────────────────────────────────

    pub fn get_value(&self, cv: &ComponentVariable) -> Option<VariableValue> {
        self.lookup(cv.component, cv.variable, AttributeKind::Actual)
            .map(|e| e.value)
    }

    pub fn get_int(&self, cv: &ComponentVariable) -> Option<i64> {
        match self.get_value(cv)? {
            VariableValue::Int(v) => Some(v),
            _ => None,
        }
    }

    pub fn get_decimal(&self, cv: &ComponentVariable) -> Option<f64> {
        match self.get_value(cv)? {
            VariableValue::Decimal(v) => Some(v),
            VariableValue::Int(v) => Some(v as f64),
            _ => None,
        }
    }

    pub fn get_bool(&self, cv: &ComponentVariable) -> Option<bool> {
        match self.get_value(cv)? {
            VariableValue::Bool(v) => Some(v),
            _ => None,
        }
    }

    pub fn get_text(&self, cv: &ComponentVariable) -> Option<String> {
        match self.get_value(cv)? {
            VariableValue::Text(v) => Some(v),
            _ => None,
        }
    }

    pub fn get_option_list(&self, cv: &ComponentVariable) -> Option<Vec<String>> {
        match self.get_value(cv)? {
            VariableValue::OptionList(v) => Some(v),
            _ => None,
        }
    }

    /// Getter for variables the core cannot run without. A miss is a
    /// configuration error (fatal at boot, degrading at runtime).
    pub fn require_int(&self, cv: &ComponentVariable) -> Result<i64, DomainError> {
        self.get_int(cv).ok_or(DomainError::Configuration {
            component: cv.component.to_string(),
            variable: cv.variable.to_string(),
        })
    }

    pub fn require_bool(&self, cv: &ComponentVariable) -> Result<bool, DomainError> {
        self.get_bool(cv).ok_or(DomainError::Configuration {
            component: cv.component.to_string(),
            variable: cv.variable.to_string(),
        })
    }

    pub fn require_decimal(&self, cv: &ComponentVariable) -> Result<f64, DomainError> {
        self.get_decimal(cv).ok_or(DomainError::Configuration {
            component: cv.component.to_string(),
            variable: cv.variable.to_string(),
        })
    }

    // ── Setters ────────────────────────────────────────────

    /// Set through the OCPP path (SetVariables / ChangeConfiguration).
    /// Mutability is enforced and the text is parsed against the stored
    /// type.
    pub fn set_value(&self, component: &str, variable: &str, text: &str) -> SetVariableOutcome {
        let mut entries = self.entries.write().unwrap();
        let known_component = entries.keys().any(|k| k.component == component);
        let key = VariableKey {
            component: component.to_string(),
            variable: variable.to_string(),
            attribute: AttributeKind::Actual,
        };
        let Some(entry) = entries.get_mut(&key) else {
            return if known_component {
                SetVariableOutcome::UnknownVariable
            } else {
                SetVariableOutcome::UnknownComponent
            };
        };
        if entry.mutability == Mutability::ReadOnly {
            return SetVariableOutcome::ReadOnly;
        }
        match entry.value.parse_as_same_type(text) {
            Some(value) => {
                entry.value = value;
                SetVariableOutcome::Accepted
            }
            None => SetVariableOutcome::Rejected,
        }
    }

    /// Internal write that bypasses mutability (e.g. the library updating
    /// `AuthCacheStorage` after a cache write).
    pub fn set_internal(&self, cv: &ComponentVariable, value: VariableValue) {
        let mut entries = self.entries.write().unwrap();
        let key = VariableKey {
            component: cv.component.to_string(),
            variable: cv.variable.to_string(),
            attribute: AttributeKind::Actual,
        };
        match entries.get_mut(&key) {
            Some(entry) => entry.value = value,
            None => {
                entries.insert(
                    key,
                    VariableEntry {
                        value,
                        mutability: Mutability::ReadOnly,
                        persistent: false,
                    },
                );
            }
        }
    }

    /// Snapshot of every variable, for GetVariables handling and reports.
    pub fn snapshot(&self) -> Vec<(String, String, VariableEntry)> {
        let entries = self.entries.read().unwrap();
        let mut all: Vec<(String, String, VariableEntry)> = entries
            .iter()
            .map(|(k, v)| (k.component.clone(), k.variable.clone(), v.clone()))
            .collect();
        all.sort_by(|a, b| (a.0.as_str(), a.1.as_str()).cmp(&(b.0.as_str(), b.1.as_str())));
        all
    }
}

impl Default for DeviceModel {
    fn default() -> Self {
        Self::with_defaults()
    }
}
