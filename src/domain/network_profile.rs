//! Network connection profiles
//!
//! A station carries an ordered set of ways to reach the CSMS. The
//! connectivity manager walks them in priority order and falls back to the
//! next slot when a connection attempt fails.

use serde::{Deserialize, Serialize};

/// OCPP security profile level of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SecurityProfileLevel {
    /// HTTP Basic over plain WebSocket. Testing only.
    BasicUnsecured = 1,
    /// HTTP Basic over WSS with server certificate verification.
    BasicTls = 2,
    /// Mutual TLS with the charging station client certificate.
    MutualTls = 3,
}

impl SecurityProfileLevel {
    pub fn from_i32(v: i32) -> Option<Self> {
        match v {
            1 => Some(Self::BasicUnsecured),
            2 => Some(Self::BasicTls),
            3 => Some(Self::MutualTls),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> i32 {
        *self as i32
    }

    /// Profiles 1 and 2 authenticate with HTTP Basic.
    pub fn uses_basic_auth(&self) -> bool {
        matches!(self, Self::BasicUnsecured | Self::BasicTls)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicAuthCredentials {
    pub username: String,
    pub password: String,
}

/// One configured way to reach the CSMS.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionProfile {
    /// Unique configuration slot.
    pub slot: i32,
    /// Lower value is tried first.
    pub priority: i32,
    pub csms_url: String,
    pub security_profile: SecurityProfileLevel,
    /// Optional network interface to bind.
    pub interface: Option<String>,
    pub basic_auth: Option<BasicAuthCredentials>,
}

impl ConnectionProfile {
    /// Sort a slot list into deterministic try-order: priority, then slot.
    pub fn sort_by_priority(profiles: &mut [ConnectionProfile]) {
        profiles.sort_by_key(|p| (p.priority, p.slot));
    }
}
