//! OCPP protocol version
//!
//! The station is configured with exactly one version per boot; the
//! subprotocol it offers during the WebSocket handshake follows from it.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Supported OCPP protocol versions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OcppVersion {
    /// OCPP 1.6 (JSON / OCPP-J)
    V16,
    /// OCPP 2.0.1
    V201,
    /// OCPP 2.1
    V21,
}

impl OcppVersion {
    /// WebSocket subprotocol identifier offered in `Sec-WebSocket-Protocol`.
    pub fn subprotocol(&self) -> &'static str {
        match self {
            Self::V16 => "ocpp1.6",
            Self::V201 => "ocpp2.0.1",
            Self::V21 => "ocpp2.1",
        }
    }

    /// True for the 2.x family sharing the component/variable device model.
    pub fn is_v2x(&self) -> bool {
        matches!(self, Self::V201 | Self::V21)
    }
}

impl FromStr for OcppVersion {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "ocpp1.6" | "1.6" => Ok(Self::V16),
            "ocpp2.0.1" | "2.0.1" => Ok(Self::V201),
            "ocpp2.1" | "2.1" => Ok(Self::V21),
            _ => Err(()),
        }
    }
}

impl fmt::Display for OcppVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::V16 => "1.6",
            Self::V201 => "2.0.1",
            Self::V21 => "2.1",
        };
        write!(f, "OCPP {}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subprotocol_roundtrip() {
        for v in [OcppVersion::V16, OcppVersion::V201, OcppVersion::V21] {
            assert_eq!(v.subprotocol().parse::<OcppVersion>(), Ok(v));
        }
    }

    #[test]
    fn unknown_subprotocol_rejected() {
        assert!("ocpp0.9".parse::<OcppVersion>().is_err());
    }
}
