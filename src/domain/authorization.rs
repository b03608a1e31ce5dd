//! Authorization value objects

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of authorizing an id token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthorizationStatus {
    Accepted,
    Blocked,
    ConcurrentTx,
    Expired,
    Invalid,
    NoCredit,
    NotAllowedTypeEVSE,
    NotAtThisLocation,
    NotAtThisTime,
    Unknown,
}

impl AuthorizationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accepted => "Accepted",
            Self::Blocked => "Blocked",
            Self::ConcurrentTx => "ConcurrentTx",
            Self::Expired => "Expired",
            Self::Invalid => "Invalid",
            Self::NoCredit => "NoCredit",
            Self::NotAllowedTypeEVSE => "NotAllowedTypeEVSE",
            Self::NotAtThisLocation => "NotAtThisLocation",
            Self::NotAtThisTime => "NotAtThisTime",
            Self::Unknown => "Unknown",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "Accepted" => Self::Accepted,
            "Blocked" => Self::Blocked,
            "ConcurrentTx" => Self::ConcurrentTx,
            "Expired" => Self::Expired,
            "Invalid" => Self::Invalid,
            "NoCredit" => Self::NoCredit,
            "NotAllowedTypeEVSE" => Self::NotAllowedTypeEVSE,
            "NotAtThisLocation" => Self::NotAtThisLocation,
            "NotAtThisTime" => Self::NotAtThisTime,
            "Unknown" => Self::Unknown,
            _ => return None,
        })
    }
}

/// What the CSMS (or cache / local list) knows about an id token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdTokenInfo {
    pub status: AuthorizationStatus,
    /// After this instant a cached entry no longer authorizes.
    pub cache_expiry: Option<DateTime<Utc>>,
    pub parent_id_token: Option<String>,
}

impl IdTokenInfo {
    pub fn accepted() -> Self {
        Self {
            status: AuthorizationStatus::Accepted,
            cache_expiry: None,
            parent_id_token: None,
        }
    }

    pub fn with_status(status: AuthorizationStatus) -> Self {
        Self {
            status,
            cache_expiry: None,
            parent_id_token: None,
        }
    }

    /// Entry expired relative to `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.cache_expiry.map(|e| e <= now).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn expiry_honoured() {
        let mut info = IdTokenInfo::accepted();
        let now = Utc::now();
        assert!(!info.is_expired(now));
        info.cache_expiry = Some(now - Duration::seconds(1));
        assert!(info.is_expired(now));
        info.cache_expiry = Some(now + Duration::hours(1));
        assert!(!info.is_expired(now));
    }

    #[test]
    fn status_string_roundtrip() {
        for s in [
            AuthorizationStatus::Accepted,
            AuthorizationStatus::ConcurrentTx,
            AuthorizationStatus::NotAllowedTypeEVSE,
            AuthorizationStatus::Unknown,
        ] {
            assert_eq!(AuthorizationStatus::parse(s.as_str()), Some(s));
        }
    }
}
