//! Operative/availability state model
//!
//! Three layers of state combine into what the CSMS sees:
//! the operator-set Operative/Inoperative status of the CS, each EVSE and
//! each connector, plus the transient connector facts (plugged in, faulted,
//! reserved, explicitly unavailable). The projection rules live here so the
//! state manager only does bookkeeping.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Operative/Inoperative status of the CS, an EVSE or a connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationalStatus {
    Operative,
    Inoperative,
}

impl OperationalStatus {
    /// Combine a parent and child status. `Inoperative` dominates: a child
    /// can only be effectively Operative if every ancestor is.
    pub fn merge(self, other: OperationalStatus) -> OperationalStatus {
        if self == OperationalStatus::Inoperative || other == OperationalStatus::Inoperative {
            OperationalStatus::Inoperative
        } else {
            OperationalStatus::Operative
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Operative => "Operative",
            Self::Inoperative => "Inoperative",
        }
    }
}

impl fmt::Display for OperationalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wire-level connector status reported via StatusNotification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectorStatus {
    Available,
    Occupied,
    Reserved,
    Unavailable,
    Faulted,
}

impl ConnectorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Available => "Available",
            Self::Occupied => "Occupied",
            Self::Reserved => "Reserved",
            Self::Unavailable => "Unavailable",
            Self::Faulted => "Faulted",
        }
    }
}

impl fmt::Display for ConnectorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The individual state of a single connector.
///
/// `individual_operational_status` is usually set by the CSMS; the booleans
/// are transient facts raised by the application and assumed false on boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FullConnectorStatus {
    pub individual_operational_status: OperationalStatus,
    /// Active (uncleared) error on the connector.
    pub faulted: bool,
    /// Active reservation targeting this connector.
    pub reserved: bool,
    /// Cable plugged in.
    pub occupied: bool,
    /// Explicitly set unavailable.
    pub unavailable: bool,
}

impl FullConnectorStatus {
    pub fn new(individual_operational_status: OperationalStatus) -> Self {
        Self {
            individual_operational_status,
            faulted: false,
            reserved: false,
            occupied: false,
            unavailable: false,
        }
    }

    /// Project the individual state to a wire-level connector status.
    ///
    /// Does NOT take the EVSE or CS into account; callers that need the
    /// effective status apply [`FullConnectorStatus::effective_status`].
    /// Precedence: Faulted, then Unavailable/Inoperative, then Reserved,
    /// then Occupied, then Available.
    pub fn to_connector_status(&self) -> ConnectorStatus {
        if self.faulted {
            ConnectorStatus::Faulted
        } else if self.unavailable
            || self.individual_operational_status == OperationalStatus::Inoperative
        {
            ConnectorStatus::Unavailable
        } else if self.reserved {
            ConnectorStatus::Reserved
        } else if self.occupied {
            ConnectorStatus::Occupied
        } else {
            ConnectorStatus::Available
        }
    }

    /// Project to the wire-level status the CSMS should see, given the
    /// combined effective Operative/Inoperative state of the parent EVSE and
    /// CS. An Inoperative parent forces Unavailable.
    pub fn effective_status(&self, parents: OperationalStatus) -> ConnectorStatus {
        if parents == OperationalStatus::Inoperative {
            ConnectorStatus::Unavailable
        } else {
            self.to_connector_status()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full(faulted: bool, reserved: bool, occupied: bool, unavailable: bool) -> FullConnectorStatus {
        FullConnectorStatus {
            individual_operational_status: OperationalStatus::Operative,
            faulted,
            reserved,
            occupied,
            unavailable,
        }
    }

    #[test]
    fn merge_inoperative_dominates() {
        use OperationalStatus::*;
        assert_eq!(Operative.merge(Operative), Operative);
        assert_eq!(Operative.merge(Inoperative), Inoperative);
        assert_eq!(Inoperative.merge(Operative), Inoperative);
        assert_eq!(Inoperative.merge(Inoperative), Inoperative);
    }

    #[test]
    fn projection_precedence() {
        assert_eq!(full(true, true, true, true).to_connector_status(), ConnectorStatus::Faulted);
        assert_eq!(full(false, true, true, true).to_connector_status(), ConnectorStatus::Unavailable);
        assert_eq!(full(false, true, true, false).to_connector_status(), ConnectorStatus::Reserved);
        assert_eq!(full(false, false, true, false).to_connector_status(), ConnectorStatus::Occupied);
        assert_eq!(full(false, false, false, false).to_connector_status(), ConnectorStatus::Available);
    }

    #[test]
    fn inoperative_individual_projects_unavailable() {
        let mut s = full(false, false, false, false);
        s.individual_operational_status = OperationalStatus::Inoperative;
        assert_eq!(s.to_connector_status(), ConnectorStatus::Unavailable);
    }

    #[test]
    fn inoperative_parent_forces_unavailable() {
        let s = full(false, true, true, false);
        assert_eq!(s.effective_status(OperationalStatus::Operative), ConnectorStatus::Reserved);
        assert_eq!(s.effective_status(OperationalStatus::Inoperative), ConnectorStatus::Unavailable);
    }

    #[test]
    fn inoperative_parent_overrides_faulted() {
        let s = full(true, false, false, false);
        assert_eq!(s.effective_status(OperationalStatus::Inoperative), ConnectorStatus::Unavailable);
    }
}
