//! People involved in a clearance: the requester and the verifiers acting on stages.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::stage::StageData;
use super::unit::{DivisionId, UnitId, UnitRef};

/// Identifier of the person a clearance request is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequesterId(pub Uuid);

impl From<Uuid> for RequesterId {
    fn from(uuid: Uuid) -> Self {
        RequesterId(uuid)
    }
}

impl std::ops::Deref for RequesterId {
    type Target = Uuid;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::Display for RequesterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Display only first 8 characters for readability in logs
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Identifier of an authenticated principal acting on stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActorId(pub Uuid);

impl From<Uuid> for ActorId {
    fn from(uuid: Uuid) -> Self {
        ActorId(uuid)
    }
}

impl std::ops::Deref for ActorId {
    type Target = Uuid;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::Display for ActorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Role authorized to act on a stage.
///
/// Distinct from unit membership: a unit may have several role holders, and a
/// stage names both the unit and the role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifierRole {
    /// Generic staff of a unit (front office, library desk, accounts, ...).
    Staff,
    /// Head of an academic unit.
    UnitHead,
    /// Head of a division.
    DivisionHead,
}

impl VerifierRole {
    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            VerifierRole::Staff => "staff",
            VerifierRole::UnitHead => "unit_head",
            VerifierRole::DivisionHead => "division_head",
        }
    }

    /// Label used in synthesized remarks and notifications.
    pub fn label(&self) -> &'static str {
        match self {
            VerifierRole::Staff => "Staff",
            VerifierRole::UnitHead => "Unit Head",
            VerifierRole::DivisionHead => "Division Head",
        }
    }
}

impl std::fmt::Display for VerifierRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VerifierRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "staff" => Ok(VerifierRole::Staff),
            "unit_head" => Ok(VerifierRole::UnitHead),
            "division_head" => Ok(VerifierRole::DivisionHead),
            other => Err(format!("unknown verifier role '{}'", other)),
        }
    }
}

/// A resolved acting principal: who they are, where they sit, what they may do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub actor_id: ActorId,
    pub unit: UnitRef,
    pub role: VerifierRole,
}

impl Principal {
    /// True when this principal holds the stage's role in the stage's unit.
    pub fn can_act_on(&self, stage: &StageData) -> bool {
        self.role == stage.verifier_role && self.unit == stage.unit
    }
}

/// Requester attributes the policy resolver needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequesterProfile {
    pub requester_id: RequesterId,
    pub home_unit: UnitId,
    pub division: DivisionId,
    /// Lives in university residence, so needs residence clearance.
    pub resident: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_round_trips_through_storage_name() {
        for role in [
            VerifierRole::Staff,
            VerifierRole::UnitHead,
            VerifierRole::DivisionHead,
        ] {
            assert_eq!(role.as_str().parse::<VerifierRole>().unwrap(), role);
        }
        assert!("dean".parse::<VerifierRole>().is_err());
    }
}
