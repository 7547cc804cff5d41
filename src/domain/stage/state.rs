//! Stage types for the clearance workflow.
//!
//! This module defines the type-safe stage lifecycle using the typestate pattern.
//! A stage starts `Pending` and moves exactly once to `Approved` or `Rejected`;
//! the reverse transitions do not exist as methods, so they cannot be written.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::principal::{ActorId, VerifierRole};
use crate::domain::request::RequestId;
use crate::domain::unit::UnitRef;

/// Unique identifier for a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StageId(pub Uuid);

impl From<Uuid> for StageId {
    fn from(uuid: Uuid) -> Self {
        StageId(uuid)
    }
}

impl std::ops::Deref for StageId {
    type Target = Uuid;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::Display for StageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Display only first 8 characters for readability in logs
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Stage status as stored in the `status` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Approved,
    Rejected,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Pending => "pending",
            StageStatus::Approved => "approved",
            StageStatus::Rejected => "rejected",
        }
    }
}

impl FromStr for StageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(StageStatus::Pending),
            "approved" => Ok(StageStatus::Approved),
            "rejected" => Ok(StageStatus::Rejected),
            other => Err(format!("unknown stage status '{}'", other)),
        }
    }
}

/// One stage the policy resolver decided a request needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSpec {
    pub unit: UnitRef,
    pub verifier_role: VerifierRole,
    /// Stages sharing an order are parallel; otherwise strictly ordered.
    pub sequence_order: u32,
}

/// Marker trait for valid stage states.
pub trait StageState: Send + Sync {}

/// A stage of a clearance request.
///
/// The generic parameter `T` is the current state of the stage.
#[derive(Debug, Clone, Serialize)]
pub struct Stage<T: StageState> {
    pub state: T,
    pub data: StageData,
}

/// Immutable stage attributes, fixed when the request is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageData {
    pub id: StageId,
    /// Owning request. Stages are destroyed with it.
    pub request_id: RequestId,
    pub unit: UnitRef,
    pub verifier_role: VerifierRole,
    pub sequence_order: u32,
    pub created_at: DateTime<Utc>,
}

impl StageData {
    pub fn spec(&self) -> StageSpec {
        StageSpec {
            unit: self.unit,
            verifier_role: self.verifier_role,
            sequence_order: self.sequence_order,
        }
    }
}

// ============================================================================
// Stage States
// ============================================================================

/// Waiting for its verifier.
#[derive(Debug, Clone, Serialize)]
pub struct Pending {}

impl StageState for Pending {}

/// Signed off by a verifier.
#[derive(Debug, Clone, Serialize)]
pub struct Approved {
    pub reviewer_id: ActorId,
    pub reviewed_at: DateTime<Utc>,
    pub remarks: Option<String>,
}

impl StageState for Approved {}

/// Refused by a verifier. Terminates the whole request.
#[derive(Debug, Clone, Serialize)]
pub struct Rejected {
    pub reviewer_id: ActorId,
    pub reviewed_at: DateTime<Utc>,
    pub remarks: String,
}

impl StageState for Rejected {}

impl Stage<Pending> {
    /// Materialize a pending stage for `request_id` from a resolved spec.
    pub fn from_spec(request_id: RequestId, spec: StageSpec, created_at: DateTime<Utc>) -> Self {
        Stage {
            state: Pending {},
            data: StageData {
                id: StageId(Uuid::new_v4()),
                request_id,
                unit: spec.unit,
                verifier_role: spec.verifier_role,
                sequence_order: spec.sequence_order,
                created_at,
            },
        }
    }
}

/// Enum that can hold a stage in any state.
///
/// Used for storage and reads where stages of one request are handled uniformly.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", content = "stage", rename_all = "snake_case")]
pub enum AnyStage {
    Pending(Stage<Pending>),
    Approved(Stage<Approved>),
    Rejected(Stage<Rejected>),
}

impl AnyStage {
    pub fn id(&self) -> StageId {
        self.data().id
    }

    pub fn data(&self) -> &StageData {
        match self {
            AnyStage::Pending(s) => &s.data,
            AnyStage::Approved(s) => &s.data,
            AnyStage::Rejected(s) => &s.data,
        }
    }

    pub fn status(&self) -> StageStatus {
        match self {
            AnyStage::Pending(_) => StageStatus::Pending,
            AnyStage::Approved(_) => StageStatus::Approved,
            AnyStage::Rejected(_) => StageStatus::Rejected,
        }
    }

    pub fn sequence_order(&self) -> u32 {
        self.data().sequence_order
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, AnyStage::Pending(_))
    }

    pub fn is_approved(&self) -> bool {
        matches!(self, AnyStage::Approved(_))
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, AnyStage::Rejected(_))
    }

    /// Who reviewed the stage, if anyone has.
    pub fn reviewer_id(&self) -> Option<ActorId> {
        match self {
            AnyStage::Pending(_) => None,
            AnyStage::Approved(s) => Some(s.state.reviewer_id),
            AnyStage::Rejected(s) => Some(s.state.reviewer_id),
        }
    }

    pub fn reviewed_at(&self) -> Option<DateTime<Utc>> {
        match self {
            AnyStage::Pending(_) => None,
            AnyStage::Approved(s) => Some(s.state.reviewed_at),
            AnyStage::Rejected(s) => Some(s.state.reviewed_at),
        }
    }

    pub fn remarks(&self) -> Option<&str> {
        match self {
            AnyStage::Pending(_) => None,
            AnyStage::Approved(s) => s.state.remarks.as_deref(),
            AnyStage::Rejected(s) => Some(s.state.remarks.as_str()),
        }
    }

    pub fn as_pending(&self) -> Option<&Stage<Pending>> {
        match self {
            AnyStage::Pending(s) => Some(s),
            _ => None,
        }
    }

    pub fn into_pending(self) -> Option<Stage<Pending>> {
        match self {
            AnyStage::Pending(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_rejected(&self) -> Option<&Stage<Rejected>> {
        match self {
            AnyStage::Rejected(s) => Some(s),
            _ => None,
        }
    }
}

impl From<Stage<Pending>> for AnyStage {
    fn from(s: Stage<Pending>) -> Self {
        AnyStage::Pending(s)
    }
}

impl From<Stage<Approved>> for AnyStage {
    fn from(s: Stage<Approved>) -> Self {
        AnyStage::Approved(s)
    }
}

impl From<Stage<Rejected>> for AnyStage {
    fn from(s: Stage<Rejected>) -> Self {
        AnyStage::Rejected(s)
    }
}
