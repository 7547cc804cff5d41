//! Clearance request aggregate.
//!
//! A request owns its stages. Its `status` is a projection of the stage states that
//! is persisted for fast reads; [`ClearanceRequest::recompute`] is the only code path
//! that changes it, and storage backends call it inside the same transaction that
//! writes the triggering stage.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::principal::RequesterId;
use super::stage::{AnyStage, StageId, rejection_remarks};

/// Unique identifier for a clearance request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub Uuid);

impl From<Uuid> for RequestId {
    fn from(uuid: Uuid) -> Self {
        RequestId(uuid)
    }
}

impl std::ops::Deref for RequestId {
    type Target = Uuid;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Display only first 8 characters for readability in logs
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Overall request status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    InProgress,
    Completed,
    Rejected,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::InProgress => "in_progress",
            RequestStatus::Completed => "completed",
            RequestStatus::Rejected => "rejected",
        }
    }

    /// Completed and Rejected requests accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestStatus::Completed | RequestStatus::Rejected)
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RequestStatus::Pending),
            "in_progress" => Ok(RequestStatus::InProgress),
            "completed" => Ok(RequestStatus::Completed),
            "rejected" => Ok(RequestStatus::Rejected),
            other => Err(format!("unknown request status '{}'", other)),
        }
    }
}

/// Reference to an issued clearance certificate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateRef {
    pub id: Uuid,
    /// Human readable number printed on the certificate.
    pub certificate_number: String,
    pub issued_at: DateTime<Utc>,
}

/// A clearance request for one requester.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClearanceRequest {
    pub id: RequestId,
    pub requester_id: RequesterId,
    pub status: RequestStatus,
    /// Set when a stage rejects the request.
    pub remarks: Option<String>,
    pub certificate: Option<CertificateRef>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ClearanceRequest {
    pub fn new(requester_id: RequesterId, now: DateTime<Utc>) -> Self {
        Self {
            id: RequestId(Uuid::new_v4()),
            requester_id,
            status: RequestStatus::Pending,
            remarks: None,
            certificate: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Recompute the cached status from the request's stages.
    ///
    /// On the first rejection the request remarks are synthesized from the rejected
    /// stage's role and comment.
    pub(crate) fn recompute(&mut self, stages: &[AnyStage], now: DateTime<Utc>) {
        let status = derive_status(stages);
        if status == RequestStatus::Rejected
            && self.remarks.is_none()
            && let Some(rejected) = stages.iter().find_map(AnyStage::as_rejected)
        {
            self.remarks = Some(rejection_remarks(
                rejected.data.verifier_role,
                &rejected.state.remarks,
            ));
        }
        self.status = status;
        self.updated_at = now;
    }
}

/// Derive the request status from its stage states.
///
/// - any stage Rejected: `Rejected`, regardless of where it sits in the order
/// - every stage Approved: `Completed`
/// - some stage Approved: `InProgress`
/// - otherwise: `Pending`
///
/// An empty stage set is `Pending`; it is never considered complete.
pub fn derive_status(stages: &[AnyStage]) -> RequestStatus {
    if stages.iter().any(AnyStage::is_rejected) {
        RequestStatus::Rejected
    } else if !stages.is_empty() && stages.iter().all(AnyStage::is_approved) {
        RequestStatus::Completed
    } else if stages.iter().any(AnyStage::is_approved) {
        RequestStatus::InProgress
    } else {
        RequestStatus::Pending
    }
}

/// Read model of the aggregate: the request with its stages in sequence order.
#[derive(Debug, Clone, Serialize)]
pub struct RequestView {
    pub request: ClearanceRequest,
    pub stages: Vec<AnyStage>,
}

impl RequestView {
    pub fn new(request: ClearanceRequest, mut stages: Vec<AnyStage>) -> Self {
        stages.sort_by_key(|s| s.sequence_order());
        Self { request, stages }
    }

    pub fn status(&self) -> RequestStatus {
        self.request.status
    }

    pub fn stage(&self, id: StageId) -> Option<&AnyStage> {
        self.stages.iter().find(|s| s.id() == id)
    }

    pub fn stages_at(&self, order: u32) -> impl Iterator<Item = &AnyStage> {
        self.stages
            .iter()
            .filter(move |s| s.sequence_order() == order)
    }

    /// The stage that terminated the request, if any.
    pub fn rejected_stage(&self) -> Option<&AnyStage> {
        self.stages.iter().find(|s| s.is_rejected())
    }
}
