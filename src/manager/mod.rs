//! Main traits for the clearance workflow.
//!
//! This module defines the `Storage` trait, which persists requests and their stages
//! and applies stage transitions atomically, and the [`ClearanceManager`] that drives
//! the workflow on top of it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::domain::principal::{RequesterId, VerifierRole};
use crate::domain::request::{
    CertificateRef, ClearanceRequest, RequestId, RequestStatus, RequestView,
};
use crate::domain::stage::{AnyStage, Pending, Stage, StageId};
use crate::domain::unit::UnitRef;
use crate::error::Result;

mod clearance;
pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use clearance::{ClearanceManager, QueueEntry};

/// Storage trait for persisting and querying clearance requests.
///
/// Every method touches the rows of at most one request, except the listing and
/// statistics queries, which are bounded by a limit or aggregate per unit.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Persist a new request together with its stage set, atomically.
    ///
    /// # Errors
    /// - `ActiveRequestExists` if the requester has a Pending or InProgress request
    /// - `AlreadyCompleted` if the requester has a Completed request
    /// - `Validation` if `stages` is empty or belongs to another request
    async fn create_request(
        &self,
        request: &ClearanceRequest,
        stages: &[Stage<Pending>],
    ) -> Result<()>;

    /// Get a request with all of its stages.
    async fn get_request(&self, id: RequestId) -> Result<RequestView>;

    /// The requester's most recently created request, if any.
    async fn latest_request_for(&self, requester_id: RequesterId) -> Result<Option<RequestView>>;

    async fn get_stage(&self, id: StageId) -> Result<AnyStage>;

    /// Apply a decided stage (Approved or Rejected) and recompute its request.
    ///
    /// Inside one unit of work, with the owning request locked:
    /// - the stored stage must still be Pending (`AlreadyProcessed`)
    /// - the request must not be terminal (`RequestAlreadyTerminal`)
    /// - every lower-order stage must be Approved (`NotActionable`)
    ///
    /// If the request becomes Completed, its issuance claim is taken in the same
    /// unit of work, so exactly one transition ever reports `completed_now` and
    /// carries an `issuance_claim`.
    async fn commit_transition(&self, stage: AnyStage) -> Result<TransitionOutcome>;

    /// Open requests with a stage at `unit` for `role` that is actionable now, oldest
    /// first. Requests whose only matching stages are still gated are skipped before
    /// `limit` applies.
    async fn open_requests_for(
        &self,
        unit: UnitRef,
        role: VerifierRole,
        limit: usize,
    ) -> Result<Vec<RequestView>>;

    /// Actionable stages that have been waiting since `stale_before` or earlier,
    /// counted per `(unit, role)` across every open request.
    async fn overdue_groups(&self, stale_before: DateTime<Utc>) -> Result<Vec<OverdueGroup>>;

    /// Take the certificate issuance claim for a Completed request.
    ///
    /// Succeeds when the request has no certificate and is unclaimed, or its claim
    /// was last renewed before `stale_before`. Returns `None` when someone else holds it.
    async fn claim_issuance(
        &self,
        id: RequestId,
        stale_before: DateTime<Utc>,
    ) -> Result<Option<IssuanceClaim>>;

    /// Refresh a held claim so it does not go stale while the issuer runs.
    /// Returns `false` if the claim has been taken over or fulfilled.
    async fn renew_issuance(&self, claim: &IssuanceClaim) -> Result<bool>;

    /// Attach the issued certificate and clear the claim.
    ///
    /// # Errors
    /// Fails without writing if `claim` is no longer the request's current claim, or
    /// the request already has a certificate.
    async fn record_certificate(
        &self,
        claim: &IssuanceClaim,
        certificate: &CertificateRef,
    ) -> Result<()>;

    /// Drop an issuance claim after a failed issue, so it can be retried. A claim
    /// that has already been taken over is left alone.
    async fn release_issuance(&self, claim: &IssuanceClaim) -> Result<()>;

    /// Completed requests without a certificate whose claim is absent or older
    /// than `stale_before`.
    async fn list_unissued(&self, stale_before: DateTime<Utc>, limit: usize)
    -> Result<Vec<RequestId>>;

    /// Look up a request by its certificate number, or by certificate id when the
    /// input is a UUID.
    async fn find_by_certificate(&self, certificate_number: &str) -> Result<Option<RequestView>>;

    /// Request counts per status and the units with the most waiting stages.
    async fn dashboard_stats(&self, bottleneck_limit: usize) -> Result<DashboardStats>;
}

/// Result of a committed stage transition.
#[derive(Debug, Clone)]
pub struct TransitionOutcome {
    /// The stage as stored after the transition.
    pub stage: AnyStage,
    /// The owning request after recompute.
    pub request: ClearanceRequest,
    pub previous_status: RequestStatus,
    /// Set when this transition took the certificate issuance claim.
    pub issuance_claim: Option<IssuanceClaim>,
}

impl TransitionOutcome {
    pub fn issuance_claimed(&self) -> bool {
        self.issuance_claim.is_some()
    }

    /// This transition moved the request into Completed.
    pub fn completed_now(&self) -> bool {
        self.request.status == RequestStatus::Completed
            && self.previous_status != RequestStatus::Completed
    }

    /// This transition moved the request into Rejected.
    pub fn rejected_now(&self) -> bool {
        self.request.status == RequestStatus::Rejected
            && self.previous_status != RequestStatus::Rejected
    }
}

/// A held certificate issuance claim.
///
/// Every claim on a request gets a fresh token, so a holder whose claim went stale
/// and was taken over can no longer renew, record, or release it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IssuanceClaim {
    pub request_id: RequestId,
    pub token: Uuid,
}

impl IssuanceClaim {
    pub fn new(request_id: RequestId) -> Self {
        Self {
            request_id,
            token: Uuid::new_v4(),
        }
    }
}

/// Overdue actionable stages for one verifier role at one unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OverdueGroup {
    pub unit: UnitRef,
    pub role: VerifierRole,
    pub pending_count: usize,
    pub oldest_since: DateTime<Utc>,
}

/// Aggregate view for an administrative dashboard.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DashboardStats {
    pub total: u64,
    pub pending: u64,
    pub in_progress: u64,
    pub completed: u64,
    pub rejected: u64,
    /// Units with the most Pending stages on open requests, largest first.
    pub bottlenecks: Vec<Bottleneck>,
}

impl DashboardStats {
    pub fn count(&self, status: RequestStatus) -> u64 {
        match status {
            RequestStatus::Pending => self.pending,
            RequestStatus::InProgress => self.in_progress,
            RequestStatus::Completed => self.completed,
            RequestStatus::Rejected => self.rejected,
        }
    }

    pub(crate) fn add(&mut self, status: RequestStatus, count: u64) {
        self.total += count;
        match status {
            RequestStatus::Pending => self.pending += count,
            RequestStatus::InProgress => self.in_progress += count,
            RequestStatus::Completed => self.completed += count,
            RequestStatus::Rejected => self.rejected += count,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Bottleneck {
    pub unit: UnitRef,
    pub pending_count: u64,
}
