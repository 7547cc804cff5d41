//! In-memory implementation of [`Storage`].
//!
//! All state sits behind one `parking_lot::Mutex`. Each trait method takes the lock
//! once, does all of its checks and writes, and releases it before returning, so
//! every operation is atomic with respect to every other one in the process. No
//! `.await` happens while the lock is held.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use super::{
    Bottleneck, DashboardStats, IssuanceClaim, OverdueGroup, Storage, TransitionOutcome,
};
use crate::domain::principal::{RequesterId, VerifierRole};
use crate::domain::request::{
    CertificateRef, ClearanceRequest, RequestId, RequestStatus, RequestView,
};
use crate::domain::stage::{AnyStage, Pending, Stage, StageId};
use crate::domain::unit::UnitRef;
use crate::error::{ClearanceError, Result};
use crate::gate;

#[derive(Debug, Clone)]
struct StoredRequest {
    request: ClearanceRequest,
    /// Insertion sequence, breaks `created_at` ties.
    seq: u64,
    claim: Option<HeldClaim>,
    stage_ids: Vec<StageId>,
}

#[derive(Debug, Clone, Copy)]
struct HeldClaim {
    token: Uuid,
    renewed_at: DateTime<Utc>,
}

impl StoredRequest {
    fn claim_is_stale(&self, stale_before: DateTime<Utc>) -> bool {
        self.claim.is_none_or(|held| held.renewed_at < stale_before)
    }

    fn holds(&self, claim: &IssuanceClaim) -> bool {
        self.claim.is_some_and(|held| held.token == claim.token)
    }
}

#[derive(Debug, Default)]
struct Inner {
    requests: HashMap<RequestId, StoredRequest>,
    stages: HashMap<StageId, AnyStage>,
    next_seq: u64,
}

impl Inner {
    fn stages_of(&self, stored: &StoredRequest) -> Vec<AnyStage> {
        stored
            .stage_ids
            .iter()
            .filter_map(|id| self.stages.get(id).cloned())
            .collect()
    }

    fn view(&self, stored: &StoredRequest) -> RequestView {
        RequestView::new(stored.request.clone(), self.stages_of(stored))
    }

    /// Requests matching `filter`, oldest first.
    fn sorted_requests<F>(&self, filter: F) -> Vec<&StoredRequest>
    where
        F: Fn(&StoredRequest) -> bool,
    {
        let mut requests: Vec<_> = self.requests.values().filter(|r| filter(r)).collect();
        requests.sort_by_key(|r| (r.request.created_at, r.seq));
        requests
    }
}

/// Process-local storage backend.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    inner: Mutex<Inner>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored requests, across all requesters.
    pub fn request_count(&self) -> usize {
        self.inner.lock().requests.len()
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    #[tracing::instrument(skip(self, request, stages), fields(request_id = %request.id, stage_count = stages.len()))]
    async fn create_request(
        &self,
        request: &ClearanceRequest,
        stages: &[Stage<Pending>],
    ) -> Result<()> {
        if stages.is_empty() {
            return Err(ClearanceError::Validation(
                "a clearance request needs at least one stage".to_string(),
            ));
        }
        if let Some(stray) = stages.iter().find(|s| s.data.request_id != request.id) {
            return Err(ClearanceError::Validation(format!(
                "stage {} belongs to request {}, not {}",
                stray.data.id, stray.data.request_id, request.id
            )));
        }

        let mut inner = self.inner.lock();

        let existing: Vec<RequestStatus> = inner
            .requests
            .values()
            .filter(|r| r.request.requester_id == request.requester_id)
            .map(|r| r.request.status)
            .collect();
        if existing.contains(&RequestStatus::Completed) {
            return Err(ClearanceError::AlreadyCompleted(request.requester_id));
        }
        if existing.iter().any(|s| !s.is_terminal()) {
            return Err(ClearanceError::ActiveRequestExists(request.requester_id));
        }
        if inner.requests.contains_key(&request.id) {
            return Err(ClearanceError::Other(anyhow::anyhow!(
                "Request {} already exists",
                request.id
            )));
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        for stage in stages {
            inner.stages.insert(stage.data.id, stage.clone().into());
        }
        inner.requests.insert(
            request.id,
            StoredRequest {
                request: request.clone(),
                seq,
                claim: None,
                stage_ids: stages.iter().map(|s| s.data.id).collect(),
            },
        );
        Ok(())
    }

    async fn get_request(&self, id: RequestId) -> Result<RequestView> {
        let inner = self.inner.lock();
        let stored = inner
            .requests
            .get(&id)
            .ok_or(ClearanceError::RequestNotFound(id))?;
        Ok(inner.view(stored))
    }

    async fn latest_request_for(&self, requester_id: RequesterId) -> Result<Option<RequestView>> {
        let inner = self.inner.lock();
        Ok(inner
            .sorted_requests(|r| r.request.requester_id == requester_id)
            .last()
            .map(|stored| inner.view(stored)))
    }

    async fn get_stage(&self, id: StageId) -> Result<AnyStage> {
        self.inner
            .lock()
            .stages
            .get(&id)
            .cloned()
            .ok_or(ClearanceError::StageNotFound(id))
    }

    #[tracing::instrument(skip(self, stage), fields(stage_id = %stage.id(), status = stage.status().as_str()))]
    async fn commit_transition(&self, stage: AnyStage) -> Result<TransitionOutcome> {
        if stage.is_pending() {
            return Err(ClearanceError::Validation(
                "only approved or rejected stages can be committed".to_string(),
            ));
        }

        let now = Utc::now();
        let mut inner = self.inner.lock();

        let stored_stage = inner
            .stages
            .get(&stage.id())
            .cloned()
            .ok_or(ClearanceError::StageNotFound(stage.id()))?;
        if !stored_stage.is_pending() {
            return Err(ClearanceError::AlreadyProcessed(stage.id()));
        }

        let request_id = stored_stage.data().request_id;
        let stored = inner
            .requests
            .get(&request_id)
            .ok_or(ClearanceError::RequestNotFound(request_id))?;
        if stored.request.status.is_terminal() {
            return Err(ClearanceError::RequestAlreadyTerminal(
                request_id,
                stored.request.status,
            ));
        }
        if !gate::is_actionable(&stored_stage, &inner.stages_of(stored)) {
            return Err(ClearanceError::NotActionable(stage.id()));
        }

        // The stored attributes win over whatever the caller carried along.
        let decided = match stage {
            AnyStage::Approved(mut s) => {
                s.data = stored_stage.data().clone();
                AnyStage::Approved(s)
            }
            AnyStage::Rejected(mut s) => {
                s.data = stored_stage.data().clone();
                AnyStage::Rejected(s)
            }
            AnyStage::Pending(_) => {
                return Err(ClearanceError::Validation(
                    "only approved or rejected stages can be committed".to_string(),
                ));
            }
        };
        inner.stages.insert(decided.id(), decided.clone());

        let Inner {
            requests, stages, ..
        } = &mut *inner;
        let stored = requests
            .get_mut(&request_id)
            .ok_or(ClearanceError::RequestNotFound(request_id))?;
        let siblings: Vec<AnyStage> = stored
            .stage_ids
            .iter()
            .filter_map(|id| stages.get(id).cloned())
            .collect();

        let previous_status = stored.request.status;
        stored.request.recompute(&siblings, now);

        let mut issuance_claim = None;
        if stored.request.status == RequestStatus::Completed
            && previous_status != RequestStatus::Completed
            && stored.claim.is_none()
        {
            let claim = IssuanceClaim::new(request_id);
            stored.claim = Some(HeldClaim {
                token: claim.token,
                renewed_at: now,
            });
            issuance_claim = Some(claim);
        }

        Ok(TransitionOutcome {
            stage: decided,
            request: stored.request.clone(),
            previous_status,
            issuance_claim,
        })
    }

    async fn open_requests_for(
        &self,
        unit: UnitRef,
        role: VerifierRole,
        limit: usize,
    ) -> Result<Vec<RequestView>> {
        let inner = self.inner.lock();
        Ok(inner
            .sorted_requests(|r| {
                if r.request.status.is_terminal() {
                    return false;
                }
                let stages = inner.stages_of(r);
                gate::actionable_stages(&stages)
                    .into_iter()
                    .any(|s| s.data().unit == unit && s.data().verifier_role == role)
            })
            .into_iter()
            .take(limit)
            .map(|stored| inner.view(stored))
            .collect())
    }

    async fn overdue_groups(&self, stale_before: DateTime<Utc>) -> Result<Vec<OverdueGroup>> {
        let inner = self.inner.lock();
        let mut groups: BTreeMap<(UnitRef, VerifierRole), (usize, DateTime<Utc>)> =
            BTreeMap::new();

        for stored in inner.requests.values() {
            if stored.request.status.is_terminal() {
                continue;
            }
            let stages = inner.stages_of(stored);
            for stage in gate::actionable_stages(&stages) {
                let since = gate::waiting_since(stage, &stages);
                if since > stale_before {
                    continue;
                }
                let key = (stage.data().unit, stage.data().verifier_role);
                let entry = groups.entry(key).or_insert((0, since));
                entry.0 += 1;
                entry.1 = entry.1.min(since);
            }
        }

        Ok(groups
            .into_iter()
            .map(|((unit, role), (pending_count, oldest_since))| OverdueGroup {
                unit,
                role,
                pending_count,
                oldest_since,
            })
            .collect())
    }

    async fn claim_issuance(
        &self,
        id: RequestId,
        stale_before: DateTime<Utc>,
    ) -> Result<Option<IssuanceClaim>> {
        let mut inner = self.inner.lock();
        let stored = inner
            .requests
            .get_mut(&id)
            .ok_or(ClearanceError::RequestNotFound(id))?;

        let claimable = stored.request.status == RequestStatus::Completed
            && stored.request.certificate.is_none()
            && stored.claim_is_stale(stale_before);
        if !claimable {
            return Ok(None);
        }
        let claim = IssuanceClaim::new(id);
        stored.claim = Some(HeldClaim {
            token: claim.token,
            renewed_at: Utc::now(),
        });
        Ok(Some(claim))
    }

    async fn renew_issuance(&self, claim: &IssuanceClaim) -> Result<bool> {
        let mut inner = self.inner.lock();
        let stored = inner
            .requests
            .get_mut(&claim.request_id)
            .ok_or(ClearanceError::RequestNotFound(claim.request_id))?;
        if !stored.holds(claim) {
            return Ok(false);
        }
        stored.claim = Some(HeldClaim {
            token: claim.token,
            renewed_at: Utc::now(),
        });
        Ok(true)
    }

    async fn record_certificate(
        &self,
        claim: &IssuanceClaim,
        certificate: &CertificateRef,
    ) -> Result<()> {
        let id = claim.request_id;
        let mut inner = self.inner.lock();
        let stored = inner
            .requests
            .get_mut(&id)
            .ok_or(ClearanceError::RequestNotFound(id))?;

        if let Some(existing) = &stored.request.certificate {
            return Err(ClearanceError::Other(anyhow::anyhow!(
                "Request {} already has certificate {}",
                id,
                existing.certificate_number
            )));
        }
        if !stored.holds(claim) {
            return Err(ClearanceError::Other(anyhow::anyhow!(
                "Issuance claim on request {} is no longer held",
                id
            )));
        }
        stored.request.certificate = Some(certificate.clone());
        stored.request.updated_at = Utc::now();
        stored.claim = None;
        Ok(())
    }

    async fn release_issuance(&self, claim: &IssuanceClaim) -> Result<()> {
        let mut inner = self.inner.lock();
        let stored = inner
            .requests
            .get_mut(&claim.request_id)
            .ok_or(ClearanceError::RequestNotFound(claim.request_id))?;
        if stored.holds(claim) {
            stored.claim = None;
        }
        Ok(())
    }

    async fn list_unissued(
        &self,
        stale_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<RequestId>> {
        let inner = self.inner.lock();
        Ok(inner
            .sorted_requests(|r| {
                r.request.status == RequestStatus::Completed
                    && r.request.certificate.is_none()
                    && r.claim_is_stale(stale_before)
            })
            .into_iter()
            .take(limit)
            .map(|stored| stored.request.id)
            .collect())
    }

    async fn find_by_certificate(&self, certificate_number: &str) -> Result<Option<RequestView>> {
        let number = certificate_number.trim();
        let certificate_id = Uuid::parse_str(number).ok();
        let inner = self.inner.lock();
        Ok(inner
            .requests
            .values()
            .find(|r| {
                r.request.certificate.as_ref().is_some_and(|c| {
                    c.certificate_number == number || certificate_id == Some(c.id)
                })
            })
            .map(|stored| inner.view(stored)))
    }

    async fn dashboard_stats(&self, bottleneck_limit: usize) -> Result<DashboardStats> {
        let inner = self.inner.lock();
        let mut stats = DashboardStats::default();
        let mut pending_by_unit: HashMap<UnitRef, u64> = HashMap::new();

        for stored in inner.requests.values() {
            stats.add(stored.request.status, 1);
            if stored.request.status.is_terminal() {
                continue;
            }
            for stage in inner.stages_of(stored).iter().filter(|s| s.is_pending()) {
                *pending_by_unit.entry(stage.data().unit).or_default() += 1;
            }
        }

        let mut bottlenecks: Vec<Bottleneck> = pending_by_unit
            .into_iter()
            .map(|(unit, pending_count)| Bottleneck {
                unit,
                pending_count,
            })
            .collect();
        bottlenecks.sort_by(|a, b| {
            b.pending_count
                .cmp(&a.pending_count)
                .then_with(|| a.unit.cmp(&b.unit))
        });
        bottlenecks.truncate(bottleneck_limit);
        stats.bottlenecks = bottlenecks;

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::principal::ActorId;
    use crate::domain::stage::StageSpec;
    use crate::domain::unit::UnitId;
    use uuid::Uuid;

    fn new_request(orders: &[u32]) -> (ClearanceRequest, Vec<Stage<Pending>>) {
        let request = ClearanceRequest::new(RequesterId(Uuid::new_v4()), Utc::now());
        let stages = orders
            .iter()
            .enumerate()
            .map(|(i, order)| {
                Stage::from_spec(
                    request.id,
                    StageSpec {
                        unit: UnitRef::Unit(UnitId(i as i64 + 1)),
                        verifier_role: VerifierRole::Staff,
                        sequence_order: *order,
                    },
                    Utc::now(),
                )
            })
            .collect();
        (request, stages)
    }

    fn actor() -> ActorId {
        ActorId(Uuid::new_v4())
    }

    #[tokio::test]
    async fn test_create_and_get_request() {
        let storage = InMemoryStorage::new();
        let (request, stages) = new_request(&[1, 2, 2, 3]);
        storage.create_request(&request, &stages).await.unwrap();

        let view = storage.get_request(request.id).await.unwrap();
        assert_eq!(view.stages.len(), 4);
        assert_eq!(view.status(), RequestStatus::Pending);

        let latest = storage
            .latest_request_for(request.requester_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.request.id, request.id);
    }

    #[tokio::test]
    async fn test_create_rejects_empty_stage_set() {
        let storage = InMemoryStorage::new();
        let (request, _) = new_request(&[]);
        let err = storage.create_request(&request, &[]).await.unwrap_err();
        assert!(matches!(err, ClearanceError::Validation(_)));
        assert_eq!(storage.request_count(), 0);
    }

    #[tokio::test]
    async fn test_second_active_request_is_refused() {
        let storage = InMemoryStorage::new();
        let (request, stages) = new_request(&[1]);
        storage.create_request(&request, &stages).await.unwrap();

        let again = ClearanceRequest::new(request.requester_id, Utc::now());
        let stage = Stage::from_spec(
            again.id,
            StageSpec {
                unit: UnitRef::Unit(UnitId(1)),
                verifier_role: VerifierRole::Staff,
                sequence_order: 1,
            },
            Utc::now(),
        );
        let err = storage.create_request(&again, &[stage]).await.unwrap_err();
        assert!(matches!(err, ClearanceError::ActiveRequestExists(_)));
    }

    #[tokio::test]
    async fn test_commit_enforces_gating_and_single_decision() {
        let storage = InMemoryStorage::new();
        let (request, stages) = new_request(&[1, 2]);
        storage.create_request(&request, &stages).await.unwrap();

        let err = stages[1]
            .clone()
            .approve(actor(), None, &storage)
            .await
            .unwrap_err();
        assert!(matches!(err, ClearanceError::NotActionable(_)));

        let outcome = stages[0]
            .clone()
            .approve(actor(), None, &storage)
            .await
            .unwrap();
        assert_eq!(outcome.request.status, RequestStatus::InProgress);
        assert_eq!(outcome.previous_status, RequestStatus::Pending);

        let err = stages[0]
            .clone()
            .approve(actor(), None, &storage)
            .await
            .unwrap_err();
        assert!(matches!(err, ClearanceError::AlreadyProcessed(_)));
    }

    fn certificate(number: &str) -> CertificateRef {
        CertificateRef {
            id: Uuid::new_v4(),
            certificate_number: number.to_string(),
            issued_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_completion_takes_issuance_claim_once() {
        let storage = InMemoryStorage::new();
        let (request, stages) = new_request(&[1]);
        storage.create_request(&request, &stages).await.unwrap();

        let outcome = stages[0]
            .clone()
            .approve(actor(), None, &storage)
            .await
            .unwrap();
        assert!(outcome.completed_now());
        let claim = outcome.issuance_claim.unwrap();
        assert_eq!(claim.request_id, request.id);

        // Claim is held and fresh, so nobody else may take it
        let stale_before = Utc::now() - chrono::Duration::minutes(5);
        assert!(
            storage
                .claim_issuance(request.id, stale_before)
                .await
                .unwrap()
                .is_none()
        );
        assert!(storage.list_unissued(stale_before, 10).await.unwrap().is_empty());

        storage.release_issuance(&claim).await.unwrap();
        assert_eq!(
            storage.list_unissued(stale_before, 10).await.unwrap(),
            vec![request.id]
        );
        let retry = storage
            .claim_issuance(request.id, stale_before)
            .await
            .unwrap()
            .unwrap();
        assert_ne!(retry.token, claim.token);

        let issued = certificate("ND-2026-4F2A1");
        storage.record_certificate(&retry, &issued).await.unwrap();
        assert!(
            storage
                .claim_issuance(request.id, Utc::now())
                .await
                .unwrap()
                .is_none()
        );

        let found = storage
            .find_by_certificate(" ND-2026-4F2A1 ")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.request.id, request.id);
        let found = storage
            .find_by_certificate(&issued.id.to_string())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.request.id, request.id);
    }

    #[tokio::test]
    async fn test_taken_over_claim_cannot_record_or_release() {
        let storage = InMemoryStorage::new();
        let (request, stages) = new_request(&[1]);
        storage.create_request(&request, &stages).await.unwrap();
        let first = stages[0]
            .clone()
            .approve(actor(), None, &storage)
            .await
            .unwrap()
            .issuance_claim
            .unwrap();

        // A sweep that considers every claim stale takes over
        let second = storage
            .claim_issuance(request.id, Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap()
            .unwrap();

        assert!(!storage.renew_issuance(&first).await.unwrap());
        let err = storage
            .record_certificate(&first, &certificate("ND-2026-00001"))
            .await
            .unwrap_err();
        assert!(matches!(err, ClearanceError::Other(_)));

        // Releasing the superseded claim leaves the current holder in place
        storage.release_issuance(&first).await.unwrap();
        assert!(storage.renew_issuance(&second).await.unwrap());
        storage
            .record_certificate(&second, &certificate("ND-2026-00002"))
            .await
            .unwrap();

        let view = storage.get_request(request.id).await.unwrap();
        assert_eq!(
            view.request.certificate.unwrap().certificate_number,
            "ND-2026-00002"
        );
    }

    #[tokio::test]
    async fn test_renewal_keeps_claim_fresh() {
        let storage = InMemoryStorage::new();
        let (request, stages) = new_request(&[1]);
        storage.create_request(&request, &stages).await.unwrap();
        let claim = stages[0]
            .clone()
            .approve(actor(), None, &storage)
            .await
            .unwrap()
            .issuance_claim
            .unwrap();

        let before_renewal = Utc::now() + chrono::Duration::milliseconds(1);
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        assert!(storage.renew_issuance(&claim).await.unwrap());

        assert!(
            storage
                .claim_issuance(request.id, before_renewal)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_queue_limit_applies_after_gating() {
        let storage = InMemoryStorage::new();
        let target = UnitRef::Unit(UnitId(2));

        // Older request: the target unit sits behind an undecided order 1
        let (older, older_stages) = new_request(&[1, 2]);
        storage.create_request(&older, &older_stages).await.unwrap();

        // Newer request: order 1 approved, so the target unit is up
        let (newer, newer_stages) = new_request(&[1, 2]);
        storage.create_request(&newer, &newer_stages).await.unwrap();
        newer_stages[0]
            .clone()
            .approve(actor(), None, &storage)
            .await
            .unwrap();

        let queue = storage
            .open_requests_for(target, VerifierRole::Staff, 1)
            .await
            .unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].request.id, newer.id);
    }

    #[tokio::test]
    async fn test_overdue_groups_count_only_actionable_stages() {
        let storage = InMemoryStorage::new();
        let (first, first_stages) = new_request(&[1, 2]);
        let (second, second_stages) = new_request(&[1]);
        storage.create_request(&first, &first_stages).await.unwrap();
        storage
            .create_request(&second, &second_stages)
            .await
            .unwrap();

        let groups = storage
            .overdue_groups(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        // Both order 1 stages sit at unit 1; the gated order 2 stage is not counted
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].unit, UnitRef::Unit(UnitId(1)));
        assert_eq!(groups[0].pending_count, 2);

        let fresh = storage
            .overdue_groups(Utc::now() - chrono::Duration::minutes(5))
            .await
            .unwrap();
        assert!(fresh.is_empty());
    }

    #[tokio::test]
    async fn test_rejection_terminates_request() {
        let storage = InMemoryStorage::new();
        let (request, stages) = new_request(&[1, 1, 2]);
        storage.create_request(&request, &stages).await.unwrap();

        let outcome = stages[0]
            .clone()
            .reject(actor(), "books not returned".to_string(), &storage)
            .await
            .unwrap();
        assert!(outcome.rejected_now());

        // The sibling is still pending but the request is closed
        let err = stages[1]
            .clone()
            .approve(actor(), None, &storage)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ClearanceError::RequestAlreadyTerminal(_, RequestStatus::Rejected)
        ));
    }

    #[tokio::test]
    async fn test_dashboard_counts_open_pending_stages() {
        let storage = InMemoryStorage::new();
        let (first, first_stages) = new_request(&[1, 2]);
        let (second, second_stages) = new_request(&[1]);
        storage.create_request(&first, &first_stages).await.unwrap();
        storage
            .create_request(&second, &second_stages)
            .await
            .unwrap();
        second_stages[0]
            .clone()
            .reject(actor(), "fees due".to_string(), &storage)
            .await
            .unwrap();

        let stats = storage.dashboard_stats(5).await.unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.count(RequestStatus::Pending), 1);
        assert_eq!(stats.count(RequestStatus::Rejected), 1);
        // Only the open request's two pending stages count
        let pending: u64 = stats.bottlenecks.iter().map(|b| b.pending_count).sum();
        assert_eq!(pending, 2);
    }
}
