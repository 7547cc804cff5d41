//! PostgreSQL implementation of [`Storage`].
//!
//! Stage transitions take a `SELECT ... FOR UPDATE` lock on the owning request row,
//! re-read the request's stages, and write the stage with a compare-and-set on
//! `status = 'pending'`. The request status recompute and the issuance claim are
//! written in the same transaction, so completion is detected exactly once.

use std::collections::HashMap;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row};
use uuid::Uuid;

use super::{
    Bottleneck, DashboardStats, IssuanceClaim, OverdueGroup, Storage, TransitionOutcome,
};
use crate::domain::principal::{ActorId, RequesterId, VerifierRole};
use crate::domain::request::{
    CertificateRef, ClearanceRequest, RequestId, RequestStatus, RequestView,
};
use crate::domain::stage::{
    AnyStage, Approved, Pending, Rejected, Stage, StageData, StageId, StageStatus,
};
use crate::domain::unit::{DivisionId, UnitId, UnitRef};
use crate::error::{ClearanceError, Result};
use crate::gate;

mod pool_provider;

pub use pool_provider::{PoolProvider, TestDbPools};

const REQUEST_COLUMNS: &str = "id, requester_id, status, remarks, certificate_id, \
     certificate_number, certificate_issued_at, created_at, updated_at";

const STAGE_COLUMNS: &str = "id, request_id, unit_id, division_id, verifier_role, \
     sequence_order, status, reviewer_id, reviewed_at, remarks, created_at";

const LIVE_REQUEST_INDEX: &str = "clearance_requests_one_live_per_requester";

/// PostgreSQL implementation of the Storage trait.
///
/// # Example
/// ```ignore
/// use clearance::{PostgresStorage, migrator};
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgresql://localhost/clearance").await?;
/// migrator().run(&pool).await?;
/// let storage = Arc::new(PostgresStorage::new(pool));
/// ```
pub struct PostgresStorage<P: PoolProvider = PgPool> {
    pools: P,
}

impl<P: PoolProvider> PostgresStorage<P> {
    pub fn new(pools: P) -> Self {
        Self { pools }
    }

    pub fn pools(&self) -> &P {
        &self.pools
    }

    async fn ensure_request_exists(&self, id: RequestId) -> Result<()> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM clearance_requests WHERE id = $1)")
                .bind(*id)
                .fetch_one(self.pools.write())
                .await
                .map_err(|e| ClearanceError::Other(anyhow!("Failed to check request: {}", e)))?;
        if exists {
            Ok(())
        } else {
            Err(ClearanceError::RequestNotFound(id))
        }
    }

    /// Load the stages of `requests` and pair them up, preserving request order.
    async fn attach_stages(
        &self,
        pool: &PgPool,
        requests: Vec<ClearanceRequest>,
    ) -> Result<Vec<RequestView>> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<Uuid> = requests.iter().map(|r| *r.id).collect();
        let rows = sqlx::query(&format!(
            "SELECT {STAGE_COLUMNS} FROM clearance_stages WHERE request_id = ANY($1)"
        ))
        .bind(&ids)
        .fetch_all(pool)
        .await
        .map_err(|e| ClearanceError::Other(anyhow!("Failed to fetch stages: {}", e)))?;

        let mut by_request: HashMap<RequestId, Vec<AnyStage>> = HashMap::new();
        for row in &rows {
            let stage = stage_from_row(row)?;
            by_request
                .entry(stage.data().request_id)
                .or_default()
                .push(stage);
        }

        Ok(requests
            .into_iter()
            .map(|request| {
                let stages = by_request.remove(&request.id).unwrap_or_default();
                RequestView::new(request, stages)
            })
            .collect())
    }
}

impl<P: PoolProvider> Clone for PostgresStorage<P> {
    fn clone(&self) -> Self {
        Self {
            pools: self.pools.clone(),
        }
    }
}

// ============================================================================
// Row decoding
// ============================================================================

fn column<'r, T>(row: &'r PgRow, name: &str) -> Result<T>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get(name)
        .map_err(|e| ClearanceError::Other(anyhow!("Failed to read {}: {}", name, e)))
}

fn request_from_row(row: &PgRow) -> Result<ClearanceRequest> {
    let status_str: String = column(row, "status")?;
    let status = status_str.parse::<RequestStatus>().map_err(|e| {
        ClearanceError::Other(anyhow!("Invalid request status '{}': {}", status_str, e))
    })?;

    let certificate_id: Option<Uuid> = column(row, "certificate_id")?;
    let certificate_number: Option<String> = column(row, "certificate_number")?;
    let certificate_issued_at: Option<DateTime<Utc>> = column(row, "certificate_issued_at")?;
    let certificate = match (certificate_id, certificate_number, certificate_issued_at) {
        (Some(id), Some(certificate_number), Some(issued_at)) => Some(CertificateRef {
            id,
            certificate_number,
            issued_at,
        }),
        _ => None,
    };

    Ok(ClearanceRequest {
        id: RequestId(column(row, "id")?),
        requester_id: RequesterId(column(row, "requester_id")?),
        status,
        remarks: column(row, "remarks")?,
        certificate,
        created_at: column(row, "created_at")?,
        updated_at: column(row, "updated_at")?,
    })
}

fn stage_from_row(row: &PgRow) -> Result<AnyStage> {
    let id = StageId(column(row, "id")?);

    let unit = unit_from_row(row).map_err(|_| {
        ClearanceError::Other(anyhow!(
            "Stage {} must reference exactly one unit or division",
            id
        ))
    })?;

    let role_str: String = column(row, "verifier_role")?;
    let verifier_role = role_str.parse::<VerifierRole>().map_err(|e| {
        ClearanceError::Other(anyhow!("Invalid verifier role '{}': {}", role_str, e))
    })?;
    let sequence_order: i32 = column(row, "sequence_order")?;

    let data = StageData {
        id,
        request_id: RequestId(column(row, "request_id")?),
        unit,
        verifier_role,
        sequence_order: sequence_order as u32,
        created_at: column(row, "created_at")?,
    };

    let status_str: String = column(row, "status")?;
    let status = status_str.parse::<StageStatus>().map_err(|e| {
        ClearanceError::Other(anyhow!("Invalid stage status '{}': {}", status_str, e))
    })?;
    let reviewer_id: Option<Uuid> = column(row, "reviewer_id")?;
    let reviewed_at: Option<DateTime<Utc>> = column(row, "reviewed_at")?;
    let remarks: Option<String> = column(row, "remarks")?;

    let review = || {
        reviewer_id.zip(reviewed_at).ok_or_else(|| {
            ClearanceError::Other(anyhow!("Stage {} is {} but has no reviewer", id, status_str))
        })
    };

    Ok(match status {
        StageStatus::Pending => AnyStage::Pending(Stage {
            state: Pending {},
            data,
        }),
        StageStatus::Approved => {
            let (reviewer_id, reviewed_at) = review()?;
            AnyStage::Approved(Stage {
                state: Approved {
                    reviewer_id: ActorId(reviewer_id),
                    reviewed_at,
                    remarks,
                },
                data,
            })
        }
        StageStatus::Rejected => {
            let (reviewer_id, reviewed_at) = review()?;
            AnyStage::Rejected(Stage {
                state: Rejected {
                    reviewer_id: ActorId(reviewer_id),
                    reviewed_at,
                    remarks: remarks.unwrap_or_default(),
                },
                data,
            })
        }
    })
}

fn unit_from_row(row: &PgRow) -> Result<UnitRef> {
    let unit_id: Option<i64> = column(row, "unit_id")?;
    let division_id: Option<i64> = column(row, "division_id")?;
    match (unit_id, division_id) {
        (Some(unit), None) => Ok(UnitRef::Unit(UnitId(unit))),
        (None, Some(division)) => Ok(UnitRef::Division(DivisionId(division))),
        _ => Err(ClearanceError::Other(anyhow!(
            "Row must reference exactly one unit or division"
        ))),
    }
}

fn unit_columns(unit: UnitRef) -> (Option<i64>, Option<i64>) {
    match unit {
        UnitRef::Unit(id) => (Some(id.0), None),
        UnitRef::Division(id) => (None, Some(id.0)),
    }
}

fn is_live_request_conflict(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .and_then(|db| db.constraint())
        .is_some_and(|c| c == LIVE_REQUEST_INDEX)
}

#[async_trait]
impl<P: PoolProvider> Storage for PostgresStorage<P> {
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

        let mut tx =
            self.pools.write().begin().await.map_err(|e| {
                ClearanceError::Other(anyhow!("Failed to begin transaction: {}", e))
            })?;

        let existing: Vec<String> = sqlx::query_scalar(
            "SELECT status FROM clearance_requests WHERE requester_id = $1 AND status <> 'rejected'",
        )
        .bind(*request.requester_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| ClearanceError::Other(anyhow!("Failed to check existing requests: {}", e)))?;
        if existing.iter().any(|s| s == RequestStatus::Completed.as_str()) {
            return Err(ClearanceError::AlreadyCompleted(request.requester_id));
        }
        if !existing.is_empty() {
            return Err(ClearanceError::ActiveRequestExists(request.requester_id));
        }

        sqlx::query(
            r#"
            INSERT INTO clearance_requests (id, requester_id, status, remarks, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(*request.id)
        .bind(*request.requester_id)
        .bind(request.status.as_str())
        .bind(&request.remarks)
        .bind(request.created_at)
        .bind(request.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            // A concurrent create for the same requester got there first
            if is_live_request_conflict(&e) {
                ClearanceError::ActiveRequestExists(request.requester_id)
            } else {
                ClearanceError::Other(anyhow!("Failed to insert request: {}", e))
            }
        })?;

        let mut ids = Vec::with_capacity(stages.len());
        let mut unit_ids = Vec::with_capacity(stages.len());
        let mut division_ids = Vec::with_capacity(stages.len());
        let mut roles = Vec::with_capacity(stages.len());
        let mut orders = Vec::with_capacity(stages.len());
        let mut created = Vec::with_capacity(stages.len());
        for stage in stages {
            let (unit_id, division_id) = unit_columns(stage.data.unit);
            ids.push(*stage.data.id);
            unit_ids.push(unit_id);
            division_ids.push(division_id);
            roles.push(stage.data.verifier_role.as_str().to_string());
            orders.push(stage.data.sequence_order as i32);
            created.push(stage.data.created_at);
        }

        sqlx::query(
            r#"
            INSERT INTO clearance_stages
                (id, request_id, unit_id, division_id, verifier_role, sequence_order, created_at)
            SELECT s.id, $1, s.unit_id, s.division_id, s.verifier_role, s.sequence_order, s.created_at
            FROM UNNEST($2::uuid[], $3::bigint[], $4::bigint[], $5::text[], $6::int[], $7::timestamptz[])
                AS s(id, unit_id, division_id, verifier_role, sequence_order, created_at)
            "#,
        )
        .bind(*request.id)
        .bind(&ids)
        .bind(&unit_ids)
        .bind(&division_ids)
        .bind(&roles)
        .bind(&orders)
        .bind(&created)
        .execute(&mut *tx)
        .await
        .map_err(|e| ClearanceError::Other(anyhow!("Failed to insert stages: {}", e)))?;

        tx.commit()
            .await
            .map_err(|e| ClearanceError::Other(anyhow!("Failed to commit transaction: {}", e)))?;

        Ok(())
    }

    #[tracing::instrument(skip(self), fields(request_id = %id))]
    async fn get_request(&self, id: RequestId) -> Result<RequestView> {
        let row = sqlx::query(&format!(
            "SELECT {REQUEST_COLUMNS} FROM clearance_requests WHERE id = $1"
        ))
        .bind(*id)
        .fetch_optional(self.pools.read())
        .await
        .map_err(|e| ClearanceError::Other(anyhow!("Failed to fetch request: {}", e)))?
        .ok_or(ClearanceError::RequestNotFound(id))?;

        let request = request_from_row(&row)?;
        let mut views = self.attach_stages(self.pools.read(), vec![request]).await?;
        views
            .pop()
            .ok_or_else(|| ClearanceError::Other(anyhow!("Request {} vanished", id)))
    }

    async fn latest_request_for(&self, requester_id: RequesterId) -> Result<Option<RequestView>> {
        let row = sqlx::query(&format!(
            "SELECT {REQUEST_COLUMNS} FROM clearance_requests WHERE requester_id = $1 \
             ORDER BY created_at DESC LIMIT 1"
        ))
        .bind(*requester_id)
        .fetch_optional(self.pools.read())
        .await
        .map_err(|e| ClearanceError::Other(anyhow!("Failed to fetch latest request: {}", e)))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let request = request_from_row(&row)?;
        Ok(self
            .attach_stages(self.pools.read(), vec![request])
            .await?
            .pop())
    }

    async fn get_stage(&self, id: StageId) -> Result<AnyStage> {
        let row = sqlx::query(&format!(
            "SELECT {STAGE_COLUMNS} FROM clearance_stages WHERE id = $1"
        ))
        .bind(*id)
        .fetch_optional(self.pools.read())
        .await
        .map_err(|e| ClearanceError::Other(anyhow!("Failed to fetch stage: {}", e)))?
        .ok_or(ClearanceError::StageNotFound(id))?;
        stage_from_row(&row)
    }

    #[tracing::instrument(skip(self, stage), fields(stage_id = %stage.id(), status = stage.status().as_str()))]
    async fn commit_transition(&self, stage: AnyStage) -> Result<TransitionOutcome> {
        let (reviewer_id, reviewed_at) = match (stage.reviewer_id(), stage.reviewed_at()) {
            (Some(reviewer_id), Some(reviewed_at)) => (reviewer_id, reviewed_at),
            _ => {
                return Err(ClearanceError::Validation(
                    "only approved or rejected stages can be committed".to_string(),
                ));
            }
        };
        let stage_id = stage.id();
        let now = Utc::now();

        let mut tx =
            self.pools.write().begin().await.map_err(|e| {
                ClearanceError::Other(anyhow!("Failed to begin transaction: {}", e))
            })?;

        let request_id: Uuid =
            sqlx::query_scalar("SELECT request_id FROM clearance_stages WHERE id = $1")
                .bind(*stage_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| ClearanceError::Other(anyhow!("Failed to fetch stage: {}", e)))?
                .ok_or(ClearanceError::StageNotFound(stage_id))?;
        let request_id = RequestId(request_id);

        // Serializes every transition on this request until commit
        let request_row = sqlx::query(&format!(
            "SELECT {REQUEST_COLUMNS} FROM clearance_requests WHERE id = $1 FOR UPDATE"
        ))
        .bind(*request_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| ClearanceError::Other(anyhow!("Failed to lock request: {}", e)))?
        .ok_or(ClearanceError::RequestNotFound(request_id))?;
        let mut request = request_from_row(&request_row)?;

        let stage_rows = sqlx::query(&format!(
            "SELECT {STAGE_COLUMNS} FROM clearance_stages WHERE request_id = $1"
        ))
        .bind(*request_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| ClearanceError::Other(anyhow!("Failed to fetch stages: {}", e)))?;
        let mut stages = stage_rows
            .iter()
            .map(stage_from_row)
            .collect::<Result<Vec<_>>>()?;

        let position = stages
            .iter()
            .position(|s| s.id() == stage_id)
            .ok_or(ClearanceError::StageNotFound(stage_id))?;
        if !stages[position].is_pending() {
            return Err(ClearanceError::AlreadyProcessed(stage_id));
        }
        if request.status.is_terminal() {
            return Err(ClearanceError::RequestAlreadyTerminal(
                request_id,
                request.status,
            ));
        }
        if !gate::is_actionable(&stages[position], &stages) {
            return Err(ClearanceError::NotActionable(stage_id));
        }

        let updated = sqlx::query(
            r#"
            UPDATE clearance_stages SET
                status = $2,
                reviewer_id = $3,
                reviewed_at = $4,
                remarks = $5
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(*stage_id)
        .bind(stage.status().as_str())
        .bind(*reviewer_id)
        .bind(reviewed_at)
        .bind(stage.remarks())
        .execute(&mut *tx)
        .await
        .map_err(|e| ClearanceError::Other(anyhow!("Failed to update stage: {}", e)))?
        .rows_affected();
        if updated == 0 {
            return Err(ClearanceError::AlreadyProcessed(stage_id));
        }

        let stored_data = stages[position].data().clone();
        let decided = match stage {
            AnyStage::Approved(mut s) => {
                s.data = stored_data;
                AnyStage::Approved(s)
            }
            AnyStage::Rejected(mut s) => {
                s.data = stored_data;
                AnyStage::Rejected(s)
            }
            AnyStage::Pending(_) => {
                return Err(ClearanceError::Validation(
                    "only approved or rejected stages can be committed".to_string(),
                ));
            }
        };
        stages[position] = decided.clone();

        let previous_status = request.status;
        request.recompute(&stages, now);
        let issuance_claim = (request.status == RequestStatus::Completed
            && previous_status != RequestStatus::Completed)
            .then(|| IssuanceClaim::new(request_id));

        sqlx::query(
            r#"
            UPDATE clearance_requests SET
                status = $2,
                remarks = $3,
                updated_at = $4,
                issuance_claimed_at = CASE WHEN $5::uuid IS NULL THEN issuance_claimed_at ELSE $4 END,
                issuance_claim_id = COALESCE($5, issuance_claim_id)
            WHERE id = $1
            "#,
        )
        .bind(*request_id)
        .bind(request.status.as_str())
        .bind(&request.remarks)
        .bind(now)
        .bind(issuance_claim.map(|c| c.token))
        .execute(&mut *tx)
        .await
        .map_err(|e| ClearanceError::Other(anyhow!("Failed to update request: {}", e)))?;

        tx.commit()
            .await
            .map_err(|e| ClearanceError::Other(anyhow!("Failed to commit transaction: {}", e)))?;

        Ok(TransitionOutcome {
            stage: decided,
            request,
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
        let (unit_id, division_id) = unit_columns(unit);
        let rows = sqlx::query(&format!(
            r#"
            SELECT {REQUEST_COLUMNS} FROM clearance_requests r
            WHERE r.status IN ('pending', 'in_progress')
              AND EXISTS (
                SELECT 1 FROM clearance_stages s
                WHERE s.request_id = r.id
                  AND s.status = 'pending'
                  AND s.verifier_role = $3
                  AND s.unit_id IS NOT DISTINCT FROM $1
                  AND s.division_id IS NOT DISTINCT FROM $2
                  AND NOT EXISTS (
                    SELECT 1 FROM clearance_stages l
                    WHERE l.request_id = s.request_id
                      AND l.sequence_order < s.sequence_order
                      AND l.status <> 'approved'
                  )
              )
            ORDER BY r.created_at ASC
            LIMIT $4
            "#
        ))
        .bind(unit_id)
        .bind(division_id)
        .bind(role.as_str())
        .bind(limit.min(i64::MAX as usize) as i64)
        .fetch_all(self.pools.read())
        .await
        .map_err(|e| ClearanceError::Other(anyhow!("Failed to list requests for unit: {}", e)))?;

        let requests = rows
            .iter()
            .map(request_from_row)
            .collect::<Result<Vec<_>>>()?;
        self.attach_stages(self.pools.read(), requests).await
    }

    async fn overdue_groups(&self, stale_before: DateTime<Utc>) -> Result<Vec<OverdueGroup>> {
        let rows = sqlx::query(
            r#"
            WITH actionable AS (
                SELECT
                    s.unit_id,
                    s.division_id,
                    s.verifier_role,
                    GREATEST(
                        s.created_at,
                        COALESCE(
                            (SELECT MAX(l.reviewed_at) FROM clearance_stages l
                             WHERE l.request_id = s.request_id
                               AND l.sequence_order < s.sequence_order),
                            s.created_at
                        )
                    ) AS waiting_since
                FROM clearance_stages s
                JOIN clearance_requests r ON r.id = s.request_id
                WHERE s.status = 'pending'
                  AND r.status IN ('pending', 'in_progress')
                  AND NOT EXISTS (
                    SELECT 1 FROM clearance_stages l
                    WHERE l.request_id = s.request_id
                      AND l.sequence_order < s.sequence_order
                      AND l.status <> 'approved'
                  )
            )
            SELECT unit_id, division_id, verifier_role,
                   COUNT(*) AS pending_count,
                   MIN(waiting_since) AS oldest_since
            FROM actionable
            WHERE waiting_since <= $1
            GROUP BY unit_id, division_id, verifier_role
            ORDER BY (unit_id IS NULL), unit_id, division_id, verifier_role
            "#,
        )
        .bind(stale_before)
        .fetch_all(self.pools.read())
        .await
        .map_err(|e| ClearanceError::Other(anyhow!("Failed to list overdue stages: {}", e)))?;

        rows.iter()
            .map(|row| {
                let role_str: String = column(row, "verifier_role")?;
                let role = role_str.parse::<VerifierRole>().map_err(|e| {
                    ClearanceError::Other(anyhow!("Invalid verifier role '{}': {}", role_str, e))
                })?;
                let pending_count: i64 = column(row, "pending_count")?;
                Ok(OverdueGroup {
                    unit: unit_from_row(row)?,
                    role,
                    pending_count: pending_count as usize,
                    oldest_since: column(row, "oldest_since")?,
                })
            })
            .collect()
    }

    #[tracing::instrument(skip(self), fields(request_id = %id))]
    async fn claim_issuance(
        &self,
        id: RequestId,
        stale_before: DateTime<Utc>,
    ) -> Result<Option<IssuanceClaim>> {
        let claim = IssuanceClaim::new(id);
        let claimed = sqlx::query(
            r#"
            UPDATE clearance_requests SET issuance_claimed_at = $3, issuance_claim_id = $4
            WHERE id = $1
              AND status = 'completed'
              AND certificate_number IS NULL
              AND (issuance_claimed_at IS NULL OR issuance_claimed_at < $2)
            "#,
        )
        .bind(*id)
        .bind(stale_before)
        .bind(Utc::now())
        .bind(claim.token)
        .execute(self.pools.write())
        .await
        .map_err(|e| ClearanceError::Other(anyhow!("Failed to claim issuance: {}", e)))?
        .rows_affected();

        if claimed == 0 {
            self.ensure_request_exists(id).await?;
            return Ok(None);
        }
        Ok(Some(claim))
    }

    async fn renew_issuance(&self, claim: &IssuanceClaim) -> Result<bool> {
        let renewed = sqlx::query(
            r#"
            UPDATE clearance_requests SET issuance_claimed_at = NOW()
            WHERE id = $1 AND issuance_claim_id = $2 AND certificate_number IS NULL
            "#,
        )
        .bind(*claim.request_id)
        .bind(claim.token)
        .execute(self.pools.write())
        .await
        .map_err(|e| ClearanceError::Other(anyhow!("Failed to renew issuance claim: {}", e)))?
        .rows_affected();

        Ok(renewed > 0)
    }

    #[tracing::instrument(skip(self, claim, certificate), fields(request_id = %claim.request_id, certificate_number = %certificate.certificate_number))]
    async fn record_certificate(
        &self,
        claim: &IssuanceClaim,
        certificate: &CertificateRef,
    ) -> Result<()> {
        let id = claim.request_id;
        let updated = sqlx::query(
            r#"
            UPDATE clearance_requests SET
                certificate_id = $3,
                certificate_number = $4,
                certificate_issued_at = $5,
                issuance_claimed_at = NULL,
                issuance_claim_id = NULL,
                updated_at = NOW()
            WHERE id = $1 AND issuance_claim_id = $2 AND certificate_number IS NULL
            "#,
        )
        .bind(*id)
        .bind(claim.token)
        .bind(certificate.id)
        .bind(&certificate.certificate_number)
        .bind(certificate.issued_at)
        .execute(self.pools.write())
        .await
        .map_err(|e| ClearanceError::Other(anyhow!("Failed to record certificate: {}", e)))?
        .rows_affected();

        if updated == 0 {
            self.ensure_request_exists(id).await?;
            return Err(ClearanceError::Other(anyhow!(
                "Request {} already has a certificate or its issuance claim is no longer held",
                id
            )));
        }
        Ok(())
    }

    async fn release_issuance(&self, claim: &IssuanceClaim) -> Result<()> {
        let updated = sqlx::query(
            r#"
            UPDATE clearance_requests SET issuance_claimed_at = NULL, issuance_claim_id = NULL
            WHERE id = $1 AND issuance_claim_id = $2
            "#,
        )
        .bind(*claim.request_id)
        .bind(claim.token)
        .execute(self.pools.write())
        .await
        .map_err(|e| ClearanceError::Other(anyhow!("Failed to release issuance: {}", e)))?
        .rows_affected();

        if updated == 0 {
            self.ensure_request_exists(claim.request_id).await?;
        }
        Ok(())
    }

    async fn list_unissued(
        &self,
        stale_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<RequestId>> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id FROM clearance_requests
            WHERE status = 'completed'
              AND certificate_number IS NULL
              AND (issuance_claimed_at IS NULL OR issuance_claimed_at < $1)
            ORDER BY created_at ASC
            LIMIT $2
            "#,
        )
        .bind(stale_before)
        .bind(limit.min(i64::MAX as usize) as i64)
        .fetch_all(self.pools.read())
        .await
        .map_err(|e| ClearanceError::Other(anyhow!("Failed to list unissued requests: {}", e)))?;

        Ok(ids.into_iter().map(RequestId).collect())
    }

    async fn find_by_certificate(&self, certificate_number: &str) -> Result<Option<RequestView>> {
        let number = certificate_number.trim();
        let row = sqlx::query(&format!(
            "SELECT {REQUEST_COLUMNS} FROM clearance_requests \
             WHERE certificate_number = $1 OR certificate_id = $2 LIMIT 1"
        ))
        .bind(number)
        .bind(Uuid::parse_str(number).ok())
        .fetch_optional(self.pools.read())
        .await
        .map_err(|e| ClearanceError::Other(anyhow!("Failed to find certificate: {}", e)))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let request = request_from_row(&row)?;
        Ok(self
            .attach_stages(self.pools.read(), vec![request])
            .await?
            .pop())
    }

    async fn dashboard_stats(&self, bottleneck_limit: usize) -> Result<DashboardStats> {
        let counts = sqlx::query(
            "SELECT status, COUNT(*) AS count FROM clearance_requests GROUP BY status",
        )
        .fetch_all(self.pools.read())
        .await
        .map_err(|e| ClearanceError::Other(anyhow!("Failed to count requests: {}", e)))?;

        let mut stats = DashboardStats::default();
        for row in &counts {
            let status_str: String = column(row, "status")?;
            let status = status_str.parse::<RequestStatus>().map_err(|e| {
                ClearanceError::Other(anyhow!("Invalid request status '{}': {}", status_str, e))
            })?;
            let count: i64 = column(row, "count")?;
            stats.add(status, count as u64);
        }

        // Ties order the same way UnitRef does: units before divisions, then by id
        let bottlenecks = sqlx::query(
            r#"
            SELECT s.unit_id, s.division_id, COUNT(*) AS pending_count
            FROM clearance_stages s
            JOIN clearance_requests r ON r.id = s.request_id
            WHERE s.status = 'pending' AND r.status IN ('pending', 'in_progress')
            GROUP BY s.unit_id, s.division_id
            ORDER BY pending_count DESC, (s.unit_id IS NULL), s.unit_id, s.division_id
            LIMIT $1
            "#,
        )
        .bind(bottleneck_limit.min(i64::MAX as usize) as i64)
        .fetch_all(self.pools.read())
        .await
        .map_err(|e| ClearanceError::Other(anyhow!("Failed to compute bottlenecks: {}", e)))?;

        for row in &bottlenecks {
            let unit_id: Option<i64> = column(row, "unit_id")?;
            let division_id: Option<i64> = column(row, "division_id")?;
            let unit = match (unit_id, division_id) {
                (Some(id), _) => UnitRef::Unit(UnitId(id)),
                (None, Some(id)) => UnitRef::Division(DivisionId(id)),
                (None, None) => continue,
            };
            let pending_count: i64 = column(row, "pending_count")?;
            stats.bottlenecks.push(Bottleneck {
                unit,
                pending_count: pending_count as u64,
            });
        }

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::stage::StageSpec;
    use std::sync::Arc;

    fn new_request(orders: &[u32]) -> (ClearanceRequest, Vec<Stage<Pending>>) {
        let request = ClearanceRequest::new(RequesterId(Uuid::new_v4()), Utc::now());
        let stages = orders
            .iter()
            .enumerate()
            .map(|(i, order)| {
                let unit = if i == 0 {
                    UnitRef::Division(DivisionId(1))
                } else {
                    UnitRef::Unit(UnitId(i as i64 + 10))
                };
                Stage::from_spec(
                    request.id,
                    StageSpec {
                        unit,
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

    #[sqlx::test]
    async fn test_create_and_read_back(pool: PgPool) {
        let storage = PostgresStorage::new(TestDbPools::new(pool).await.unwrap());
        let (request, stages) = new_request(&[1, 2, 2, 3]);
        storage.create_request(&request, &stages).await.unwrap();

        let view = storage.get_request(request.id).await.unwrap();
        assert_eq!(view.status(), RequestStatus::Pending);
        assert_eq!(view.stages.len(), 4);
        assert_eq!(
            view.stages[0].data().unit,
            UnitRef::Division(DivisionId(1))
        );

        let latest = storage
            .latest_request_for(request.requester_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.request.id, request.id);
    }

    #[sqlx::test]
    async fn test_live_request_is_unique_per_requester(pool: PgPool) {
        let storage = PostgresStorage::new(TestDbPools::new(pool).await.unwrap());
        let (request, stages) = new_request(&[1]);
        storage.create_request(&request, &stages).await.unwrap();

        let again = ClearanceRequest::new(request.requester_id, Utc::now());
        let stage = Stage::from_spec(again.id, stages[0].data.spec(), Utc::now());
        let err = storage.create_request(&again, &[stage]).await.unwrap_err();
        assert!(matches!(err, ClearanceError::ActiveRequestExists(_)));
    }

    #[sqlx::test]
    async fn test_transition_gating_and_completion(pool: PgPool) {
        let storage = PostgresStorage::new(TestDbPools::new(pool).await.unwrap());
        let (request, stages) = new_request(&[1, 2]);
        storage.create_request(&request, &stages).await.unwrap();

        let err = stages[1]
            .clone()
            .approve(actor(), None, &storage)
            .await
            .unwrap_err();
        assert!(matches!(err, ClearanceError::NotActionable(_)));

        let first = stages[0]
            .clone()
            .approve(actor(), Some("ok".to_string()), &storage)
            .await
            .unwrap();
        assert_eq!(first.request.status, RequestStatus::InProgress);

        let last = stages[1]
            .clone()
            .approve(actor(), None, &storage)
            .await
            .unwrap();
        assert!(last.completed_now());
        let claim = last.issuance_claim.unwrap();

        // Claim is fresh
        let stale_before = Utc::now() - chrono::Duration::minutes(5);
        assert!(
            storage
                .claim_issuance(request.id, stale_before)
                .await
                .unwrap()
                .is_none()
        );
        assert!(storage.renew_issuance(&claim).await.unwrap());

        let certificate = CertificateRef {
            id: Uuid::new_v4(),
            certificate_number: "ND-2026-00A1F".to_string(),
            issued_at: Utc::now(),
        };
        storage
            .record_certificate(&claim, &certificate)
            .await
            .unwrap();
        let found = storage
            .find_by_certificate("ND-2026-00A1F")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.request.certificate, Some(certificate.clone()));

        let by_id = storage
            .find_by_certificate(&certificate.id.to_string())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_id.request.id, request.id);
        assert!(
            storage
                .find_by_certificate(&Uuid::new_v4().to_string())
                .await
                .unwrap()
                .is_none()
        );
    }

    #[sqlx::test]
    async fn test_superseded_claim_is_fenced(pool: PgPool) {
        let storage = PostgresStorage::new(TestDbPools::new(pool).await.unwrap());
        let (request, stages) = new_request(&[1]);
        storage.create_request(&request, &stages).await.unwrap();
        let first = stages[0]
            .clone()
            .approve(actor(), None, &storage)
            .await
            .unwrap()
            .issuance_claim
            .unwrap();

        let second = storage
            .claim_issuance(request.id, Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap()
            .unwrap();

        assert!(!storage.renew_issuance(&first).await.unwrap());
        let certificate = |number: &str| CertificateRef {
            id: Uuid::new_v4(),
            certificate_number: number.to_string(),
            issued_at: Utc::now(),
        };
        assert!(
            storage
                .record_certificate(&first, &certificate("ND-2026-00001"))
                .await
                .is_err()
        );
        storage.release_issuance(&first).await.unwrap();
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

    #[sqlx::test]
    async fn test_unit_queue_skips_gated_requests_before_limit(pool: PgPool) {
        let storage = PostgresStorage::new(TestDbPools::new(pool).await.unwrap());
        let target = UnitRef::Unit(UnitId(11));

        let (older, older_stages) = new_request(&[1, 2]);
        storage.create_request(&older, &older_stages).await.unwrap();
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

        let groups = storage
            .overdue_groups(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        // Older request waits at the division; newer one at unit 11
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].unit, target);
        assert_eq!(groups[0].pending_count, 1);
        assert_eq!(groups[1].unit, UnitRef::Division(DivisionId(1)));
        assert_eq!(groups[1].pending_count, 1);
    }

    #[sqlx::test]
    async fn test_rejection_records_remarks(pool: PgPool) {
        let storage = PostgresStorage::new(TestDbPools::new(pool).await.unwrap());
        let (request, stages) = new_request(&[1, 2]);
        storage.create_request(&request, &stages).await.unwrap();

        let outcome = stages[0]
            .clone()
            .reject(actor(), "dues outstanding".to_string(), &storage)
            .await
            .unwrap();
        assert!(outcome.rejected_now());

        let view = storage.get_request(request.id).await.unwrap();
        assert_eq!(view.status(), RequestStatus::Rejected);
        assert_eq!(
            view.request.remarks.as_deref(),
            Some("Rejected at Staff stage: dues outstanding")
        );
        assert_eq!(view.stages[0].remarks(), Some("dues outstanding"));

        // Resubmission is allowed after a rejection
        let (mut again, _) = new_request(&[1]);
        again.requester_id = request.requester_id;
        let stage = Stage::from_spec(again.id, stages[0].data.spec(), Utc::now());
        storage.create_request(&again, &[stage]).await.unwrap();
    }

    #[sqlx::test]
    async fn test_concurrent_approvals_have_one_winner(pool: PgPool) {
        let storage = Arc::new(PostgresStorage::new(TestDbPools::new(pool).await.unwrap()));
        let (request, stages) = new_request(&[1]);
        storage.create_request(&request, &stages).await.unwrap();

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let storage = storage.clone();
                let stage = stages[0].clone();
                tokio::spawn(async move { stage.approve(actor(), None, storage.as_ref()).await })
            })
            .collect();

        let mut winners = 0;
        let mut losers = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(outcome) => {
                    assert!(outcome.issuance_claimed());
                    winners += 1;
                }
                Err(ClearanceError::AlreadyProcessed(_)) => losers += 1,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        assert_eq!((winners, losers), (1, 1));
    }

    #[sqlx::test]
    async fn test_dashboard_stats(pool: PgPool) {
        let storage = PostgresStorage::new(TestDbPools::new(pool).await.unwrap());
        let (request, stages) = new_request(&[1, 2, 2]);
        storage.create_request(&request, &stages).await.unwrap();

        let stats = storage.dashboard_stats(2).await.unwrap();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.bottlenecks.len(), 2);
        // All tied at one; units sort before divisions
        assert_eq!(stats.bottlenecks[0].unit, UnitRef::Unit(UnitId(11)));
    }
}
