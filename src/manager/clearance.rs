//! The clearance manager: creates requests, applies verifier decisions, and hands
//! completed requests to the certificate issuer.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use metrics::counter;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{DashboardStats, IssuanceClaim, Storage, TransitionOutcome};
use crate::collaborators::Collaborators;
use crate::config::EngineConfig;
use crate::domain::principal::{ActorId, RequesterId};
use crate::domain::request::{CertificateRef, ClearanceRequest, RequestId, RequestView};
use crate::domain::stage::{AnyStage, Stage, StageAction, StageId};
use crate::error::{ClearanceError, Result};
use crate::events::AuditEvent;
use crate::gate;
use crate::policy;
use crate::sweeper::Sweeper;

/// A stage waiting on a particular verifier.
#[derive(Debug, Clone, Serialize)]
pub struct QueueEntry {
    pub request_id: RequestId,
    pub requester_id: RequesterId,
    pub stage: AnyStage,
    /// When the stage became actionable.
    pub waiting_since: DateTime<Utc>,
}

/// Drives the clearance workflow on top of a [`Storage`] backend.
///
/// # Example
/// ```ignore
/// let manager = Arc::new(
///     ClearanceManager::new(Arc::new(InMemoryStorage::new()), collaborators)
///         .with_config(config),
/// );
///
/// let view = manager.create_request(requester_id).await?;
/// manager.approve(view.stages[0].id(), actor_id, None).await?;
///
/// // Reminders and issuance retries in the background
/// let handle = manager.clone().spawn_sweeper(shutdown_token);
/// ```
pub struct ClearanceManager<S: Storage> {
    storage: Arc<S>,
    collaborators: Collaborators,
    config: EngineConfig,
    #[cfg(feature = "metrics")]
    metrics: Option<crate::metrics::ClearanceMetrics>,
}

impl<S: Storage + 'static> ClearanceManager<S> {
    /// Create a manager with the default configuration.
    pub fn new(storage: Arc<S>, collaborators: Collaborators) -> Self {
        Self {
            storage,
            collaborators,
            config: EngineConfig::default(),
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    /// Set a custom engine configuration.
    ///
    /// This is a builder method that can be chained after `new()`.
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Report into a Prometheus registry as well as the `metrics` facade.
    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, metrics: crate::metrics::ClearanceMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Open a clearance request for a requester and generate its stages.
    ///
    /// The stage plan is resolved before anything is written; a resolution failure
    /// leaves storage untouched.
    ///
    /// # Errors
    /// - `RequesterNotFound` from the profile provider
    /// - `Configuration` if the pipeline cannot be resolved against the catalog
    /// - `ActiveRequestExists` / `AlreadyCompleted` from storage
    #[tracing::instrument(skip(self), fields(requester_id = %requester_id))]
    pub async fn create_request(&self, requester_id: RequesterId) -> Result<RequestView> {
        let profile = self
            .collaborators
            .profiles
            .get_profile(requester_id)
            .await?;
        let catalog = self.collaborators.catalog.list_units().await?;
        let specs = policy::resolve(&profile, &catalog, &self.config.pipeline)?;

        let now = Utc::now();
        let request = ClearanceRequest::new(requester_id, now);
        let stages: Vec<_> = specs
            .into_iter()
            .map(|spec| Stage::from_spec(request.id, spec, now))
            .collect();

        self.storage.create_request(&request, &stages).await?;

        counter!("clearance_requests_created_total").increment(1);
        tracing::info!(
            request_id = %request.id,
            stage_count = stages.len(),
            "Clearance request created"
        );
        self.emit(AuditEvent::RequestCreated {
            request_id: request.id,
            requester_id,
            stage_count: stages.len(),
            at: now,
        })
        .await;

        Ok(RequestView::new(
            request,
            stages.into_iter().map(AnyStage::from).collect(),
        ))
    }

    pub async fn get_request(&self, id: RequestId) -> Result<RequestView> {
        self.storage.get_request(id).await
    }

    /// The requester's most recent request.
    ///
    /// # Errors
    /// `RequesterNotFound` if they have never opened one.
    pub async fn latest_request_for(&self, requester_id: RequesterId) -> Result<RequestView> {
        self.storage
            .latest_request_for(requester_id)
            .await?
            .ok_or(ClearanceError::RequesterNotFound(requester_id))
    }

    /// Stages of a request that may be acted on now.
    pub async fn actionable_stages(&self, id: RequestId) -> Result<Vec<AnyStage>> {
        let view = self.storage.get_request(id).await?;
        Ok(gate::actionable_stages(&view.stages)
            .into_iter()
            .cloned()
            .collect())
    }

    /// Every stage the actor may act on now, across open requests, oldest first.
    #[tracing::instrument(skip(self), fields(actor_id = %actor_id))]
    pub async fn pending_for(&self, actor_id: ActorId) -> Result<Vec<QueueEntry>> {
        let principal = self.collaborators.identities.resolve(actor_id).await?;
        let views = self
            .storage
            .open_requests_for(principal.unit, principal.role, self.config.sweep_batch_size)
            .await?;

        let mut queue = Vec::new();
        for view in &views {
            for stage in gate::actionable_for(&view.stages, &principal) {
                queue.push(QueueEntry {
                    request_id: view.request.id,
                    requester_id: view.request.requester_id,
                    stage: stage.clone(),
                    waiting_since: gate::waiting_since(stage, &view.stages),
                });
            }
        }
        queue.sort_by_key(|entry| entry.waiting_since);
        Ok(queue)
    }

    pub async fn approve(
        &self,
        stage_id: StageId,
        actor_id: ActorId,
        remarks: Option<String>,
    ) -> Result<TransitionOutcome> {
        self.transition(stage_id, actor_id, StageAction::Approve, remarks)
            .await
    }

    pub async fn reject(
        &self,
        stage_id: StageId,
        actor_id: ActorId,
        remarks: String,
    ) -> Result<TransitionOutcome> {
        self.transition(stage_id, actor_id, StageAction::Reject, Some(remarks))
            .await
    }

    /// Apply a verifier's decision to a stage.
    ///
    /// Checks run in this order: the stage exists and is still Pending, a rejection
    /// carries remarks, the actor is known and holds the stage's role and unit, the
    /// request is not terminal, and every lower-order stage is Approved. Storage
    /// re-checks the Pending status along with the last two under the request lock.
    ///
    /// When the decision completes the request, the certificate is issued before
    /// returning. Issuer failures are logged and left for the sweeper to retry.
    #[tracing::instrument(skip(self, remarks), fields(stage_id = %stage_id, actor_id = %actor_id, action = action.as_str()))]
    pub async fn transition(
        &self,
        stage_id: StageId,
        actor_id: ActorId,
        action: StageAction,
        remarks: Option<String>,
    ) -> Result<TransitionOutcome> {
        let pending = self
            .storage
            .get_stage(stage_id)
            .await?
            .into_pending()
            .ok_or(ClearanceError::AlreadyProcessed(stage_id))?;

        let remarks = remarks.filter(|r| !r.trim().is_empty());
        if action == StageAction::Reject && remarks.is_none() {
            return Err(ClearanceError::Validation(
                "remarks are required to reject a stage".to_string(),
            ));
        }

        let principal = self.collaborators.identities.resolve(actor_id).await?;
        if !principal.can_act_on(&pending.data) {
            tracing::warn!(
                stage_id = %stage_id,
                actor_id = %actor_id,
                actor_role = principal.role.as_str(),
                actor_unit = %principal.unit,
                "Actor not authorized for stage"
            );
            return Err(ClearanceError::Forbidden {
                actor_id,
                stage_id,
                required_role: pending.data.verifier_role,
                required_unit: pending.data.unit,
            });
        }

        let mut outcome = match action {
            StageAction::Approve => {
                pending
                    .approve(actor_id, remarks.clone(), self.storage.as_ref())
                    .await?
            }
            StageAction::Reject => {
                pending
                    .reject(
                        actor_id,
                        remarks.clone().unwrap_or_default(),
                        self.storage.as_ref(),
                    )
                    .await?
            }
        };

        let request_id = outcome.request.id;
        let now = Utc::now();
        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            metrics.record_stage_decision(action, principal.role);
        }
        let stage_event = match &outcome.stage {
            AnyStage::Rejected(s) => AuditEvent::StageRejected {
                request_id,
                stage_id,
                actor_id,
                actor_role: principal.role,
                remarks: s.state.remarks.clone(),
                at: now,
            },
            _ => AuditEvent::StageApproved {
                request_id,
                stage_id,
                actor_id,
                actor_role: principal.role,
                remarks,
                at: now,
            },
        };
        self.emit(stage_event).await;

        if outcome.rejected_now() {
            counter!("clearance_requests_rejected_total").increment(1);
            self.emit(AuditEvent::RequestRejected {
                request_id,
                requester_id: outcome.request.requester_id,
                remarks: outcome.request.remarks.clone().unwrap_or_default(),
                at: now,
            })
            .await;
        }

        if outcome.completed_now() {
            counter!("clearance_requests_completed_total").increment(1);
            tracing::info!(request_id = %request_id, "Clearance request completed");
            #[cfg(feature = "metrics")]
            if let Some(metrics) = &self.metrics {
                metrics.record_completion(now - outcome.request.created_at);
            }
            self.emit(AuditEvent::RequestCompleted {
                request_id,
                requester_id: outcome.request.requester_id,
                at: now,
            })
            .await;

            if let Some(claim) = outcome.issuance_claim {
                match self.deliver_certificate(&claim).await {
                    Ok(certificate) => outcome.request.certificate = Some(certificate),
                    Err(e) => {
                        tracing::warn!(
                            request_id = %request_id,
                            error = %e,
                            "Certificate issuance failed, will retry"
                        );
                    }
                }
            }
        }

        Ok(outcome)
    }

    /// Issue the certificate for a request whose issuance claim we hold.
    ///
    /// The claim is renewed while the issuer runs so a sweep never mistakes a slow
    /// call for a dead one. On failure the claim is released so the sweeper can retry.
    async fn deliver_certificate(&self, claim: &IssuanceClaim) -> Result<CertificateRef> {
        let request_id = claim.request_id;
        let issued = {
            let mut issue = self.collaborators.issuer.issue(request_id);
            let mut heartbeat = tokio::time::interval(self.config.issuance_heartbeat_interval());
            heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            heartbeat.tick().await;
            loop {
                tokio::select! {
                    result = &mut issue => break result,
                    _ = heartbeat.tick() => match self.storage.renew_issuance(claim).await {
                        Ok(true) => {}
                        Ok(false) => tracing::warn!(
                            request_id = %request_id,
                            "Issuance claim was taken over while issuing"
                        ),
                        Err(e) => tracing::warn!(
                            request_id = %request_id,
                            error = %e,
                            "Failed to renew issuance claim"
                        ),
                    },
                }
            }
        };

        let certificate = match issued {
            Ok(certificate) => certificate,
            Err(e) => {
                counter!("clearance_certificate_failures_total").increment(1);
                #[cfg(feature = "metrics")]
                if let Some(metrics) = &self.metrics {
                    metrics.record_certificate("failed");
                }
                if let Err(release_err) = self.storage.release_issuance(claim).await {
                    tracing::error!(
                        request_id = %request_id,
                        error = %release_err,
                        "Failed to release issuance claim"
                    );
                }
                return Err(e);
            }
        };

        self.storage.record_certificate(claim, &certificate).await?;

        counter!("clearance_certificates_issued_total").increment(1);
        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            metrics.record_certificate("issued");
        }
        tracing::info!(
            request_id = %request_id,
            certificate_number = %certificate.certificate_number,
            "Certificate issued"
        );
        self.emit(AuditEvent::CertificateIssued {
            request_id,
            certificate_number: certificate.certificate_number.clone(),
            at: certificate.issued_at,
        })
        .await;

        Ok(certificate)
    }

    /// Issue certificates for completed requests whose issuance never finished.
    ///
    /// Returns the number of certificates issued.
    #[tracing::instrument(skip(self))]
    pub async fn retry_unissued_certificates(&self) -> Result<usize> {
        let stale_before = Utc::now() - self.config.issuance_claim_timeout();
        let candidates = self
            .storage
            .list_unissued(stale_before, self.config.sweep_batch_size)
            .await?;

        let mut issued = 0;
        for request_id in candidates {
            let Some(claim) = self.storage.claim_issuance(request_id, stale_before).await? else {
                continue;
            };
            match self.deliver_certificate(&claim).await {
                Ok(_) => issued += 1,
                Err(e) => tracing::warn!(
                    request_id = %request_id,
                    error = %e,
                    "Certificate retry failed"
                ),
            }
        }
        Ok(issued)
    }

    /// Record one reminder per `(unit, role)` that has actionable stages waiting
    /// longer than the configured threshold.
    ///
    /// Returns the number of reminders recorded.
    #[tracing::instrument(skip(self))]
    pub async fn send_stale_reminders(&self, now: DateTime<Utc>) -> Result<usize> {
        let threshold = self.config.stale_stage_threshold()?;
        let groups = self.storage.overdue_groups(now - threshold).await?;

        let reminders = groups.len();
        for group in groups {
            tracing::info!(
                unit = %group.unit,
                role = group.role.as_str(),
                pending_count = group.pending_count,
                "Stages overdue for review"
            );
            self.emit(AuditEvent::ReminderDue {
                unit: group.unit,
                role: group.role,
                pending_count: group.pending_count,
                oldest_since: group.oldest_since,
                at: now,
            })
            .await;
        }
        counter!("clearance_reminders_due_total").increment(reminders as u64);
        Ok(reminders)
    }

    /// Request counts and bottlenecks. Also refreshes the Prometheus gauges.
    pub async fn dashboard_stats(&self) -> Result<DashboardStats> {
        let stats = self
            .storage
            .dashboard_stats(self.config.bottleneck_limit)
            .await?;
        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            metrics.observe_dashboard(&stats);
        }
        Ok(stats)
    }

    /// Look up a request by the number printed on its certificate, or by the
    /// certificate's id.
    pub async fn find_by_certificate(
        &self,
        certificate_number: &str,
    ) -> Result<Option<RequestView>> {
        let number = certificate_number.trim();
        if number.is_empty() {
            return Err(ClearanceError::Validation(
                "certificate number is empty".to_string(),
            ));
        }
        self.storage.find_by_certificate(number).await
    }

    /// Run the reminder and issuance-retry sweeper until `shutdown_token` fires.
    pub fn spawn_sweeper(self: Arc<Self>, shutdown_token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(Sweeper::new(self).run(shutdown_token))
    }

    /// Hand an event to the sink. Failures never affect the caller.
    async fn emit(&self, event: AuditEvent) {
        if let Err(e) = self.collaborators.events.record(&event).await {
            tracing::warn!(
                action = event.action(),
                error = %e,
                "Failed to record audit event"
            );
        }
    }
}
