//! Contracts for the systems the engine calls out to.
//!
//! The engine owns none of these: the unit catalog, requester profiles, identity
//! resolution, certificate rendering and audit persistence all live elsewhere.
//! Each trait has an in-memory implementation here, used by tests and by
//! embedders that keep this data in process.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Datelike, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::domain::principal::{ActorId, Principal, RequesterId, RequesterProfile};
use crate::domain::request::{CertificateRef, RequestId};
use crate::domain::unit::Catalog;
use crate::error::{ClearanceError, Result};
use crate::events::AuditEvent;

/// Read-only source of the organization's units.
#[async_trait]
pub trait UnitCatalog: Send + Sync {
    /// Snapshot of every division and unit. Read once per request creation.
    async fn list_units(&self) -> Result<Catalog>;
}

/// Source of requester attributes.
#[async_trait]
pub trait ProfileProvider: Send + Sync {
    /// # Errors
    /// `RequesterNotFound` if the requester is unknown.
    async fn get_profile(&self, requester_id: RequesterId) -> Result<RequesterProfile>;
}

/// Resolves an authenticated actor into the unit and role they act for.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn resolve(&self, actor_id: ActorId) -> Result<Principal>;
}

/// Renders and stores the final certificate for a completed request.
///
/// Calls for one request never overlap: the caller holds an issuance claim and
/// renews it while `issue` runs. A process that dies mid-call leaves a stale claim,
/// and the retry sweep then calls `issue` again, so implementations should be
/// idempotent on `request_id`.
#[async_trait]
pub trait CertificateIssuer: Send + Sync {
    async fn issue(&self, request_id: RequestId) -> Result<CertificateRef>;
}

/// Fire-and-forget audit log.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn record(&self, event: &AuditEvent) -> Result<()>;
}

/// The full set of collaborators a manager needs.
#[derive(Clone)]
pub struct Collaborators {
    pub catalog: Arc<dyn UnitCatalog>,
    pub profiles: Arc<dyn ProfileProvider>,
    pub identities: Arc<dyn IdentityProvider>,
    pub issuer: Arc<dyn CertificateIssuer>,
    pub events: Arc<dyn EventSink>,
}

// ============================================================================
// In-memory implementations
// ============================================================================

/// Fixed unit catalog.
#[derive(Clone, Default)]
pub struct StaticCatalog {
    catalog: Arc<Mutex<Catalog>>,
}

impl StaticCatalog {
    pub fn new(catalog: Catalog) -> Self {
        Self {
            catalog: Arc::new(Mutex::new(catalog)),
        }
    }

    /// Swap the catalog. Existing requests keep the stages they were created with.
    pub fn replace(&self, catalog: Catalog) {
        *self.catalog.lock() = catalog;
    }
}

#[async_trait]
impl UnitCatalog for StaticCatalog {
    async fn list_units(&self) -> Result<Catalog> {
        Ok(self.catalog.lock().clone())
    }
}

/// Requester profiles held in a map.
#[derive(Clone, Default)]
pub struct StaticProfiles {
    profiles: Arc<Mutex<HashMap<RequesterId, RequesterProfile>>>,
}

impl StaticProfiles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, profile: RequesterProfile) {
        self.profiles.lock().insert(profile.requester_id, profile);
    }
}

#[async_trait]
impl ProfileProvider for StaticProfiles {
    async fn get_profile(&self, requester_id: RequesterId) -> Result<RequesterProfile> {
        self.profiles
            .lock()
            .get(&requester_id)
            .copied()
            .ok_or(ClearanceError::RequesterNotFound(requester_id))
    }
}

/// Principals held in a map.
#[derive(Clone, Default)]
pub struct StaticIdentities {
    principals: Arc<Mutex<HashMap<ActorId, Principal>>>,
}

impl StaticIdentities {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, principal: Principal) {
        self.principals.lock().insert(principal.actor_id, principal);
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentities {
    async fn resolve(&self, actor_id: ActorId) -> Result<Principal> {
        self.principals
            .lock()
            .get(&actor_id)
            .copied()
            .ok_or(ClearanceError::ActorNotFound(actor_id))
    }
}

/// Mock certificate issuer for testing.
///
/// Issues certificate numbers of the form `{prefix}-{year}-{5 hex chars}` and
/// records every call, so tests can assert exactly-once issuance.
#[derive(Clone)]
pub struct MockCertificateIssuer {
    prefix: String,
    calls: Arc<Mutex<Vec<RequestId>>>,
    failures_remaining: Arc<Mutex<usize>>,
    delay: Arc<Mutex<Option<Duration>>>,
}

impl MockCertificateIssuer {
    pub fn new() -> Self {
        Self::with_prefix("ND")
    }

    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            calls: Arc::new(Mutex::new(Vec::new())),
            failures_remaining: Arc::new(Mutex::new(0)),
            delay: Arc::new(Mutex::new(None)),
        }
    }

    /// Make every subsequent call take `delay` before answering.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    /// Make the next `count` calls fail.
    pub fn fail_next(&self, count: usize) {
        *self.failures_remaining.lock() = count;
    }

    /// Every request id `issue` was called with, failed calls included.
    pub fn get_calls(&self) -> Vec<RequestId> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn calls_for(&self, request_id: RequestId) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|id| **id == request_id)
            .count()
    }
}

impl Default for MockCertificateIssuer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CertificateIssuer for MockCertificateIssuer {
    async fn issue(&self, request_id: RequestId) -> Result<CertificateRef> {
        self.calls.lock().push(request_id);

        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        {
            let mut failures = self.failures_remaining.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(ClearanceError::Other(anyhow::anyhow!(
                    "Certificate rendering failed for {}",
                    request_id
                )));
            }
        }

        let now = Utc::now();
        let suffix = Uuid::new_v4().simple().to_string()[..5].to_uppercase();
        Ok(CertificateRef {
            id: Uuid::new_v4(),
            certificate_number: format!("{}-{}-{}", self.prefix, now.year(), suffix),
            issued_at: now,
        })
    }
}

/// Mock event sink that keeps every recorded event in memory.
#[derive(Clone, Default)]
pub struct MockEventSink {
    events: Arc<Mutex<Vec<AuditEvent>>>,
    failing: Arc<Mutex<bool>>,
}

impl MockEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `record` call fail (events are not kept).
    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock() = failing;
    }

    pub fn get_events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }

    /// Events with the given action name, in recording order.
    pub fn events_with_action(&self, action: &str) -> Vec<AuditEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.action() == action)
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

#[async_trait]
impl EventSink for MockEventSink {
    async fn record(&self, event: &AuditEvent) -> Result<()> {
        if *self.failing.lock() {
            return Err(ClearanceError::Other(anyhow::anyhow!(
                "Audit store unavailable"
            )));
        }
        self.events.lock().push(event.clone());
        Ok(())
    }
}

/// Event sink that writes each event as a structured log line.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingEventSink;

#[async_trait]
impl EventSink for TracingEventSink {
    async fn record(&self, event: &AuditEvent) -> Result<()> {
        let payload = serde_json::to_string(event)?;
        tracing::info!(
            action = event.action(),
            request_id = ?event.request_id().map(|id| id.to_string()),
            event = %payload,
            "Audit event"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_issuer_fails_then_succeeds() {
        let issuer = MockCertificateIssuer::with_prefix("GBU-ND");
        let request_id = RequestId(Uuid::new_v4());
        issuer.fail_next(1);

        assert!(issuer.issue(request_id).await.is_err());
        let certificate = issuer.issue(request_id).await.unwrap();

        assert!(certificate.certificate_number.starts_with("GBU-ND-"));
        assert_eq!(certificate.certificate_number.len(), "GBU-ND-2026-ABCDE".len());
        assert_eq!(issuer.calls_for(request_id), 2);
    }

    #[tokio::test]
    async fn test_unknown_requester_profile() {
        let profiles = StaticProfiles::new();
        let requester_id = RequesterId(Uuid::new_v4());
        let err = profiles.get_profile(requester_id).await.unwrap_err();
        assert!(matches!(err, ClearanceError::RequesterNotFound(id) if id == requester_id));
    }

    #[tokio::test]
    async fn test_unknown_actor() {
        let identities = StaticIdentities::new();
        let actor_id = ActorId(Uuid::new_v4());
        let err = identities.resolve(actor_id).await.unwrap_err();
        assert!(matches!(err, ClearanceError::ActorNotFound(id) if id == actor_id));
    }

    #[tokio::test]
    async fn test_failing_event_sink_drops_events() {
        let sink = MockEventSink::new();
        let event = AuditEvent::CertificateIssued {
            request_id: RequestId(Uuid::new_v4()),
            certificate_number: "ND-2026-00000".to_string(),
            at: Utc::now(),
        };
        sink.set_failing(true);
        assert!(sink.record(&event).await.is_err());
        sink.set_failing(false);
        sink.record(&event).await.unwrap();
        assert_eq!(sink.events_with_action("certificate_issued").len(), 1);
    }
}
