//! Audit events emitted by the engine.
//!
//! Events are handed to an [`EventSink`](crate::collaborators::EventSink) after the
//! change they describe has been committed. Recording them is best effort.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::principal::{ActorId, RequesterId, VerifierRole};
use crate::domain::request::RequestId;
use crate::domain::stage::StageId;
use crate::domain::unit::UnitRef;

/// Something that happened to a clearance request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum AuditEvent {
    RequestCreated {
        request_id: RequestId,
        requester_id: RequesterId,
        stage_count: usize,
        at: DateTime<Utc>,
    },
    StageApproved {
        request_id: RequestId,
        stage_id: StageId,
        actor_id: ActorId,
        actor_role: VerifierRole,
        remarks: Option<String>,
        at: DateTime<Utc>,
    },
    StageRejected {
        request_id: RequestId,
        stage_id: StageId,
        actor_id: ActorId,
        actor_role: VerifierRole,
        remarks: String,
        at: DateTime<Utc>,
    },
    RequestCompleted {
        request_id: RequestId,
        requester_id: RequesterId,
        at: DateTime<Utc>,
    },
    RequestRejected {
        request_id: RequestId,
        requester_id: RequesterId,
        remarks: String,
        at: DateTime<Utc>,
    },
    CertificateIssued {
        request_id: RequestId,
        certificate_number: String,
        at: DateTime<Utc>,
    },
    /// Stages at `unit` for `role` have waited longer than the configured threshold.
    ReminderDue {
        unit: UnitRef,
        role: VerifierRole,
        pending_count: usize,
        oldest_since: DateTime<Utc>,
        at: DateTime<Utc>,
    },
}

impl AuditEvent {
    /// The snake_case action name, as serialized in the `action` field.
    pub fn action(&self) -> &'static str {
        match self {
            AuditEvent::RequestCreated { .. } => "request_created",
            AuditEvent::StageApproved { .. } => "stage_approved",
            AuditEvent::StageRejected { .. } => "stage_rejected",
            AuditEvent::RequestCompleted { .. } => "request_completed",
            AuditEvent::RequestRejected { .. } => "request_rejected",
            AuditEvent::CertificateIssued { .. } => "certificate_issued",
            AuditEvent::ReminderDue { .. } => "reminder_due",
        }
    }

    /// The request this event is about, if it is about a single request.
    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            AuditEvent::RequestCreated { request_id, .. }
            | AuditEvent::StageApproved { request_id, .. }
            | AuditEvent::StageRejected { request_id, .. }
            | AuditEvent::RequestCompleted { request_id, .. }
            | AuditEvent::RequestRejected { request_id, .. }
            | AuditEvent::CertificateIssued { request_id, .. } => Some(*request_id),
            AuditEvent::ReminderDue { .. } => None,
        }
    }
}
