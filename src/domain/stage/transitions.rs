//! State transitions for stages using the typestate pattern.
//!
//! ```text
//! Stage<Pending> ──approve()──> Stage<Approved>
//!                └──reject()───> Stage<Rejected>   (terminates the request)
//! ```
//!
//! Both transitions hand the new stage to [`Storage::commit_transition`], which
//! re-checks the stored state with a compare-and-set and recomputes the owning
//! request's status in the same transaction. Building the `Stage<Approved>` value
//! here does not mean the write succeeded: a concurrent verifier may have won,
//! in which case the storage call fails with `AlreadyProcessed`.

use chrono::Utc;
use metrics::counter;

use crate::domain::principal::{ActorId, VerifierRole};
use crate::error::{ClearanceError, Result};
use crate::manager::{Storage, TransitionOutcome};

use super::state::{Approved, Pending, Rejected, Stage};

/// What a verifier does to a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageAction {
    Approve,
    Reject,
}

impl StageAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageAction::Approve => "approve",
            StageAction::Reject => "reject",
        }
    }
}

/// Request-level remarks for a rejection, naming the rejecting role.
pub fn rejection_remarks(role: VerifierRole, comment: &str) -> String {
    format!("Rejected at {} stage: {}", role.label(), comment.trim())
}

impl Stage<Pending> {
    pub async fn approve<S: Storage + ?Sized>(
        self,
        reviewer_id: ActorId,
        remarks: Option<String>,
        storage: &S,
    ) -> Result<TransitionOutcome> {
        let stage = Stage {
            data: self.data,
            state: Approved {
                reviewer_id,
                reviewed_at: Utc::now(),
                remarks,
            },
        };
        let outcome = storage.commit_transition(stage.into()).await?;

        counter!("clearance_stage_transitions_total", "action" => "approve").increment(1);
        tracing::debug!(
            stage_id = %outcome.stage.id(),
            request_id = %outcome.request.id,
            reviewer_id = %reviewer_id,
            "Stage approved"
        );
        Ok(outcome)
    }

    /// Reject the stage. The stage keeps the verifier's comment; the request remarks
    /// are synthesized from the stage role and that comment by the storage recompute.
    pub async fn reject<S: Storage + ?Sized>(
        self,
        reviewer_id: ActorId,
        comment: String,
        storage: &S,
    ) -> Result<TransitionOutcome> {
        if comment.trim().is_empty() {
            return Err(ClearanceError::Validation(
                "remarks are required to reject a stage".to_string(),
            ));
        }

        let stage = Stage {
            state: Rejected {
                reviewer_id,
                reviewed_at: Utc::now(),
                remarks: comment.trim().to_string(),
            },
            data: self.data,
        };
        let outcome = storage.commit_transition(stage.into()).await?;

        counter!("clearance_stage_transitions_total", "action" => "reject").increment(1);
        tracing::info!(
            stage_id = %outcome.stage.id(),
            request_id = %outcome.request.id,
            reviewer_id = %reviewer_id,
            "Stage rejected, request terminated"
        );
        Ok(outcome)
    }
}
