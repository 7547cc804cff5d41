//! Error types for the clearance workflow engine.

use thiserror::Error;

use crate::domain::principal::{ActorId, RequesterId, VerifierRole};
use crate::domain::request::{RequestId, RequestStatus};
use crate::domain::stage::StageId;
use crate::domain::unit::UnitRef;

/// Result type alias using the clearance error type.
pub type Result<T> = std::result::Result<T, ClearanceError>;

/// Main error type for the clearance workflow engine.
#[derive(Error, Debug)]
pub enum ClearanceError {
    /// The unit catalog or pipeline cannot produce a valid stage plan
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Caller input is malformed (e.g. rejecting without remarks)
    #[error("Validation error: {0}")]
    Validation(String),

    /// The acting principal does not hold the stage's role in the stage's unit
    #[error(
        "Actor {actor_id} is not allowed to act on stage {stage_id} (requires {required_role} at {required_unit})"
    )]
    Forbidden {
        actor_id: ActorId,
        stage_id: StageId,
        required_role: VerifierRole,
        required_unit: UnitRef,
    },

    /// The identity provider has no principal for this actor
    #[error("Actor not found: {0}")]
    ActorNotFound(ActorId),

    /// The stage was already approved or rejected, possibly by a concurrent verifier
    #[error("Stage already processed: {0}")]
    AlreadyProcessed(StageId),

    #[error("Request not found: {0}")]
    RequestNotFound(RequestId),

    #[error("Stage not found: {0}")]
    StageNotFound(StageId),

    #[error("Requester not found: {0}")]
    RequesterNotFound(RequesterId),

    /// The owning request is Completed or Rejected
    #[error("Request {0} is already {1}")]
    RequestAlreadyTerminal(RequestId, RequestStatus),

    /// A lower-order stage is still waiting
    #[error("Stage {0} is not actionable yet: earlier stages are still pending")]
    NotActionable(StageId),

    #[error("Requester {0} already has an active clearance request")]
    ActiveRequestExists(RequesterId),

    #[error("Requester {0} has already been cleared")]
    AlreadyCompleted(RequesterId),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// General error from anyhow
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ClearanceError {
    /// Conflicts are expected outcomes of racing or repeated calls, not faults.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            ClearanceError::AlreadyProcessed(_)
                | ClearanceError::RequestAlreadyTerminal(..)
                | ClearanceError::ActiveRequestExists(_)
                | ClearanceError::AlreadyCompleted(_)
        )
    }
}
