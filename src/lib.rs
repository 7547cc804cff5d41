//! Stage workflow engine for multi-party clearance ("no dues") requests.
//!
//! A departing member opens a clearance request; the engine resolves which units
//! must sign off and in what order, gates which stages are actionable, applies
//! verifier decisions with compare-and-set semantics, and hands a completed request
//! to the certificate issuer exactly once.
//!
//! Storage is pluggable: an in-memory backend ships by default and a PostgreSQL
//! backend is available behind the `postgres` feature.

pub mod collaborators;
pub mod config;
pub mod domain;
pub mod error;
pub mod events;
pub mod gate;
pub mod manager;
pub mod metrics;
pub mod policy;
pub mod sweeper;

// Re-export commonly used types
pub use collaborators::{
    CertificateIssuer, Collaborators, EventSink, IdentityProvider, MockCertificateIssuer,
    MockEventSink, ProfileProvider, StaticCatalog, StaticIdentities, StaticProfiles,
    TracingEventSink, UnitCatalog,
};
pub use config::EngineConfig;
pub use domain::principal::{ActorId, Principal, RequesterId, RequesterProfile, VerifierRole};
pub use domain::request::{
    CertificateRef, ClearanceRequest, RequestId, RequestStatus, RequestView, derive_status,
};
pub use domain::stage::{AnyStage, Stage, StageAction, StageId, StageSpec, StageStatus};
pub use domain::unit::{
    AdminCategory, Catalog, Division, DivisionId, Unit, UnitId, UnitKind, UnitRef,
};
pub use error::{ClearanceError, Result};
pub use events::AuditEvent;
pub use manager::memory::InMemoryStorage;
pub use manager::{
    Bottleneck, ClearanceManager, DashboardStats, IssuanceClaim, OverdueGroup, QueueEntry,
    Storage, TransitionOutcome,
};
#[cfg(feature = "metrics")]
pub use metrics::ClearanceMetrics;
pub use policy::{Condition, PipelineConfig, PipelineStep, UnitSelector};
#[cfg(feature = "postgres")]
pub use manager::postgres::{PoolProvider, PostgresStorage, TestDbPools};
pub use sweeper::Sweeper;

/// Get the clearance database migrator
///
/// Returns a migrator that can be run against a connection pool.
#[cfg(feature = "postgres")]
pub fn migrator() -> sqlx::migrate::Migrator {
    sqlx::migrate!("./migrations")
}
