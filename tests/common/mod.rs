#![allow(dead_code)]

use std::sync::Arc;

use clearance::{
    ActorId, AdminCategory, Catalog, ClearanceManager, Collaborators, Division, DivisionId,
    EngineConfig, InMemoryStorage, MockCertificateIssuer, MockEventSink, Principal, RequesterId,
    RequesterProfile, StageId, StaticCatalog, StaticIdentities, StaticProfiles, Unit, UnitId,
    UnitKind, UnitRef, VerifierRole,
};
use uuid::Uuid;

pub const ENGINEERING: DivisionId = DivisionId(1);
pub const HUMANITIES: DivisionId = DivisionId(2);
pub const COMPUTER_SCIENCE: UnitId = UnitId(10);
pub const HISTORY: UnitId = UnitId(11);
pub const WORKSHOP_LAB: UnitId = UnitId(20);
pub const HOSTEL: UnitId = UnitId(25);
pub const LIBRARY: UnitId = UnitId(30);
pub const SPORTS: UnitId = UnitId(40);
pub const ACCOUNTS: UnitId = UnitId(50);

pub fn catalog() -> Catalog {
    let academic = |id, name: &str, division| Unit {
        id,
        name: name.to_string(),
        code: None,
        kind: UnitKind::Academic { division },
    };
    let admin = |id, name: &str, category| Unit {
        id,
        name: name.to_string(),
        code: None,
        kind: UnitKind::Administrative { category },
    };

    Catalog {
        divisions: vec![
            Division {
                id: ENGINEERING,
                name: "School of Engineering".to_string(),
                code: Some("SOE".to_string()),
                requires_lab_clearance: true,
            },
            Division {
                id: HUMANITIES,
                name: "School of Humanities".to_string(),
                code: Some("SOH".to_string()),
                requires_lab_clearance: false,
            },
        ],
        units: vec![
            academic(COMPUTER_SCIENCE, "Computer Science", ENGINEERING),
            academic(HISTORY, "History", HUMANITIES),
            admin(WORKSHOP_LAB, "Workshop Lab", AdminCategory::Lab),
            admin(HOSTEL, "Hostel Office", AdminCategory::Residence),
            admin(LIBRARY, "Central Library", AdminCategory::General),
            admin(SPORTS, "Sports Office", AdminCategory::General),
            admin(ACCOUNTS, "Accounts", AdminCategory::Finance),
        ],
    }
}

/// An in-memory engine with one verifier per (unit, role) in the catalog.
pub struct Harness {
    pub manager: Arc<ClearanceManager<InMemoryStorage>>,
    pub issuer: MockCertificateIssuer,
    pub events: MockEventSink,
    pub profiles: StaticProfiles,
    pub identities: StaticIdentities,
    pub catalog: StaticCatalog,
    verifiers: Vec<Principal>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let issuer = MockCertificateIssuer::new();
        let events = MockEventSink::new();
        let profiles = StaticProfiles::new();
        let identities = StaticIdentities::new();
        let catalog = StaticCatalog::new(catalog());

        let mut verifiers = Vec::new();
        let mut add = |unit, role| {
            let principal = Principal {
                actor_id: ActorId(Uuid::new_v4()),
                unit,
                role,
            };
            identities.insert(principal);
            verifiers.push(principal);
        };
        for division in [ENGINEERING, HUMANITIES] {
            add(UnitRef::Division(division), VerifierRole::Staff);
            add(UnitRef::Division(division), VerifierRole::DivisionHead);
        }
        for unit in [COMPUTER_SCIENCE, HISTORY] {
            add(UnitRef::Unit(unit), VerifierRole::UnitHead);
        }
        for unit in [WORKSHOP_LAB, HOSTEL, LIBRARY, SPORTS, ACCOUNTS] {
            add(UnitRef::Unit(unit), VerifierRole::Staff);
        }

        let collaborators = Collaborators {
            catalog: Arc::new(catalog.clone()),
            profiles: Arc::new(profiles.clone()),
            identities: Arc::new(identities.clone()),
            issuer: Arc::new(issuer.clone()),
            events: Arc::new(events.clone()),
        };
        let manager = Arc::new(
            ClearanceManager::new(Arc::new(InMemoryStorage::new()), collaborators)
                .with_config(config),
        );

        Self {
            manager,
            issuer,
            events,
            profiles,
            identities,
            catalog,
            verifiers,
        }
    }

    /// Register a requester and return their id.
    pub fn requester(&self, division: DivisionId, home_unit: UnitId, resident: bool) -> RequesterId {
        let requester_id = RequesterId(Uuid::new_v4());
        self.profiles.insert(RequesterProfile {
            requester_id,
            home_unit,
            division,
            resident,
        });
        requester_id
    }

    /// The verifier holding `role` at `unit`.
    pub fn verifier(&self, unit: UnitRef, role: VerifierRole) -> ActorId {
        self.verifiers
            .iter()
            .find(|p| p.unit == unit && p.role == role)
            .map(|p| p.actor_id)
            .unwrap_or_else(|| panic!("no verifier for {} {}", unit, role))
    }

    /// Approve every currently actionable stage of a request, once.
    pub async fn approve_frontier(&self, request_id: clearance::RequestId) -> Vec<StageId> {
        let stages = self.manager.actionable_stages(request_id).await.unwrap();
        let mut approved = Vec::new();
        for stage in stages {
            let actor = self.verifier(stage.data().unit, stage.data().verifier_role);
            self.manager.approve(stage.id(), actor, None).await.unwrap();
            approved.push(stage.id());
        }
        approved
    }
}
