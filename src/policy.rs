//! Policy resolver: decides which stages a clearance request needs.
//!
//! The pipeline is a table of [`PipelineStep`] rows, each pairing a unit selector
//! with an inclusion condition, the verifying role and the sequence order. The
//! resolver evaluates every row once against the requester's profile and the unit
//! catalog, so adding or reshaping a stage is a configuration change.

use serde::{Deserialize, Serialize};

use crate::domain::principal::{RequesterProfile, VerifierRole};
use crate::domain::stage::StageSpec;
use crate::domain::unit::{AdminCategory, Catalog, Division, UnitKind, UnitRef};
use crate::error::{ClearanceError, Result};

/// Which unit (or units) a pipeline row produces stages for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UnitSelector {
    /// The requester's top-level division.
    RequesterDivision,
    /// The requester's academic home unit.
    HomeUnit,
    /// Every administrative unit of a category, one stage each.
    Administrative { category: AdminCategory },
    /// The single finance unit.
    Finance,
}

/// When a pipeline row applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    Always,
    /// The requester's division has `requires_lab_clearance` set.
    DivisionRequiresLab,
    /// The requester lives in university residence.
    RequesterIsResident,
}

impl Condition {
    fn holds(&self, profile: &RequesterProfile, division: &Division) -> bool {
        match self {
            Condition::Always => true,
            Condition::DivisionRequiresLab => division.requires_lab_clearance,
            Condition::RequesterIsResident => profile.resident,
        }
    }
}

/// One row of the pipeline table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStep {
    pub selector: UnitSelector,
    #[serde(default = "default_condition")]
    pub condition: Condition,
    pub role: VerifierRole,
    pub order: u32,
}

fn default_condition() -> Condition {
    Condition::Always
}

impl PipelineStep {
    pub const fn new(selector: UnitSelector, role: VerifierRole, order: u32) -> Self {
        Self {
            selector,
            condition: Condition::Always,
            role,
            order,
        }
    }

    pub const fn when(mut self, condition: Condition) -> Self {
        self.condition = condition;
        self
    }
}

/// The ordered approval pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub steps: Vec<PipelineStep>,
}

impl Default for PipelineConfig {
    /// Division office, home unit head, division head, conditional administrative
    /// offices in parallel, then finance.
    fn default() -> Self {
        use UnitSelector::*;
        use VerifierRole::*;
        let admin = |category| Administrative { category };

        Self {
            steps: vec![
                PipelineStep::new(RequesterDivision, Staff, 1),
                PipelineStep::new(HomeUnit, UnitHead, 2),
                PipelineStep::new(RequesterDivision, DivisionHead, 3),
                PipelineStep::new(admin(AdminCategory::Lab), Staff, 4)
                    .when(Condition::DivisionRequiresLab),
                PipelineStep::new(admin(AdminCategory::Residence), Staff, 4)
                    .when(Condition::RequesterIsResident),
                PipelineStep::new(admin(AdminCategory::General), Staff, 4),
                PipelineStep::new(Finance, Staff, 5),
            ],
        }
    }
}

impl PipelineConfig {
    /// Reject pipelines that could never produce a usable stage set.
    pub fn validate(&self) -> Result<()> {
        if self.steps.is_empty() {
            return Err(ClearanceError::Configuration(
                "pipeline has no steps".to_string(),
            ));
        }
        if let Some(step) = self.steps.iter().find(|s| s.order == 0) {
            return Err(ClearanceError::Configuration(format!(
                "pipeline step {:?} has order 0, orders start at 1",
                step.selector
            )));
        }
        Ok(())
    }
}

/// Resolve the stage plan for a requester.
///
/// Output is ordered by sequence order, with parallel stages sorted by unit.
///
/// # Errors
/// `Configuration` when the pipeline is invalid, the profile's home unit or division
/// is unknown to the catalog, the home unit sits in a different division, or the
/// catalog does not have exactly one finance unit. Nothing is persisted on error.
pub fn resolve(
    profile: &RequesterProfile,
    catalog: &Catalog,
    config: &PipelineConfig,
) -> Result<Vec<StageSpec>> {
    config.validate()?;

    let division = catalog.division(profile.division).ok_or_else(|| {
        ClearanceError::Configuration(format!(
            "division {} of requester {} is not in the unit catalog",
            profile.division, profile.requester_id
        ))
    })?;
    let home = catalog.unit(profile.home_unit).ok_or_else(|| {
        ClearanceError::Configuration(format!(
            "home unit {} of requester {} is not in the unit catalog",
            profile.home_unit, profile.requester_id
        ))
    })?;
    match home.kind {
        UnitKind::Academic { division: owner } if owner == division.id => {}
        UnitKind::Academic { division: owner } => {
            return Err(ClearanceError::Configuration(format!(
                "home unit {} belongs to {}, but requester {} is in {}",
                home.id, owner, profile.requester_id, division.id
            )));
        }
        UnitKind::Administrative { .. } => {
            return Err(ClearanceError::Configuration(format!(
                "home unit {} of requester {} is not an academic unit",
                home.id, profile.requester_id
            )));
        }
    }

    let mut specs = Vec::new();
    for step in &config.steps {
        if !step.condition.holds(profile, division) {
            continue;
        }

        let units: Vec<UnitRef> = match step.selector {
            UnitSelector::RequesterDivision => vec![UnitRef::Division(division.id)],
            UnitSelector::HomeUnit => vec![UnitRef::Unit(home.id)],
            UnitSelector::Administrative { category } => catalog
                .administrative(category)
                .into_iter()
                .map(|u| UnitRef::Unit(u.id))
                .collect(),
            UnitSelector::Finance => vec![UnitRef::Unit(catalog.finance_unit()?.id)],
        };

        specs.extend(units.into_iter().map(|unit| StageSpec {
            unit,
            verifier_role: step.role,
            sequence_order: step.order,
        }));
    }

    specs.sort_by_key(|s| (s.sequence_order, s.unit));

    tracing::debug!(
        requester_id = %profile.requester_id,
        stage_count = specs.len(),
        "Resolved clearance pipeline"
    );

    Ok(specs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::principal::RequesterId;
    use crate::domain::unit::{DivisionId, Unit, UnitId};
    use uuid::Uuid;

    fn catalog(lab_flag: bool) -> Catalog {
        let admin = |id, name: &str, category| Unit {
            id: UnitId(id),
            name: name.to_string(),
            code: None,
            kind: UnitKind::Administrative { category },
        };
        Catalog {
            divisions: vec![Division {
                id: DivisionId(1),
                name: "Engineering".to_string(),
                code: Some("ENG".to_string()),
                requires_lab_clearance: lab_flag,
            }],
            units: vec![
                Unit {
                    id: UnitId(10),
                    name: "Computer Science".to_string(),
                    code: Some("CS".to_string()),
                    kind: UnitKind::Academic {
                        division: DivisionId(1),
                    },
                },
                admin(30, "Central Library", AdminCategory::General),
                admin(20, "Workshop Lab", AdminCategory::Lab),
                admin(25, "Hostel Office", AdminCategory::Residence),
                admin(40, "Sports Office", AdminCategory::General),
                admin(50, "Accounts", AdminCategory::Finance),
            ],
        }
    }

    fn profile(resident: bool) -> RequesterProfile {
        RequesterProfile {
            requester_id: RequesterId(Uuid::new_v4()),
            home_unit: UnitId(10),
            division: DivisionId(1),
            resident,
        }
    }

    fn orders(specs: &[StageSpec]) -> Vec<u32> {
        specs.iter().map(|s| s.sequence_order).collect()
    }

    #[test]
    fn test_default_pipeline_shape() {
        let specs = resolve(&profile(true), &catalog(true), &PipelineConfig::default()).unwrap();

        assert_eq!(orders(&specs), vec![1, 2, 3, 4, 4, 4, 4, 5]);
        assert_eq!(specs[0].unit, UnitRef::Division(DivisionId(1)));
        assert_eq!(specs[0].verifier_role, VerifierRole::Staff);
        assert_eq!(specs[1].unit, UnitRef::Unit(UnitId(10)));
        assert_eq!(specs[1].verifier_role, VerifierRole::UnitHead);
        assert_eq!(specs[2].verifier_role, VerifierRole::DivisionHead);

        // Parallel stages sorted by unit id
        let parallel: Vec<_> = specs[3..7].iter().map(|s| s.unit).collect();
        assert_eq!(
            parallel,
            vec![
                UnitRef::Unit(UnitId(20)),
                UnitRef::Unit(UnitId(25)),
                UnitRef::Unit(UnitId(30)),
                UnitRef::Unit(UnitId(40)),
            ]
        );
        assert_eq!(specs[7].unit, UnitRef::Unit(UnitId(50)));
    }

    #[test]
    fn test_lab_and_residence_are_conditional() {
        let specs = resolve(&profile(false), &catalog(false), &PipelineConfig::default()).unwrap();
        let units: Vec<_> = specs.iter().map(|s| s.unit).collect();

        assert!(!units.contains(&UnitRef::Unit(UnitId(20))), "lab excluded");
        assert!(!units.contains(&UnitRef::Unit(UnitId(25))), "residence excluded");
        assert_eq!(orders(&specs), vec![1, 2, 3, 4, 4, 5]);
    }

    #[test]
    fn test_missing_finance_unit_is_configuration_error() {
        let mut catalog = catalog(true);
        catalog.units.retain(|u| u.admin_category() != Some(AdminCategory::Finance));

        let err = resolve(&profile(false), &catalog, &PipelineConfig::default()).unwrap_err();
        assert!(matches!(err, ClearanceError::Configuration(_)));
    }

    #[test]
    fn test_home_unit_in_other_division_is_rejected() {
        let mut catalog = catalog(true);
        catalog.divisions.push(Division {
            id: DivisionId(2),
            name: "Science".to_string(),
            code: None,
            requires_lab_clearance: false,
        });
        let mut profile = profile(false);
        profile.division = DivisionId(2);

        let err = resolve(&profile, &catalog, &PipelineConfig::default()).unwrap_err();
        assert!(err.to_string().contains("belongs to division:1"));
    }

    #[test]
    fn test_unknown_home_unit_is_rejected() {
        let mut profile = profile(false);
        profile.home_unit = UnitId(999);

        let err = resolve(&profile, &catalog(true), &PipelineConfig::default()).unwrap_err();
        assert!(matches!(err, ClearanceError::Configuration(_)));
    }

    #[test]
    fn test_alternate_pipeline() {
        let config = PipelineConfig {
            steps: vec![
                PipelineStep::new(UnitSelector::HomeUnit, VerifierRole::UnitHead, 1),
                PipelineStep::new(UnitSelector::Finance, VerifierRole::Staff, 2),
            ],
        };
        let specs = resolve(&profile(true), &catalog(true), &config).unwrap();
        assert_eq!(orders(&specs), vec![1, 2]);
    }

    #[test]
    fn test_validate_rejects_empty_and_zero_order() {
        assert!(PipelineConfig { steps: vec![] }.validate().is_err());
        let zero = PipelineConfig {
            steps: vec![PipelineStep::new(
                UnitSelector::Finance,
                VerifierRole::Staff,
                0,
            )],
        };
        assert!(zero.validate().is_err());
        assert!(PipelineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_pipeline_deserializes_with_default_condition() {
        let json = r#"{"steps":[
            {"selector":{"type":"home_unit"},"role":"unit_head","order":1},
            {"selector":{"type":"administrative","category":"lab"},"condition":"division_requires_lab","role":"staff","order":2}
        ]}"#;
        let config: PipelineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.steps[0].condition, Condition::Always);
        assert_eq!(
            config.steps[1].selector,
            UnitSelector::Administrative {
                category: AdminCategory::Lab
            }
        );
    }
}
