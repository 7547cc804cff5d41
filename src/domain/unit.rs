//! Organizational units consumed by the policy resolver.
//!
//! The catalog is a read-only snapshot: the engine never edits units, it only
//! reads their kind and policy flags when deciding which stages a request needs.

use serde::{Deserialize, Serialize};

use crate::error::{ClearanceError, Result};

/// Identifier of a department-like unit (academic or administrative).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnitId(pub i64);

impl From<i64> for UnitId {
    fn from(id: i64) -> Self {
        UnitId(id)
    }
}

impl std::fmt::Display for UnitId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unit:{}", self.0)
    }
}

/// Identifier of a top-level division (school-like unit).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DivisionId(pub i64);

impl From<i64> for DivisionId {
    fn from(id: i64) -> Self {
        DivisionId(id)
    }
}

impl std::fmt::Display for DivisionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "division:{}", self.0)
    }
}

/// The organizational unit responsible for a stage.
///
/// A stage is owned by exactly one of the two unit kinds, never both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum UnitRef {
    Unit(UnitId),
    Division(DivisionId),
}

impl std::fmt::Display for UnitRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnitRef::Unit(id) => id.fmt(f),
            UnitRef::Division(id) => id.fmt(f),
        }
    }
}

/// Category of an administrative unit. Drives conditional stage inclusion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdminCategory {
    /// Laboratories; only required when the division demands lab clearance.
    Lab,
    /// Residence halls; only required for resident requesters.
    Residence,
    /// Finance and accounts; always the final stage.
    Finance,
    /// Every other administrative office (library, sports, placement cell, ...).
    General,
}

/// What kind of unit this is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UnitKind {
    /// A teaching department belonging to a division.
    Academic { division: DivisionId },
    /// A university-wide administrative office.
    Administrative { category: AdminCategory },
}

/// A department-like unit in the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unit {
    pub id: UnitId,
    pub name: String,
    pub code: Option<String>,
    pub kind: UnitKind,
}

impl Unit {
    pub fn admin_category(&self) -> Option<AdminCategory> {
        match self.kind {
            UnitKind::Administrative { category } => Some(category),
            UnitKind::Academic { .. } => None,
        }
    }
}

/// A top-level division and its policy flags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Division {
    pub id: DivisionId,
    pub name: String,
    pub code: Option<String>,
    /// Members of this division must be cleared by the lab unit.
    pub requires_lab_clearance: bool,
}

/// Snapshot of every unit known to the organization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Catalog {
    pub divisions: Vec<Division>,
    pub units: Vec<Unit>,
}

impl Catalog {
    pub fn division(&self, id: DivisionId) -> Option<&Division> {
        self.divisions.iter().find(|d| d.id == id)
    }

    pub fn unit(&self, id: UnitId) -> Option<&Unit> {
        self.units.iter().find(|u| u.id == id)
    }

    /// Administrative units of the given category, ordered by id.
    pub fn administrative(&self, category: AdminCategory) -> Vec<&Unit> {
        let mut units: Vec<&Unit> = self
            .units
            .iter()
            .filter(|u| u.admin_category() == Some(category))
            .collect();
        units.sort_by_key(|u| u.id);
        units
    }

    /// The single finance unit.
    ///
    /// # Errors
    /// `Configuration` if the catalog has no finance unit or more than one.
    pub fn finance_unit(&self) -> Result<&Unit> {
        let finance = self.administrative(AdminCategory::Finance);
        match finance.as_slice() {
            [unit] => Ok(unit),
            [] => Err(ClearanceError::Configuration(
                "unit catalog has no finance unit".to_string(),
            )),
            many => Err(ClearanceError::Configuration(format!(
                "unit catalog has {} finance units, expected exactly one",
                many.len()
            ))),
        }
    }

    /// Human-readable name for a unit reference, if the catalog knows it.
    pub fn name_of(&self, unit: UnitRef) -> Option<&str> {
        match unit {
            UnitRef::Unit(id) => self.unit(id).map(|u| u.name.as_str()),
            UnitRef::Division(id) => self.division(id).map(|d| d.name.as_str()),
        }
    }
}
