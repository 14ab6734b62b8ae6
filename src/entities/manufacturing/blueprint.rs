use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use strum::{Display, EnumIter, EnumString};

use crate::errors::ServiceError;

/// Cell chemistry families handled on the line
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum Chemistry {
    Lfp,
    Nmc,
    Nca,
    Lto,
    Lmo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum BlueprintStatus {
    Draft,
    Active,
}

/// Design specification (SKU) a module or pack must conform to.
/// Structural fields are frozen once the blueprint is ACTIVE.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Blueprint {
    pub id: String,
    pub name: String,
    pub chemistry: Chemistry,
    pub series_count: u32,
    pub parallel_count: u32,
    pub modules_per_pack: u32,
    pub cells_per_module: u32,
    /// Chemistries accepted in addition to `chemistry`
    pub allowed_chemistries: BTreeSet<Chemistry>,
    pub status: BlueprintStatus,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    pub updated_at: DateTime<Utc>,
    pub activated_at: Option<DateTime<Utc>>,
    pub activated_by: Option<String>,
}

/// Structural edit applied to a DRAFT blueprint
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlueprintPatch {
    pub name: Option<String>,
    pub chemistry: Option<Chemistry>,
    pub series_count: Option<u32>,
    pub parallel_count: Option<u32>,
    pub modules_per_pack: Option<u32>,
    pub cells_per_module: Option<u32>,
    pub allowed_chemistries: Option<BTreeSet<Chemistry>>,
}

impl Blueprint {
    pub fn is_active(&self) -> bool {
        self.status == BlueprintStatus::Active
    }

    pub fn accepts(&self, chemistry: Chemistry) -> bool {
        self.chemistry == chemistry || self.allowed_chemistries.contains(&chemistry)
    }

    /// Counts must be positive; a module holds `series × parallel` cells.
    pub fn check_structure(&self) -> Result<(), ServiceError> {
        let counts = [
            ("series_count", self.series_count),
            ("parallel_count", self.parallel_count),
            ("modules_per_pack", self.modules_per_pack),
            ("cells_per_module", self.cells_per_module),
        ];
        if let Some((field, _)) = counts.iter().find(|(_, v)| *v == 0) {
            return Err(ServiceError::ValidationError(format!(
                "blueprint {}: {} must be greater than zero",
                self.id, field
            )));
        }

        let topology = self.series_count.checked_mul(self.parallel_count);
        if topology != Some(self.cells_per_module) {
            return Err(ServiceError::ValidationError(format!(
                "blueprint {}: cells_per_module {} does not match {}S{}P",
                self.id, self.cells_per_module, self.series_count, self.parallel_count
            )));
        }

        Ok(())
    }

    pub fn apply(&mut self, patch: BlueprintPatch) -> Result<(), ServiceError> {
        if self.is_active() {
            return Err(ServiceError::Immutable(format!(
                "blueprint {} is ACTIVE",
                self.id
            )));
        }

        if let Some(name) = patch.name {
            self.name = name;
        }
        if let Some(chemistry) = patch.chemistry {
            self.chemistry = chemistry;
        }
        if let Some(v) = patch.series_count {
            self.series_count = v;
        }
        if let Some(v) = patch.parallel_count {
            self.parallel_count = v;
        }
        if let Some(v) = patch.modules_per_pack {
            self.modules_per_pack = v;
        }
        if let Some(v) = patch.cells_per_module {
            self.cells_per_module = v;
        }
        if let Some(set) = patch.allowed_chemistries {
            self.allowed_chemistries = set;
        }

        self.check_structure()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    pub(crate) fn sample() -> Blueprint {
        let now = Utc::now();
        Blueprint {
            id: "BP-16S1P".into(),
            name: "16S1P LFP module".into(),
            chemistry: Chemistry::Lfp,
            series_count: 16,
            parallel_count: 1,
            modules_per_pack: 1,
            cells_per_module: 16,
            allowed_chemistries: BTreeSet::new(),
            status: BlueprintStatus::Draft,
            created_at: now,
            created_by: "eng-1".into(),
            updated_at: now,
            activated_at: None,
            activated_by: None,
        }
    }

    #[test]
    fn chemistry_parses_case_insensitively() {
        assert_eq!(Chemistry::from_str("lfp").unwrap(), Chemistry::Lfp);
        assert_eq!(Chemistry::Nmc.to_string(), "NMC");
        assert!(Chemistry::from_str("lead_acid").is_err());
    }

    #[test]
    fn structure_requires_matching_topology() {
        let mut bp = sample();
        assert!(bp.check_structure().is_ok());
        bp.cells_per_module = 12;
        assert!(bp.check_structure().is_err());
        bp.series_count = 0;
        assert!(bp.check_structure().is_err());
    }

    #[test]
    fn active_blueprint_rejects_patch() {
        let mut bp = sample();
        bp.status = BlueprintStatus::Active;
        let err = bp
            .apply(BlueprintPatch {
                name: Some("renamed".into()),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, ServiceError::Immutable(_)));
        assert_eq!(bp.name, "16S1P LFP module");
    }

    #[test]
    fn accepts_primary_and_allowed_chemistries() {
        let mut bp = sample();
        assert!(bp.accepts(Chemistry::Lfp));
        assert!(!bp.accepts(Chemistry::Nmc));
        bp.allowed_chemistries.insert(Chemistry::Nmc);
        assert!(bp.accepts(Chemistry::Nmc));
    }
}
