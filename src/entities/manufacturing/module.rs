use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ModuleStatus {
    Draft,
    InProgress,
    Sealed,
    Consumed,
    Quarantined,
}

/// Sub-assembly of bound cells built against one blueprint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Module {
    pub id: String,
    pub blueprint_id: String,
    pub target_cell_count: u32,
    /// Bound serials in bind order, no duplicates
    pub cells: Vec<String>,
    pub status: ModuleStatus,
    /// Pack consuming this module
    pub pack_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    pub updated_at: DateTime<Utc>,
    pub sealed_at: Option<DateTime<Utc>>,
    pub sealed_by: Option<String>,
    pub quarantine_reason: Option<String>,
}

impl Module {
    pub fn bound_count(&self) -> u32 {
        u32::try_from(self.cells.len()).unwrap_or(u32::MAX)
    }

    pub fn is_full(&self) -> bool {
        self.bound_count() >= self.target_cell_count
    }

    pub fn contains(&self, serial: &str) -> bool {
        self.cells.iter().any(|s| s == serial)
    }

    /// Past the seal gate: bindings only change under override
    pub fn is_sealed(&self) -> bool {
        matches!(self.status, ModuleStatus::Sealed | ModuleStatus::Consumed)
    }

    /// Cell set may only shrink under override. Quarantine does not lift
    /// the seal, and a quarantined module's cells are evidence.
    pub fn bindings_frozen(&self) -> bool {
        self.is_sealed() || self.sealed_at.is_some() || self.status == ModuleStatus::Quarantined
    }

    pub fn is_open_for_binding(&self) -> bool {
        matches!(self.status, ModuleStatus::Draft | ModuleStatus::InProgress)
    }

    pub fn push_cell(&mut self, serial: String, now: DateTime<Utc>) {
        self.cells.push(serial);
        if self.status == ModuleStatus::Draft {
            self.status = ModuleStatus::InProgress;
        }
        self.updated_at = now;
    }

    pub fn remove_cell(&mut self, serial: &str, now: DateTime<Utc>) -> bool {
        let before = self.cells.len();
        self.cells.retain(|s| s != serial);
        self.updated_at = now;
        self.cells.len() != before
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module(target: u32) -> Module {
        let now = Utc::now();
        Module {
            id: "M1".into(),
            blueprint_id: "BP".into(),
            target_cell_count: target,
            cells: vec![],
            status: ModuleStatus::Draft,
            pack_id: None,
            created_at: now,
            created_by: "op".into(),
            updated_at: now,
            sealed_at: None,
            sealed_by: None,
            quarantine_reason: None,
        }
    }

    #[test]
    fn first_bind_moves_to_in_progress() {
        let mut m = module(2);
        m.push_cell("C-1".into(), Utc::now());
        assert_eq!(m.status, ModuleStatus::InProgress);
        assert!(m.contains("C-1"));
        assert!(!m.is_full());
        m.push_cell("C-2".into(), Utc::now());
        assert!(m.is_full());
    }

    #[test]
    fn quarantine_keeps_bindings_frozen() {
        let mut m = module(1);
        m.push_cell("C-1".into(), Utc::now());
        assert!(!m.bindings_frozen());

        m.status = ModuleStatus::Sealed;
        m.sealed_at = Some(Utc::now());
        m.status = ModuleStatus::Quarantined;
        assert!(!m.is_sealed());
        assert!(m.bindings_frozen());
    }

    #[test]
    fn remove_cell_reports_presence() {
        let mut m = module(2);
        m.push_cell("C-1".into(), Utc::now());
        assert!(m.remove_cell("C-1", Utc::now()));
        assert!(!m.remove_cell("C-1", Utc::now()));
        assert_eq!(m.bound_count(), 0);
    }
}
