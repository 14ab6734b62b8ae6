use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Join record linking one cell serial to one module.
/// Released bindings are kept as history; only open bindings count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellBinding {
    pub id: String,
    pub module_id: String,
    pub serial: String,
    pub lot_id: String,
    pub bound_at: DateTime<Utc>,
    pub bound_by: String,
    pub override_reason: Option<String>,
    pub released_at: Option<DateTime<Utc>>,
    pub released_by: Option<String>,
    pub release_reason: Option<String>,
}

impl CellBinding {
    /// Check if the cell is currently bound through this record
    pub fn is_open(&self) -> bool {
        self.released_at.is_none()
    }

    pub fn release(&mut self, released_by: &str, reason: Option<String>, now: DateTime<Utc>) {
        self.released_at = Some(now);
        self.released_by = Some(released_by.to_string());
        self.release_reason = reason;
    }
}
