use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum ReleaseDisposition {
    Retest,
    Scrap,
}

/// Opened when a pack is quarantined; closed by a release disposition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuarantineRecord {
    pub id: String,
    pub pack_id: String,
    /// EOL run whose decision opened this record, if any
    pub run_id: Option<String>,
    pub reason: String,
    pub ncr_ref: Option<String>,
    pub opened_at: DateTime<Utc>,
    pub opened_by: String,
    pub released_at: Option<DateTime<Utc>>,
    pub released_by: Option<String>,
    pub disposition: Option<ReleaseDisposition>,
    pub release_notes: Option<String>,
}

impl QuarantineRecord {
    pub fn is_open(&self) -> bool {
        self.released_at.is_none()
    }

    pub fn close(
        &mut self,
        disposition: ReleaseDisposition,
        released_by: &str,
        notes: Option<String>,
        now: DateTime<Utc>,
    ) {
        self.released_at = Some(now);
        self.released_by = Some(released_by.to_string());
        self.disposition = Some(disposition);
        self.release_notes = notes;
    }
}
