use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::errors::UnmetPrecondition;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum PackStatus {
    Draft,
    InProgress,
    ReadyForEol,
    Passed,
    Quarantined,
    Scrapped,
    Finalized,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum QcStatus {
    Pending,
    Passed,
    Failed,
}

/// Top-level sellable assembly
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pack {
    pub id: String,
    pub blueprint_id: String,
    pub required_module_count: u32,
    /// Linked modules in link order
    pub modules: Vec<String>,
    pub bms_id: Option<String>,
    pub pack_serial: Option<String>,
    pub qc_status: QcStatus,
    pub status: PackStatus,
    /// Current EOL run, if one has been opened for this attempt
    pub active_run_id: Option<String>,
    pub eol_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    pub updated_at: DateTime<Utc>,
    pub ready_at: Option<DateTime<Utc>>,
    pub finalized_at: Option<DateTime<Utc>>,
    pub finalized_by: Option<String>,
}

impl Pack {
    pub fn module_count(&self) -> u32 {
        u32::try_from(self.modules.len()).unwrap_or(u32::MAX)
    }

    /// READY_FOR_EOL or beyond: assembly fields are frozen.
    pub fn is_locked(&self) -> bool {
        !matches!(self.status, PackStatus::Draft | PackStatus::InProgress)
    }

    pub fn is_full(&self) -> bool {
        self.module_count() >= self.required_module_count
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        if self.status == PackStatus::Draft {
            self.status = PackStatus::InProgress;
        }
        self.updated_at = now;
    }

    /// Every finalization precondition that does not currently hold
    pub fn unmet_preconditions(&self) -> Vec<UnmetPrecondition> {
        let mut unmet = Vec::new();

        if self.module_count() != self.required_module_count {
            unmet.push(UnmetPrecondition::ModuleCount {
                expected: self.required_module_count,
                actual: self.module_count(),
            });
        }
        if self.pack_serial.is_none() {
            unmet.push(UnmetPrecondition::PackSerialUnassigned);
        }
        if self.qc_status != QcStatus::Passed {
            unmet.push(UnmetPrecondition::QcNotPassed {
                current: self.qc_status.to_string(),
            });
        }
        if self.bms_id.is_none() {
            unmet.push(UnmetPrecondition::BmsUnbound);
        }

        unmet
    }
}

/// `{prefix}-{YYYYMMDD}-{seq:06}`
pub fn format_pack_serial(prefix: &str, date: DateTime<Utc>, sequence: u64) -> String {
    format!("{}-{}-{:06}", prefix, date.format("%Y%m%d"), sequence)
}
