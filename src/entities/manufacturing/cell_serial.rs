use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum SerialStatus {
    Generated,
    Scanned,
    Bound,
}

/// One physical cell identity. Keyed by `serial`, which is globally unique.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellSerial {
    pub serial: String,
    pub lot_id: String,
    pub status: SerialStatus,
    pub generated_at: DateTime<Utc>,
    pub scanned_at: Option<DateTime<Utc>>,
    pub scanned_by: Option<String>,
    /// Open binding while BOUND
    pub binding_id: Option<String>,
    pub bound_module: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl CellSerial {
    pub fn generated(serial: String, lot_id: String, now: DateTime<Utc>) -> Self {
        Self {
            serial,
            lot_id,
            status: SerialStatus::Generated,
            generated_at: now,
            scanned_at: None,
            scanned_by: None,
            binding_id: None,
            bound_module: None,
            updated_at: now,
        }
    }

    pub fn is_bound(&self) -> bool {
        self.status == SerialStatus::Bound
    }

    /// Unbinding never returns a cell to GENERATED.
    pub fn release(&mut self, now: DateTime<Utc>) {
        self.status = SerialStatus::Scanned;
        self.binding_id = None;
        self.bound_module = None;
        self.updated_at = now;
    }
}

/// `{prefix}-{seq:05}`
pub fn format_serial(prefix: &str, sequence: u32) -> String {
    format!("{}-{:05}", prefix, sequence)
}
