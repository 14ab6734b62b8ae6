use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use super::blueprint::Chemistry;
use super::cell_serial::SerialStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum LotStatus {
    Draft,
    Published,
}

/// Denormalized per-status counts of a lot's serials.
///
/// Each counter equals the number of child serials currently in that status;
/// `total()` equals the number of serials ever generated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LotCounters {
    pub generated: u32,
    pub scanned: u32,
    pub bound: u32,
}

impl LotCounters {
    pub fn total(&self) -> u32 {
        self.generated + self.scanned + self.bound
    }

    fn slot(&mut self, status: SerialStatus) -> &mut u32 {
        match status {
            SerialStatus::Generated => &mut self.generated,
            SerialStatus::Scanned => &mut self.scanned,
            SerialStatus::Bound => &mut self.bound,
        }
    }

    /// Moves one serial from `from` to `to`; `None` means newly generated.
    pub fn record_transition(&mut self, from: Option<SerialStatus>, to: SerialStatus) {
        if let Some(from) = from {
            let slot = self.slot(from);
            *slot = slot.saturating_sub(1);
        }
        *self.slot(to) += 1;
    }

    pub fn tally<I>(statuses: I) -> Self
    where
        I: IntoIterator<Item = SerialStatus>,
    {
        statuses.into_iter().fold(Self::default(), |mut acc, s| {
            acc.record_transition(None, s);
            acc
        })
    }
}

/// A physical cell shipment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellLot {
    pub id: String,
    pub supplier: String,
    pub supplier_lot_ref: Option<String>,
    pub declared_quantity: u32,
    pub chemistry: Chemistry,
    pub status: LotStatus,
    /// Prefixes claimed by this lot, in generation order
    pub serial_prefixes: Vec<String>,
    pub counters: LotCounters,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    pub updated_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
    pub published_by: Option<String>,
}

impl CellLot {
    pub fn is_draft(&self) -> bool {
        self.status == LotStatus::Draft
    }

    pub fn remaining_capacity(&self) -> u32 {
        self.declared_quantity.saturating_sub(self.counters.total())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_keep_total_constant() {
        let mut counters = LotCounters::default();
        for _ in 0..3 {
            counters.record_transition(None, SerialStatus::Generated);
        }
        counters.record_transition(Some(SerialStatus::Generated), SerialStatus::Scanned);
        counters.record_transition(Some(SerialStatus::Scanned), SerialStatus::Bound);
        counters.record_transition(Some(SerialStatus::Bound), SerialStatus::Scanned);

        assert_eq!(
            counters,
            LotCounters {
                generated: 2,
                scanned: 1,
                bound: 0
            }
        );
        assert_eq!(counters.total(), 3);
    }

    #[test]
    fn tally_matches_incremental_updates() {
        let statuses = [
            SerialStatus::Generated,
            SerialStatus::Bound,
            SerialStatus::Scanned,
            SerialStatus::Bound,
        ];
        let counters = LotCounters::tally(statuses);
        assert_eq!(counters.bound, 2);
        assert_eq!(counters.total(), 4);
    }
}
