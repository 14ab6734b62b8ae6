use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use strum::{Display, EnumString};

use crate::config::EolItemTemplate;
use crate::errors::ServiceError;

static THRESHOLD_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*([<>])\s*(-?\d+(?:\.\d+)?)\s*$").expect("threshold pattern compiles")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ItemStatus {
    NotRun,
    Pass,
    Fail,
    Na,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum AggregateResult {
    Pending,
    Pass,
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum Decision {
    Pass,
    Fail,
    Quarantine,
    Scrap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    LessThan,
    GreaterThan,
}

/// Strict numeric bound written as `< N` or `> N`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Threshold {
    pub comparator: Comparator,
    pub limit: f64,
}

impl Threshold {
    pub fn evaluate(&self, measured: f64) -> ItemStatus {
        let pass = match self.comparator {
            Comparator::LessThan => measured < self.limit,
            Comparator::GreaterThan => measured > self.limit,
        };
        if pass {
            ItemStatus::Pass
        } else {
            ItemStatus::Fail
        }
    }
}

impl FromStr for Threshold {
    type Err = ServiceError;

    fn from_str(expr: &str) -> Result<Self, Self::Err> {
        let caps = THRESHOLD_RE.captures(expr).ok_or_else(|| {
            ServiceError::InvalidInput(format!("threshold '{}' is not '< N' or '> N'", expr))
        })?;

        let comparator = if &caps[1] == "<" {
            Comparator::LessThan
        } else {
            Comparator::GreaterThan
        };
        let limit = caps[2]
            .parse::<f64>()
            .map_err(|e| ServiceError::InvalidInput(format!("threshold '{}': {}", expr, e)))?;

        Ok(Threshold { comparator, limit })
    }
}

impl TryFrom<String> for Threshold {
    type Error = ServiceError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Threshold> for String {
    fn from(t: Threshold) -> Self {
        t.to_string()
    }
}

impl fmt::Display for Threshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self.comparator {
            Comparator::LessThan => '<',
            Comparator::GreaterThan => '>',
        };
        write!(f, "{} {}", op, self.limit)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestItem {
    pub id: String,
    pub name: String,
    pub required: bool,
    pub unit: Option<String>,
    pub threshold: Option<Threshold>,
    pub measured_value: Option<f64>,
    pub status: ItemStatus,
    pub updated_at: Option<DateTime<Utc>>,
    pub updated_by: Option<String>,
}

impl TestItem {
    pub fn from_template(template: &EolItemTemplate) -> Result<Self, ServiceError> {
        let threshold = template
            .threshold
            .as_deref()
            .map(Threshold::from_str)
            .transpose()?;

        Ok(TestItem {
            id: template.id.clone(),
            name: template.name.clone(),
            required: template.required,
            unit: template.unit.clone(),
            threshold,
            measured_value: None,
            status: ItemStatus::NotRun,
            updated_at: None,
            updated_by: None,
        })
    }
}

/// Input for one test item: a reading for thresholded items, a direct status otherwise
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemUpdate {
    Measurement(f64),
    Status(ItemStatus),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub decision: Decision,
    pub signed_by: String,
    pub signed_at: DateTime<Utc>,
    pub notes: Option<String>,
    pub override_reason: Option<String>,
}

/// One EOL attempt for a pack. Immutable once `decision` is recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EolTestRun {
    pub id: String,
    pub pack_id: String,
    pub attempt: u32,
    pub items: Vec<TestItem>,
    pub aggregate: AggregateResult,
    pub decision: Option<DecisionRecord>,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    pub updated_at: DateTime<Utc>,
}

impl EolTestRun {
    pub fn run_id(pack_id: &str, attempt: u32) -> String {
        format!("EOL-{}-{}", pack_id, attempt)
    }

    pub fn is_decided(&self) -> bool {
        self.decision.is_some()
    }

    /// FAIL if any required item failed, PASS if every required item is
    /// PASS or NA, otherwise PENDING. Optional items never contribute.
    pub fn aggregate_of(items: &[TestItem]) -> AggregateResult {
        let required = || items.iter().filter(|i| i.required);

        if required().any(|i| i.status == ItemStatus::Fail) {
            AggregateResult::Fail
        } else if required().all(|i| matches!(i.status, ItemStatus::Pass | ItemStatus::Na)) {
            AggregateResult::Pass
        } else {
            AggregateResult::Pending
        }
    }

    pub fn apply_update(
        &mut self,
        item_id: &str,
        update: ItemUpdate,
        actor: &str,
        now: DateTime<Utc>,
    ) -> Result<ItemStatus, ServiceError> {
        if self.is_decided() {
            return Err(ServiceError::Immutable(format!(
                "EOL run {} already has a final decision",
                self.id
            )));
        }

        let run_id = self.id.clone();
        let item = self
            .items
            .iter_mut()
            .find(|i| i.id == item_id)
            .ok_or_else(|| ServiceError::NotFound(format!("test item {} on run {}", item_id, run_id)))?;

        match (update, item.threshold) {
            (ItemUpdate::Measurement(value), Some(threshold)) => {
                if !value.is_finite() {
                    return Err(ServiceError::InvalidInput(format!(
                        "measurement for {} must be finite",
                        item_id
                    )));
                }
                item.measured_value = Some(value);
                item.status = threshold.evaluate(value);
            }
            (ItemUpdate::Measurement(_), None) => {
                return Err(ServiceError::InvalidInput(format!(
                    "test item {} has no threshold; set its status directly",
                    item_id
                )));
            }
            (ItemUpdate::Status(status), Some(_))
                if !matches!(status, ItemStatus::NotRun | ItemStatus::Na) =>
            {
                return Err(ServiceError::InvalidInput(format!(
                    "test item {} is thresholded; PASS/FAIL derive from the measurement",
                    item_id
                )));
            }
            (ItemUpdate::Status(status), threshold) => {
                if threshold.is_some() {
                    item.measured_value = None;
                }
                item.status = status;
            }
        }

        item.updated_at = Some(now);
        item.updated_by = Some(actor.to_string());
        let status = item.status;

        self.aggregate = Self::aggregate_of(&self.items);
        self.updated_at = now;
        Ok(status)
    }
}
