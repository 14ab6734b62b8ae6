use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

/// Namespaces of globally unique physical identities
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ClaimNamespace {
    BmsId,
    PackSerial,
    SerialPrefix,
}

/// Exclusive ownership of one identity value. Stored under
/// `claim_key(namespace, value)` so uniqueness is a single keyed lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityClaim {
    pub id: String,
    pub namespace: ClaimNamespace,
    pub value: String,
    pub owner_id: String,
    pub claimed_at: DateTime<Utc>,
    pub claimed_by: String,
}

impl IdentityClaim {
    pub fn new(
        namespace: ClaimNamespace,
        value: &str,
        owner_id: &str,
        claimed_by: &str,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: claim_key(namespace, value),
            namespace,
            value: value.to_string(),
            owner_id: owner_id.to_string(),
            claimed_at: now,
            claimed_by: claimed_by.to_string(),
        }
    }
}

pub fn claim_key(namespace: ClaimNamespace, value: &str) -> String {
    format!("{}:{}", namespace, value)
}
