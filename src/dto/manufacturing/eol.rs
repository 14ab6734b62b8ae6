use serde::Deserialize;
use validator::Validate;

use super::{validate_identifier, validate_reason};
use crate::entities::manufacturing::{Decision, ItemStatus, ItemUpdate, ReleaseDisposition};
use crate::errors::ServiceError;

/// Exactly one of `measurement` or `status` must be present
#[derive(Debug, Deserialize, Validate)]
pub struct UpdateTestItemRequest {
    pub measurement: Option<f64>,
    pub status: Option<ItemStatus>,
}

impl TryFrom<UpdateTestItemRequest> for ItemUpdate {
    type Error = ServiceError;

    fn try_from(req: UpdateTestItemRequest) -> Result<Self, Self::Error> {
        match (req.measurement, req.status) {
            (Some(value), None) => Ok(ItemUpdate::Measurement(value)),
            (None, Some(status)) => Ok(ItemUpdate::Status(status)),
            _ => Err(ServiceError::InvalidInput(
                "provide either measurement or status".to_string(),
            )),
        }
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct FinalizeDecisionRequest {
    pub decision: Decision,
    #[validate(length(max = 2000))]
    pub notes: Option<String>,
    #[validate(length(max = 1000), custom = "validate_reason")]
    pub override_reason: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct HoldPackRequest {
    #[validate(length(max = 1000), custom = "validate_reason")]
    pub reason: String,
    #[validate(custom = "validate_identifier")]
    pub ncr_ref: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct ReleaseQuarantineRequest {
    pub disposition: ReleaseDisposition,
    #[validate(length(max = 2000))]
    pub notes: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListQuarantineQuery {
    pub pack_id: Option<String>,
    #[serde(default)]
    pub open_only: bool,
}
