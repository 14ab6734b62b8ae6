use serde::Deserialize;
use validator::Validate;

use super::{validate_identifier, validate_reason};
use crate::entities::manufacturing::{ModuleStatus, PackStatus, QcStatus};
use crate::services::{module_assembly::NewModule, pack_assembly::NewPack};

#[derive(Debug, Deserialize, Validate)]
pub struct CreateModuleRequest {
    #[validate(custom = "validate_identifier")]
    pub id: Option<String>,
    #[validate(custom = "validate_identifier")]
    pub blueprint_id: String,
}

impl From<CreateModuleRequest> for NewModule {
    fn from(req: CreateModuleRequest) -> Self {
        NewModule {
            id: req.id,
            blueprint_id: req.blueprint_id,
        }
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct BindCellRequest {
    #[validate(custom = "validate_identifier")]
    pub serial: String,
    /// Present only when the caller invokes a privileged override
    #[validate(length(max = 1000), custom = "validate_reason")]
    pub override_reason: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct UnbindCellRequest {
    #[validate(length(max = 1000))]
    pub reason: Option<String>,
    #[validate(length(max = 1000), custom = "validate_reason")]
    pub override_reason: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct QuarantineModuleRequest {
    #[validate(length(max = 1000), custom = "validate_reason")]
    pub reason: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListModulesQuery {
    pub status: Option<ModuleStatus>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListBindingsQuery {
    #[serde(default)]
    pub include_released: bool,
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreatePackRequest {
    #[validate(custom = "validate_identifier")]
    pub id: Option<String>,
    #[validate(custom = "validate_identifier")]
    pub blueprint_id: String,
}

impl From<CreatePackRequest> for NewPack {
    fn from(req: CreatePackRequest) -> Self {
        NewPack {
            id: req.id,
            blueprint_id: req.blueprint_id,
        }
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct LinkModuleRequest {
    #[validate(custom = "validate_identifier")]
    pub module_id: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct BindDeviceRequest {
    #[validate(custom = "validate_identifier")]
    pub bms_id: String,
}

#[derive(Debug, Deserialize)]
pub struct SetQcStatusRequest {
    pub status: QcStatus,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListPacksQuery {
    pub status: Option<PackStatus>,
}
