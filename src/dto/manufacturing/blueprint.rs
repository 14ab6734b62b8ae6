use serde::Deserialize;
use std::collections::BTreeSet;
use validator::Validate;

use super::validate_identifier;
use crate::entities::manufacturing::{BlueprintPatch, BlueprintStatus, Chemistry};
use crate::services::blueprints::NewBlueprint;

#[derive(Debug, Deserialize, Validate)]
pub struct CreateBlueprintRequest {
    #[validate(custom = "validate_identifier")]
    pub id: Option<String>,
    #[validate(length(min = 1, max = 200))]
    pub name: String,
    pub chemistry: Chemistry,
    #[validate(range(min = 1, max = 1000))]
    pub series_count: u32,
    #[validate(range(min = 1, max = 1000))]
    pub parallel_count: u32,
    #[validate(range(min = 1, max = 1000))]
    pub modules_per_pack: u32,
    #[validate(range(min = 1, max = 100000))]
    pub cells_per_module: u32,
    #[serde(default)]
    pub allowed_chemistries: BTreeSet<Chemistry>,
}

impl From<CreateBlueprintRequest> for NewBlueprint {
    fn from(req: CreateBlueprintRequest) -> Self {
        NewBlueprint {
            id: req.id,
            name: req.name,
            chemistry: req.chemistry,
            series_count: req.series_count,
            parallel_count: req.parallel_count,
            modules_per_pack: req.modules_per_pack,
            cells_per_module: req.cells_per_module,
            allowed_chemistries: req.allowed_chemistries,
        }
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct UpdateBlueprintRequest {
    #[validate(length(min = 1, max = 200))]
    pub name: Option<String>,
    pub chemistry: Option<Chemistry>,
    #[validate(range(min = 1, max = 1000))]
    pub series_count: Option<u32>,
    #[validate(range(min = 1, max = 1000))]
    pub parallel_count: Option<u32>,
    #[validate(range(min = 1, max = 1000))]
    pub modules_per_pack: Option<u32>,
    #[validate(range(min = 1, max = 100000))]
    pub cells_per_module: Option<u32>,
    pub allowed_chemistries: Option<BTreeSet<Chemistry>>,
}

impl From<UpdateBlueprintRequest> for BlueprintPatch {
    fn from(req: UpdateBlueprintRequest) -> Self {
        BlueprintPatch {
            name: req.name,
            chemistry: req.chemistry,
            series_count: req.series_count,
            parallel_count: req.parallel_count,
            modules_per_pack: req.modules_per_pack,
            cells_per_module: req.cells_per_module,
            allowed_chemistries: req.allowed_chemistries,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ListBlueprintsQuery {
    pub status: Option<BlueprintStatus>,
}
