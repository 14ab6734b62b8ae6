use serde::Deserialize;
use validator::Validate;

use super::validate_identifier;
use crate::entities::manufacturing::{Chemistry, LotStatus, SerialStatus};
use crate::services::identity_ledger::NewLot;

#[derive(Debug, Deserialize, Validate)]
pub struct CreateLotRequest {
    #[validate(custom = "validate_identifier")]
    pub id: Option<String>,
    #[validate(length(min = 1, max = 200))]
    pub supplier: String,
    #[validate(length(max = 100))]
    pub supplier_lot_ref: Option<String>,
    #[validate(range(min = 1, max = 1000000))]
    pub declared_quantity: u32,
    pub chemistry: Chemistry,
}

impl From<CreateLotRequest> for NewLot {
    fn from(req: CreateLotRequest) -> Self {
        NewLot {
            id: req.id,
            supplier: req.supplier,
            supplier_lot_ref: req.supplier_lot_ref,
            declared_quantity: req.declared_quantity,
            chemistry: req.chemistry,
        }
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct GenerateSerialsRequest {
    #[validate(length(min = 1, max = 32), custom = "validate_identifier")]
    pub prefix: String,
    #[validate(range(min = 1, max = 10000))]
    pub count: u32,
}

#[derive(Debug, Deserialize, Validate)]
pub struct ScanSerialRequest {
    #[validate(custom = "validate_identifier")]
    pub serial: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListLotsQuery {
    pub status: Option<LotStatus>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListSerialsQuery {
    pub status: Option<SerialStatus>,
}
