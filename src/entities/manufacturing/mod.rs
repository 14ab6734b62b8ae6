// Design authority
pub mod blueprint;

// Identity ledger
pub mod cell_lot;
pub mod cell_serial;
pub mod identity_claim;

// Assembly
pub mod cell_binding;
pub mod module;
pub mod pack;

// End-of-line disposition
pub mod eol_test_run;
pub mod quarantine_record;

pub use blueprint::{Blueprint, BlueprintPatch, BlueprintStatus, Chemistry};
pub use cell_binding::CellBinding;
pub use cell_lot::{CellLot, LotCounters, LotStatus};
pub use cell_serial::{CellSerial, SerialStatus};
pub use eol_test_run::{
    AggregateResult, Decision, DecisionRecord, EolTestRun, ItemStatus, ItemUpdate, TestItem,
    Threshold,
};
pub use identity_claim::{ClaimNamespace, IdentityClaim};
pub use module::{Module, ModuleStatus};
pub use pack::{Pack, PackStatus, QcStatus};
pub use quarantine_record::{QuarantineRecord, ReleaseDisposition};
