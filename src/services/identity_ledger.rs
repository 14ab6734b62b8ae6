use chrono::Utc;
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};

use super::{assign_id, validate_identifier, EngineContext};
use crate::{
    auth::{ActorContext, Screen, Verb},
    entities::manufacturing::{
        cell_serial::format_serial, identity_claim::claim_key, CellLot, CellSerial, Chemistry,
        ClaimNamespace, IdentityClaim, LotCounters, LotStatus, SerialStatus,
    },
    errors::{ServiceError, ServiceResult},
    events::Event,
    repositories::{
        fetch, list_typed, require, ChangeSet, EntityKey, EntityKind, ListFilter,
    },
};

const MAX_SERIALS_PER_CALL: u32 = 10_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewLot {
    pub id: Option<String>,
    pub supplier: String,
    pub supplier_lot_ref: Option<String>,
    pub declared_quantity: u32,
    pub chemistry: Chemistry,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeneratedSerials {
    pub lot_id: String,
    pub prefix: String,
    pub serials: Vec<String>,
    pub counters: LotCounters,
}

/// Recorded lot counters against a recount of the lot's serials
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CounterReport {
    pub lot_id: String,
    pub recorded: LotCounters,
    pub actual: LotCounters,
    pub consistent: bool,
}

/// Cell lots and serial identities
#[derive(Clone)]
pub struct IdentityLedger {
    ctx: Arc<EngineContext>,
}

impl IdentityLedger {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    #[instrument(skip(self, actor), fields(actor = %actor.actor_id))]
    pub async fn create_lot(&self, actor: &ActorContext, input: NewLot) -> ServiceResult<CellLot> {
        self.ctx
            .authorizer
            .require(actor, Screen::CellLots, Verb::Create)?;

        if input.supplier.trim().is_empty() {
            return Err(ServiceError::InvalidInput(
                "supplier cannot be empty".to_string(),
            ));
        }
        if input.declared_quantity == 0 {
            return Err(ServiceError::InvalidInput(
                "declared quantity must be positive".to_string(),
            ));
        }

        let id = assign_id(input.id, "LOT")?;
        let _lock = self
            .ctx
            .locks
            .lock(EntityKey::new(EntityKind::Lot, id.clone()))
            .await;

        if fetch::<CellLot>(self.ctx.store.as_ref(), &id).await?.is_some() {
            return Err(ServiceError::AlreadyAssigned(format!("lot id {} is taken", id)));
        }

        let now = Utc::now();
        let lot = CellLot {
            id: id.clone(),
            supplier: input.supplier.trim().to_string(),
            supplier_lot_ref: input.supplier_lot_ref,
            declared_quantity: input.declared_quantity,
            chemistry: input.chemistry,
            status: LotStatus::Draft,
            serial_prefixes: Vec::new(),
            counters: LotCounters::default(),
            created_at: now,
            created_by: actor.actor_id.clone(),
            updated_at: now,
            published_at: None,
            published_by: None,
        };

        let mut changes = ChangeSet::new();
        changes.insert(lot.clone());
        self.ctx.store.commit(changes).await?;

        info!(lot_id = %id, chemistry = %lot.chemistry, quantity = lot.declared_quantity, "Cell lot created");
        self.ctx.emit(Event::LotCreated { lot_id: id }).await;
        Ok(lot)
    }

    /// Generates `count` GENERATED serials `{prefix}-00001…` under a prefix
    /// no other generation has used.
    #[instrument(skip(self, actor), fields(actor = %actor.actor_id))]
    pub async fn generate_serials(
        &self,
        actor: &ActorContext,
        lot_id: &str,
        prefix: &str,
        count: u32,
    ) -> ServiceResult<GeneratedSerials> {
        self.ctx
            .authorizer
            .require(actor, Screen::CellLots, Verb::Create)?;

        let prefix = prefix.trim();
        validate_identifier(prefix, "prefix")?;
        if count == 0 || count > MAX_SERIALS_PER_CALL {
            return Err(ServiceError::InvalidInput(format!(
                "count must be between 1 and {}",
                MAX_SERIALS_PER_CALL
            )));
        }

        let claim_id = claim_key(ClaimNamespace::SerialPrefix, prefix);
        let _lock = self
            .ctx
            .locks
            .lock_many([
                EntityKey::new(EntityKind::Lot, lot_id),
                EntityKey::new(EntityKind::Claim, claim_id.clone()),
            ])
            .await;

        let store = self.ctx.store.as_ref();
        let stored = require::<CellLot>(store, lot_id).await?;
        let mut lot = stored.value;

        if !lot.is_draft() {
            return Err(ServiceError::invalid_transition(
                format!("lot {}", lot_id),
                lot.status,
                "generate serials for",
            ));
        }

        if let Some(existing) = fetch::<IdentityClaim>(store, &claim_id).await? {
            warn!(lot_id, prefix, owner = %existing.value.owner_id, "Serial prefix collision");
            return Err(ServiceError::AlreadyAssigned(format!(
                "serial prefix {} already used by lot {}",
                prefix, existing.value.owner_id
            )));
        }

        let total = lot.counters.total();
        if count > lot.remaining_capacity() {
            return Err(ServiceError::cardinality(
                format!("lot {} serials", lot_id),
                lot.declared_quantity,
                total.saturating_add(count),
            ));
        }

        let now = Utc::now();
        let serials: Vec<String> = (1..=count).map(|seq| format_serial(prefix, seq)).collect();

        for serial in &serials {
            if fetch::<CellSerial>(store, serial).await?.is_some() {
                return Err(ServiceError::AlreadyAssigned(format!(
                    "serial {} already exists",
                    serial
                )));
            }
        }

        let mut changes = ChangeSet::new();
        for serial in &serials {
            changes.insert(CellSerial::generated(serial.clone(), lot_id.to_string(), now));
            lot.counters.record_transition(None, SerialStatus::Generated);
        }
        changes.insert(IdentityClaim::new(
            ClaimNamespace::SerialPrefix,
            prefix,
            lot_id,
            &actor.actor_id,
            now,
        ));
        lot.serial_prefixes.push(prefix.to_string());
        lot.updated_at = now;
        changes.update(lot.clone(), stored.revision);
        store.commit(changes).await?;

        info!(lot_id, prefix, count, "Serials generated");
        counter!("packtrace.serials.generated", u64::from(count));
        self.ctx
            .emit(Event::SerialsGenerated {
                lot_id: lot_id.to_string(),
                prefix: prefix.to_string(),
                count,
            })
            .await;

        Ok(GeneratedSerials {
            lot_id: lot_id.to_string(),
            prefix: prefix.to_string(),
            serials,
            counters: lot.counters,
        })
    }

    /// GENERATED → SCANNED
    #[instrument(skip(self, actor), fields(actor = %actor.actor_id))]
    pub async fn scan_serial(
        &self,
        actor: &ActorContext,
        lot_id: &str,
        serial: &str,
    ) -> ServiceResult<CellSerial> {
        self.ctx
            .authorizer
            .require(actor, Screen::CellLots, Verb::Execute)?;

        let _lock = self
            .ctx
            .locks
            .lock_many([
                EntityKey::new(EntityKind::Lot, lot_id),
                EntityKey::new(EntityKind::Serial, serial),
            ])
            .await;

        let store = self.ctx.store.as_ref();
        let stored_lot = require::<CellLot>(store, lot_id).await?;
        let stored_cell = require::<CellSerial>(store, serial).await?;

        if stored_cell.value.lot_id != lot_id {
            return Err(ServiceError::NotFound(format!(
                "serial {} in lot {}",
                serial, lot_id
            )));
        }

        let mut cell = stored_cell.value;
        if cell.status != SerialStatus::Generated {
            return Err(ServiceError::invalid_transition(
                format!("serial {}", serial),
                cell.status,
                "scan",
            ));
        }

        let now = Utc::now();
        cell.status = SerialStatus::Scanned;
        cell.scanned_at = Some(now);
        cell.scanned_by = Some(actor.actor_id.clone());
        cell.updated_at = now;

        let mut lot = stored_lot.value;
        lot.counters
            .record_transition(Some(SerialStatus::Generated), SerialStatus::Scanned);
        lot.updated_at = now;

        let mut changes = ChangeSet::new();
        changes
            .update(cell.clone(), stored_cell.revision)
            .update(lot, stored_lot.revision);
        store.commit(changes).await?;

        info!(lot_id, serial, "Serial scanned");
        counter!("packtrace.serials.scanned", 1);
        self.ctx
            .emit(Event::SerialScanned {
                lot_id: lot_id.to_string(),
                serial: serial.to_string(),
            })
            .await;
        Ok(cell)
    }

    /// DRAFT → PUBLISHED once every recorded serial is accounted for.
    #[instrument(skip(self, actor), fields(actor = %actor.actor_id))]
    pub async fn publish_lot(&self, actor: &ActorContext, lot_id: &str) -> ServiceResult<CellLot> {
        self.ctx
            .authorizer
            .require(actor, Screen::CellLots, Verb::Execute)?;

        let _lock = self
            .ctx
            .locks
            .lock(EntityKey::new(EntityKind::Lot, lot_id))
            .await;

        let store = self.ctx.store.as_ref();
        let stored = require::<CellLot>(store, lot_id).await?;
        let mut lot = stored.value;

        if !lot.is_draft() {
            return Err(ServiceError::invalid_transition(
                format!("lot {}", lot_id),
                lot.status,
                "publish",
            ));
        }

        if lot.counters.total() == 0 {
            return Err(ServiceError::cardinality(
                format!("lot {} serials", lot_id),
                lot.declared_quantity,
                0,
            ));
        }

        let actual = self.recount(lot_id).await?;
        if actual != lot.counters {
            warn!(lot_id, recorded = ?lot.counters, actual = ?actual, "Lot counters drifted");
            return Err(ServiceError::cardinality(
                format!("lot {} serials", lot_id),
                lot.counters.total(),
                actual.total(),
            ));
        }

        let now = Utc::now();
        lot.status = LotStatus::Published;
        lot.published_at = Some(now);
        lot.published_by = Some(actor.actor_id.clone());
        lot.updated_at = now;

        let mut changes = ChangeSet::new();
        changes.update(lot.clone(), stored.revision);
        store.commit(changes).await?;

        info!(lot_id, serials = lot.counters.total(), "Cell lot published");
        self.ctx
            .emit(Event::LotPublished {
                lot_id: lot_id.to_string(),
            })
            .await;
        Ok(lot)
    }

    /// Keyed lookup across all lots
    pub async fn find_serial_globally(
        &self,
        actor: &ActorContext,
        serial: &str,
    ) -> ServiceResult<CellSerial> {
        self.ctx
            .authorizer
            .require(actor, Screen::CellLots, Verb::View)?;
        Ok(require::<CellSerial>(self.ctx.store.as_ref(), serial)
            .await?
            .value)
    }

    pub async fn get_lot(&self, actor: &ActorContext, lot_id: &str) -> ServiceResult<CellLot> {
        self.ctx
            .authorizer
            .require(actor, Screen::CellLots, Verb::View)?;
        Ok(require::<CellLot>(self.ctx.store.as_ref(), lot_id).await?.value)
    }

    pub async fn list_lots(
        &self,
        actor: &ActorContext,
        status: Option<LotStatus>,
    ) -> ServiceResult<Vec<CellLot>> {
        self.ctx
            .authorizer
            .require(actor, Screen::CellLots, Verb::View)?;
        let filter = status.map(ListFilter::by_status).unwrap_or_default();
        Ok(list_typed::<CellLot>(self.ctx.store.as_ref(), &filter)
            .await?
            .into_iter()
            .map(|v| v.value)
            .collect())
    }

    pub async fn list_lot_serials(
        &self,
        actor: &ActorContext,
        lot_id: &str,
        status: Option<SerialStatus>,
    ) -> ServiceResult<Vec<CellSerial>> {
        self.ctx
            .authorizer
            .require(actor, Screen::CellLots, Verb::View)?;
        require::<CellLot>(self.ctx.store.as_ref(), lot_id).await?;

        let filter = ListFilter {
            status: status.map(|s| s.to_string()),
            parent: Some(lot_id.to_string()),
        };
        Ok(list_typed::<CellSerial>(self.ctx.store.as_ref(), &filter)
            .await?
            .into_iter()
            .map(|v| v.value)
            .collect())
    }

    pub async fn verify_lot_counters(
        &self,
        actor: &ActorContext,
        lot_id: &str,
    ) -> ServiceResult<CounterReport> {
        self.ctx
            .authorizer
            .require(actor, Screen::CellLots, Verb::View)?;
        let lot = require::<CellLot>(self.ctx.store.as_ref(), lot_id).await?.value;
        let actual = self.recount(lot_id).await?;

        Ok(CounterReport {
            lot_id: lot_id.to_string(),
            recorded: lot.counters,
            consistent: actual == lot.counters,
            actual,
        })
    }

    async fn recount(&self, lot_id: &str) -> ServiceResult<LotCounters> {
        let serials =
            list_typed::<CellSerial>(self.ctx.store.as_ref(), &ListFilter::by_parent(lot_id))
                .await?;
        Ok(LotCounters::tally(serials.into_iter().map(|s| s.value.status)))
    }
}
