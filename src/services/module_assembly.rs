use chrono::Utc;
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};

use super::{assign_id, blueprints::require_active, check_override, EngineContext};
use crate::{
    auth::{ActorContext, OverrideGrant, Screen, Verb},
    entities::manufacturing::{
        Blueprint, CellBinding, CellLot, CellSerial, Module, ModuleStatus, SerialStatus,
    },
    errors::{ServiceError, ServiceResult},
    events::Event,
    repositories::{
        fetch, list_typed, require, ChangeSet, EntityKey, EntityKind, ListFilter,
    },
};

pub const GUARD_SEALED_MODULE: &str = "sealed_module";
pub const GUARD_UNSCANNED_SERIAL: &str = "unscanned_serial";
pub const GUARD_CHEMISTRY: &str = "chemistry";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewModule {
    pub id: Option<String>,
    pub blueprint_id: String,
}

/// Binds cell identities into modules
#[derive(Clone)]
pub struct ModuleAssembly {
    ctx: Arc<EngineContext>,
}

impl ModuleAssembly {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    #[instrument(skip(self, actor), fields(actor = %actor.actor_id))]
    pub async fn create_module(&self, actor: &ActorContext, input: NewModule) -> ServiceResult<Module> {
        self.ctx
            .authorizer
            .require(actor, Screen::Modules, Verb::Create)?;

        let blueprint = require_active(&self.ctx, &input.blueprint_id).await?;
        let id = assign_id(input.id, "MOD")?;

        let _lock = self
            .ctx
            .locks
            .lock(EntityKey::new(EntityKind::Module, id.clone()))
            .await;

        if fetch::<Module>(self.ctx.store.as_ref(), &id).await?.is_some() {
            return Err(ServiceError::AlreadyAssigned(format!("module id {} is taken", id)));
        }

        let now = Utc::now();
        let module = Module {
            id: id.clone(),
            blueprint_id: blueprint.id.clone(),
            target_cell_count: blueprint.cells_per_module,
            cells: Vec::new(),
            status: ModuleStatus::Draft,
            pack_id: None,
            created_at: now,
            created_by: actor.actor_id.clone(),
            updated_at: now,
            sealed_at: None,
            sealed_by: None,
            quarantine_reason: None,
        };

        let mut changes = ChangeSet::new();
        changes.insert(module.clone());
        self.ctx.store.commit(changes).await?;

        info!(module_id = %id, blueprint_id = %blueprint.id, target = module.target_cell_count, "Module created");
        self.ctx
            .emit(Event::ModuleCreated {
                module_id: id,
                blueprint_id: blueprint.id,
            })
            .await;
        Ok(module)
    }

    /// Binds one cell serial into a module.
    ///
    /// Guards run in order: module not sealed, capacity, serial exists, serial
    /// not bound, serial scanned (when configured), lot chemistry accepted by
    /// the blueprint. The sealed, scan and chemistry guards yield to an
    /// override grant for the modules screen.
    #[instrument(skip(self, actor, grant), fields(actor = %actor.actor_id, overridden = grant.is_some()))]
    pub async fn bind_cell(
        &self,
        actor: &ActorContext,
        module_id: &str,
        serial: &str,
        grant: Option<&OverrideGrant>,
    ) -> ServiceResult<CellBinding> {
        self.ctx
            .authorizer
            .require(actor, Screen::Modules, Verb::Execute)?;
        let grant = check_override(actor, grant, Screen::Modules)?;

        let store = self.ctx.store.as_ref();
        let lot_hint = fetch::<CellSerial>(store, serial)
            .await?
            .map(|s| s.value.lot_id);

        let mut keys = vec![
            EntityKey::new(EntityKind::Module, module_id),
            EntityKey::new(EntityKind::Serial, serial),
        ];
        if let Some(lot_id) = &lot_hint {
            keys.push(EntityKey::new(EntityKind::Lot, lot_id.clone()));
        }
        let _lock = self.ctx.locks.lock_many(keys).await;

        let mut overrides: Vec<&'static str> = Vec::new();

        let stored_module = require::<Module>(store, module_id).await?;
        let mut module = stored_module.value;

        if module.status == ModuleStatus::Quarantined {
            return Err(ServiceError::invalid_transition(
                format!("module {}", module_id),
                module.status,
                "bind cells into",
            ));
        }
        if module.is_sealed() {
            if grant.is_none() {
                warn!(module_id, status = %module.status, "Bind rejected: module sealed");
                return Err(ServiceError::Immutable(format!(
                    "module {} is {}",
                    module_id, module.status
                )));
            }
            overrides.push(GUARD_SEALED_MODULE);
        }

        if module.is_full() {
            return Err(ServiceError::cardinality(
                format!("module {}", module_id),
                module.target_cell_count,
                module.bound_count().saturating_add(1),
            ));
        }

        let stored_cell = fetch::<CellSerial>(store, serial)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("serial {}", serial)))?;
        let mut cell = stored_cell.value;

        if cell.is_bound() {
            warn!(module_id, serial, bound_to = ?cell.bound_module, "Bind rejected: serial already bound");
            return Err(ServiceError::AlreadyBound(format!(
                "serial {} is bound to module {}",
                serial,
                cell.bound_module.as_deref().unwrap_or("unknown")
            )));
        }

        if cell.status == SerialStatus::Generated && self.ctx.settings.require_scan_before_bind {
            if grant.is_none() {
                return Err(ServiceError::invalid_transition(
                    format!("serial {}", serial),
                    cell.status,
                    "bind unscanned",
                ));
            }
            overrides.push(GUARD_UNSCANNED_SERIAL);
        }

        if lot_hint.as_deref() != Some(cell.lot_id.as_str()) {
            return Err(ServiceError::ConcurrentModification(format!(
                "serial {} changed while binding",
                serial
            )));
        }
        let stored_lot = require::<CellLot>(store, &cell.lot_id).await?;
        let mut lot = stored_lot.value;
        let blueprint = require::<Blueprint>(store, &module.blueprint_id).await?.value;

        if !blueprint.accepts(lot.chemistry) {
            if grant.is_none() {
                warn!(module_id, serial, lot = %lot.id, "Bind rejected: chemistry mismatch");
                return Err(ServiceError::ChemistryMismatch {
                    lot_id: lot.id.clone(),
                    lot_chemistry: lot.chemistry.to_string(),
                    blueprint_id: blueprint.id.clone(),
                    blueprint_chemistry: blueprint.chemistry.to_string(),
                });
            }
            overrides.push(GUARD_CHEMISTRY);
        }

        let now = Utc::now();
        let binding = CellBinding {
            id: assign_id(None, "BND")?,
            module_id: module_id.to_string(),
            serial: serial.to_string(),
            lot_id: lot.id.clone(),
            bound_at: now,
            bound_by: actor.actor_id.clone(),
            override_reason: grant
                .filter(|_| !overrides.is_empty())
                .map(|g| g.reason().to_string()),
            released_at: None,
            released_by: None,
            release_reason: None,
        };

        let previous = cell.status;
        cell.status = SerialStatus::Bound;
        cell.binding_id = Some(binding.id.clone());
        cell.bound_module = Some(module_id.to_string());
        cell.updated_at = now;

        lot.counters
            .record_transition(Some(previous), SerialStatus::Bound);
        lot.updated_at = now;

        module.push_cell(serial.to_string(), now);

        let mut changes = ChangeSet::new();
        changes
            .insert(binding.clone())
            .update(module, stored_module.revision)
            .update(cell, stored_cell.revision)
            .update(lot, stored_lot.revision);
        store.commit(changes).await?;

        self.ctx
            .record_overrides(grant, &overrides, &format!("module {} serial {}", module_id, serial))
            .await;
        info!(module_id, serial, binding_id = %binding.id, "Cell bound");
        counter!("packtrace.cells.bound", 1);
        self.ctx
            .emit(Event::CellBound {
                module_id: module_id.to_string(),
                serial: serial.to_string(),
                binding_id: binding.id.clone(),
            })
            .await;

        Ok(binding)
    }

    /// Releases the open binding and returns the serial to SCANNED.
    /// A sealed module is reopened to IN_PROGRESS under override.
    #[instrument(skip(self, actor, grant), fields(actor = %actor.actor_id, overridden = grant.is_some()))]
    pub async fn unbind_cell(
        &self,
        actor: &ActorContext,
        module_id: &str,
        serial: &str,
        reason: Option<String>,
        grant: Option<&OverrideGrant>,
    ) -> ServiceResult<CellBinding> {
        self.ctx
            .authorizer
            .require(actor, Screen::Modules, Verb::Edit)?;
        let grant = check_override(actor, grant, Screen::Modules)?;

        let store = self.ctx.store.as_ref();
        let hint = fetch::<CellSerial>(store, serial)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("serial {}", serial)))?;

        let _lock = self
            .ctx
            .locks
            .lock_many([
                EntityKey::new(EntityKind::Module, module_id),
                EntityKey::new(EntityKind::Serial, serial),
                EntityKey::new(EntityKind::Lot, hint.value.lot_id.clone()),
            ])
            .await;

        let mut overrides: Vec<&'static str> = Vec::new();
        let stored_module = require::<Module>(store, module_id).await?;
        let mut module = stored_module.value;

        if !module.contains(serial) {
            return Err(ServiceError::NotFound(format!(
                "serial {} on module {}",
                serial, module_id
            )));
        }

        if module.bindings_frozen() {
            if grant.is_none() {
                warn!(module_id, serial, status = %module.status, "Unbind rejected: bindings frozen");
                return Err(ServiceError::Immutable(format!(
                    "module {} is {}",
                    module_id, module.status
                )));
            }
            overrides.push(GUARD_SEALED_MODULE);
        }

        let stored_cell = require::<CellSerial>(store, serial).await?;
        let mut cell = stored_cell.value;
        let binding_id = cell.binding_id.clone().ok_or_else(|| {
            ServiceError::InternalError(format!("serial {} listed on {} without binding", serial, module_id))
        })?;
        let stored_binding = require::<CellBinding>(store, &binding_id).await?;
        let mut binding = stored_binding.value;
        let stored_lot = require::<CellLot>(store, &cell.lot_id).await?;
        let mut lot = stored_lot.value;

        let now = Utc::now();
        binding.release(&actor.actor_id, reason, now);
        cell.release(now);
        lot.counters
            .record_transition(Some(SerialStatus::Bound), SerialStatus::Scanned);
        lot.updated_at = now;
        module.remove_cell(serial, now);
        if module.status == ModuleStatus::Sealed {
            module.status = ModuleStatus::InProgress;
            module.sealed_at = None;
            module.sealed_by = None;
        }

        let mut changes = ChangeSet::new();
        changes
            .update(binding.clone(), stored_binding.revision)
            .update(module, stored_module.revision)
            .update(cell, stored_cell.revision)
            .update(lot, stored_lot.revision);
        store.commit(changes).await?;

        self.ctx
            .record_overrides(grant, &overrides, &format!("module {} serial {}", module_id, serial))
            .await;
        info!(module_id, serial, binding_id = %binding_id, "Cell unbound");
        counter!("packtrace.cells.unbound", 1);
        self.ctx
            .emit(Event::CellUnbound {
                module_id: module_id.to_string(),
                serial: serial.to_string(),
                binding_id,
            })
            .await;

        Ok(binding)
    }

    /// One-way gate: bound count must equal the target exactly.
    #[instrument(skip(self, actor), fields(actor = %actor.actor_id))]
    pub async fn seal_module(&self, actor: &ActorContext, module_id: &str) -> ServiceResult<Module> {
        self.ctx
            .authorizer
            .require(actor, Screen::Modules, Verb::Execute)?;

        let _lock = self
            .ctx
            .locks
            .lock(EntityKey::new(EntityKind::Module, module_id))
            .await;

        let store = self.ctx.store.as_ref();
        let stored = require::<Module>(store, module_id).await?;
        let mut module = stored.value;

        if module.is_sealed() {
            return Err(ServiceError::Immutable(format!(
                "module {} is already {}",
                module_id, module.status
            )));
        }
        if !module.is_open_for_binding() {
            return Err(ServiceError::invalid_transition(
                format!("module {}", module_id),
                module.status,
                "seal",
            ));
        }
        if module.bound_count() != module.target_cell_count {
            warn!(
                module_id,
                expected = module.target_cell_count,
                actual = module.bound_count(),
                "Seal rejected: cardinality mismatch"
            );
            return Err(ServiceError::cardinality(
                format!("module {}", module_id),
                module.target_cell_count,
                module.bound_count(),
            ));
        }

        let now = Utc::now();
        module.status = ModuleStatus::Sealed;
        module.sealed_at = Some(now);
        module.sealed_by = Some(actor.actor_id.clone());
        module.updated_at = now;

        let mut changes = ChangeSet::new();
        changes.update(module.clone(), stored.revision);
        store.commit(changes).await?;

        info!(module_id, cells = module.bound_count(), "Module sealed");
        counter!("packtrace.modules.sealed", 1);
        self.ctx
            .emit(Event::ModuleSealed {
                module_id: module_id.to_string(),
                cell_count: module.bound_count(),
            })
            .await;
        Ok(module)
    }

    /// Alternate terminal state, reachable from IN_PROGRESS or SEALED
    #[instrument(skip(self, actor), fields(actor = %actor.actor_id))]
    pub async fn quarantine_module(
        &self,
        actor: &ActorContext,
        module_id: &str,
        reason: &str,
    ) -> ServiceResult<Module> {
        self.ctx
            .authorizer
            .require(actor, Screen::Modules, Verb::Approve)?;

        let reason = reason.trim();
        if reason.is_empty() {
            return Err(ServiceError::InvalidInput(
                "quarantine reason is required".to_string(),
            ));
        }

        let _lock = self
            .ctx
            .locks
            .lock(EntityKey::new(EntityKind::Module, module_id))
            .await;

        let store = self.ctx.store.as_ref();
        let stored = require::<Module>(store, module_id).await?;
        let mut module = stored.value;

        if !matches!(module.status, ModuleStatus::InProgress | ModuleStatus::Sealed) {
            return Err(ServiceError::invalid_transition(
                format!("module {}", module_id),
                module.status,
                "quarantine",
            ));
        }

        module.status = ModuleStatus::Quarantined;
        module.quarantine_reason = Some(reason.to_string());
        module.updated_at = Utc::now();

        let mut changes = ChangeSet::new();
        changes.update(module.clone(), stored.revision);
        store.commit(changes).await?;

        warn!(module_id, reason, "Module quarantined");
        counter!("packtrace.modules.quarantined", 1);
        self.ctx
            .emit(Event::ModuleQuarantined {
                module_id: module_id.to_string(),
                reason: reason.to_string(),
            })
            .await;
        Ok(module)
    }

    pub async fn get_module(&self, actor: &ActorContext, module_id: &str) -> ServiceResult<Module> {
        self.ctx
            .authorizer
            .require(actor, Screen::Modules, Verb::View)?;
        Ok(require::<Module>(self.ctx.store.as_ref(), module_id).await?.value)
    }

    pub async fn list_modules(
        &self,
        actor: &ActorContext,
        status: Option<ModuleStatus>,
    ) -> ServiceResult<Vec<Module>> {
        self.ctx
            .authorizer
            .require(actor, Screen::Modules, Verb::View)?;
        let filter = status.map(ListFilter::by_status).unwrap_or_default();
        Ok(list_typed::<Module>(self.ctx.store.as_ref(), &filter)
            .await?
            .into_iter()
            .map(|v| v.value)
            .collect())
    }

    /// Bindings of a module, oldest first; released history only on request
    pub async fn list_module_bindings(
        &self,
        actor: &ActorContext,
        module_id: &str,
        include_released: bool,
    ) -> ServiceResult<Vec<CellBinding>> {
        self.ctx
            .authorizer
            .require(actor, Screen::Modules, Verb::View)?;
        require::<Module>(self.ctx.store.as_ref(), module_id).await?;

        let mut bindings: Vec<CellBinding> =
            list_typed::<CellBinding>(self.ctx.store.as_ref(), &ListFilter::by_parent(module_id))
                .await?
                .into_iter()
                .map(|v| v.value)
                .filter(|b| include_released || b.is_open())
                .collect();
        bindings.sort_by(|a, b| a.bound_at.cmp(&b.bound_at).then_with(|| a.id.cmp(&b.id)));
        Ok(bindings)
    }
}
