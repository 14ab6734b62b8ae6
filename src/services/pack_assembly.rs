use chrono::Utc;
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};

use super::{
    assign_id, blueprints::require_active, eol_disposition::start_run, validate_identifier,
    EngineContext,
};
use crate::{
    auth::{ActorContext, Screen, Verb},
    entities::manufacturing::{
        identity_claim::claim_key, pack::format_pack_serial, ClaimNamespace, IdentityClaim, Module,
        ModuleStatus, Pack, PackStatus, QcStatus,
    },
    errors::{ServiceError, ServiceResult},
    events::Event,
    repositories::{fetch, list_typed, require, ChangeSet, EntityKey, EntityKind, ListFilter},
};

/// Sequence draws before a pack serial assignment gives up
const PACK_SERIAL_ATTEMPTS: u32 = 8;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewPack {
    pub id: Option<String>,
    pub blueprint_id: String,
}

/// Links sealed modules and device identities into packs and gates the
/// hand-off to EOL testing.
#[derive(Clone)]
pub struct PackAssembly {
    ctx: Arc<EngineContext>,
}

fn locked_error(pack: &Pack) -> ServiceError {
    ServiceError::Immutable(format!("pack {} is {}", pack.id, pack.status))
}

impl PackAssembly {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    #[instrument(skip(self, actor), fields(actor = %actor.actor_id))]
    pub async fn create_pack(&self, actor: &ActorContext, input: NewPack) -> ServiceResult<Pack> {
        self.ctx
            .authorizer
            .require(actor, Screen::Packs, Verb::Create)?;

        let blueprint = require_active(&self.ctx, &input.blueprint_id).await?;
        let id = assign_id(input.id, "PACK")?;

        let _lock = self
            .ctx
            .locks
            .lock(EntityKey::new(EntityKind::Pack, id.clone()))
            .await;

        if fetch::<Pack>(self.ctx.store.as_ref(), &id).await?.is_some() {
            return Err(ServiceError::AlreadyAssigned(format!("pack id {} is taken", id)));
        }

        let now = Utc::now();
        let pack = Pack {
            id: id.clone(),
            blueprint_id: blueprint.id.clone(),
            required_module_count: blueprint.modules_per_pack,
            modules: Vec::new(),
            bms_id: None,
            pack_serial: None,
            qc_status: QcStatus::Pending,
            status: PackStatus::Draft,
            active_run_id: None,
            eol_attempts: 0,
            created_at: now,
            created_by: actor.actor_id.clone(),
            updated_at: now,
            ready_at: None,
            finalized_at: None,
            finalized_by: None,
        };

        let mut changes = ChangeSet::new();
        changes.insert(pack.clone());
        self.ctx.store.commit(changes).await?;

        info!(pack_id = %id, blueprint_id = %blueprint.id, required = pack.required_module_count, "Pack created");
        self.ctx
            .emit(Event::PackCreated {
                pack_id: id,
                blueprint_id: blueprint.id,
            })
            .await;
        Ok(pack)
    }

    /// Links a sealed module. The module is marked CONSUMED by this pack.
    #[instrument(skip(self, actor), fields(actor = %actor.actor_id))]
    pub async fn link_module(
        &self,
        actor: &ActorContext,
        pack_id: &str,
        module_id: &str,
    ) -> ServiceResult<Pack> {
        self.ctx
            .authorizer
            .require(actor, Screen::Packs, Verb::Execute)?;

        let _lock = self
            .ctx
            .locks
            .lock_many([
                EntityKey::new(EntityKind::Pack, pack_id),
                EntityKey::new(EntityKind::Module, module_id),
            ])
            .await;

        let store = self.ctx.store.as_ref();
        let stored_pack = require::<Pack>(store, pack_id).await?;
        let mut pack = stored_pack.value;

        if pack.is_locked() {
            return Err(locked_error(&pack));
        }
        if pack.modules.iter().any(|m| m == module_id) {
            return Err(ServiceError::AlreadyBound(format!(
                "module {} is already linked to pack {}",
                module_id, pack_id
            )));
        }

        let stored_module = require::<Module>(store, module_id).await?;
        let mut module = stored_module.value;

        match module.status {
            ModuleStatus::Sealed => {}
            ModuleStatus::Consumed => {
                warn!(pack_id, module_id, owner = ?module.pack_id, "Link rejected: module consumed");
                return Err(ServiceError::AlreadyBound(format!(
                    "module {} is linked to pack {}",
                    module_id,
                    module.pack_id.as_deref().unwrap_or("unknown")
                )));
            }
            status => {
                return Err(ServiceError::invalid_transition(
                    format!("module {}", module_id),
                    status,
                    "link",
                ));
            }
        }

        if pack.is_full() {
            return Err(ServiceError::cardinality(
                format!("pack {}", pack_id),
                pack.required_module_count,
                pack.module_count().saturating_add(1),
            ));
        }

        if module.blueprint_id != pack.blueprint_id {
            return Err(ServiceError::BlueprintMismatch(format!(
                "module {} is built to {}, pack {} to {}",
                module_id, module.blueprint_id, pack_id, pack.blueprint_id
            )));
        }

        let now = Utc::now();
        module.status = ModuleStatus::Consumed;
        module.pack_id = Some(pack_id.to_string());
        module.updated_at = now;
        pack.modules.push(module_id.to_string());
        pack.touch(now);

        let mut changes = ChangeSet::new();
        changes
            .update(pack.clone(), stored_pack.revision)
            .update(module, stored_module.revision);
        store.commit(changes).await?;

        info!(pack_id, module_id, linked = pack.module_count(), "Module linked");
        self.ctx
            .emit(Event::ModuleLinked {
                pack_id: pack_id.to_string(),
                module_id: module_id.to_string(),
            })
            .await;
        Ok(pack)
    }

    /// Reverses `link_module` while the pack is still open.
    #[instrument(skip(self, actor), fields(actor = %actor.actor_id))]
    pub async fn unlink_module(
        &self,
        actor: &ActorContext,
        pack_id: &str,
        module_id: &str,
    ) -> ServiceResult<Pack> {
        self.ctx
            .authorizer
            .require(actor, Screen::Packs, Verb::Edit)?;

        let _lock = self
            .ctx
            .locks
            .lock_many([
                EntityKey::new(EntityKind::Pack, pack_id),
                EntityKey::new(EntityKind::Module, module_id),
            ])
            .await;

        let store = self.ctx.store.as_ref();
        let stored_pack = require::<Pack>(store, pack_id).await?;
        let mut pack = stored_pack.value;

        if pack.is_locked() {
            return Err(locked_error(&pack));
        }
        let Some(position) = pack.modules.iter().position(|m| m == module_id) else {
            return Err(ServiceError::NotFound(format!(
                "module {} on pack {}",
                module_id, pack_id
            )));
        };

        let stored_module = require::<Module>(store, module_id).await?;
        let mut module = stored_module.value;

        let now = Utc::now();
        pack.modules.remove(position);
        pack.updated_at = now;
        module.status = ModuleStatus::Sealed;
        module.pack_id = None;
        module.updated_at = now;

        let mut changes = ChangeSet::new();
        changes
            .update(pack.clone(), stored_pack.revision)
            .update(module, stored_module.revision);
        store.commit(changes).await?;

        info!(pack_id, module_id, "Module unlinked");
        self.ctx
            .emit(Event::ModuleUnlinked {
                pack_id: pack_id.to_string(),
                module_id: module_id.to_string(),
            })
            .await;
        Ok(pack)
    }

    /// One-time BMS binding. A BMS id can belong to at most one pack.
    #[instrument(skip(self, actor), fields(actor = %actor.actor_id))]
    pub async fn bind_device(
        &self,
        actor: &ActorContext,
        pack_id: &str,
        bms_id: &str,
    ) -> ServiceResult<Pack> {
        self.ctx
            .authorizer
            .require(actor, Screen::Packs, Verb::Execute)?;
        let bms_id = bms_id.trim();
        validate_identifier(bms_id, "bms_id")?;

        let claim_id = claim_key(ClaimNamespace::BmsId, bms_id);
        let _lock = self
            .ctx
            .locks
            .lock_many([
                EntityKey::new(EntityKind::Pack, pack_id),
                EntityKey::new(EntityKind::Claim, claim_id.clone()),
            ])
            .await;

        let store = self.ctx.store.as_ref();
        let stored = require::<Pack>(store, pack_id).await?;
        let mut pack = stored.value;

        if pack.is_locked() {
            return Err(locked_error(&pack));
        }
        if let Some(existing) = &pack.bms_id {
            return Err(ServiceError::AlreadyBound(format!(
                "pack {} already carries BMS {}",
                pack_id, existing
            )));
        }
        if let Some(claim) = fetch::<IdentityClaim>(store, &claim_id).await? {
            warn!(pack_id, bms_id, owner = %claim.value.owner_id, "Device bind rejected: BMS in use");
            return Err(ServiceError::AlreadyBound(format!(
                "BMS {} is bound to pack {}",
                bms_id, claim.value.owner_id
            )));
        }

        let now = Utc::now();
        pack.bms_id = Some(bms_id.to_string());
        pack.updated_at = now;

        let mut changes = ChangeSet::new();
        changes
            .insert(IdentityClaim::new(
                ClaimNamespace::BmsId,
                bms_id,
                pack_id,
                &actor.actor_id,
                now,
            ))
            .update(pack.clone(), stored.revision);
        store.commit(changes).await?;

        info!(pack_id, bms_id, "BMS bound");
        self.ctx
            .emit(Event::DeviceBound {
                pack_id: pack_id.to_string(),
                bms_id: bms_id.to_string(),
            })
            .await;
        Ok(pack)
    }

    /// Generates `{prefix}-{YYYYMMDD}-{seq:06}` from a per-day sequence.
    #[instrument(skip(self, actor), fields(actor = %actor.actor_id))]
    pub async fn assign_pack_serial(&self, actor: &ActorContext, pack_id: &str) -> ServiceResult<Pack> {
        self.ctx
            .authorizer
            .require(actor, Screen::Packs, Verb::Execute)?;

        let _lock = self
            .ctx
            .locks
            .lock(EntityKey::new(EntityKind::Pack, pack_id))
            .await;

        let store = self.ctx.store.as_ref();
        let stored = require::<Pack>(store, pack_id).await?;
        let mut pack = stored.value;

        if pack.is_locked() {
            return Err(locked_error(&pack));
        }
        if let Some(existing) = &pack.pack_serial {
            return Err(ServiceError::AlreadyAssigned(format!(
                "pack {} already has serial {}",
                pack_id, existing
            )));
        }

        let now = Utc::now();
        let sequence_name = format!("pack_serial:{}", now.format("%Y%m%d"));
        let mut attempt = 0;
        let serial = loop {
            attempt += 1;
            let sequence = store.next_sequence(&sequence_name).await?;
            let candidate = format_pack_serial(&self.ctx.settings.pack_serial_prefix, now, sequence);
            match fetch::<IdentityClaim>(store, &claim_key(ClaimNamespace::PackSerial, &candidate)).await? {
                None => break candidate,
                Some(claim) if attempt >= PACK_SERIAL_ATTEMPTS => {
                    return Err(ServiceError::AlreadyAssigned(format!(
                        "pack serial {} is held by pack {} after {} attempts",
                        candidate, claim.value.owner_id, attempt
                    )));
                }
                Some(claim) => {
                    warn!(pack_id, pack_serial = %candidate, holder = %claim.value.owner_id, "Pack serial taken, drawing next");
                }
            }
        };

        pack.pack_serial = Some(serial.clone());
        pack.updated_at = now;

        let mut changes = ChangeSet::new();
        changes
            .insert(IdentityClaim::new(
                ClaimNamespace::PackSerial,
                &serial,
                pack_id,
                &actor.actor_id,
                now,
            ))
            .update(pack.clone(), stored.revision);
        store.commit(changes).await?;

        info!(pack_id, pack_serial = %serial, "Pack serial assigned");
        self.ctx
            .emit(Event::PackSerialAssigned {
                pack_id: pack_id.to_string(),
                pack_serial: serial,
            })
            .await;
        Ok(pack)
    }

    #[instrument(skip(self, actor), fields(actor = %actor.actor_id))]
    pub async fn set_qc_status(
        &self,
        actor: &ActorContext,
        pack_id: &str,
        status: QcStatus,
    ) -> ServiceResult<Pack> {
        self.ctx
            .authorizer
            .require(actor, Screen::Packs, Verb::Approve)?;

        let _lock = self
            .ctx
            .locks
            .lock(EntityKey::new(EntityKind::Pack, pack_id))
            .await;

        let store = self.ctx.store.as_ref();
        let stored = require::<Pack>(store, pack_id).await?;
        let mut pack = stored.value;

        if pack.is_locked() {
            return Err(locked_error(&pack));
        }

        let old_status = pack.qc_status;
        pack.qc_status = status;
        pack.updated_at = Utc::now();

        let mut changes = ChangeSet::new();
        changes.update(pack.clone(), stored.revision);
        store.commit(changes).await?;

        info!(pack_id, old = %old_status, new = %status, "QC status set");
        self.ctx
            .emit(Event::QcStatusChanged {
                pack_id: pack_id.to_string(),
                old_status,
                new_status: status,
            })
            .await;
        Ok(pack)
    }

    /// Locks the pack for EOL once all four preconditions hold and opens
    /// the first test run of this attempt.
    #[instrument(skip(self, actor), fields(actor = %actor.actor_id))]
    pub async fn mark_ready_for_eol(&self, actor: &ActorContext, pack_id: &str) -> ServiceResult<Pack> {
        self.ctx
            .authorizer
            .require(actor, Screen::Packs, Verb::Execute)?;

        let _lock = self
            .ctx
            .locks
            .lock(EntityKey::new(EntityKind::Pack, pack_id))
            .await;

        let store = self.ctx.store.as_ref();
        let stored = require::<Pack>(store, pack_id).await?;
        let mut pack = stored.value;

        if pack.is_locked() {
            return Err(ServiceError::invalid_transition(
                format!("pack {}", pack_id),
                pack.status,
                "mark ready for EOL",
            ));
        }

        let unmet = pack.unmet_preconditions();
        if !unmet.is_empty() {
            warn!(pack_id, unmet = unmet.len(), "Pack not ready for EOL");
            return Err(ServiceError::PreconditionsUnmet(unmet));
        }

        let now = Utc::now();
        pack.status = PackStatus::ReadyForEol;
        pack.ready_at = Some(now);
        pack.updated_at = now;
        let run = start_run(&self.ctx, &mut pack, &actor.actor_id, now);

        let mut changes = ChangeSet::new();
        changes
            .insert(run.clone())
            .update(pack.clone(), stored.revision);
        store.commit(changes).await?;

        info!(pack_id, run_id = %run.id, "Pack ready for EOL");
        counter!("packtrace.packs.ready", 1);
        self.ctx
            .emit_all(vec![
                Event::PackReadyForEol {
                    pack_id: pack_id.to_string(),
                },
                Event::TestRunOpened {
                    pack_id: pack_id.to_string(),
                    run_id: run.id,
                    attempt: run.attempt,
                },
            ])
            .await;
        Ok(pack)
    }

    /// PASSED → FINALIZED, re-checking every precondition.
    #[instrument(skip(self, actor), fields(actor = %actor.actor_id))]
    pub async fn dispatch_pack(&self, actor: &ActorContext, pack_id: &str) -> ServiceResult<Pack> {
        self.ctx
            .authorizer
            .require(actor, Screen::Packs, Verb::Approve)?;

        let _lock = self
            .ctx
            .locks
            .lock(EntityKey::new(EntityKind::Pack, pack_id))
            .await;

        let store = self.ctx.store.as_ref();
        let stored = require::<Pack>(store, pack_id).await?;
        let mut pack = stored.value;

        match pack.status {
            PackStatus::Passed => {}
            PackStatus::Finalized => return Err(locked_error(&pack)),
            status => {
                return Err(ServiceError::invalid_transition(
                    format!("pack {}", pack_id),
                    status,
                    "dispatch",
                ));
            }
        }

        let unmet = pack.unmet_preconditions();
        if !unmet.is_empty() {
            warn!(pack_id, unmet = unmet.len(), "Dispatch rejected");
            return Err(ServiceError::PreconditionsUnmet(unmet));
        }

        let now = Utc::now();
        pack.status = PackStatus::Finalized;
        pack.finalized_at = Some(now);
        pack.finalized_by = Some(actor.actor_id.clone());
        pack.updated_at = now;

        let mut changes = ChangeSet::new();
        changes.update(pack.clone(), stored.revision);
        store.commit(changes).await?;

        info!(pack_id, pack_serial = ?pack.pack_serial, "Pack dispatched");
        counter!("packtrace.packs.dispatched", 1);
        self.ctx
            .emit(Event::PackDispatched {
                pack_id: pack_id.to_string(),
                pack_serial: pack.pack_serial.clone(),
            })
            .await;
        Ok(pack)
    }

    pub async fn get_pack(&self, actor: &ActorContext, pack_id: &str) -> ServiceResult<Pack> {
        self.ctx
            .authorizer
            .require(actor, Screen::Packs, Verb::View)?;
        Ok(require::<Pack>(self.ctx.store.as_ref(), pack_id).await?.value)
    }

    pub async fn list_packs(
        &self,
        actor: &ActorContext,
        status: Option<PackStatus>,
    ) -> ServiceResult<Vec<Pack>> {
        self.ctx
            .authorizer
            .require(actor, Screen::Packs, Verb::View)?;
        let filter = status.map(ListFilter::by_status).unwrap_or_default();
        Ok(list_typed::<Pack>(self.ctx.store.as_ref(), &filter)
            .await?
            .into_iter()
            .map(|v| v.value)
            .collect())
    }
}
