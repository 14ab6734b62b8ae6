use chrono::Utc;
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, instrument};

use super::{assign_id, EngineContext};
use crate::{
    auth::{ActorContext, Screen, Verb},
    entities::manufacturing::{Blueprint, BlueprintPatch, BlueprintStatus, Chemistry},
    errors::{ServiceError, ServiceResult},
    events::Event,
    repositories::{fetch, list_typed, require, ChangeSet, EntityKey, EntityKind, ListFilter},
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewBlueprint {
    pub id: Option<String>,
    pub name: String,
    pub chemistry: Chemistry,
    pub series_count: u32,
    pub parallel_count: u32,
    pub modules_per_pack: u32,
    pub cells_per_module: u32,
    #[serde(default)]
    pub allowed_chemistries: BTreeSet<Chemistry>,
}

/// Design-authority operations on blueprints (SKUs)
#[derive(Clone)]
pub struct BlueprintService {
    ctx: Arc<EngineContext>,
}

impl BlueprintService {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    #[instrument(skip(self, actor), fields(actor = %actor.actor_id))]
    pub async fn create(&self, actor: &ActorContext, input: NewBlueprint) -> ServiceResult<Blueprint> {
        self.ctx
            .authorizer
            .require(actor, Screen::Blueprints, Verb::Create)?;

        if input.name.trim().is_empty() {
            return Err(ServiceError::InvalidInput(
                "blueprint name cannot be empty".to_string(),
            ));
        }

        let id = assign_id(input.id, "BP")?;
        let _lock = self
            .ctx
            .locks
            .lock(EntityKey::new(EntityKind::Blueprint, id.clone()))
            .await;

        if fetch::<Blueprint>(self.ctx.store.as_ref(), &id).await?.is_some() {
            return Err(ServiceError::AlreadyAssigned(format!(
                "blueprint id {} is taken",
                id
            )));
        }

        let now = Utc::now();
        let blueprint = Blueprint {
            id: id.clone(),
            name: input.name.trim().to_string(),
            chemistry: input.chemistry,
            series_count: input.series_count,
            parallel_count: input.parallel_count,
            modules_per_pack: input.modules_per_pack,
            cells_per_module: input.cells_per_module,
            allowed_chemistries: input.allowed_chemistries,
            status: BlueprintStatus::Draft,
            created_at: now,
            created_by: actor.actor_id.clone(),
            updated_at: now,
            activated_at: None,
            activated_by: None,
        };
        blueprint.check_structure()?;

        let mut changes = ChangeSet::new();
        changes.insert(blueprint.clone());
        self.ctx.store.commit(changes).await?;

        info!(blueprint_id = %id, chemistry = %blueprint.chemistry, "Blueprint created");
        self.ctx
            .emit(Event::BlueprintCreated { blueprint_id: id })
            .await;
        Ok(blueprint)
    }

    #[instrument(skip(self, actor, patch), fields(actor = %actor.actor_id))]
    pub async fn update(
        &self,
        actor: &ActorContext,
        blueprint_id: &str,
        patch: BlueprintPatch,
    ) -> ServiceResult<Blueprint> {
        self.ctx
            .authorizer
            .require(actor, Screen::Blueprints, Verb::Edit)?;

        let _lock = self
            .ctx
            .locks
            .lock(EntityKey::new(EntityKind::Blueprint, blueprint_id))
            .await;

        let stored = require::<Blueprint>(self.ctx.store.as_ref(), blueprint_id).await?;
        let mut blueprint = stored.value;
        blueprint.apply(patch)?;
        blueprint.updated_at = Utc::now();

        let mut changes = ChangeSet::new();
        changes.update(blueprint.clone(), stored.revision);
        self.ctx.store.commit(changes).await?;

        info!(blueprint_id, "Blueprint updated");
        self.ctx
            .emit(Event::BlueprintUpdated {
                blueprint_id: blueprint_id.to_string(),
            })
            .await;
        Ok(blueprint)
    }

    /// DRAFT → ACTIVE, one-way
    #[instrument(skip(self, actor), fields(actor = %actor.actor_id))]
    pub async fn activate(&self, actor: &ActorContext, blueprint_id: &str) -> ServiceResult<Blueprint> {
        self.ctx
            .authorizer
            .require(actor, Screen::Blueprints, Verb::Approve)?;

        let _lock = self
            .ctx
            .locks
            .lock(EntityKey::new(EntityKind::Blueprint, blueprint_id))
            .await;

        let stored = require::<Blueprint>(self.ctx.store.as_ref(), blueprint_id).await?;
        let mut blueprint = stored.value;
        if blueprint.is_active() {
            return Err(ServiceError::invalid_transition(
                format!("blueprint {}", blueprint_id),
                blueprint.status,
                "activate",
            ));
        }
        blueprint.check_structure()?;

        let now = Utc::now();
        blueprint.status = BlueprintStatus::Active;
        blueprint.activated_at = Some(now);
        blueprint.activated_by = Some(actor.actor_id.clone());
        blueprint.updated_at = now;

        let mut changes = ChangeSet::new();
        changes.update(blueprint.clone(), stored.revision);
        self.ctx.store.commit(changes).await?;

        info!(blueprint_id, "Blueprint activated");
        counter!("packtrace.blueprints.activated", 1);
        self.ctx
            .emit(Event::BlueprintActivated {
                blueprint_id: blueprint_id.to_string(),
                actor_id: actor.actor_id.clone(),
            })
            .await;
        Ok(blueprint)
    }

    pub async fn get(&self, actor: &ActorContext, blueprint_id: &str) -> ServiceResult<Blueprint> {
        self.ctx
            .authorizer
            .require(actor, Screen::Blueprints, Verb::View)?;
        Ok(require::<Blueprint>(self.ctx.store.as_ref(), blueprint_id)
            .await?
            .value)
    }

    pub async fn list(
        &self,
        actor: &ActorContext,
        status: Option<BlueprintStatus>,
    ) -> ServiceResult<Vec<Blueprint>> {
        self.ctx
            .authorizer
            .require(actor, Screen::Blueprints, Verb::View)?;
        let filter = status.map(ListFilter::by_status).unwrap_or_default();
        Ok(list_typed::<Blueprint>(self.ctx.store.as_ref(), &filter)
            .await?
            .into_iter()
            .map(|v| v.value)
            .collect())
    }
}

/// Loads a blueprint that downstream assemblies may reference.
pub(crate) async fn require_active(ctx: &EngineContext, blueprint_id: &str) -> ServiceResult<Blueprint> {
    let blueprint = require::<Blueprint>(ctx.store.as_ref(), blueprint_id).await?.value;
    if !blueprint.is_active() {
        return Err(ServiceError::invalid_transition(
            format!("blueprint {}", blueprint_id),
            blueprint.status,
            "reference",
        ));
    }
    Ok(blueprint)
}
