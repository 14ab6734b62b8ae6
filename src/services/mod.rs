//! Traceability & workflow authorization engine.
//!
//! Each component service shares one [`EngineContext`]: the persistence
//! provider, the injected authorizer, per-entity locks and the event sender.

pub mod blueprints;
pub mod eol_disposition;
pub mod identity_ledger;
pub mod lineage;
pub mod locks;
pub mod module_assembly;
pub mod pack_assembly;

use std::{collections::HashSet, sync::Arc};
use uuid::Uuid;

use crate::{
    auth::{ActorContext, Authorizer, OverrideGrant, Screen},
    config::{EngineConfig, EolConfig},
    entities::manufacturing::TestItem,
    errors::{ServiceError, ServiceResult},
    events::{Event, EventSender},
    repositories::TraceabilityStore,
};

pub use blueprints::BlueprintService;
pub use eol_disposition::EolDisposition;
pub use identity_ledger::IdentityLedger;
pub use lineage::LineageResolver;
pub use locks::EntityLocks;
pub use module_assembly::ModuleAssembly;
pub use pack_assembly::PackAssembly;

const MAX_ID_LEN: usize = 64;

pub struct EngineContext {
    pub store: Arc<dyn TraceabilityStore>,
    pub authorizer: Arc<Authorizer>,
    pub locks: EntityLocks,
    pub settings: EngineConfig,
    /// Parsed EOL matrix template; validated once at build time
    pub eol_template: Vec<TestItem>,
    event_sender: Option<EventSender>,
}

impl EngineContext {
    pub async fn emit(&self, event: Event) {
        if let Some(sender) = &self.event_sender {
            sender.send_or_log(event).await;
        }
    }

    pub async fn emit_all(&self, events: Vec<Event>) {
        for event in events {
            self.emit(event).await;
        }
    }

    /// Audits each guard bypassed by `grant` once the operation has committed.
    pub async fn record_overrides(
        &self,
        grant: Option<&OverrideGrant>,
        guards: &[&'static str],
        subject: &str,
    ) {
        let Some(grant) = grant else { return };
        for guard in guards {
            grant.record_use(guard, subject);
            self.emit(Event::OverrideUsed {
                actor_id: grant.actor_id().to_string(),
                cluster: grant.cluster().clone(),
                screen: grant.screen(),
                guard: guard.to_string(),
                subject: subject.to_string(),
                reason: grant.reason().to_string(),
            })
            .await;
        }
    }
}

/// Validates an override presented for `screen` and ties it to the actor.
pub(crate) fn check_override<'a>(
    actor: &ActorContext,
    grant: Option<&'a OverrideGrant>,
    screen: Screen,
) -> ServiceResult<Option<&'a OverrideGrant>> {
    match grant {
        Some(g) => {
            g.check_screen(screen)?;
            if g.actor_id() != actor.actor_id {
                return Err(ServiceError::PermissionDenied {
                    cluster: actor.cluster.to_string(),
                    screen: screen.to_string(),
                    verb: "override (granted to another actor)".to_string(),
                });
            }
            Ok(Some(g))
        }
        None => Ok(None),
    }
}

/// Caller-supplied id, or a generated `{PREFIX}-{hex}` id.
pub(crate) fn assign_id(requested: Option<String>, prefix: &str) -> ServiceResult<String> {
    match requested.map(|s| s.trim().to_string()) {
        Some(id) => {
            validate_identifier(&id, "id")?;
            Ok(id)
        }
        None => {
            let hex = Uuid::new_v4().simple().to_string();
            Ok(format!("{}-{}", prefix, hex[..12].to_ascii_uppercase()))
        }
    }
}

pub(crate) fn validate_identifier(value: &str, field: &str) -> ServiceResult<()> {
    let ok = !value.is_empty()
        && value.len() <= MAX_ID_LEN
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');
    if ok {
        Ok(())
    } else {
        Err(ServiceError::InvalidInput(format!(
            "{} '{}' must be 1-{} characters of [A-Za-z0-9._-]",
            field, value, MAX_ID_LEN
        )))
    }
}

/// Entry point wiring the component services to one shared context
#[derive(Clone)]
pub struct TraceabilityEngine {
    ctx: Arc<EngineContext>,
}

pub struct EngineBuilder {
    store: Arc<dyn TraceabilityStore>,
    authorizer: Arc<Authorizer>,
    settings: EngineConfig,
    eol: EolConfig,
    event_sender: Option<EventSender>,
}

impl EngineBuilder {
    pub fn settings(mut self, settings: EngineConfig) -> Self {
        self.settings = settings;
        self
    }

    pub fn eol(mut self, eol: EolConfig) -> Self {
        self.eol = eol;
        self
    }

    pub fn events(mut self, sender: EventSender) -> Self {
        self.event_sender = Some(sender);
        self
    }

    pub fn build(self) -> ServiceResult<TraceabilityEngine> {
        let eol_template = self
            .eol
            .items
            .iter()
            .map(TestItem::from_template)
            .collect::<ServiceResult<Vec<_>>>()?;

        if eol_template.is_empty() {
            return Err(ServiceError::InvalidInput(
                "EOL test matrix has no items".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        if let Some(dup) = eol_template.iter().find(|item| !seen.insert(item.id.as_str())) {
            return Err(ServiceError::InvalidInput(format!(
                "duplicate EOL item id '{}'",
                dup.id
            )));
        }

        Ok(TraceabilityEngine {
            ctx: Arc::new(EngineContext {
                store: self.store,
                authorizer: self.authorizer,
                locks: EntityLocks::new(),
                settings: self.settings,
                eol_template,
                event_sender: self.event_sender,
            }),
        })
    }
}

impl TraceabilityEngine {
    pub fn builder(store: Arc<dyn TraceabilityStore>, authorizer: Arc<Authorizer>) -> EngineBuilder {
        EngineBuilder {
            store,
            authorizer,
            settings: EngineConfig::default(),
            eol: EolConfig::default(),
            event_sender: None,
        }
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    pub fn authorizer(&self) -> &Authorizer {
        &self.ctx.authorizer
    }

    pub fn blueprints(&self) -> BlueprintService {
        BlueprintService::new(self.ctx.clone())
    }

    pub fn ledger(&self) -> IdentityLedger {
        IdentityLedger::new(self.ctx.clone())
    }

    pub fn modules(&self) -> ModuleAssembly {
        ModuleAssembly::new(self.ctx.clone())
    }

    pub fn packs(&self) -> PackAssembly {
        PackAssembly::new(self.ctx.clone())
    }

    pub fn eol(&self) -> EolDisposition {
        EolDisposition::new(self.ctx.clone())
    }

    pub fn lineage(&self) -> LineageResolver {
        LineageResolver::new(self.ctx.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{auth::PermissionTable, repositories::in_memory::InMemoryStore};
    use assert_matches::assert_matches;

    #[test]
    fn generated_ids_carry_prefix() {
        let id = assign_id(None, "MOD").unwrap();
        assert!(id.starts_with("MOD-"));
        assert_eq!(id.len(), 16);
    }

    #[test]
    fn requested_ids_are_validated() {
        assert_eq!(assign_id(Some(" M1 ".into()), "MOD").unwrap(), "M1");
        assert!(assign_id(Some("bad id".into()), "MOD").is_err());
        assert!(assign_id(Some(String::new()), "MOD").is_err());
    }

    fn builder() -> EngineBuilder {
        TraceabilityEngine::builder(
            Arc::new(InMemoryStore::new()),
            Arc::new(Authorizer::new(Arc::new(PermissionTable::new()))),
        )
    }

    #[test]
    fn build_rejects_duplicate_eol_items() {
        let mut eol = EolConfig::default();
        let first = eol.items[0].clone();
        eol.items.push(first);
        let err = builder().eol(eol).build().err().expect("duplicate ids rejected");
        assert_matches!(err, ServiceError::InvalidInput(msg) if msg.contains("duplicate"));
        assert!(builder().build().is_ok());
    }
}
