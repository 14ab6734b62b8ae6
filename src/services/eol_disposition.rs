use chrono::{DateTime, Utc};
use metrics::counter;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use super::{assign_id, check_override, EngineContext};
use crate::{
    auth::{ActorContext, OverrideGrant, Screen, Verb},
    entities::manufacturing::{
        AggregateResult, Decision, DecisionRecord, EolTestRun, ItemUpdate, Pack, PackStatus,
        QuarantineRecord, ReleaseDisposition, TestItem,
    },
    errors::{ServiceError, ServiceResult},
    events::Event,
    repositories::{
        fetch, list_typed, require, ChangeSet, EntityKey, EntityKind, ListFilter, Versioned,
    },
};

pub const GUARD_EOL_AGGREGATE: &str = "eol_aggregate";

/// Result of signing a run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecisionOutcome {
    pub run: EolTestRun,
    pub pack: Pack,
    pub quarantine: Option<QuarantineRecord>,
}

/// Result of a quarantine release
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReleaseOutcome {
    pub pack: Pack,
    pub record: QuarantineRecord,
}

/// Starts attempt n+1 for `pack` from the configured matrix template.
pub(crate) fn start_run(
    ctx: &EngineContext,
    pack: &mut Pack,
    actor_id: &str,
    now: DateTime<Utc>,
) -> EolTestRun {
    let attempt = pack.eol_attempts.saturating_add(1);
    let items: Vec<TestItem> = ctx.eol_template.clone();
    let run = EolTestRun {
        id: EolTestRun::run_id(&pack.id, attempt),
        pack_id: pack.id.clone(),
        attempt,
        aggregate: EolTestRun::aggregate_of(&items),
        items,
        decision: None,
        created_at: now,
        created_by: actor_id.to_string(),
        updated_at: now,
    };
    pack.eol_attempts = attempt;
    pack.active_run_id = Some(run.id.clone());
    pack.updated_at = now;
    run
}

/// End-of-line test runs, sign-off and quarantine handling.
///
/// Test runs and quarantine records are only mutated while their pack's
/// lock is held, so the pack key is always part of the lock set.
#[derive(Clone)]
pub struct EolDisposition {
    ctx: Arc<EngineContext>,
}

impl EolDisposition {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    /// Returns the pack's active run, creating it on first access.
    #[instrument(skip(self, actor), fields(actor = %actor.actor_id))]
    pub async fn open_test_run(&self, actor: &ActorContext, pack_id: &str) -> ServiceResult<EolTestRun> {
        self.ctx
            .authorizer
            .require(actor, Screen::Eol, Verb::View)?;

        let _lock = self
            .ctx
            .locks
            .lock(EntityKey::new(EntityKind::Pack, pack_id))
            .await;

        let store = self.ctx.store.as_ref();
        let stored = require::<Pack>(store, pack_id).await?;
        let mut pack = stored.value;

        if let Some(run_id) = &pack.active_run_id {
            if let Some(run) = fetch::<EolTestRun>(store, run_id).await? {
                return Ok(run.value);
            }
            warn!(pack_id, run_id = %run_id, "Active EOL run missing; opening a new attempt");
        }

        if pack.status != PackStatus::ReadyForEol {
            return Err(ServiceError::invalid_transition(
                format!("pack {}", pack_id),
                pack.status,
                "open an EOL run for",
            ));
        }
        self.ctx
            .authorizer
            .require(actor, Screen::Eol, Verb::Create)?;

        let run = start_run(&self.ctx, &mut pack, &actor.actor_id, Utc::now());

        let mut changes = ChangeSet::new();
        changes
            .insert(run.clone())
            .update(pack, stored.revision);
        store.commit(changes).await?;

        info!(pack_id, run_id = %run.id, attempt = run.attempt, "EOL run opened");
        self.ctx
            .emit(Event::TestRunOpened {
                pack_id: pack_id.to_string(),
                run_id: run.id.clone(),
                attempt: run.attempt,
            })
            .await;
        Ok(run)
    }

    pub async fn get_test_run(&self, actor: &ActorContext, run_id: &str) -> ServiceResult<EolTestRun> {
        self.ctx
            .authorizer
            .require(actor, Screen::Eol, Verb::View)?;
        Ok(require::<EolTestRun>(self.ctx.store.as_ref(), run_id).await?.value)
    }

    /// Every attempt recorded for a pack, oldest first
    pub async fn list_test_runs(&self, actor: &ActorContext, pack_id: &str) -> ServiceResult<Vec<EolTestRun>> {
        self.ctx
            .authorizer
            .require(actor, Screen::Eol, Verb::View)?;
        let mut runs: Vec<EolTestRun> =
            list_typed::<EolTestRun>(self.ctx.store.as_ref(), &ListFilter::by_parent(pack_id))
                .await?
                .into_iter()
                .map(|v| v.value)
                .collect();
        runs.sort_by_key(|r| r.attempt);
        Ok(runs)
    }

    /// Records a measurement or manual status and recomputes the aggregate.
    #[instrument(skip(self, actor), fields(actor = %actor.actor_id))]
    pub async fn update_test_item(
        &self,
        actor: &ActorContext,
        run_id: &str,
        item_id: &str,
        update: ItemUpdate,
    ) -> ServiceResult<EolTestRun> {
        self.ctx
            .authorizer
            .require(actor, Screen::Eol, Verb::Execute)?;

        let store = self.ctx.store.as_ref();
        let pack_id = require::<EolTestRun>(store, run_id).await?.value.pack_id;
        let _lock = self
            .ctx
            .locks
            .lock_many([
                EntityKey::new(EntityKind::Pack, pack_id.clone()),
                EntityKey::new(EntityKind::TestRun, run_id),
            ])
            .await;

        let stored_run = require::<EolTestRun>(store, run_id).await?;
        let mut run = stored_run.value;
        if run.is_decided() {
            return Err(ServiceError::Immutable(format!(
                "EOL run {} already has a final decision",
                run_id
            )));
        }
        let pack = require::<Pack>(store, &pack_id).await?.value;
        Self::ensure_active(&pack, run_id, "update")?;

        let status = run.apply_update(item_id, update, &actor.actor_id, Utc::now())?;

        let mut changes = ChangeSet::new();
        changes.update(run.clone(), stored_run.revision);
        store.commit(changes).await?;

        info!(run_id, item_id, status = %status, aggregate = %run.aggregate, "EOL item updated");
        self.ctx
            .emit(Event::TestItemUpdated {
                run_id: run_id.to_string(),
                item_id: item_id.to_string(),
                status,
                aggregate: run.aggregate,
            })
            .await;
        Ok(run)
    }

    /// Signs the run exactly once and drives the pack to the matching
    /// terminal status. FAIL and QUARANTINE both open a quarantine record.
    #[instrument(skip(self, actor, notes, grant), fields(actor = %actor.actor_id, overridden = grant.is_some()))]
    pub async fn finalize_decision(
        &self,
        actor: &ActorContext,
        run_id: &str,
        decision: Decision,
        notes: Option<String>,
        grant: Option<&OverrideGrant>,
    ) -> ServiceResult<DecisionOutcome> {
        self.ctx
            .authorizer
            .require(actor, Screen::Eol, Verb::Approve)?;
        let grant = check_override(actor, grant, Screen::Eol)?;

        let store = self.ctx.store.as_ref();
        let pack_id = require::<EolTestRun>(store, run_id).await?.value.pack_id;
        let _lock = self
            .ctx
            .locks
            .lock_many([
                EntityKey::new(EntityKind::Pack, pack_id.clone()),
                EntityKey::new(EntityKind::TestRun, run_id),
            ])
            .await;

        let stored_run = require::<EolTestRun>(store, run_id).await?;
        let mut run = stored_run.value;
        if run.is_decided() {
            warn!(run_id, "Decision rejected: run already signed");
            return Err(ServiceError::Immutable(format!(
                "EOL run {} already has a final decision",
                run_id
            )));
        }
        let stored_pack = require::<Pack>(store, &pack_id).await?;
        let mut pack = stored_pack.value;
        Self::ensure_active(&pack, run_id, "sign")?;

        let mut overrides: Vec<&'static str> = Vec::new();
        if decision == Decision::Pass && run.aggregate != AggregateResult::Pass {
            if grant.is_none() {
                warn!(run_id, aggregate = %run.aggregate, "PASS rejected: aggregate not PASS");
                return Err(ServiceError::invalid_transition(
                    format!("EOL run {}", run_id),
                    run.aggregate,
                    "sign PASS on",
                ));
            }
            overrides.push(GUARD_EOL_AGGREGATE);
        }

        let now = Utc::now();
        let notes = notes.map(|n| n.trim().to_string()).filter(|n| !n.is_empty());
        run.decision = Some(DecisionRecord {
            decision,
            signed_by: actor.actor_id.clone(),
            signed_at: now,
            notes: notes.clone(),
            override_reason: grant
                .filter(|_| !overrides.is_empty())
                .map(|g| g.reason().to_string()),
        });
        run.updated_at = now;

        let quarantine = match decision {
            Decision::Pass => {
                pack.status = PackStatus::Passed;
                None
            }
            Decision::Scrap => {
                pack.status = PackStatus::Scrapped;
                None
            }
            Decision::Fail | Decision::Quarantine => {
                pack.status = PackStatus::Quarantined;
                Some(QuarantineRecord {
                    id: assign_id(None, "QR")?,
                    pack_id: pack_id.clone(),
                    run_id: Some(run_id.to_string()),
                    reason: notes
                        .clone()
                        .unwrap_or_else(|| format!("EOL decision {}", decision)),
                    ncr_ref: None,
                    opened_at: now,
                    opened_by: actor.actor_id.clone(),
                    released_at: None,
                    released_by: None,
                    disposition: None,
                    release_notes: None,
                })
            }
        };
        pack.updated_at = now;

        let mut changes = ChangeSet::new();
        changes
            .update(run.clone(), stored_run.revision)
            .update(pack.clone(), stored_pack.revision);
        if let Some(record) = &quarantine {
            changes.insert(record.clone());
        }
        store.commit(changes).await?;

        self.ctx
            .record_overrides(grant, &overrides, &format!("EOL run {}", run_id))
            .await;
        info!(run_id, pack_id = %pack_id, decision = %decision, pack_status = %pack.status, "EOL decision recorded");
        counter!("packtrace.eol.decisions", 1, "decision" => decision.to_string());

        let mut events = vec![Event::EolDecisionRecorded {
            pack_id: pack_id.clone(),
            run_id: run_id.to_string(),
            decision,
            signed_by: actor.actor_id.clone(),
        }];
        if let Some(record) = &quarantine {
            events.push(Event::PackQuarantined {
                pack_id: pack_id.clone(),
                record_id: record.id.clone(),
                reason: record.reason.clone(),
            });
        }
        self.ctx.emit_all(events).await;

        Ok(DecisionOutcome {
            run,
            pack,
            quarantine,
        })
    }

    /// Manual quarantine outside the EOL decision path.
    #[instrument(skip(self, actor), fields(actor = %actor.actor_id))]
    pub async fn hold_pack(
        &self,
        actor: &ActorContext,
        pack_id: &str,
        reason: &str,
        ncr_ref: Option<String>,
    ) -> ServiceResult<QuarantineRecord> {
        self.ctx
            .authorizer
            .require(actor, Screen::Quarantine, Verb::Create)?;

        let reason = reason.trim();
        if reason.is_empty() {
            return Err(ServiceError::InvalidInput(
                "quarantine reason is required".to_string(),
            ));
        }

        let _lock = self
            .ctx
            .locks
            .lock(EntityKey::new(EntityKind::Pack, pack_id))
            .await;

        let store = self.ctx.store.as_ref();
        let stored = require::<Pack>(store, pack_id).await?;
        let mut pack = stored.value;

        if !matches!(pack.status, PackStatus::ReadyForEol | PackStatus::Passed) {
            return Err(ServiceError::invalid_transition(
                format!("pack {}", pack_id),
                pack.status,
                "hold",
            ));
        }
        if let Some(open) = self.open_record(pack_id).await? {
            return Err(ServiceError::AlreadyAssigned(format!(
                "pack {} already has open quarantine record {}",
                pack_id, open.value.id
            )));
        }

        let now = Utc::now();
        let record = QuarantineRecord {
            id: assign_id(None, "QR")?,
            pack_id: pack_id.to_string(),
            run_id: None,
            reason: reason.to_string(),
            ncr_ref: ncr_ref.map(|r| r.trim().to_string()).filter(|r| !r.is_empty()),
            opened_at: now,
            opened_by: actor.actor_id.clone(),
            released_at: None,
            released_by: None,
            disposition: None,
            release_notes: None,
        };
        pack.status = PackStatus::Quarantined;
        pack.updated_at = now;

        let mut changes = ChangeSet::new();
        changes
            .insert(record.clone())
            .update(pack, stored.revision);
        store.commit(changes).await?;

        warn!(pack_id, record_id = %record.id, reason, "Pack held in quarantine");
        self.ctx
            .emit(Event::PackQuarantined {
                pack_id: pack_id.to_string(),
                record_id: record.id.clone(),
                reason: reason.to_string(),
            })
            .await;
        Ok(record)
    }

    /// Closes the open record. Retest returns the pack to READY_FOR_EOL
    /// with no active run so the next open starts a fresh attempt.
    #[instrument(skip(self, actor, notes), fields(actor = %actor.actor_id))]
    pub async fn release_from_quarantine(
        &self,
        actor: &ActorContext,
        pack_id: &str,
        disposition: ReleaseDisposition,
        notes: Option<String>,
    ) -> ServiceResult<ReleaseOutcome> {
        self.ctx
            .authorizer
            .require(actor, Screen::Quarantine, Verb::Approve)?;

        let _lock = self
            .ctx
            .locks
            .lock(EntityKey::new(EntityKind::Pack, pack_id))
            .await;

        let store = self.ctx.store.as_ref();
        let stored_pack = require::<Pack>(store, pack_id).await?;
        let mut pack = stored_pack.value;

        if pack.status != PackStatus::Quarantined {
            return Err(ServiceError::invalid_transition(
                format!("pack {}", pack_id),
                pack.status,
                "release",
            ));
        }
        let stored_record = self.open_record(pack_id).await?.ok_or_else(|| {
            ServiceError::NotFound(format!("open quarantine record for pack {}", pack_id))
        })?;
        let mut record = stored_record.value;

        let now = Utc::now();
        let notes = notes.map(|n| n.trim().to_string()).filter(|n| !n.is_empty());
        record.close(disposition, &actor.actor_id, notes, now);
        match disposition {
            ReleaseDisposition::Retest => {
                pack.status = PackStatus::ReadyForEol;
                pack.active_run_id = None;
            }
            ReleaseDisposition::Scrap => pack.status = PackStatus::Scrapped,
        }
        pack.updated_at = now;

        let mut changes = ChangeSet::new();
        changes
            .update(record.clone(), stored_record.revision)
            .update(pack.clone(), stored_pack.revision);
        store.commit(changes).await?;

        info!(pack_id, record_id = %record.id, disposition = %disposition, "Pack released from quarantine");
        counter!("packtrace.quarantine.released", 1, "disposition" => disposition.to_string());
        self.ctx
            .emit(Event::PackReleased {
                pack_id: pack_id.to_string(),
                record_id: record.id.clone(),
                disposition,
            })
            .await;
        Ok(ReleaseOutcome { pack, record })
    }

    /// Quarantine records, newest first, optionally scoped to one pack
    pub async fn list_quarantine_records(
        &self,
        actor: &ActorContext,
        pack_id: Option<&str>,
        open_only: bool,
    ) -> ServiceResult<Vec<QuarantineRecord>> {
        self.ctx
            .authorizer
            .require(actor, Screen::Quarantine, Verb::View)?;

        let filter = ListFilter {
            status: open_only.then(|| "OPEN".to_string()),
            parent: pack_id.map(str::to_string),
        };
        let mut records: Vec<QuarantineRecord> =
            list_typed::<QuarantineRecord>(self.ctx.store.as_ref(), &filter)
                .await?
                .into_iter()
                .map(|v| v.value)
                .collect();
        records.sort_by(|a, b| b.opened_at.cmp(&a.opened_at));
        Ok(records)
    }

    async fn open_record(&self, pack_id: &str) -> ServiceResult<Option<Versioned<QuarantineRecord>>> {
        let filter = ListFilter {
            status: Some("OPEN".to_string()),
            parent: Some(pack_id.to_string()),
        };
        Ok(list_typed::<QuarantineRecord>(self.ctx.store.as_ref(), &filter)
            .await?
            .into_iter()
            .next())
    }

    fn ensure_active(pack: &Pack, run_id: &str, operation: &str) -> ServiceResult<()> {
        if pack.status != PackStatus::ReadyForEol {
            return Err(ServiceError::invalid_transition(
                format!("EOL run {} (pack {})", run_id, pack.id),
                pack.status,
                operation,
            ));
        }
        if pack.active_run_id.as_deref() != Some(run_id) {
            return Err(ServiceError::invalid_transition(
                format!("EOL run {}", run_id),
                "ARCHIVED",
                operation,
            ));
        }
        Ok(())
    }
}
