mod common;

use assert_matches::assert_matches;
use common::Plant;
use packtrace_api::{
    auth::Screen,
    entities::manufacturing::{
        AggregateResult, Decision, ItemStatus, ItemUpdate, PackStatus, ReleaseDisposition,
    },
    errors::ServiceError,
    events::Event,
};

#[tokio::test]
async fn open_test_run_is_idempotent() {
    let plant = Plant::new();
    plant.ready_pack(2).await;
    let qe = plant.quality();
    let eol = plant.engine.eol();

    let first = eol.open_test_run(&qe, "P1").await.unwrap();
    let again = eol.open_test_run(&qe, "P1").await.unwrap();
    assert_eq!(first.id, "EOL-P1-1");
    assert_eq!(first, again);
    assert_eq!(first.items.len(), 6);
    assert_eq!(first.aggregate, AggregateResult::Pending);
    assert!(first.items.iter().all(|i| i.status == ItemStatus::NotRun));
    assert_eq!(eol.list_test_runs(&qe, "P1").await.unwrap().len(), 1);
}

#[tokio::test]
async fn open_test_run_requires_ready_pack() {
    let plant = Plant::new();
    plant.complete_pack(2).await;
    assert_matches!(
        plant.engine.eol().open_test_run(&plant.quality(), "P1").await,
        Err(ServiceError::InvalidStateTransition { .. })
    );
}

#[tokio::test]
async fn measurements_drive_aggregate() {
    let plant = Plant::new();
    plant.ready_pack(2).await;
    let qe = plant.quality();
    let eol = plant.engine.eol();
    let run_id = "EOL-P1-1";

    let run = eol
        .update_test_item(&qe, run_id, "hipot_leakage", ItemUpdate::Measurement(7.5))
        .await
        .unwrap();
    assert_eq!(run.aggregate, AggregateResult::Fail);

    // A required failure can be corrected before sign-off
    let run = eol
        .update_test_item(&qe, run_id, "hipot_leakage", ItemUpdate::Measurement(1.2))
        .await
        .unwrap();
    assert_eq!(run.aggregate, AggregateResult::Pending);

    plant.pass_all_required(run_id).await;
    let run = eol.get_test_run(&qe, run_id).await.unwrap();
    assert_eq!(run.aggregate, AggregateResult::Pass);

    // Optional item failing does not move the aggregate
    let run = eol
        .update_test_item(&qe, run_id, "thermal_sensor", ItemUpdate::Status(ItemStatus::Fail))
        .await
        .unwrap();
    assert_eq!(run.aggregate, AggregateResult::Pass);
}

#[tokio::test]
async fn item_update_rejects_mismatched_input() {
    let plant = Plant::new();
    plant.ready_pack(2).await;
    let qe = plant.quality();
    let eol = plant.engine.eol();

    assert_matches!(
        eol.update_test_item(&qe, "EOL-P1-1", "visual", ItemUpdate::Measurement(1.0))
            .await,
        Err(ServiceError::InvalidInput(_))
    );
    assert_matches!(
        eol.update_test_item(&qe, "EOL-P1-1", "hipot_leakage", ItemUpdate::Measurement(f64::NAN))
            .await,
        Err(ServiceError::InvalidInput(_))
    );
    assert_matches!(
        eol.update_test_item(&qe, "EOL-P1-1", "no_such_item", ItemUpdate::Status(ItemStatus::Pass))
            .await,
        Err(ServiceError::NotFound(_))
    );
}

#[tokio::test]
async fn pass_decision_requires_passing_aggregate() {
    let mut plant = Plant::new();
    plant.ready_pack(2).await;
    let qe = plant.quality();
    let eol = plant.engine.eol();

    assert_matches!(
        eol.finalize_decision(&qe, "EOL-P1-1", Decision::Pass, None, None).await,
        Err(ServiceError::InvalidStateTransition { .. })
    );

    let grant = plant
        .engine
        .authorizer()
        .grant_override(&qe, Screen::Eol, "visual deferred to rework bay")
        .unwrap();
    plant.drain_events();
    let outcome = eol
        .finalize_decision(&qe, "EOL-P1-1", Decision::Pass, None, Some(&grant))
        .await
        .unwrap();
    assert_eq!(outcome.pack.status, PackStatus::Passed);
    let record = outcome.run.decision.unwrap();
    assert_eq!(
        record.override_reason.as_deref(),
        Some("visual deferred to rework bay")
    );

    let events = plant.drain_events();
    assert!(events.iter().any(|e| matches!(
        e,
        Event::OverrideUsed { guard, .. } if guard == "eol_aggregate"
    )));
}

#[tokio::test]
async fn decided_run_is_immutable() {
    let plant = Plant::new();
    plant.ready_pack(2).await;
    plant.pass_all_required("EOL-P1-1").await;
    let qe = plant.quality();
    let eol = plant.engine.eol();

    eol.finalize_decision(&qe, "EOL-P1-1", Decision::Pass, Some("ok".into()), None)
        .await
        .unwrap();
    assert_matches!(
        eol.finalize_decision(&qe, "EOL-P1-1", Decision::Scrap, None, None).await,
        Err(ServiceError::Immutable(_))
    );
    assert_matches!(
        eol.update_test_item(&qe, "EOL-P1-1", "visual", ItemUpdate::Status(ItemStatus::Fail))
            .await,
        Err(ServiceError::Immutable(_))
    );
}

#[tokio::test]
async fn passed_pack_dispatches_once() {
    let plant = Plant::new();
    plant.ready_pack(2).await;
    plant.pass_all_required("EOL-P1-1").await;
    let qe = plant.quality();
    plant
        .engine
        .eol()
        .finalize_decision(&qe, "EOL-P1-1", Decision::Pass, None, None)
        .await
        .unwrap();

    let packs = plant.engine.packs();
    let finalized = packs.dispatch_pack(&qe, "P1").await.unwrap();
    assert_eq!(finalized.status, PackStatus::Finalized);
    assert_eq!(finalized.finalized_by.as_deref(), Some("qe-1"));
    assert_matches!(
        packs.dispatch_pack(&qe, "P1").await,
        Err(ServiceError::Immutable(_))
    );
}

#[tokio::test]
async fn fail_quarantines_then_retest_opens_new_attempt() {
    let plant = Plant::new();
    plant.ready_pack(2).await;
    let qe = plant.quality();
    let eol = plant.engine.eol();

    eol.update_test_item(&qe, "EOL-P1-1", "insulation_resistance", ItemUpdate::Measurement(120.0))
        .await
        .unwrap();
    let outcome = eol
        .finalize_decision(&qe, "EOL-P1-1", Decision::Fail, Some("low IR".into()), None)
        .await
        .unwrap();
    assert_eq!(outcome.pack.status, PackStatus::Quarantined);
    let record = outcome.quarantine.unwrap();
    assert_eq!(record.reason, "low IR");
    assert_eq!(record.run_id.as_deref(), Some("EOL-P1-1"));

    let open = eol.list_quarantine_records(&qe, Some("P1"), true).await.unwrap();
    assert_eq!(open.len(), 1);

    let released = eol
        .release_from_quarantine(&qe, "P1", ReleaseDisposition::Retest, Some("reseated HV connector".into()))
        .await
        .unwrap();
    assert_eq!(released.pack.status, PackStatus::ReadyForEol);
    assert!(released.pack.active_run_id.is_none());
    assert_eq!(released.record.disposition, Some(ReleaseDisposition::Retest));

    let second = eol.open_test_run(&qe, "P1").await.unwrap();
    assert_eq!(second.id, "EOL-P1-2");
    assert_eq!(second.attempt, 2);
    assert!(second.decision.is_none());

    // The first attempt stays readable but cannot change
    assert_matches!(
        eol.update_test_item(&qe, "EOL-P1-1", "visual", ItemUpdate::Status(ItemStatus::Pass))
            .await,
        Err(ServiceError::Immutable(_))
    );
    let runs = eol.list_test_runs(&plant.auditor(), "P1").await.unwrap();
    assert_eq!(runs.iter().map(|r| r.attempt).collect::<Vec<_>>(), vec![1, 2]);
    assert!(eol
        .list_quarantine_records(&qe, Some("P1"), true)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn scrap_decision_is_terminal() {
    let plant = Plant::new();
    plant.ready_pack(2).await;
    let qe = plant.quality();
    let outcome = plant
        .engine
        .eol()
        .finalize_decision(&qe, "EOL-P1-1", Decision::Scrap, None, None)
        .await
        .unwrap();
    assert_eq!(outcome.pack.status, PackStatus::Scrapped);
    assert!(outcome.quarantine.is_none());
    assert_matches!(
        plant.engine.packs().dispatch_pack(&qe, "P1").await,
        Err(ServiceError::InvalidStateTransition { .. })
    );
}

#[tokio::test]
async fn manual_hold_and_scrap_release() {
    let plant = Plant::new();
    plant.ready_pack(2).await;
    let qe = plant.quality();
    let eol = plant.engine.eol();

    let record = eol
        .hold_pack(&qe, "P1", "supplier recall on lot L1", Some("NCR-0042".into()))
        .await
        .unwrap();
    assert!(record.is_open());
    assert_eq!(record.ncr_ref.as_deref(), Some("NCR-0042"));

    // Quarantined pack cannot be held again
    assert_matches!(
        eol.hold_pack(&qe, "P1", "again", None).await,
        Err(ServiceError::InvalidStateTransition { .. })
    );
    // Nor can its run be worked
    assert_matches!(
        eol.update_test_item(&qe, "EOL-P1-1", "visual", ItemUpdate::Status(ItemStatus::Pass))
            .await,
        Err(ServiceError::InvalidStateTransition { .. })
    );

    let released = eol
        .release_from_quarantine(&qe, "P1", ReleaseDisposition::Scrap, None)
        .await
        .unwrap();
    assert_eq!(released.pack.status, PackStatus::Scrapped);
    assert!(!released.record.is_open());

    assert_matches!(
        eol.release_from_quarantine(&qe, "P1", ReleaseDisposition::Retest, None).await,
        Err(ServiceError::InvalidStateTransition { .. })
    );
}

#[tokio::test]
async fn hold_requires_reason_and_permission() {
    let plant = Plant::new();
    plant.ready_pack(2).await;
    let eol = plant.engine.eol();
    assert_matches!(
        eol.hold_pack(&plant.quality(), "P1", " ", None).await,
        Err(ServiceError::InvalidInput(_))
    );
    assert_matches!(
        eol.hold_pack(&plant.operator(), "P1", "looks odd", None).await,
        Err(ServiceError::PermissionDenied { .. })
    );
    assert_matches!(
        eol.hold_pack(&plant.auditor(), "P1", "looks odd", None).await,
        Err(ServiceError::PermissionDenied { .. })
    );
}

#[tokio::test]
async fn operator_cannot_sign_decisions() {
    let plant = Plant::new();
    plant.ready_pack(2).await;
    plant.pass_all_required("EOL-P1-1").await;
    assert_matches!(
        plant
            .engine
            .eol()
            .finalize_decision(&plant.operator(), "EOL-P1-1", Decision::Pass, None, None)
            .await,
        Err(ServiceError::PermissionDenied { .. })
    );
}
