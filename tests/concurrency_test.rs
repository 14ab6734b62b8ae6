mod common;

use std::collections::HashSet;

use common::Plant;
use futures::future::join_all;
use packtrace_api::{
    entities::manufacturing::{Chemistry, ModuleStatus},
    errors::ServiceError,
};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_binds_never_exceed_target() {
    let plant = Plant::new();
    plant.active_blueprint("BP", Chemistry::Lfp, 8, 1).await;
    let serials = plant.lot_with_serials("L1", Chemistry::Lfp, 20, true).await;
    plant.module("M1", "BP").await;

    let tasks = serials.iter().cloned().map(|serial| {
        let engine = plant.engine.clone();
        let op = plant.operator();
        tokio::spawn(async move { engine.modules().bind_cell(&op, "M1", &serial, None).await })
    });
    let results: Vec<_> = join_all(tasks)
        .await
        .into_iter()
        .map(|joined| joined.expect("task completes"))
        .collect();

    let ok = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(ok, 8);
    assert!(results
        .iter()
        .filter_map(|r| r.as_ref().err())
        .all(|e| matches!(e, ServiceError::CardinalityMismatch { .. })));

    let module = plant
        .engine
        .modules()
        .get_module(&plant.operator(), "M1")
        .await
        .unwrap();
    assert_eq!(module.cells.len(), 8);
    assert_eq!(module.status, ModuleStatus::InProgress);

    let lot = plant
        .engine
        .ledger()
        .verify_lot_counters(&plant.auditor(), "L1")
        .await
        .unwrap();
    assert!(lot.consistent);
    assert_eq!(lot.recorded.bound, 8);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn one_serial_raced_into_many_modules_binds_once() {
    let plant = Plant::new();
    plant.active_blueprint("BP", Chemistry::Lfp, 2, 1).await;
    let serials = plant.lot_with_serials("L1", Chemistry::Lfp, 1, true).await;
    for i in 0..6 {
        plant.module(&format!("M{}", i), "BP").await;
    }

    let tasks = (0..6).map(|i| {
        let engine = plant.engine.clone();
        let op = plant.operator();
        let serial = serials[0].clone();
        tokio::spawn(async move {
            engine
                .modules()
                .bind_cell(&op, &format!("M{}", i), &serial, None)
                .await
        })
    });
    let results: Vec<_> = join_all(tasks)
        .await
        .into_iter()
        .map(|joined| joined.expect("task completes"))
        .collect();

    let winners: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(winners.len(), 1);
    assert!(results
        .iter()
        .filter_map(|r| r.as_ref().err())
        .all(|e| matches!(e, ServiceError::AlreadyBound(_))));

    let cell = plant
        .engine
        .ledger()
        .find_serial_globally(&plant.auditor(), &serials[0])
        .await
        .unwrap();
    assert_eq!(cell.bound_module.as_deref(), Some(winners[0].module_id.as_str()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_pack_serials_are_unique() {
    let plant = Plant::new();
    plant.active_blueprint("BP", Chemistry::Lfp, 2, 1).await;
    for i in 0..12 {
        plant.pack(&format!("P{}", i), "BP").await;
    }

    let tasks = (0..12).map(|i| {
        let engine = plant.engine.clone();
        let op = plant.operator();
        tokio::spawn(async move { engine.packs().assign_pack_serial(&op, &format!("P{}", i)).await })
    });
    let serials: HashSet<String> = join_all(tasks)
        .await
        .into_iter()
        .map(|joined| {
            joined
                .expect("task completes")
                .expect("serial assigned")
                .pack_serial
                .expect("serial set")
        })
        .collect();
    assert_eq!(serials.len(), 12);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn lock_table_drains_after_concurrent_scans() {
    let plant = Plant::new();
    let serials = plant.lot_with_serials("L1", Chemistry::Lfp, 500, false).await;

    let tasks = serials.iter().cloned().map(|serial| {
        let engine = plant.engine.clone();
        let clerk = plant.clerk();
        tokio::spawn(async move { engine.ledger().scan_serial(&clerk, "L1", &serial).await })
    });
    for joined in join_all(tasks).await {
        joined.expect("task completes").expect("scan succeeds");
    }

    let lot = plant.engine.ledger().get_lot(&plant.clerk(), "L1").await.unwrap();
    assert_eq!(lot.counters.scanned, 500);
    assert!(plant.engine.context().locks.is_empty());
}
