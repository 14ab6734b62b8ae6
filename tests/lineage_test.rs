mod common;

use assert_matches::assert_matches;
use common::Plant;
use packtrace_api::{
    auth::{ActorContext, ClusterId},
    entities::manufacturing::{Chemistry, Module},
    errors::ServiceError,
    repositories::{require, ChangeSet, TraceabilityStore},
    services::lineage::{SubjectKind, SubjectRef},
};

#[tokio::test]
async fn serial_resolves_to_module_and_lot() {
    let plant = Plant::new();
    plant.complete_pack(2).await;
    let view = plant
        .engine
        .lineage()
        .resolve(&plant.auditor(), "L1-00001")
        .await
        .unwrap();

    assert_eq!(view.subject.kind, SubjectKind::Serial);
    assert_eq!(view.subject.status.as_deref(), Some("BOUND"));
    let parent = view.parent.unwrap();
    assert_eq!((parent.kind, parent.id.as_str()), (SubjectKind::Module, "M1"));
    assert_eq!(parent.status.as_deref(), Some("CONSUMED"));
    let origin = view.origin.unwrap();
    assert_eq!((origin.kind, origin.id.as_str()), (SubjectKind::Lot, "L1"));
    assert!(view.warnings.is_empty());
    assert!(view.ambiguous_matches.is_empty());
}

#[tokio::test]
async fn pack_serial_resolves_to_pack() {
    let plant = Plant::new();
    let pack = plant.complete_pack(2).await;
    let serial = pack.pack_serial.unwrap();
    let lineage = plant.engine.lineage();
    let auditor = plant.auditor();

    let view = lineage.resolve(&auditor, &serial).await.unwrap();
    assert_eq!(view.subject.id, "P1");
    assert_eq!(view.children.len(), 1);
    assert_eq!(view.children[0].id, "M1");
    let check = view.cardinality.unwrap();
    assert_eq!((check.declared, check.actual, check.mismatch), (Some(1), 1, false));

    let typed = lineage
        .resolve_typed(&auditor, SubjectRef::PackSerial(serial))
        .await
        .unwrap();
    assert_eq!(typed.subject, view.subject);
}

#[tokio::test]
async fn module_view_reports_partial_build() {
    let plant = Plant::new();
    plant.active_blueprint("BP", Chemistry::Lfp, 4, 1).await;
    let serials = plant.lot_with_serials("L1", Chemistry::Lfp, 4, true).await;
    plant.module("M1", "BP").await;
    for serial in &serials[..3] {
        plant
            .engine
            .modules()
            .bind_cell(&plant.operator(), "M1", serial, None)
            .await
            .unwrap();
    }

    let view = plant
        .engine
        .lineage()
        .resolve(&plant.auditor(), "M1")
        .await
        .unwrap();
    assert_eq!(view.subject.kind, SubjectKind::Module);
    assert!(view.parent.is_none());
    assert_eq!(view.children.len(), 3);
    let check = view.cardinality.unwrap();
    assert_eq!((check.declared, check.actual, check.mismatch), (Some(4), 3, true));
}

#[tokio::test]
async fn lot_view_counts_against_declared_quantity() {
    let plant = Plant::new();
    plant.lot_with_serials("L1", Chemistry::Nmc, 5, false).await;
    let view = plant
        .engine
        .lineage()
        .resolve_typed(&plant.auditor(), SubjectRef::Lot("L1".into()))
        .await
        .unwrap();
    assert_eq!(view.children.len(), 5);
    assert!(!view.cardinality.unwrap().mismatch);
}

#[tokio::test]
async fn ambiguous_identifier_prefers_pack() {
    let plant = Plant::new();
    plant.active_blueprint("BP", Chemistry::Lfp, 2, 1).await;
    plant.pack("X1", "BP").await;
    plant.module("X1", "BP").await;

    let view = plant
        .engine
        .lineage()
        .resolve(&plant.auditor(), "X1")
        .await
        .unwrap();
    assert_eq!(view.subject.kind, SubjectKind::Pack);
    assert_eq!(view.ambiguous_matches, vec![SubjectKind::Module]);
    assert_eq!(view.warnings.len(), 1);

    let typed = plant
        .engine
        .lineage()
        .resolve_typed(&plant.auditor(), SubjectRef::Module("X1".into()))
        .await
        .unwrap();
    assert_eq!(typed.subject.kind, SubjectKind::Module);
    assert!(typed.ambiguous_matches.is_empty());
}

#[tokio::test]
async fn unknown_identifier_is_not_found() {
    let plant = Plant::new();
    let lineage = plant.engine.lineage();
    assert_matches!(
        lineage.resolve(&plant.auditor(), "GHOST").await,
        Err(ServiceError::NotFound(_))
    );
    assert_matches!(
        lineage
            .resolve_typed(&plant.auditor(), SubjectRef::Serial("GHOST".into()))
            .await,
        Err(ServiceError::NotFound(_))
    );
}

#[tokio::test]
async fn genealogy_walks_pack_to_cells() {
    let plant = Plant::new();
    plant.complete_pack(3).await;
    let tree = plant
        .engine
        .lineage()
        .genealogy(&plant.quality(), "P1")
        .await
        .unwrap();

    assert_eq!(tree.bms_id.as_deref(), Some("B1"));
    assert!(tree.pack_serial.is_some());
    assert!(!tree.cardinality.mismatch);
    assert_eq!(tree.modules.len(), 1);
    let module = &tree.modules[0];
    assert_eq!(module.module.id, "M1");
    assert_eq!(module.cells.len(), 3);
    assert!(module.cells.iter().all(|c| c.status.as_deref() == Some("BOUND")));
    assert!(tree.warnings.is_empty());
}

#[tokio::test]
async fn orphaned_links_become_warnings() {
    let plant = Plant::new();
    plant.complete_pack(2).await;

    // Corrupt the module's cell list underneath the engine
    let store = plant.store.as_ref();
    let stored = require::<Module>(store, "M1").await.unwrap();
    let mut module = stored.value;
    module.cells.push("LOST-00001".to_string());
    let mut changes = ChangeSet::new();
    changes.update(module, stored.revision);
    store.commit(changes).await.unwrap();

    let tree = plant
        .engine
        .lineage()
        .genealogy(&plant.auditor(), "P1")
        .await
        .unwrap();
    let cells = &tree.modules[0].cells;
    assert_eq!(cells.len(), 3);
    assert!(cells.iter().any(|c| c.id == "LOST-00001" && c.status.is_none()));
    assert!(tree.modules[0].cardinality.unwrap().mismatch);
    assert!(tree.warnings.iter().any(|w| w.contains("LOST-00001")));
}

#[tokio::test]
async fn lineage_requires_view_permission() {
    let plant = Plant::new();
    plant.complete_pack(2).await;
    let nobody = ActorContext::new("guest-1", "visitor", ClusterId::new("visitors"));
    assert_matches!(
        plant.engine.lineage().resolve(&nobody, "P1").await,
        Err(ServiceError::PermissionDenied { .. })
    );
}
