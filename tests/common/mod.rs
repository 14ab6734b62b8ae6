#![allow(dead_code)]

use std::sync::Arc;

use axum::{
    body::{self, Body},
    http::{Method, Request, StatusCode},
    Router,
};
use serde_json::Value;
use tokio::sync::mpsc;
use tower::ServiceExt;

use packtrace_api::{
    auth::{ActorContext, Authorizer, PermissionTable},
    config::{AuthorizationConfig, EngineConfig},
    entities::manufacturing::{
        eol_test_run::Comparator, Blueprint, Chemistry, ItemStatus, ItemUpdate, Module, Pack,
        QcStatus,
    },
    events::{Event, EventSender},
    repositories::InMemoryStore,
    services::{
        blueprints::NewBlueprint, identity_ledger::NewLot, module_assembly::NewModule,
        pack_assembly::NewPack, TraceabilityEngine,
    },
    AppState,
};

const EVENT_CAPACITY: usize = 65_536;

/// Engine on a fresh in-memory store with the standard plant permission table.
pub struct Plant {
    pub engine: TraceabilityEngine,
    pub store: Arc<InMemoryStore>,
    events: mpsc::Receiver<Event>,
}

impl Plant {
    pub fn new() -> Self {
        Self::with_settings(EngineConfig::default())
    }

    pub fn with_settings(settings: EngineConfig) -> Self {
        let table = PermissionTable::from_config(&AuthorizationConfig::default())
            .expect("default permission table");
        let authorizer = Arc::new(Authorizer::new(Arc::new(table)));
        let store = Arc::new(InMemoryStore::new());
        let (tx, rx) = mpsc::channel(EVENT_CAPACITY);

        let engine = TraceabilityEngine::builder(store.clone(), authorizer)
            .settings(settings)
            .events(EventSender::new(tx))
            .build()
            .expect("engine builds");

        Self {
            engine,
            store,
            events: rx,
        }
    }

    pub fn actor(&self, actor_id: &str, role: &str) -> ActorContext {
        self.engine
            .authorizer()
            .resolve_actor(actor_id.to_string(), role.to_string(), None)
            .expect("role is mapped")
    }

    pub fn admin(&self) -> ActorContext {
        self.actor("admin-1", "plant_admin")
    }

    pub fn engineer(&self) -> ActorContext {
        self.actor("eng-1", "design_engineer")
    }

    pub fn clerk(&self) -> ActorContext {
        self.actor("clerk-1", "receiving_clerk")
    }

    pub fn operator(&self) -> ActorContext {
        self.actor("op-1", "line_operator")
    }

    pub fn supervisor(&self) -> ActorContext {
        self.actor("sup-1", "line_supervisor")
    }

    pub fn quality(&self) -> ActorContext {
        self.actor("qe-1", "quality_engineer")
    }

    pub fn auditor(&self) -> ActorContext {
        self.actor("aud-1", "auditor")
    }

    /// Events emitted so far
    pub fn drain_events(&mut self) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    pub async fn active_blueprint(
        &self,
        id: &str,
        chemistry: Chemistry,
        cells_per_module: u32,
        modules_per_pack: u32,
    ) -> Blueprint {
        let eng = self.engineer();
        self.engine
            .blueprints()
            .create(
                &eng,
                NewBlueprint {
                    id: Some(id.to_string()),
                    name: format!("{} pack", id),
                    chemistry,
                    series_count: cells_per_module,
                    parallel_count: 1,
                    modules_per_pack,
                    cells_per_module,
                    allowed_chemistries: Default::default(),
                },
            )
            .await
            .expect("create blueprint");
        self.engine
            .blueprints()
            .activate(&eng, id)
            .await
            .expect("activate blueprint")
    }

    /// Creates a lot and generates `count` serials, optionally scanning them.
    pub async fn lot_with_serials(
        &self,
        lot_id: &str,
        chemistry: Chemistry,
        count: u32,
        scan: bool,
    ) -> Vec<String> {
        let clerk = self.clerk();
        let ledger = self.engine.ledger();
        ledger
            .create_lot(
                &clerk,
                NewLot {
                    id: Some(lot_id.to_string()),
                    supplier: "CATL".to_string(),
                    supplier_lot_ref: None,
                    declared_quantity: count,
                    chemistry,
                },
            )
            .await
            .expect("create lot");
        let generated = ledger
            .generate_serials(&clerk, lot_id, lot_id, count)
            .await
            .expect("generate serials");
        if scan {
            for serial in &generated.serials {
                ledger
                    .scan_serial(&clerk, lot_id, serial)
                    .await
                    .expect("scan serial");
            }
        }
        generated.serials
    }

    pub async fn module(&self, module_id: &str, blueprint_id: &str) -> Module {
        self.engine
            .modules()
            .create_module(
                &self.operator(),
                NewModule {
                    id: Some(module_id.to_string()),
                    blueprint_id: blueprint_id.to_string(),
                },
            )
            .await
            .expect("create module")
    }

    /// Binds every serial and seals the module.
    pub async fn sealed_module(&self, module_id: &str, blueprint_id: &str, serials: &[String]) -> Module {
        let op = self.operator();
        self.module(module_id, blueprint_id).await;
        for serial in serials {
            self.engine
                .modules()
                .bind_cell(&op, module_id, serial, None)
                .await
                .expect("bind cell");
        }
        self.engine
            .modules()
            .seal_module(&op, module_id)
            .await
            .expect("seal module")
    }

    pub async fn pack(&self, pack_id: &str, blueprint_id: &str) -> Pack {
        self.engine
            .packs()
            .create_pack(
                &self.operator(),
                NewPack {
                    id: Some(pack_id.to_string()),
                    blueprint_id: blueprint_id.to_string(),
                },
            )
            .await
            .expect("create pack")
    }

    /// Lot `L1` → module `M1` → pack `P1` on a one-module LFP blueprint,
    /// with serial, QC and BMS completed but not yet marked ready.
    pub async fn complete_pack(&self, cells: u32) -> Pack {
        self.active_blueprint("BP-LFP", Chemistry::Lfp, cells, 1).await;
        let serials = self.lot_with_serials("L1", Chemistry::Lfp, cells, true).await;
        self.sealed_module("M1", "BP-LFP", &serials).await;
        self.pack("P1", "BP-LFP").await;

        let op = self.operator();
        let packs = self.engine.packs();
        packs.link_module(&op, "P1", "M1").await.expect("link");
        packs.assign_pack_serial(&op, "P1").await.expect("serial");
        packs
            .set_qc_status(&self.quality(), "P1", QcStatus::Passed)
            .await
            .expect("qc");
        packs.bind_device(&op, "P1", "B1").await.expect("bms")
    }

    /// `complete_pack` moved to READY_FOR_EOL
    pub async fn ready_pack(&self, cells: u32) -> Pack {
        self.complete_pack(cells).await;
        self.engine
            .packs()
            .mark_ready_for_eol(&self.operator(), "P1")
            .await
            .expect("ready for EOL")
    }

    /// Sets every required item of the active run to a passing value.
    pub async fn pass_all_required(&self, run_id: &str) {
        let qe = self.quality();
        let eol = self.engine.eol();
        let run = eol.get_test_run(&qe, run_id).await.expect("run");
        for item in run.items.iter().filter(|i| i.required) {
            let update = match item.threshold {
                Some(t) => ItemUpdate::Measurement(match t.comparator {
                    Comparator::LessThan => t.limit - 1.0,
                    Comparator::GreaterThan => t.limit + 1.0,
                }),
                None => ItemUpdate::Status(ItemStatus::Pass),
            };
            eol.update_test_item(&qe, run_id, &item.id, update)
                .await
                .expect("update item");
        }
    }
}

/// HTTP harness driving the router with `tower::ServiceExt::oneshot`
pub struct TestApp {
    router: Router,
    pub plant: Plant,
}

impl TestApp {
    pub fn new() -> Self {
        let plant = Plant::new();
        let router = packtrace_api::app(AppState::new(plant.engine.clone()));
        Self { router, plant }
    }

    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        role: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        self.request_in_cluster(method, uri, role, None, body).await
    }

    /// Same as `request`, also sending `x-actor-cluster`
    pub async fn request_in_cluster(
        &self,
        method: Method,
        uri: &str,
        role: Option<&str>,
        cluster: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(role) = role {
            builder = builder
                .header("x-actor-id", format!("{}-http", role))
                .header("x-actor-role", role);
        }
        if let Some(cluster) = cluster {
            builder = builder.header("x-actor-cluster", cluster);
        }
        let request = match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string())),
            None => builder.body(Body::empty()),
        }
        .expect("request builds");

        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("router responds");
        let status = response.status();
        let bytes = body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("response body bytes");
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, json)
    }
}
