use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::auth::{rbac::AUDIT_TARGET, ClusterId, Screen};
use crate::entities::manufacturing::{
    AggregateResult, Decision, ItemStatus, QcStatus, ReleaseDisposition,
};

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Best-effort delivery: a closed or full channel never fails the caller.
    pub async fn send_or_log(&self, event: Event) {
        let name: &'static str = (&event).into();
        if let Err(e) = self.send(event).await {
            warn!(event = name, error = %e, "Dropping domain event");
        }
    }
}

/// State transitions published by the engine
#[derive(Debug, Clone, Serialize, Deserialize, strum::IntoStaticStr)]
pub enum Event {
    // Blueprint events
    BlueprintCreated {
        blueprint_id: String,
    },
    BlueprintUpdated {
        blueprint_id: String,
    },
    BlueprintActivated {
        blueprint_id: String,
        actor_id: String,
    },

    // Identity ledger events
    LotCreated {
        lot_id: String,
    },
    SerialsGenerated {
        lot_id: String,
        prefix: String,
        count: u32,
    },
    SerialScanned {
        lot_id: String,
        serial: String,
    },
    LotPublished {
        lot_id: String,
    },

    // Module events
    ModuleCreated {
        module_id: String,
        blueprint_id: String,
    },
    CellBound {
        module_id: String,
        serial: String,
        binding_id: String,
    },
    CellUnbound {
        module_id: String,
        serial: String,
        binding_id: String,
    },
    ModuleSealed {
        module_id: String,
        cell_count: u32,
    },
    ModuleQuarantined {
        module_id: String,
        reason: String,
    },

    // Pack events
    PackCreated {
        pack_id: String,
        blueprint_id: String,
    },
    ModuleLinked {
        pack_id: String,
        module_id: String,
    },
    ModuleUnlinked {
        pack_id: String,
        module_id: String,
    },
    DeviceBound {
        pack_id: String,
        bms_id: String,
    },
    PackSerialAssigned {
        pack_id: String,
        pack_serial: String,
    },
    QcStatusChanged {
        pack_id: String,
        old_status: QcStatus,
        new_status: QcStatus,
    },
    PackReadyForEol {
        pack_id: String,
    },
    PackDispatched {
        pack_id: String,
        pack_serial: Option<String>,
    },

    // EOL events
    TestRunOpened {
        pack_id: String,
        run_id: String,
        attempt: u32,
    },
    TestItemUpdated {
        run_id: String,
        item_id: String,
        status: ItemStatus,
        aggregate: AggregateResult,
    },
    EolDecisionRecorded {
        pack_id: String,
        run_id: String,
        decision: Decision,
        signed_by: String,
    },
    PackQuarantined {
        pack_id: String,
        record_id: String,
        reason: String,
    },
    PackReleased {
        pack_id: String,
        record_id: String,
        disposition: ReleaseDisposition,
    },

    // Privileged bypass of a business guard
    OverrideUsed {
        actor_id: String,
        cluster: ClusterId,
        screen: Screen,
        guard: String,
        subject: String,
        reason: String,
    },
}

/// Drains the event channel until every sender is dropped
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        let name: &'static str = (&event).into();

        match &event {
            Event::OverrideUsed {
                actor_id,
                cluster,
                screen,
                guard,
                subject,
                reason,
            } => {
                warn!(
                    target: AUDIT_TARGET,
                    actor = %actor_id,
                    cluster = %cluster,
                    screen = %screen,
                    guard = %guard,
                    subject = %subject,
                    reason = %reason,
                    "Override event"
                );
            }
            Event::EolDecisionRecorded {
                pack_id,
                run_id,
                decision,
                signed_by,
            } => {
                info!(
                    pack_id = %pack_id,
                    run_id = %run_id,
                    decision = %decision,
                    signed_by = %signed_by,
                    "EOL decision recorded"
                );
            }
            _ => match serde_json::to_string(&event) {
                Ok(payload) => info!(event = name, payload = %payload, "Domain event"),
                Err(e) => error!(event = name, error = %e, "Failed to serialize domain event"),
            },
        }
    }

    info!("Event processing loop stopped");
}
