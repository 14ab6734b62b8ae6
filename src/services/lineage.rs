/*!
 * Read-only genealogy queries.
 *
 * Resolution never takes entity locks. Records are read one at a time, so a
 * view assembled while writers are active may mix revisions; missing or
 * inconsistent links are reported as warnings instead of failing the query.
 */

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use strum::Display;
use tracing::{debug, instrument, warn};

use super::EngineContext;
use crate::{
    auth::{ActorContext, Screen, Verb},
    entities::manufacturing::{
        identity_claim::claim_key, Blueprint, CellLot, CellSerial, ClaimNamespace, IdentityClaim,
        Module, Pack,
    },
    errors::{ServiceError, ServiceResult},
    repositories::{fetch, list_typed, ListFilter, StoredEntity, TraceabilityStore},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SubjectKind {
    Pack,
    Module,
    Serial,
    Lot,
}

/// Identifier carrying an explicit type tag
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum SubjectRef {
    Pack(String),
    PackSerial(String),
    Module(String),
    Serial(String),
    Lot(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineageNode {
    pub kind: SubjectKind,
    pub id: String,
    /// `None` when the referenced record does not exist
    pub status: Option<String>,
}

impl LineageNode {
    fn new(kind: SubjectKind, id: &str, status: Option<String>) -> Self {
        Self {
            kind,
            id: id.to_string(),
            status,
        }
    }
}

/// Declared-required count against actual linked children
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardinalityCheck {
    pub declared: Option<u32>,
    pub actual: u32,
    pub mismatch: bool,
}

impl CardinalityCheck {
    pub fn new(declared: Option<u32>, actual: u32) -> Self {
        Self {
            declared,
            actual,
            mismatch: declared.map_or(false, |d| d != actual),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineageView {
    pub subject: LineageNode,
    pub parent: Option<LineageNode>,
    /// Source lot of a serial
    pub origin: Option<LineageNode>,
    pub children: Vec<LineageNode>,
    pub cardinality: Option<CardinalityCheck>,
    /// Other subject kinds the probed identifier also matched
    pub ambiguous_matches: Vec<SubjectKind>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleGenealogy {
    pub module: LineageNode,
    pub cardinality: Option<CardinalityCheck>,
    pub cells: Vec<LineageNode>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackGenealogy {
    pub pack: LineageNode,
    pub pack_serial: Option<String>,
    pub bms_id: Option<String>,
    pub cardinality: CardinalityCheck,
    pub modules: Vec<ModuleGenealogy>,
    pub warnings: Vec<String>,
}

enum Subject {
    Pack(Pack),
    Module(Module),
    Serial(CellSerial),
    Lot(CellLot),
}

impl Subject {
    fn kind(&self) -> SubjectKind {
        match self {
            Subject::Pack(_) => SubjectKind::Pack,
            Subject::Module(_) => SubjectKind::Module,
            Subject::Serial(_) => SubjectKind::Serial,
            Subject::Lot(_) => SubjectKind::Lot,
        }
    }
}

#[derive(Clone)]
pub struct LineageResolver {
    ctx: Arc<EngineContext>,
}

impl LineageResolver {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    fn store(&self) -> &dyn TraceabilityStore {
        self.ctx.store.as_ref()
    }

    /// Resolves an untyped identifier by probing pack id, pack serial, module
    /// and serial in that order. Identifier namespaces are assumed disjoint;
    /// when they are not, the first match wins and the others are reported
    /// in `ambiguous_matches`.
    #[instrument(skip(self, actor), fields(actor = %actor.actor_id))]
    pub async fn resolve(&self, actor: &ActorContext, identifier: &str) -> ServiceResult<LineageView> {
        self.ctx
            .authorizer
            .require(actor, Screen::Lineage, Verb::View)?;

        let identifier = identifier.trim();
        let mut matches: Vec<Subject> = Vec::new();

        if let Some(pack) = self.value::<Pack>(identifier).await? {
            matches.push(Subject::Pack(pack));
        }
        if let Some(pack) = self.pack_by_serial(identifier).await? {
            if !matches.iter().any(|m| matches!(m, Subject::Pack(p) if p.id == pack.id)) {
                matches.push(Subject::Pack(pack));
            }
        }
        if let Some(module) = self.value::<Module>(identifier).await? {
            matches.push(Subject::Module(module));
        }
        if let Some(serial) = self.value::<CellSerial>(identifier).await? {
            matches.push(Subject::Serial(serial));
        }

        let mut matches = matches.into_iter();
        let first = matches.next().ok_or_else(|| {
            ServiceError::NotFound(format!("no pack, module or serial matches {}", identifier))
        })?;
        let others: Vec<SubjectKind> = matches.map(|m| m.kind()).collect();

        let mut view = self.view_of(first).await?;
        if !others.is_empty() {
            warn!(identifier, resolved = %view.subject.kind, also = ?others, "Ambiguous lineage identifier");
            view.warnings.push(format!(
                "identifier {} also matches {}; resolved as {}",
                identifier,
                others
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", "),
                view.subject.kind
            ));
            view.ambiguous_matches = others;
        }
        Ok(view)
    }

    #[instrument(skip(self, actor), fields(actor = %actor.actor_id))]
    pub async fn resolve_typed(&self, actor: &ActorContext, subject: SubjectRef) -> ServiceResult<LineageView> {
        self.ctx
            .authorizer
            .require(actor, Screen::Lineage, Verb::View)?;

        let not_found = |what: &str, id: &str| ServiceError::NotFound(format!("{} {}", what, id));
        let found = match &subject {
            SubjectRef::Pack(id) => Subject::Pack(
                self.value::<Pack>(id)
                    .await?
                    .ok_or_else(|| not_found("pack", id))?,
            ),
            SubjectRef::PackSerial(serial) => Subject::Pack(
                self.pack_by_serial(serial)
                    .await?
                    .ok_or_else(|| not_found("pack serial", serial))?,
            ),
            SubjectRef::Module(id) => Subject::Module(
                self.value::<Module>(id)
                    .await?
                    .ok_or_else(|| not_found("module", id))?,
            ),
            SubjectRef::Serial(id) => Subject::Serial(
                self.value::<CellSerial>(id)
                    .await?
                    .ok_or_else(|| not_found("serial", id))?,
            ),
            SubjectRef::Lot(id) => Subject::Lot(
                self.value::<CellLot>(id)
                    .await?
                    .ok_or_else(|| not_found("lot", id))?,
            ),
        };
        self.view_of(found).await
    }

    /// Full pack → module → cell tree with a cardinality check per level
    #[instrument(skip(self, actor), fields(actor = %actor.actor_id))]
    pub async fn genealogy(&self, actor: &ActorContext, pack_id: &str) -> ServiceResult<PackGenealogy> {
        self.ctx
            .authorizer
            .require(actor, Screen::Lineage, Verb::View)?;

        let pack = self
            .value::<Pack>(pack_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("pack {}", pack_id)))?;

        let mut warnings = Vec::new();
        let declared = self
            .declared(&pack.blueprint_id, |b| b.modules_per_pack, &mut warnings)
            .await?;
        let cardinality = CardinalityCheck::new(declared, pack.module_count());

        let mut modules = Vec::with_capacity(pack.modules.len());
        for module_id in &pack.modules {
            let Some(module) = self.value::<Module>(module_id).await? else {
                warnings.push(format!("module {} linked to pack {} not found", module_id, pack.id));
                modules.push(ModuleGenealogy {
                    module: LineageNode::new(SubjectKind::Module, module_id, None),
                    cardinality: None,
                    cells: Vec::new(),
                });
                continue;
            };
            if module.pack_id.as_deref() != Some(pack.id.as_str()) {
                warnings.push(format!(
                    "module {} does not point back to pack {}",
                    module.id, pack.id
                ));
            }
            let declared = self
                .declared(&module.blueprint_id, |b| b.cells_per_module, &mut warnings)
                .await?;
            let cells = self.cell_nodes(&module, &mut warnings).await?;
            modules.push(ModuleGenealogy {
                module: LineageNode::new(SubjectKind::Module, &module.id, Some(module.status.to_string())),
                cardinality: Some(CardinalityCheck::new(declared, module.bound_count())),
                cells,
            });
        }

        debug!(pack_id, modules = modules.len(), warnings = warnings.len(), "Genealogy assembled");
        Ok(PackGenealogy {
            pack: LineageNode::new(SubjectKind::Pack, &pack.id, Some(pack.status.to_string())),
            pack_serial: pack.pack_serial,
            bms_id: pack.bms_id,
            cardinality,
            modules,
            warnings,
        })
    }

    async fn view_of(&self, subject: Subject) -> ServiceResult<LineageView> {
        let mut warnings = Vec::new();

        let view = match subject {
            Subject::Pack(pack) => {
                let declared = self
                    .declared(&pack.blueprint_id, |b| b.modules_per_pack, &mut warnings)
                    .await?;
                let mut children = Vec::with_capacity(pack.modules.len());
                for module_id in &pack.modules {
                    let status = self.value::<Module>(module_id).await?.map(|m| m.status.to_string());
                    if status.is_none() {
                        warnings.push(format!("module {} linked to pack {} not found", module_id, pack.id));
                    }
                    children.push(LineageNode::new(SubjectKind::Module, module_id, status));
                }
                LineageView {
                    subject: LineageNode::new(SubjectKind::Pack, &pack.id, Some(pack.status.to_string())),
                    parent: None,
                    origin: None,
                    children,
                    cardinality: Some(CardinalityCheck::new(declared, pack.module_count())),
                    ambiguous_matches: Vec::new(),
                    warnings,
                }
            }
            Subject::Module(module) => {
                let declared = self
                    .declared(&module.blueprint_id, |b| b.cells_per_module, &mut warnings)
                    .await?;
                let parent = match &module.pack_id {
                    Some(pack_id) => {
                        let status = self.value::<Pack>(pack_id).await?.map(|p| p.status.to_string());
                        if status.is_none() {
                            warnings.push(format!("pack {} of module {} not found", pack_id, module.id));
                        }
                        Some(LineageNode::new(SubjectKind::Pack, pack_id, status))
                    }
                    None => None,
                };
                let children = self.cell_nodes(&module, &mut warnings).await?;
                LineageView {
                    subject: LineageNode::new(SubjectKind::Module, &module.id, Some(module.status.to_string())),
                    parent,
                    origin: None,
                    children,
                    cardinality: Some(CardinalityCheck::new(declared, module.bound_count())),
                    ambiguous_matches: Vec::new(),
                    warnings,
                }
            }
            Subject::Serial(serial) => {
                let parent = match &serial.bound_module {
                    Some(module_id) => {
                        let status = self.value::<Module>(module_id).await?.map(|m| m.status.to_string());
                        if status.is_none() {
                            warnings.push(format!(
                                "module {} of serial {} not found",
                                module_id, serial.serial
                            ));
                        }
                        Some(LineageNode::new(SubjectKind::Module, module_id, status))
                    }
                    None => None,
                };
                let lot_status = self.value::<CellLot>(&serial.lot_id).await?.map(|l| l.status.to_string());
                if lot_status.is_none() {
                    warnings.push(format!("lot {} of serial {} not found", serial.lot_id, serial.serial));
                }
                LineageView {
                    subject: LineageNode::new(SubjectKind::Serial, &serial.serial, Some(serial.status.to_string())),
                    parent,
                    origin: Some(LineageNode::new(SubjectKind::Lot, &serial.lot_id, lot_status)),
                    children: Vec::new(),
                    cardinality: None,
                    ambiguous_matches: Vec::new(),
                    warnings,
                }
            }
            Subject::Lot(lot) => {
                let serials = list_typed::<CellSerial>(self.store(), &ListFilter::by_parent(lot.id.clone())).await?;
                let children: Vec<LineageNode> = serials
                    .into_iter()
                    .map(|s| {
                        LineageNode::new(SubjectKind::Serial, &s.value.serial, Some(s.value.status.to_string()))
                    })
                    .collect();
                let actual = u32::try_from(children.len()).unwrap_or(u32::MAX);
                LineageView {
                    subject: LineageNode::new(SubjectKind::Lot, &lot.id, Some(lot.status.to_string())),
                    parent: None,
                    origin: None,
                    children,
                    cardinality: Some(CardinalityCheck::new(Some(lot.declared_quantity), actual)),
                    ambiguous_matches: Vec::new(),
                    warnings,
                }
            }
        };

        if let Some(check) = view.cardinality.filter(|c| c.mismatch) {
            debug!(
                subject = %view.subject.id,
                declared = ?check.declared,
                actual = check.actual,
                "Cardinality mismatch"
            );
        }
        Ok(view)
    }

    async fn cell_nodes(&self, module: &Module, warnings: &mut Vec<String>) -> ServiceResult<Vec<LineageNode>> {
        let mut cells = Vec::with_capacity(module.cells.len());
        for serial in &module.cells {
            match self.value::<CellSerial>(serial).await? {
                Some(cell) => {
                    if cell.bound_module.as_deref() != Some(module.id.as_str()) {
                        warnings.push(format!(
                            "serial {} does not point back to module {}",
                            serial, module.id
                        ));
                    }
                    cells.push(LineageNode::new(SubjectKind::Serial, serial, Some(cell.status.to_string())));
                }
                None => {
                    warnings.push(format!("serial {} bound to module {} not found", serial, module.id));
                    cells.push(LineageNode::new(SubjectKind::Serial, serial, None));
                }
            }
        }
        Ok(cells)
    }

    async fn declared(
        &self,
        blueprint_id: &str,
        count: impl Fn(&Blueprint) -> u32,
        warnings: &mut Vec<String>,
    ) -> ServiceResult<Option<u32>> {
        match self.value::<Blueprint>(blueprint_id).await? {
            Some(blueprint) => Ok(Some(count(&blueprint))),
            None => {
                warnings.push(format!("blueprint {} not found; declared count unknown", blueprint_id));
                Ok(None)
            }
        }
    }

    async fn pack_by_serial(&self, pack_serial: &str) -> ServiceResult<Option<Pack>> {
        let key = claim_key(ClaimNamespace::PackSerial, pack_serial);
        match self.value::<IdentityClaim>(&key).await? {
            Some(claim) => self.value::<Pack>(&claim.owner_id).await,
            None => Ok(None),
        }
    }

    async fn value<T: StoredEntity>(&self, id: &str) -> ServiceResult<Option<T>> {
        Ok(fetch::<T>(self.store(), id).await?.map(|v| v.value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cardinality_flags_both_directions() {
        assert!(CardinalityCheck::new(Some(16), 15).mismatch);
        assert!(CardinalityCheck::new(Some(16), 17).mismatch);
        assert!(!CardinalityCheck::new(Some(16), 16).mismatch);
        assert!(!CardinalityCheck::new(None, 3).mismatch);
    }

    #[test]
    fn subject_ref_wire_format() {
        let parsed: SubjectRef =
            serde_json::from_str(r#"{"type":"pack_serial","id":"PK-20260101-000001"}"#).unwrap();
        assert_eq!(parsed, SubjectRef::PackSerial("PK-20260101-000001".into()));
    }
}
