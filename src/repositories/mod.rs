//! Persistence contract for the traceability engine.
//!
//! Every record carries a revision. Writes go through [`ChangeSet`]s that are
//! committed all-or-nothing with a compare-and-swap check per record.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use strum::{AsRefStr, Display};

use crate::entities::manufacturing::{
    Blueprint, CellBinding, CellLot, CellSerial, EolTestRun, IdentityClaim, Module, Pack,
    QuarantineRecord,
};
use crate::errors::{ServiceError, ServiceResult};

pub mod in_memory;

pub use in_memory::InMemoryStore;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EntityKind {
    Blueprint,
    Lot,
    Serial,
    Binding,
    Module,
    Pack,
    TestRun,
    Quarantine,
    Claim,
}

/// Identity of one stored record; ordering is used for deadlock-free locking.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    pub kind: EntityKind,
    pub id: String,
}

impl EntityKey {
    pub fn new(kind: EntityKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.id)
    }
}

/// Tagged union of every persisted entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "record", rename_all = "snake_case")]
pub enum Record {
    Blueprint(Blueprint),
    Lot(CellLot),
    Serial(CellSerial),
    Binding(CellBinding),
    Module(Module),
    Pack(Pack),
    TestRun(EolTestRun),
    Quarantine(QuarantineRecord),
    Claim(IdentityClaim),
}

impl Record {
    pub fn kind(&self) -> EntityKind {
        match self {
            Record::Blueprint(_) => EntityKind::Blueprint,
            Record::Lot(_) => EntityKind::Lot,
            Record::Serial(_) => EntityKind::Serial,
            Record::Binding(_) => EntityKind::Binding,
            Record::Module(_) => EntityKind::Module,
            Record::Pack(_) => EntityKind::Pack,
            Record::TestRun(_) => EntityKind::TestRun,
            Record::Quarantine(_) => EntityKind::Quarantine,
            Record::Claim(_) => EntityKind::Claim,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Record::Blueprint(r) => &r.id,
            Record::Lot(r) => &r.id,
            Record::Serial(r) => &r.serial,
            Record::Binding(r) => &r.id,
            Record::Module(r) => &r.id,
            Record::Pack(r) => &r.id,
            Record::TestRun(r) => &r.id,
            Record::Quarantine(r) => &r.id,
            Record::Claim(r) => &r.id,
        }
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.kind(), self.id())
    }

    /// Status label used by [`ListFilter::status`]
    pub fn status_label(&self) -> Option<String> {
        match self {
            Record::Blueprint(r) => Some(r.status.to_string()),
            Record::Lot(r) => Some(r.status.to_string()),
            Record::Serial(r) => Some(r.status.to_string()),
            Record::Binding(r) => Some(if r.is_open() { "OPEN" } else { "RELEASED" }.to_string()),
            Record::Module(r) => Some(r.status.to_string()),
            Record::Pack(r) => Some(r.status.to_string()),
            Record::TestRun(r) => Some(r.aggregate.to_string()),
            Record::Quarantine(r) => Some(if r.is_open() { "OPEN" } else { "RELEASED" }.to_string()),
            Record::Claim(_) => None,
        }
    }

    /// Owning record id used by [`ListFilter::parent`] (the "batch")
    pub fn parent_id(&self) -> Option<&str> {
        match self {
            Record::Blueprint(_) | Record::Lot(_) => None,
            Record::Serial(r) => Some(&r.lot_id),
            Record::Binding(r) => Some(&r.module_id),
            Record::Module(r) => Some(&r.blueprint_id),
            Record::Pack(r) => Some(&r.blueprint_id),
            Record::TestRun(r) => Some(&r.pack_id),
            Record::Quarantine(r) => Some(&r.pack_id),
            Record::Claim(r) => Some(&r.owner_id),
        }
    }
}

/// Entities that can be stored as a [`Record`]
pub trait StoredEntity: Clone + Send + Sync + Sized + 'static {
    const KIND: EntityKind;

    fn into_record(self) -> Record;
    fn from_record(record: Record) -> Option<Self>;
}

macro_rules! stored_entity {
    ($ty:ty, $variant:ident) => {
        impl StoredEntity for $ty {
            const KIND: EntityKind = EntityKind::$variant;

            fn into_record(self) -> Record {
                Record::$variant(self)
            }

            fn from_record(record: Record) -> Option<Self> {
                match record {
                    Record::$variant(inner) => Some(inner),
                    _ => None,
                }
            }
        }
    };
}

stored_entity!(Blueprint, Blueprint);
stored_entity!(CellLot, Lot);
stored_entity!(CellSerial, Serial);
stored_entity!(CellBinding, Binding);
stored_entity!(Module, Module);
stored_entity!(Pack, Pack);
stored_entity!(EolTestRun, TestRun);
stored_entity!(QuarantineRecord, Quarantine);
stored_entity!(IdentityClaim, Claim);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Versioned<T> {
    pub revision: u64,
    pub value: T,
}

impl<T> Versioned<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Versioned<U> {
        Versioned {
            revision: self.revision,
            value: f(self.value),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListFilter {
    pub status: Option<String>,
    pub parent: Option<String>,
}

impl ListFilter {
    pub fn by_status(status: impl fmt::Display) -> Self {
        Self {
            status: Some(status.to_string()),
            parent: None,
        }
    }

    pub fn by_parent(parent: impl Into<String>) -> Self {
        Self {
            status: None,
            parent: Some(parent.into()),
        }
    }

    pub fn matches(&self, record: &Record) -> bool {
        let status_ok = match &self.status {
            Some(wanted) => record
                .status_label()
                .map_or(false, |s| s.eq_ignore_ascii_case(wanted)),
            None => true,
        };
        let parent_ok = match &self.parent {
            Some(wanted) => record.parent_id() == Some(wanted.as_str()),
            None => true,
        };
        status_ok && parent_ok
    }
}

/// Write precondition checked at commit time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expect {
    /// Record must not exist yet
    Absent,
    /// Stored revision must still equal this value
    Revision(u64),
}

#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    puts: Vec<(Record, Expect)>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<T: StoredEntity>(&mut self, value: T) -> &mut Self {
        self.puts.push((value.into_record(), Expect::Absent));
        self
    }

    pub fn update<T: StoredEntity>(&mut self, value: T, revision: u64) -> &mut Self {
        self.puts
            .push((value.into_record(), Expect::Revision(revision)));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.puts.is_empty()
    }

    pub fn len(&self) -> usize {
        self.puts.len()
    }

    pub fn into_puts(self) -> Vec<(Record, Expect)> {
        self.puts
    }
}

/// Storage provider consumed by the engine. Implementations must give at
/// least read-your-writes consistency and apply a [`ChangeSet`] atomically.
#[async_trait]
pub trait TraceabilityStore: Send + Sync {
    async fn get(&self, key: &EntityKey) -> ServiceResult<Option<Versioned<Record>>>;

    async fn list(&self, kind: EntityKind, filter: &ListFilter)
        -> ServiceResult<Vec<Versioned<Record>>>;

    /// Applies every put or none; a stale expectation fails with
    /// `ConcurrentModification`.
    async fn commit(&self, changes: ChangeSet) -> ServiceResult<()>;

    /// Monotonic counter, starting at 1 per name
    async fn next_sequence(&self, name: &str) -> ServiceResult<u64>;
}

/// Typed lookup by id
pub async fn fetch<T: StoredEntity>(
    store: &dyn TraceabilityStore,
    id: &str,
) -> ServiceResult<Option<Versioned<T>>> {
    let key = EntityKey::new(T::KIND, id);
    match store.get(&key).await? {
        Some(found) => {
            let revision = found.revision;
            T::from_record(found.value)
                .map(|value| Some(Versioned { revision, value }))
                .ok_or_else(|| {
                    ServiceError::StorageError(format!("record {} has unexpected kind", key))
                })
        }
        None => Ok(None),
    }
}

/// Typed lookup that maps absence to `NotFound`
pub async fn require<T: StoredEntity>(
    store: &dyn TraceabilityStore,
    id: &str,
) -> ServiceResult<Versioned<T>> {
    fetch::<T>(store, id)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("{} {}", T::KIND, id)))
}

pub async fn list_typed<T: StoredEntity>(
    store: &dyn TraceabilityStore,
    filter: &ListFilter,
) -> ServiceResult<Vec<Versioned<T>>> {
    store
        .list(T::KIND, filter)
        .await?
        .into_iter()
        .map(|found| {
            let revision = found.revision;
            T::from_record(found.value)
                .map(|value| Versioned { revision, value })
                .ok_or_else(|| {
                    ServiceError::StorageError(format!("{} listing returned foreign record", T::KIND))
                })
        })
        .collect()
}
