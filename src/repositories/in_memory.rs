use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::{ChangeSet, EntityKey, EntityKind, Expect, ListFilter, Record, TraceabilityStore, Versioned};
use crate::errors::{ServiceError, ServiceResult};

type Table = BTreeMap<String, Versioned<Record>>;

/// Default persistence provider: versioned records behind one async RwLock.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    tables: RwLock<HashMap<EntityKind, Table>>,
    sequences: DashMap<String, u64>,
    unavailable: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates an outage; every call fails with `StorageError` while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> ServiceResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(ServiceError::StorageError(
                "in-memory store marked unavailable".to_string(),
            ))
        } else {
            Ok(())
        }
    }

    pub async fn len(&self, kind: EntityKind) -> usize {
        self.tables
            .read()
            .await
            .get(&kind)
            .map_or(0, BTreeMap::len)
    }
}

#[async_trait]
impl TraceabilityStore for InMemoryStore {
    async fn get(&self, key: &EntityKey) -> ServiceResult<Option<Versioned<Record>>> {
        self.ensure_available()?;
        let tables = self.tables.read().await;
        Ok(tables
            .get(&key.kind)
            .and_then(|table| table.get(&key.id))
            .cloned())
    }

    async fn list(
        &self,
        kind: EntityKind,
        filter: &ListFilter,
    ) -> ServiceResult<Vec<Versioned<Record>>> {
        self.ensure_available()?;
        let tables = self.tables.read().await;
        Ok(tables
            .get(&kind)
            .map(|table| {
                table
                    .values()
                    .filter(|v| filter.matches(&v.value))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn commit(&self, changes: ChangeSet) -> ServiceResult<()> {
        self.ensure_available()?;
        let puts = changes.into_puts();
        if puts.is_empty() {
            return Ok(());
        }

        let mut tables = self.tables.write().await;

        // Validate every expectation before touching anything.
        let mut next_revisions = Vec::with_capacity(puts.len());
        for (record, expect) in &puts {
            let key = record.key();
            let current = tables
                .get(&key.kind)
                .and_then(|t| t.get(&key.id))
                .map(|v| v.revision);

            let next = match (expect, current) {
                (Expect::Absent, None) => 1,
                (Expect::Revision(expected), Some(actual)) if *expected == actual => actual + 1,
                (Expect::Absent, Some(_)) => {
                    warn!(key = %key, "Commit rejected: record already exists");
                    return Err(ServiceError::ConcurrentModification(format!(
                        "{} already exists",
                        key
                    )));
                }
                (Expect::Revision(expected), actual) => {
                    warn!(key = %key, expected, ?actual, "Commit rejected: stale revision");
                    return Err(ServiceError::ConcurrentModification(format!(
                        "{} changed since revision {}",
                        key, expected
                    )));
                }
            };
            next_revisions.push(next);
        }

        let count = puts.len();
        for ((record, _), revision) in puts.into_iter().zip(next_revisions) {
            let key = record.key();
            tables.entry(key.kind).or_default().insert(
                key.id,
                Versioned {
                    revision,
                    value: record,
                },
            );
        }

        debug!(records = count, "Change set committed");
        Ok(())
    }

    async fn next_sequence(&self, name: &str) -> ServiceResult<u64> {
        self.ensure_available()?;
        let mut entry = self.sequences.entry(name.to_string()).or_insert(0);
        *entry += 1;
        Ok(*entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::manufacturing::{ClaimNamespace, IdentityClaim};
    use crate::repositories::{fetch, ChangeSet};
    use assert_matches::assert_matches;
    use chrono::Utc;

    fn claim(value: &str, owner: &str) -> IdentityClaim {
        IdentityClaim::new(ClaimNamespace::BmsId, value, owner, "tester", Utc::now())
    }

    #[tokio::test]
    async fn insert_then_update_bumps_revision() {
        let store = InMemoryStore::new();
        let mut cs = ChangeSet::new();
        cs.insert(claim("B1", "P1"));
        store.commit(cs).await.unwrap();

        let stored = fetch::<IdentityClaim>(&store, "bms_id:B1").await.unwrap().unwrap();
        assert_eq!(stored.revision, 1);

        let mut cs = ChangeSet::new();
        cs.update(claim("B1", "P2"), stored.revision);
        store.commit(cs).await.unwrap();

        let stored = fetch::<IdentityClaim>(&store, "bms_id:B1").await.unwrap().unwrap();
        assert_eq!(stored.revision, 2);
        assert_eq!(stored.value.owner_id, "P2");
    }

    #[tokio::test]
    async fn stale_change_set_applies_nothing() {
        let store = InMemoryStore::new();
        let mut cs = ChangeSet::new();
        cs.insert(claim("B1", "P1"));
        store.commit(cs).await.unwrap();

        let mut cs = ChangeSet::new();
        cs.insert(claim("B2", "P2"));
        cs.insert(claim("B1", "P3"));
        assert_matches!(
            store.commit(cs).await,
            Err(ServiceError::ConcurrentModification(_))
        );
        assert!(fetch::<IdentityClaim>(&store, "bms_id:B2").await.unwrap().is_none());
        assert_eq!(store.len(EntityKind::Claim).await, 1);
    }

    #[tokio::test]
    async fn sequences_are_monotonic_per_name() {
        let store = InMemoryStore::new();
        assert_eq!(store.next_sequence("a").await.unwrap(), 1);
        assert_eq!(store.next_sequence("a").await.unwrap(), 2);
        assert_eq!(store.next_sequence("b").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn outage_is_a_storage_error() {
        let store = InMemoryStore::new();
        store.set_unavailable(true);
        let err = store.next_sequence("a").await.unwrap_err();
        assert!(err.kind().is_fatal());
    }

    #[tokio::test]
    async fn list_filters_by_parent() {
        let store = InMemoryStore::new();
        let mut cs = ChangeSet::new();
        cs.insert(claim("B1", "P1")).insert(claim("B2", "P2"));
        store.commit(cs).await.unwrap();

        let found = store
            .list(EntityKind::Claim, &ListFilter::by_parent("P2"))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].value.id(), "bms_id:B2");
    }
}
