//! Persistence layer.
//!
//! The snapshot store is the single owner of cached league state. Every
//! entity is held as a JSON payload keyed by `(entity_type, key)` together
//! with the time it was fetched. Two implementations are provided:
//! [`MemoryStore`] for tests and one-shot runs, and [`JsonFileStore`] which
//! writes the whole snapshot through to a JSON file.
//!
//! Concurrent upserts are linearized per store; for any single key the
//! entity with the latest `fetched_at` wins regardless of arrival order.

pub mod file;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use tracing::debug;

use crate::types::{Entity, EntityType, Staleness, StoreError};

pub use file::JsonFileStore;

// ---------------------------------------------------------------------------
// Store contract
// ---------------------------------------------------------------------------

/// What an upsert did to the stored entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// No entity existed under this key.
    Inserted,
    /// A prior entity was replaced.
    Replaced,
    /// Identical payload and timestamp were already stored.
    Unchanged,
    /// A newer entity is already stored; the incoming one was ignored.
    Superseded,
}

impl UpsertOutcome {
    pub fn changed(&self) -> bool {
        matches!(self, UpsertOutcome::Inserted | UpsertOutcome::Replaced)
    }
}

/// Narrow interface over the local cache. Never touches the network.
pub trait SnapshotStore: Send + Sync {
    /// Look up one entity.
    fn get(&self, entity_type: EntityType, key: &str) -> Result<Option<Entity>, StoreError>;

    /// Replace the payload stored under `(entity_type, key)`.
    ///
    /// An entity with a later `fetched_at` than the incoming one is kept.
    fn upsert(
        &self,
        entity_type: EntityType,
        key: &str,
        payload: serde_json::Value,
        fetched_at: DateTime<Utc>,
    ) -> Result<UpsertOutcome, StoreError>;

    /// Upsert a batch of entities. Implementations may persist once per batch.
    fn upsert_many(&self, entities: Vec<Entity>) -> Result<Vec<UpsertOutcome>, StoreError> {
        entities
            .into_iter()
            .map(|e| self.upsert(e.entity_type, &e.key, e.payload, e.fetched_at))
            .collect()
    }

    /// Every entity of one type as of this call. Later upserts are not
    /// reflected in the returned scan.
    fn all(&self, entity_type: EntityType) -> Result<EntityScan, StoreError>;

    /// Time since the entity was fetched, or `Unknown` if it is absent.
    fn staleness(
        &self,
        entity_type: EntityType,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<Staleness, StoreError> {
        Ok(match self.get(entity_type, key)? {
            Some(entity) => Staleness::Known(entity.age(now)),
            None => Staleness::Unknown,
        })
    }
}

/// Typed helpers layered over any [`SnapshotStore`].
pub trait SnapshotStoreExt: SnapshotStore {
    /// Fetch and decode one entity, returning it with its `fetched_at`.
    fn get_typed<T: DeserializeOwned>(
        &self,
        entity_type: EntityType,
        key: &str,
    ) -> Result<Option<(T, DateTime<Utc>)>, StoreError> {
        match self.get(entity_type, key)? {
            Some(entity) => Ok(Some((entity.decode()?, entity.fetched_at))),
            None => Ok(None),
        }
    }

    /// Serialize `value` and upsert it.
    fn put_typed<T: serde::Serialize>(
        &self,
        entity_type: EntityType,
        key: &str,
        value: &T,
        fetched_at: DateTime<Utc>,
    ) -> Result<UpsertOutcome, StoreError> {
        self.upsert(entity_type, key, serde_json::to_value(value)?, fetched_at)
    }
}

impl<S: SnapshotStore + ?Sized> SnapshotStoreExt for S {}

// ---------------------------------------------------------------------------
// Scans
// ---------------------------------------------------------------------------

/// A point-in-time view over one entity table.
///
/// Holds a shared reference to an immutable table version, so iterating is
/// lazy, can be restarted any number of times, and is unaffected by upserts
/// made after the scan was taken. Entities come out in key order.
#[derive(Debug, Clone)]
pub struct EntityScan {
    table: Arc<BTreeMap<String, Entity>>,
}

impl EntityScan {
    pub fn empty() -> Self {
        Self {
            table: Arc::new(BTreeMap::new()),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entity> + '_ {
        self.table.values()
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Decode every entity in the scan.
    pub fn decode_all<T: DeserializeOwned>(&self) -> Result<Vec<(T, DateTime<Utc>)>, StoreError> {
        self.iter()
            .map(|e| e.decode().map(|v| (v, e.fetched_at)))
            .collect()
    }
}

impl<'a> IntoIterator for &'a EntityScan {
    type Item = &'a Entity;
    type IntoIter = std::collections::btree_map::Values<'a, String, Entity>;

    fn into_iter(self) -> Self::IntoIter {
        self.table.values()
    }
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

type Table = Arc<BTreeMap<String, Entity>>;

/// In-memory snapshot store.
///
/// Tables are copy-on-write: an upsert clones a table only while a scan of
/// it is still alive.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<HashMap<EntityType, Table>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of entities across all tables.
    pub fn len(&self) -> Result<usize, StoreError> {
        let tables = self.tables.read().map_err(|_| StoreError::Poisoned)?;
        Ok(tables.values().map(|t| t.len()).sum())
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }

    /// Every entity in the store, ordered by type then key.
    pub fn entries(&self) -> Result<Vec<Entity>, StoreError> {
        let tables = self.tables.read().map_err(|_| StoreError::Poisoned)?;
        let mut out = Vec::new();
        for entity_type in EntityType::ALL {
            if let Some(table) = tables.get(entity_type) {
                out.extend(table.values().cloned());
            }
        }
        Ok(out)
    }

    /// Put back a previous entity (or remove the key) after a failed write.
    pub(crate) fn restore(
        &self,
        entity_type: EntityType,
        key: &str,
        previous: Option<Entity>,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.write().map_err(|_| StoreError::Poisoned)?;
        let table = Arc::make_mut(tables.entry(entity_type).or_default());
        match previous {
            Some(entity) => {
                table.insert(key.to_string(), entity);
            }
            None => {
                table.remove(key);
            }
        }
        Ok(())
    }
}

impl SnapshotStore for MemoryStore {
    fn get(&self, entity_type: EntityType, key: &str) -> Result<Option<Entity>, StoreError> {
        let tables = self.tables.read().map_err(|_| StoreError::Poisoned)?;
        Ok(tables.get(&entity_type).and_then(|t| t.get(key)).cloned())
    }

    fn upsert(
        &self,
        entity_type: EntityType,
        key: &str,
        payload: serde_json::Value,
        fetched_at: DateTime<Utc>,
    ) -> Result<UpsertOutcome, StoreError> {
        let mut tables = self.tables.write().map_err(|_| StoreError::Poisoned)?;
        let table = tables.entry(entity_type).or_default();

        let outcome = match table.get(key) {
            None => UpsertOutcome::Inserted,
            Some(existing) if existing.fetched_at > fetched_at => {
                debug!(
                    entity_type = %entity_type,
                    key,
                    stored = %existing.fetched_at,
                    incoming = %fetched_at,
                    "Ignoring out-of-order upsert"
                );
                return Ok(UpsertOutcome::Superseded);
            }
            Some(existing) if existing.fetched_at == fetched_at && existing.payload == payload => {
                return Ok(UpsertOutcome::Unchanged);
            }
            Some(_) => UpsertOutcome::Replaced,
        };

        Arc::make_mut(table).insert(
            key.to_string(),
            Entity {
                entity_type,
                key: key.to_string(),
                payload,
                fetched_at,
            },
        );
        Ok(outcome)
    }

    fn all(&self, entity_type: EntityType) -> Result<EntityScan, StoreError> {
        let tables = self.tables.read().map_err(|_| StoreError::Poisoned)?;
        Ok(match tables.get(&entity_type) {
            Some(table) => EntityScan {
                table: Arc::clone(table),
            },
            None => EntityScan::empty(),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;
    use std::thread;

    #[test]
    fn test_get_absent() {
        let store = MemoryStore::new();
        assert!(store.get(EntityType::Player, "p1").unwrap().is_none());
    }

    #[test]
    fn test_upsert_then_get() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let outcome = store
            .upsert(EntityType::Player, "p1", json!({"name": "A"}), now)
            .unwrap();
        assert_eq!(outcome, UpsertOutcome::Inserted);

        let entity = store.get(EntityType::Player, "p1").unwrap().unwrap();
        assert_eq!(entity.payload, json!({"name": "A"}));
        assert_eq!(entity.fetched_at, now);
    }

    #[test]
    fn test_upsert_idempotent() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.upsert(EntityType::Team, "t1", json!({"w": 1}), now).unwrap();
        let again = store.upsert(EntityType::Team, "t1", json!({"w": 1}), now).unwrap();
        assert_eq!(again, UpsertOutcome::Unchanged);
        assert_eq!(store.len().unwrap(), 1);
    }

    #[test]
    fn test_latest_fetched_at_wins_regardless_of_order() {
        let store = MemoryStore::new();
        let t0 = Utc::now();
        let t1 = t0 + Duration::seconds(10);
        let t2 = t0 + Duration::seconds(20);

        store.upsert(EntityType::Roster, "t.1", json!({"v": 1}), t1).unwrap();
        store.upsert(EntityType::Roster, "t.1", json!({"v": 2}), t2).unwrap();
        // A slow fetch that started earlier completes last.
        let late = store.upsert(EntityType::Roster, "t.1", json!({"v": 0}), t0).unwrap();
        assert_eq!(late, UpsertOutcome::Superseded);

        let entity = store.get(EntityType::Roster, "t.1").unwrap().unwrap();
        assert_eq!(entity.payload, json!({"v": 2}));
        assert_eq!(entity.fetched_at, t2);
    }

    #[test]
    fn test_same_timestamp_different_payload_replaces() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.upsert(EntityType::Team, "t1", json!({"w": 1}), now).unwrap();
        let outcome = store.upsert(EntityType::Team, "t1", json!({"w": 2}), now).unwrap();
        assert_eq!(outcome, UpsertOutcome::Replaced);
    }

    #[test]
    fn test_scan_is_snapshot_consistent() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.upsert(EntityType::Player, "a", json!(1), now).unwrap();
        store.upsert(EntityType::Player, "b", json!(2), now).unwrap();

        let scan = store.all(EntityType::Player).unwrap();
        store.upsert(EntityType::Player, "c", json!(3), now).unwrap();
        store
            .upsert(EntityType::Player, "a", json!(10), now + Duration::seconds(1))
            .unwrap();

        let keys: Vec<&str> = scan.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["a", "b"]);
        assert_eq!(scan.iter().next().unwrap().payload, json!(1));

        // Restartable: a second pass yields the same sequence.
        let again: Vec<&str> = scan.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, again);

        // A fresh scan sees the new state.
        assert_eq!(store.all(EntityType::Player).unwrap().len(), 3);
    }

    #[test]
    fn test_scan_of_empty_table() {
        let store = MemoryStore::new();
        let scan = store.all(EntityType::Transaction).unwrap();
        assert!(scan.is_empty());
        assert_eq!(scan.iter().count(), 0);
    }

    #[test]
    fn test_staleness() {
        let store = MemoryStore::new();
        let now = Utc::now();
        assert_eq!(
            store.staleness(EntityType::League, "l", now).unwrap(),
            Staleness::Unknown
        );

        store
            .upsert(EntityType::League, "l", json!({}), now - Duration::seconds(300))
            .unwrap();
        assert_eq!(
            store.staleness(EntityType::League, "l", now).unwrap(),
            Staleness::Known(std::time::Duration::from_secs(300))
        );
    }

    #[test]
    fn test_typed_roundtrip() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.put_typed(EntityType::Team, "t1", &vec![1u32, 2, 3], now).unwrap();
        let (value, fetched_at): (Vec<u32>, _) =
            store.get_typed(EntityType::Team, "t1").unwrap().unwrap();
        assert_eq!(value, vec![1, 2, 3]);
        assert_eq!(fetched_at, now);
    }

    #[test]
    fn test_concurrent_upserts_same_key_keep_latest() {
        let store = Arc::new(MemoryStore::new());
        let base = Utc::now();

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    store
                        .upsert(
                            EntityType::Player,
                            "shared",
                            json!({ "i": i }),
                            base + Duration::seconds(i),
                        )
                        .unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let entity = store.get(EntityType::Player, "shared").unwrap().unwrap();
        assert_eq!(entity.payload, json!({ "i": 15 }));
        assert_eq!(entity.fetched_at, base + Duration::seconds(15));
    }

    #[test]
    fn test_restore_previous() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.upsert(EntityType::Team, "t1", json!(1), now).unwrap();
        let prev = store.get(EntityType::Team, "t1").unwrap();
        store.upsert(EntityType::Team, "t1", json!(2), now + Duration::seconds(1)).unwrap();
        store.restore(EntityType::Team, "t1", prev).unwrap();
        assert_eq!(store.get(EntityType::Team, "t1").unwrap().unwrap().payload, json!(1));

        store.restore(EntityType::Team, "t1", None).unwrap();
        assert!(store.get(EntityType::Team, "t1").unwrap().is_none());
    }
}
