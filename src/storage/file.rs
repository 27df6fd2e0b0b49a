//! JSON-file snapshot store.
//!
//! Keeps the authoritative copy in a [`MemoryStore`] and writes the whole
//! snapshot through to disk on every change. Writes go to a temporary file
//! that is renamed over the target, so a crash mid-write leaves the
//! previous snapshot intact. If the write fails the in-memory change is
//! rolled back and the error is returned.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info};

use super::{EntityScan, MemoryStore, SnapshotStore, UpsertOutcome};
use crate::types::{Entity, EntityType, StoreError};

/// On-disk layout version.
const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct PersistedSnapshot {
    version: u32,
    saved_at: DateTime<Utc>,
    entries: Vec<Entity>,
}

/// Snapshot store backed by a single JSON file.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    inner: MemoryStore,
    /// Serialises write-through so file contents follow upsert order.
    write_lock: Mutex<()>,
}

impl JsonFileStore {
    /// Open the store, loading an existing snapshot if the file exists.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let inner = MemoryStore::new();

        if path.exists() {
            let bytes = std::fs::read(&path).map_err(|source| StoreError::Io {
                path: path.display().to_string(),
                source,
            })?;
            let snapshot: PersistedSnapshot = serde_json::from_slice(&bytes)?;
            let count = snapshot.entries.len();
            for entity in snapshot.entries {
                inner.upsert(entity.entity_type, &entity.key, entity.payload, entity.fetched_at)?;
            }
            info!(
                path = %path.display(),
                entities = count,
                saved_at = %snapshot.saved_at,
                "Snapshot loaded from disk"
            );
        } else {
            info!(path = %path.display(), "No saved snapshot found, starting fresh");
        }

        Ok(Self {
            path,
            inner,
            write_lock: Mutex::new(()),
        })
    }

    /// Delete the snapshot file (for testing or reset).
    pub fn delete(path: impl AsRef<Path>) -> Result<(), StoreError> {
        let path = path.as_ref();
        if path.exists() {
            std::fs::remove_file(path).map_err(|source| StoreError::Io {
                path: path.display().to_string(),
                source,
            })?;
        }
        Ok(())
    }

    fn persist(&self) -> Result<(), StoreError> {
        let io_err = |source| StoreError::Io {
            path: self.path.display().to_string(),
            source,
        };

        let snapshot = PersistedSnapshot {
            version: SNAPSHOT_VERSION,
            saved_at: Utc::now(),
            entries: self.inner.entries()?,
        };
        let json = serde_json::to_vec_pretty(&snapshot)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let tmp = self
            .path
            .with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple()));
        std::fs::write(&tmp, &json).map_err(io_err)?;
        if let Err(e) = std::fs::rename(&tmp, &self.path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(io_err(e));
        }

        debug!(
            path = %self.path.display(),
            entities = snapshot.entries.len(),
            "Snapshot saved"
        );
        Ok(())
    }
}

impl SnapshotStore for JsonFileStore {
    fn get(&self, entity_type: EntityType, key: &str) -> Result<Option<Entity>, StoreError> {
        self.inner.get(entity_type, key)
    }

    fn upsert(
        &self,
        entity_type: EntityType,
        key: &str,
        payload: serde_json::Value,
        fetched_at: DateTime<Utc>,
    ) -> Result<UpsertOutcome, StoreError> {
        self.upsert_many(vec![Entity {
            entity_type,
            key: key.to_string(),
            payload,
            fetched_at,
        }])
        .map(|mut outcomes| outcomes.pop().unwrap_or(UpsertOutcome::Unchanged))
    }

    fn upsert_many(&self, entities: Vec<Entity>) -> Result<Vec<UpsertOutcome>, StoreError> {
        let _guard = self.write_lock.lock().map_err(|_| StoreError::Poisoned)?;

        let mut outcomes = Vec::with_capacity(entities.len());
        let mut undo: Vec<(EntityType, String, Option<Entity>)> = Vec::new();

        for entity in entities {
            let previous = self.inner.get(entity.entity_type, &entity.key)?;
            let outcome =
                self.inner
                    .upsert(entity.entity_type, &entity.key, entity.payload, entity.fetched_at)?;
            if outcome.changed() {
                undo.push((entity.entity_type, entity.key, previous));
            }
            outcomes.push(outcome);
        }

        if undo.is_empty() {
            return Ok(outcomes);
        }

        if let Err(e) = self.persist() {
            for (entity_type, key, previous) in undo.into_iter().rev() {
                self.inner.restore(entity_type, &key, previous)?;
            }
            return Err(e);
        }
        Ok(outcomes)
    }

    fn all(&self, entity_type: EntityType) -> Result<EntityScan, StoreError> {
        self.inner.all(entity_type)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
