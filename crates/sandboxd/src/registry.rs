use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use uuid::Uuid;

use crate::error::{ServiceError, ServiceResult};
use crate::types::SandboxRecord;

type Slot = Arc<RwLock<SandboxRecord>>;

fn poisoned<T>(_: T) -> ServiceError {
    ServiceError::Internal("sandbox registry lock poisoned".into())
}

/// Concurrency-safe store of sandbox records.
///
/// The outer map lock is held only to find or insert a slot; each record
/// has its own lock, so lookups never wait on each other and transitions
/// on one record never wait on another. Every state change goes through
/// [`ContainerRegistry::transition`], which runs the caller's check and
/// mutation under that record's write lock.
#[derive(Default)]
pub struct ContainerRegistry {
    slots: RwLock<HashMap<Uuid, Slot>>,
}

impl ContainerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, id: Uuid) -> ServiceResult<Option<Slot>> {
        let slots = self.slots.read().map_err(poisoned)?;
        Ok(slots.get(&id).cloned())
    }

    pub fn insert(&self, record: SandboxRecord) -> ServiceResult<()> {
        let mut slots = self.slots.write().map_err(poisoned)?;
        if slots.contains_key(&record.id) {
            return Err(ServiceError::Internal(format!(
                "duplicate sandbox id {}",
                record.id
            )));
        }
        slots.insert(record.id, Arc::new(RwLock::new(record)));
        Ok(())
    }

    /// Point-in-time copy of one record.
    pub fn get(&self, id: Uuid) -> ServiceResult<Option<SandboxRecord>> {
        let Some(slot) = self.slot(id)? else {
            return Ok(None);
        };
        let record = slot.read().map_err(poisoned)?;
        Ok(Some(record.clone()))
    }

    /// Atomically inspect and mutate one record.
    ///
    /// `apply` sees the current record under its write lock. Returning `Err`
    /// must leave the record untouched; that is what makes a closure like
    /// "move to Running only if Ready or Idle" a compare-and-set.
    pub fn transition<T>(
        &self,
        id: Uuid,
        apply: impl FnOnce(&mut SandboxRecord) -> ServiceResult<T>,
    ) -> ServiceResult<T> {
        let slot = self
            .slot(id)?
            .ok_or_else(|| ServiceError::NotFound(id.to_string()))?;
        let mut record = slot.write().map_err(poisoned)?;
        apply(&mut record)
    }

    /// Copies of every record, including reclaimed ones awaiting purge.
    pub fn snapshot(&self) -> ServiceResult<Vec<SandboxRecord>> {
        let slots: Vec<Slot> = {
            let slots = self.slots.read().map_err(poisoned)?;
            slots.values().cloned().collect()
        };
        slots
            .iter()
            .map(|slot| -> ServiceResult<SandboxRecord> {
                Ok(slot.read().map_err(poisoned)?.clone())
            })
            .collect()
    }

    /// Drop a record entirely. Only used for reclaimed records past retention.
    pub fn remove(&self, id: Uuid) -> ServiceResult<bool> {
        let mut slots = self.slots.write().map_err(poisoned)?;
        Ok(slots.remove(&id).is_some())
    }
}
