use crate::{
    error::LookupError,
    models::{PermissionRecord, Role},
    repository::{PermissionLookup, PermissionState, PermissionStore},
};
use async_trait::async_trait;
use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
};
use tokio::sync::RwLock;

/// CachedPermissionLookup
///
/// Read-through cache in front of a `PermissionStore`. Both hits and confirmed
/// absences are cached; lookup errors never are.
///
/// Every write through `upsert_permission` (and every explicit `invalidate`) clears
/// the map and bumps `generation` under the write lock. A miss only populates the
/// cache if the generation it observed before querying is still current, so a read
/// that raced a write cannot reinsert the pre-write record.
pub struct CachedPermissionLookup {
    inner: PermissionState,
    entries: RwLock<HashMap<(Role, String), Option<PermissionRecord>>>,
    generation: AtomicU64,
}

impl CachedPermissionLookup {
    pub fn new(inner: PermissionState) -> Self {
        Self {
            inner,
            entries: RwLock::new(HashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    /// Drops every cached entry. Call after changing the backing store out of band.
    pub async fn invalidate(&self) {
        let mut entries = self.entries.write().await;
        self.generation.fetch_add(1, Ordering::AcqRel);
        entries.clear();
    }

    pub async fn cached_entries(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[async_trait]
impl PermissionLookup for CachedPermissionLookup {
    async fn find_permission(
        &self,
        role: Role,
        entity: &str,
    ) -> Result<Option<PermissionRecord>, LookupError> {
        let key = (role, entity.to_string());
        if let Some(hit) = self.entries.read().await.get(&key) {
            return Ok(hit.clone());
        }

        let observed = self.generation.load(Ordering::Acquire);
        let record = self.inner.find_permission(role, entity).await?;

        let mut entries = self.entries.write().await;
        if self.generation.load(Ordering::Acquire) == observed {
            entries.insert(key, record.clone());
        }
        Ok(record)
    }
}

#[async_trait]
impl PermissionStore for CachedPermissionLookup {
    async fn list_permissions(&self) -> Result<Vec<PermissionRecord>, LookupError> {
        self.inner.list_permissions().await
    }

    async fn upsert_permission(
        &self,
        record: PermissionRecord,
    ) -> Result<PermissionRecord, LookupError> {
        let result = self.inner.upsert_permission(record).await;
        // A failed write may still have reached the store.
        self.invalidate().await;
        result
    }
}
