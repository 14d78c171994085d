use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::core::error::RecordStorageError;

use super::{CatalogEntry, CatalogStore, CatalogUpdate, NewCatalogEntry};

/// In-memory catalog table for tests and local development.
pub struct InMemoryCatalogStore {
    /// Rows keyed by external id.
    rows: RwLock<BTreeMap<String, CatalogEntry>>,
    failing_ids: RwLock<HashSet<String>>,
    write_calls: AtomicUsize,
}

impl InMemoryCatalogStore {
    pub fn new() -> Self {
        Self {
            rows: RwLock::new(BTreeMap::new()),
            failing_ids: RwLock::new(HashSet::new()),
            write_calls: AtomicUsize::new(0),
        }
    }

    /// Make every lookup and write for `external_id` fail.
    pub async fn fail_for(&self, external_id: &str) {
        self.failing_ids.write().await.insert(external_id.to_string());
    }

    pub async fn entries(&self) -> Vec<CatalogEntry> {
        self.rows.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.read().await.is_empty()
    }

    /// Number of insert and update calls that reached the table.
    pub fn write_calls(&self) -> usize {
        self.write_calls.load(Ordering::SeqCst)
    }

    async fn check_failure(&self, external_id: &str) -> Result<(), RecordStorageError> {
        if self.failing_ids.read().await.contains(external_id) {
            return Err(RecordStorageError::Backend(format!(
                "simulated storage failure for {external_id}"
            )));
        }
        Ok(())
    }
}

impl Default for InMemoryCatalogStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CatalogStore for InMemoryCatalogStore {
    async fn find_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<CatalogEntry>, RecordStorageError> {
        self.check_failure(external_id).await?;
        Ok(self.rows.read().await.get(external_id).cloned())
    }

    async fn insert(&self, entry: NewCatalogEntry) -> Result<CatalogEntry, RecordStorageError> {
        self.check_failure(&entry.external_id).await?;
        self.write_calls.fetch_add(1, Ordering::SeqCst);

        let mut rows = self.rows.write().await;
        if rows.contains_key(&entry.external_id) {
            return Err(RecordStorageError::Rejected {
                status: 409,
                message: format!("duplicate external id {}", entry.external_id),
            });
        }
        let row = entry.into_entry(Uuid::new_v4().to_string());
        rows.insert(row.external_id.clone(), row.clone());
        Ok(row)
    }

    async fn update(
        &self,
        external_id: &str,
        update: CatalogUpdate,
    ) -> Result<(), RecordStorageError> {
        self.check_failure(external_id).await?;
        self.write_calls.fetch_add(1, Ordering::SeqCst);

        let mut rows = self.rows.write().await;
        // Same as an UPDATE ... WHERE that matches nothing.
        if let Some(row) = rows.get_mut(external_id) {
            update.apply_to(row);
        }
        Ok(())
    }
}
