pub mod duration;
pub mod metadata;
pub mod report;

use std::sync::Arc;
use std::time::Instant;

use futures::{stream, StreamExt, TryStreamExt};
use tracing::{error, info, warn};

use crate::catalog::{CatalogDefaults, CatalogStore, CatalogUpdate, NewCatalogEntry};
use crate::core::clock::Clock;
use crate::core::error::{RecordStorageError, SyncError};
use crate::observability::metrics as obs;
use crate::storage::{list_all, object_url, ObjectLister, RemoteObject};

use self::duration::{BitrateEstimator, DurationEstimator};
use self::metadata::{derive_metadata, is_audio_key, TrackMetadata};
use self::report::{SyncItem, SyncReport};

pub const NOT_AUDIO_REASON: &str = "not recognized as audio";

enum Upserted {
    Added,
    Updated,
}

/// Reconciles bucket contents into the catalog table.
///
/// The whole listing is collected before any row is written, so a listing
/// failure leaves the catalog untouched. After that, each object is handled
/// on its own: a storage error for one object is recorded in the report and
/// the run carries on. Rows whose object disappeared are left in place.
pub struct BucketReconciler {
    lister: Arc<dyn ObjectLister>,
    catalog: Arc<dyn CatalogStore>,
    clock: Arc<dyn Clock>,
    estimator: Arc<dyn DurationEstimator>,
    public_base_url: String,
    defaults: CatalogDefaults,
    concurrency: usize,
}

impl BucketReconciler {
    pub fn new(
        lister: Arc<dyn ObjectLister>,
        catalog: Arc<dyn CatalogStore>,
        clock: Arc<dyn Clock>,
        public_base_url: impl Into<String>,
    ) -> Self {
        Self {
            lister,
            catalog,
            clock,
            estimator: Arc::new(BitrateEstimator::default()),
            public_base_url: public_base_url.into(),
            defaults: CatalogDefaults::default(),
            concurrency: 1,
        }
    }

    pub fn with_estimator(mut self, estimator: Arc<dyn DurationEstimator>) -> Self {
        self.estimator = estimator;
        self
    }

    pub fn with_defaults(mut self, defaults: CatalogDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    /// Number of objects reconciled at once (minimum 1).
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Run one full reconciliation pass.
    pub async fn synchronize(&self) -> Result<SyncReport, SyncError> {
        let started = Instant::now();
        info!("starting bucket synchronization");

        let objects: Vec<RemoteObject> = match list_all(self.lister.clone()).try_collect().await {
            Ok(objects) => objects,
            Err(e) => {
                error!(error = %e, "bucket listing failed, aborting synchronization");
                obs::record_sync_run("failed", started.elapsed().as_secs_f64());
                return Err(SyncError::Listing(e));
            }
        };
        info!(objects = objects.len(), "bucket listing complete");

        let mut report = SyncReport::default();
        let mut outcomes = stream::iter(objects)
            .map(|object| self.reconcile_object(object))
            .buffer_unordered(self.concurrency);
        while let Some(item) = outcomes.next().await {
            obs::inc_sync_item(item.status.as_str());
            report.record(item);
        }

        info!(
            processed = report.processed,
            added = report.added,
            updated = report.updated,
            skipped = report.skipped,
            errors = report.errors,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "synchronization completed"
        );
        obs::record_sync_run("completed", started.elapsed().as_secs_f64());
        Ok(report)
    }

    async fn reconcile_object(&self, object: RemoteObject) -> SyncItem {
        if !is_audio_key(&object.key) {
            info!(key = %object.key, "skipping non-audio object");
            return SyncItem::skipped(object.key, NOT_AUDIO_REASON);
        }

        let metadata = derive_metadata(&object.key);
        match self.upsert(&object, &metadata).await {
            Ok(Upserted::Added) => {
                info!(key = %object.key, external_id = %object.etag, "added catalog entry");
                SyncItem::added(object.key, metadata)
            }
            Ok(Upserted::Updated) => {
                info!(key = %object.key, external_id = %object.etag, "updated catalog entry");
                SyncItem::updated(object.key, metadata)
            }
            Err(e) => {
                warn!(key = %object.key, error = %e, "failed to reconcile object");
                SyncItem::failed(object.key, e.to_string())
            }
        }
    }

    async fn upsert(
        &self,
        object: &RemoteObject,
        metadata: &TrackMetadata,
    ) -> Result<Upserted, RecordStorageError> {
        let audio_url = object_url(&self.public_base_url, &object.key);
        let duration_seconds = self.estimator.estimate_seconds(object.size_bytes);
        let now = self.clock.now();

        if self.catalog.find_by_external_id(&object.etag).await?.is_some() {
            self.catalog
                .update(
                    &object.etag,
                    CatalogUpdate {
                        title: metadata.title.clone(),
                        artist: metadata.artist.clone(),
                        audio_url,
                        file_name: object.key.clone(),
                        size_bytes: object.size_bytes,
                        duration_seconds,
                        updated_at: now,
                    },
                )
                .await?;
            return Ok(Upserted::Updated);
        }

        self.catalog
            .insert(NewCatalogEntry {
                external_id: object.etag.clone(),
                title: metadata.title.clone(),
                artist: metadata.artist.clone(),
                audio_url,
                file_name: object.key.clone(),
                size_bytes: object.size_bytes,
                duration_seconds,
                album: self.defaults.album.clone(),
                genre: self.defaults.genre.clone(),
                cover_url: self.defaults.cover_url.clone(),
                created_at: now,
                updated_at: now,
            })
            .await?;
        Ok(Upserted::Added)
    }
}
