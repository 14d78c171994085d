pub mod memory;
pub mod postgrest;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::config::CatalogConfig;
use crate::core::error::RecordStorageError;

/// One synchronized audio object as persisted in the catalog table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    /// Storage-assigned primary key.
    pub id: String,
    /// The object's etag; unique per synchronized object.
    pub external_id: String,
    pub title: String,
    pub artist: String,
    pub audio_url: String,
    pub file_name: String,
    pub size_bytes: u64,
    pub duration_seconds: u32,
    pub album: String,
    pub genre: String,
    pub cover_url: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A row to insert. The store assigns `id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewCatalogEntry {
    pub external_id: String,
    pub title: String,
    pub artist: String,
    pub audio_url: String,
    pub file_name: String,
    pub size_bytes: u64,
    pub duration_seconds: u32,
    pub album: String,
    pub genre: String,
    pub cover_url: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl NewCatalogEntry {
    pub fn into_entry(self, id: String) -> CatalogEntry {
        CatalogEntry {
            id,
            external_id: self.external_id,
            title: self.title,
            artist: self.artist,
            audio_url: self.audio_url,
            file_name: self.file_name,
            size_bytes: self.size_bytes,
            duration_seconds: self.duration_seconds,
            album: self.album,
            genre: self.genre,
            cover_url: self.cover_url,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// The mutable fields overwritten when an existing entry is seen again.
///
/// Album, genre and cover are left alone so manual edits survive a re-sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogUpdate {
    pub title: String,
    pub artist: String,
    pub audio_url: String,
    pub file_name: String,
    pub size_bytes: u64,
    pub duration_seconds: u32,
    pub updated_at: DateTime<Utc>,
}

impl CatalogUpdate {
    pub fn apply_to(&self, entry: &mut CatalogEntry) {
        entry.title = self.title.clone();
        entry.artist = self.artist.clone();
        entry.audio_url = self.audio_url.clone();
        entry.file_name = self.file_name.clone();
        entry.size_bytes = self.size_bytes;
        entry.duration_seconds = self.duration_seconds;
        entry.updated_at = self.updated_at;
    }
}

/// Placeholder values for fields the bucket cannot supply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogDefaults {
    pub album: String,
    pub genre: String,
    pub cover_url: String,
}

impl CatalogDefaults {
    pub fn from_config(config: &CatalogConfig) -> Self {
        Self {
            album: config.default_album.clone(),
            genre: config.default_genre.clone(),
            cover_url: config.default_cover_url.clone(),
        }
    }
}

impl Default for CatalogDefaults {
    fn default() -> Self {
        Self {
            album: "Unknown Album".to_string(),
            genre: "Unknown".to_string(),
            cover_url: "/placeholder.svg".to_string(),
        }
    }
}

/// Record storage for the catalog table.
///
/// Lookups and writes are keyed by the external id. Implementations must
/// reject a second insert for an external id that already exists.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn find_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<CatalogEntry>, RecordStorageError>;

    async fn insert(&self, entry: NewCatalogEntry) -> Result<CatalogEntry, RecordStorageError>;

    async fn update(
        &self,
        external_id: &str,
        update: CatalogUpdate,
    ) -> Result<(), RecordStorageError>;
}
