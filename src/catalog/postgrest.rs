use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::core::config::CatalogConfig;
use crate::core::error::RecordStorageError;
use crate::core::redact::Redacted;

use super::{CatalogDefaults, CatalogEntry, CatalogStore, CatalogUpdate, NewCatalogEntry};

/// Catalog table behind a PostgREST-style REST API (the hosted database).
///
/// Rows are addressed with `backblaze_file_id=eq.<external id>` filters.
pub struct PostgrestCatalogStore {
    client: Client,
    table_url: String,
    service_key: Redacted<String>,
    defaults: CatalogDefaults,
}

/// Column layout of the `music_files` table.
#[derive(Debug, Deserialize)]
struct MusicFileRow {
    id: serde_json::Value,
    backblaze_file_id: String,
    title: String,
    artist: String,
    audio_url: String,
    backblaze_file_name: Option<String>,
    file_size: Option<i64>,
    duration: Option<i64>,
    album: Option<String>,
    genre: Option<String>,
    cover_url: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct InsertRow<'a> {
    backblaze_file_id: &'a str,
    backblaze_file_name: &'a str,
    title: &'a str,
    artist: &'a str,
    audio_url: &'a str,
    file_size: u64,
    duration: u32,
    album: &'a str,
    genre: &'a str,
    cover_url: &'a str,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct UpdateRow<'a> {
    title: &'a str,
    artist: &'a str,
    audio_url: &'a str,
    backblaze_file_name: &'a str,
    file_size: u64,
    duration: u32,
    updated_at: DateTime<Utc>,
}

impl PostgrestCatalogStore {
    pub fn new(config: &CatalogConfig, request_timeout: Duration) -> Result<Self, RecordStorageError> {
        let client = Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            client,
            table_url: format!("{}/rest/v1/{}", config.url.trim_end_matches('/'), config.table),
            service_key: Redacted::new(config.service_key.clone()),
            defaults: CatalogDefaults::from_config(config),
        })
    }

    fn auth_headers(&self) -> Result<HeaderMap, RecordStorageError> {
        let key = self.service_key.expose();
        let invalid = |_| RecordStorageError::Backend("service key is not a valid header value".to_string());

        let mut headers = HeaderMap::new();
        headers.insert("apikey", HeaderValue::from_str(key).map_err(invalid)?);
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {key}")).map_err(invalid)?,
        );
        Ok(headers)
    }

    fn filter(external_id: &str) -> [(&'static str, String); 1] {
        [("backblaze_file_id", format!("eq.{external_id}"))]
    }

    fn row_to_entry(&self, row: MusicFileRow) -> CatalogEntry {
        let id = match row.id {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        };
        CatalogEntry {
            id,
            file_name: row.backblaze_file_name.unwrap_or_default(),
            external_id: row.backblaze_file_id,
            title: row.title,
            artist: row.artist,
            audio_url: row.audio_url,
            size_bytes: row.file_size.unwrap_or(0).max(0) as u64,
            duration_seconds: row.duration.unwrap_or(0).clamp(0, u32::MAX as i64) as u32,
            album: row.album.unwrap_or_else(|| self.defaults.album.clone()),
            genre: row.genre.unwrap_or_else(|| self.defaults.genre.clone()),
            cover_url: row.cover_url.unwrap_or_else(|| self.defaults.cover_url.clone()),
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

/// Turn a non-success response into `Rejected`, keeping the server's message.
async fn check_status(response: Response) -> Result<Response, RecordStorageError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    error!(status = status.as_u16(), message = %message, "record storage request rejected");
    Err(RecordStorageError::Rejected {
        status: status.as_u16(),
        message,
    })
}

async fn parse_rows(response: Response) -> Result<Vec<MusicFileRow>, RecordStorageError> {
    response
        .json::<Vec<MusicFileRow>>()
        .await
        .map_err(|e| RecordStorageError::Malformed {
            reason: e.to_string(),
        })
}

#[async_trait]
impl CatalogStore for PostgrestCatalogStore {
    async fn find_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<CatalogEntry>, RecordStorageError> {
        debug!(external_id, "looking up catalog entry");
        let response = self
            .client
            .get(&self.table_url)
            .headers(self.auth_headers()?)
            .query(&[("select", "*".to_string())])
            .query(&Self::filter(external_id))
            .send()
            .await?;

        let rows = parse_rows(check_status(response).await?).await?;
        Ok(rows.into_iter().next().map(|row| self.row_to_entry(row)))
    }

    async fn insert(&self, entry: NewCatalogEntry) -> Result<CatalogEntry, RecordStorageError> {
        let body = InsertRow {
            backblaze_file_id: &entry.external_id,
            backblaze_file_name: &entry.file_name,
            title: &entry.title,
            artist: &entry.artist,
            audio_url: &entry.audio_url,
            file_size: entry.size_bytes,
            duration: entry.duration_seconds,
            album: &entry.album,
            genre: &entry.genre,
            cover_url: &entry.cover_url,
            created_at: entry.created_at,
            updated_at: entry.updated_at,
        };

        let response = self
            .client
            .post(&self.table_url)
            .headers(self.auth_headers()?)
            .header("Prefer", "return=representation")
            .json(&[body])
            .send()
            .await?;

        let rows = parse_rows(check_status(response).await?).await?;
        rows.into_iter()
            .next()
            .map(|row| self.row_to_entry(row))
            .ok_or_else(|| RecordStorageError::Malformed {
                reason: "insert returned no rows".to_string(),
            })
    }

    async fn update(
        &self,
        external_id: &str,
        update: CatalogUpdate,
    ) -> Result<(), RecordStorageError> {
        let body = UpdateRow {
            title: &update.title,
            artist: &update.artist,
            audio_url: &update.audio_url,
            backblaze_file_name: &update.file_name,
            file_size: update.size_bytes,
            duration: update.duration_seconds,
            updated_at: update.updated_at,
        };

        let response = self
            .client
            .patch(&self.table_url)
            .headers(self.auth_headers()?)
            .query(&Self::filter(external_id))
            .json(&body)
            .send()
            .await?;

        check_status(response).await?;
        Ok(())
    }
}
