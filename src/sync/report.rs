use serde::Serialize;

use super::metadata::TrackMetadata;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Added,
    Updated,
    Skipped,
    Error,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Added => "added",
            ItemStatus::Updated => "updated",
            ItemStatus::Skipped => "skipped",
            ItemStatus::Error => "error",
        }
    }
}

/// Outcome for one listed object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncItem {
    pub file_name: String,
    pub status: ItemStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<TrackMetadata>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SyncItem {
    pub fn added(file_name: impl Into<String>, metadata: TrackMetadata) -> Self {
        Self::with_metadata(file_name, ItemStatus::Added, metadata)
    }

    pub fn updated(file_name: impl Into<String>, metadata: TrackMetadata) -> Self {
        Self::with_metadata(file_name, ItemStatus::Updated, metadata)
    }

    pub fn skipped(file_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
            status: ItemStatus::Skipped,
            metadata: None,
            reason: Some(reason.into()),
            error: None,
        }
    }

    pub fn failed(file_name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
            status: ItemStatus::Error,
            metadata: None,
            reason: None,
            error: Some(error.into()),
        }
    }

    fn with_metadata(file_name: impl Into<String>, status: ItemStatus, metadata: TrackMetadata) -> Self {
        Self {
            file_name: file_name.into(),
            status,
            metadata: Some(metadata),
            reason: None,
            error: None,
        }
    }
}

/// Aggregate result of one reconciliation run.
///
/// Counts are only changed through [`SyncReport::record`], which keeps
/// `processed == added + updated + skipped + errors`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub processed: usize,
    pub added: usize,
    pub updated: usize,
    pub skipped: usize,
    pub errors: usize,
    pub details: Vec<SyncItem>,
}

impl SyncReport {
    pub fn record(&mut self, item: SyncItem) {
        self.processed += 1;
        match item.status {
            ItemStatus::Added => self.added += 1,
            ItemStatus::Updated => self.updated += 1,
            ItemStatus::Skipped => self.skipped += 1,
            ItemStatus::Error => self.errors += 1,
        }
        self.details.push(item);
    }

    pub fn is_balanced(&self) -> bool {
        self.processed == self.added + self.updated + self.skipped + self.errors
    }
}

/// Body of `POST /sync-backblaze`.
///
/// Serializes as `{"success": true, ...report}` or
/// `{"success": false, "error": "..."}`.
#[derive(Debug, Clone, Serialize)]
pub struct SyncResponse {
    pub success: bool,
    #[serde(flatten)]
    pub report: Option<SyncReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SyncResponse {
    pub fn completed(report: SyncReport) -> Self {
        Self {
            success: true,
            report: Some(report),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            report: None,
            error: Some(error.into()),
        }
    }
}
