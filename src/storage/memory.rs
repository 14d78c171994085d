use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream;
use tokio::sync::RwLock;

use crate::core::error::ProviderError;

use super::{parse_range_header, ListPage, ObjectDownloader, ObjectLister, RemoteObject, UpstreamObject};

/// Body chunk size used when replaying stored bytes.
const CHUNK_SIZE: usize = 64 * 1024;

/// In-memory bucket for unit and integration tests.
///
/// Keys are kept in a `BTreeMap` so listings come back in lexicographic
/// order, like the real provider. Call counters let tests assert how many
/// pages were requested.
pub struct InMemoryObjectStore {
    objects: RwLock<BTreeMap<String, StoredObject>>,
    page_size: usize,
    list_calls: AtomicUsize,
    fetch_calls: AtomicUsize,
    /// When set, the listing page with this index (0-based) fails.
    fail_list_page: Option<usize>,
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    content_type: String,
    etag: String,
    uploaded_at: DateTime<Utc>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::with_page_size(1000)
    }

    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            objects: RwLock::new(BTreeMap::new()),
            page_size: page_size.max(1),
            list_calls: AtomicUsize::new(0),
            fetch_calls: AtomicUsize::new(0),
            fail_list_page: None,
        }
    }

    /// Make the listing fail on page `index`, after earlier pages succeed.
    pub fn failing_list_page(mut self, index: usize) -> Self {
        self.fail_list_page = Some(index);
        self
    }

    /// Store an object, replacing any previous version under the same key.
    ///
    /// The etag is derived from the content, so re-uploading different bytes
    /// yields a new etag.
    pub async fn put_object(&self, key: &str, data: Bytes, content_type: &str) -> String {
        let etag = content_etag(&data);
        let mut objects = self.objects.write().await;
        objects.insert(
            key.to_string(),
            StoredObject {
                data,
                content_type: content_type.to_string(),
                etag: etag.clone(),
                uploaded_at: Utc::now(),
            },
        );
        etag
    }

    pub async fn remove_object(&self, key: &str) -> bool {
        self.objects.write().await.remove(key).is_some()
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }
}

impl Default for InMemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

fn content_etag(data: &Bytes) -> String {
    let mut hasher = DefaultHasher::new();
    data.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

#[async_trait]
impl ObjectDownloader for InMemoryObjectStore {
    async fn fetch(&self, key: &str, range: Option<&str>) -> Result<UpstreamObject, ProviderError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);

        let objects = self.objects.read().await;
        let obj = objects.get(key.trim()).ok_or(ProviderError::UpstreamStatus {
            operation: "download",
            status: 404,
        })?;
        let total = obj.data.len() as u64;

        // Unparseable ranges are ignored and the whole object is served.
        let (status, data, content_range) = match range.and_then(parse_range_header) {
            Some((start, end)) => {
                if start >= total {
                    return Err(ProviderError::UpstreamStatus {
                        operation: "download",
                        status: 416,
                    });
                }
                let end = end.min(total - 1);
                let slice = obj.data.slice(start as usize..=end as usize);
                (206, slice, Some(format!("bytes {start}-{end}/{total}")))
            }
            None => (200, obj.data.clone(), None),
        };

        let chunks: Vec<Result<Bytes, ProviderError>> = data
            .chunks(CHUNK_SIZE)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();

        Ok(UpstreamObject {
            status,
            content_type: Some(obj.content_type.clone()),
            content_length: Some(data.len() as u64),
            accept_ranges: Some("bytes".to_string()),
            content_range,
            body: Box::pin(stream::iter(chunks)),
        })
    }
}

#[async_trait]
impl ObjectLister for InMemoryObjectStore {
    async fn list_page(&self, cursor: Option<String>) -> Result<ListPage, ProviderError> {
        let page_index = self.list_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_list_page == Some(page_index) {
            return Err(ProviderError::Listing {
                reason: format!("injected failure on page {page_index}"),
            });
        }

        let objects = self.objects.read().await;
        let mut iter = objects
            .iter()
            .filter(|(k, _)| cursor.as_ref().map_or(true, |c| k.as_str() > c.as_str()));

        let page: Vec<RemoteObject> = iter
            .by_ref()
            .take(self.page_size)
            .map(|(k, v)| RemoteObject {
                key: k.clone(),
                etag: v.etag.clone(),
                size_bytes: v.data.len() as u64,
                last_modified: v.uploaded_at,
            })
            .collect();

        let next_cursor = match (iter.next(), page.last()) {
            (Some(_), Some(last)) => Some(last.key.clone()),
            _ => None,
        };

        Ok(ListPage {
            objects: page,
            next_cursor,
        })
    }
}
