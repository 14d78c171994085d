pub mod b2;
pub mod memory;
#[cfg(feature = "s3")]
pub mod s3;
pub mod token;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};

use crate::core::error::ProviderError;

// ---------------------------------------------------------------------------
// Capability traits
// ---------------------------------------------------------------------------

/// Fetches object bytes (optionally a byte range) from the bucket.
///
/// Implementations must not buffer the whole object: the body is handed back
/// as a stream that the caller relays chunk by chunk.
#[async_trait]
pub trait ObjectDownloader: Send + Sync {
    /// Fetch `key`, forwarding `range` verbatim as the outbound `Range` header.
    ///
    /// A non-2xx upstream status is returned as an error, never as an
    /// `UpstreamObject`.
    async fn fetch(&self, key: &str, range: Option<&str>)
        -> Result<UpstreamObject, ProviderError>;
}

/// Enumerates bucket contents one page at a time.
#[async_trait]
pub trait ObjectLister: Send + Sync {
    /// Fetch the page starting at `cursor` (`None` for the first page).
    async fn list_page(&self, cursor: Option<String>) -> Result<ListPage, ProviderError>;
}

// ---------------------------------------------------------------------------
// Storage types
// ---------------------------------------------------------------------------

pub type ByteStream = BoxStream<'static, Result<Bytes, ProviderError>>;

/// A successful upstream response, body not yet consumed.
pub struct UpstreamObject {
    pub status: u16,
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
    pub accept_ranges: Option<String>,
    pub content_range: Option<String>,
    pub body: ByteStream,
}

/// An object as reported by a listing call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteObject {
    pub key: String,
    /// Provider-assigned identifier, used as the catalog's external id.
    pub etag: String,
    pub size_bytes: u64,
    pub last_modified: DateTime<Utc>,
}

/// One page of a listing.
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub objects: Vec<RemoteObject>,
    /// Cursor for the next page; `None` once the listing is exhausted.
    pub next_cursor: Option<String>,
}

/// Lazily page through the whole bucket.
///
/// The stream is finite and restartable: calling `list_all` again starts a
/// fresh listing from the first page. A failed page ends the stream with
/// that error.
pub fn list_all(lister: Arc<dyn ObjectLister>) -> BoxStream<'static, Result<RemoteObject, ProviderError>> {
    Box::pin(async_stream::stream! {
        let mut cursor: Option<String> = None;
        loop {
            match lister.list_page(cursor.take()).await {
                Ok(page) => {
                    for object in page.objects {
                        yield Ok(object);
                    }
                    match page.next_cursor {
                        Some(next) => cursor = Some(next),
                        None => break,
                    }
                }
                Err(e) => {
                    yield Err(e);
                    break;
                }
            }
        }
    })
}

// ---------------------------------------------------------------------------
// Key and header helpers
// ---------------------------------------------------------------------------

/// Characters left alone by JavaScript's `encodeURIComponent`.
const URI_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

/// Percent-encode an object key as a single URL path component.
///
/// Slashes are encoded too, so `a/b c.mp3` becomes `a%2Fb%20c.mp3`.
pub fn encode_object_key(key: &str) -> String {
    utf8_percent_encode(key, URI_COMPONENT).to_string()
}

/// Join a base URL and an object key.
pub fn object_url(base: &str, key: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), encode_object_key(key))
}

/// Parse a single-range header value like "bytes=0-1048575".
///
/// Open-ended ranges (`bytes=100-`) yield `u64::MAX` as the end.
pub fn parse_range_header(value: &str) -> Option<(u64, u64)> {
    let range_str = value.trim().strip_prefix("bytes=")?;
    let (start, end) = range_str.split_once('-')?;
    let start: u64 = start.trim().parse().ok()?;
    let end: u64 = if end.trim().is_empty() {
        u64::MAX
    } else {
        end.trim().parse().ok()?
    };
    if end < start {
        return None;
    }
    Some((start, end))
}
