use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::DateTime;
use futures::TryStreamExt;
use reqwest::header::{
    ACCEPT_RANGES, AUTHORIZATION, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, RANGE,
};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::core::config::ProviderConfig;
use crate::core::error::ProviderError;
use crate::core::redact::redact_key_id;
use crate::observability::metrics as obs;

use super::token::{AccountAuthorization, Authorizer, TokenCache};
use super::{encode_object_key, ListPage, ObjectDownloader, ObjectLister, RemoteObject, UpstreamObject};

const CLIENT_USER_AGENT: &str = concat!("tunebridge/", env!("CARGO_PKG_VERSION"));

/// Build the shared HTTP client for provider calls.
///
/// Only the connect phase is bounded here. Downloads can legitimately run
/// for minutes, so JSON calls set their own per-request timeout instead.
pub fn build_http_client(connect_timeout: Duration) -> Result<Client, ProviderError> {
    Ok(Client::builder()
        .connect_timeout(connect_timeout)
        .user_agent(CLIENT_USER_AGENT)
        .build()?)
}

fn header_string(headers: &reqwest::header::HeaderMap, name: reqwest::header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

// ---------------------------------------------------------------------------
// Account authorization
// ---------------------------------------------------------------------------

/// Exchanges the long-lived key pair for a bearer credential.
pub struct B2Authorizer {
    client: Client,
    authorize_url: String,
    key_id: String,
    application_key: String,
    request_timeout: Duration,
}

impl B2Authorizer {
    pub fn new(client: Client, config: &ProviderConfig) -> Self {
        Self {
            client,
            authorize_url: config.authorize_url.clone(),
            key_id: config.key_id.clone(),
            application_key: config.application_key.clone(),
            request_timeout: Duration::from_secs(config.request_timeout_secs),
        }
    }
}

#[async_trait]
impl Authorizer for B2Authorizer {
    async fn authorize(&self) -> Result<AccountAuthorization, ProviderError> {
        debug!(key_id = %redact_key_id(&self.key_id), "requesting account authorization");

        let response = self
            .client
            .get(&self.authorize_url)
            .basic_auth(&self.key_id, Some(&self.application_key))
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| ProviderError::AuthUnreachable {
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            error!(status = status.as_u16(), "account authorization rejected");
            return Err(ProviderError::Auth {
                status: status.as_u16(),
            });
        }

        response
            .json::<AccountAuthorization>()
            .await
            .map_err(|e| ProviderError::AuthUnreachable {
                reason: format!("invalid authorization response: {e}"),
            })
    }
}

// ---------------------------------------------------------------------------
// Downloads
// ---------------------------------------------------------------------------

/// Streams objects through the provider's authenticated download endpoint.
pub struct B2Downloader {
    client: Client,
    tokens: Arc<TokenCache>,
    bucket_name: String,
}

impl B2Downloader {
    pub fn new(client: Client, tokens: Arc<TokenCache>, bucket_name: impl Into<String>) -> Self {
        Self {
            client,
            tokens,
            bucket_name: bucket_name.into(),
        }
    }
}

#[async_trait]
impl ObjectDownloader for B2Downloader {
    async fn fetch(&self, key: &str, range: Option<&str>) -> Result<UpstreamObject, ProviderError> {
        let credential = self.tokens.get_credential().await?;

        let url = format!(
            "{}/file/{}/{}",
            credential.download_url.trim_end_matches('/'),
            self.bucket_name,
            encode_object_key(key.trim())
        );
        debug!(url = %url, range = ?range, "fetching object");

        let mut request = self
            .client
            .get(&url)
            .header(AUTHORIZATION, credential.token.as_str());
        if let Some(range) = range {
            request = request.header(RANGE, range);
        }

        let started = Instant::now();
        let response = request.send().await?;
        obs::record_upstream_fetch_duration(started.elapsed().as_secs_f64());

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            // Drop the credential so the next request re-authorizes; this
            // request still fails.
            warn!(key, "download rejected with 401, invalidating cached credential");
            self.tokens.invalidate().await;
        }
        if !status.is_success() {
            error!(key, status = status.as_u16(), "object download failed");
            return Err(ProviderError::UpstreamStatus {
                operation: "download",
                status: status.as_u16(),
            });
        }

        let headers = response.headers();
        let content_type = header_string(headers, CONTENT_TYPE);
        let content_length = header_string(headers, CONTENT_LENGTH).and_then(|v| v.parse().ok());
        let accept_ranges = header_string(headers, ACCEPT_RANGES);
        let content_range = header_string(headers, CONTENT_RANGE);

        Ok(UpstreamObject {
            status: status.as_u16(),
            content_type,
            content_length,
            accept_ranges,
            content_range,
            body: Box::pin(response.bytes_stream().map_err(ProviderError::Transport)),
        })
    }
}

// ---------------------------------------------------------------------------
// Native listing
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ListFileNamesRequest<'a> {
    bucket_id: &'a str,
    max_file_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    start_file_name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListFileNamesResponse {
    files: Vec<B2File>,
    next_file_name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct B2File {
    file_name: String,
    file_id: Option<String>,
    content_length: u64,
    upload_timestamp: i64,
    action: String,
}

/// Lists the bucket with `b2_list_file_names`, using the cached credential.
///
/// The provider's file id is reported as the etag, so a re-upload under the
/// same name counts as a change.
pub struct B2NativeLister {
    client: Client,
    tokens: Arc<TokenCache>,
    bucket_id: String,
    page_size: u32,
    request_timeout: Duration,
}

impl B2NativeLister {
    pub fn new(client: Client, tokens: Arc<TokenCache>, config: &ProviderConfig, page_size: u32) -> Self {
        Self {
            client,
            tokens,
            bucket_id: config.bucket_id.clone(),
            page_size,
            request_timeout: Duration::from_secs(config.request_timeout_secs),
        }
    }
}

#[async_trait]
impl ObjectLister for B2NativeLister {
    async fn list_page(&self, cursor: Option<String>) -> Result<ListPage, ProviderError> {
        let credential = self.tokens.get_credential().await?;
        let url = format!(
            "{}/b2api/v2/b2_list_file_names",
            credential.api_url.trim_end_matches('/')
        );

        let response = self
            .client
            .post(&url)
            .header(AUTHORIZATION, credential.token.as_str())
            .timeout(self.request_timeout)
            .json(&ListFileNamesRequest {
                bucket_id: &self.bucket_id,
                max_file_count: self.page_size,
                start_file_name: cursor,
            })
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            self.tokens.invalidate().await;
        }
        if !status.is_success() {
            error!(status = status.as_u16(), "file listing failed");
            return Err(ProviderError::Listing {
                reason: format!("list_file_names returned status {}", status.as_u16()),
            });
        }

        let page: ListFileNamesResponse =
            response
                .json()
                .await
                .map_err(|e| ProviderError::MalformedResponse {
                    reason: e.to_string(),
                })?;

        let mut objects = Vec::with_capacity(page.files.len());
        for file in page.files {
            if file.action == "folder" {
                continue;
            }
            let Some(file_id) = file.file_id else {
                warn!(key = %file.file_name, "listing entry without file id, skipping");
                continue;
            };
            let last_modified = DateTime::from_timestamp_millis(file.upload_timestamp).ok_or_else(|| {
                ProviderError::MalformedResponse {
                    reason: format!("invalid upload timestamp for {}", file.file_name),
                }
            })?;
            objects.push(RemoteObject {
                key: file.file_name,
                etag: file_id,
                size_bytes: file.content_length,
                last_modified,
            });
        }

        Ok(ListPage {
            objects,
            next_cursor: page.next_file_name,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use futures::TryStreamExt;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::core::clock::SystemClock;
    use crate::core::config::AppConfig;
    use crate::storage::list_all;

    fn provider_config(server: &MockServer) -> ProviderConfig {
        let mut config = AppConfig::default().provider;
        config.authorize_url = format!("{}/b2api/v2/b2_authorize_account", server.uri());
        config.key_id = "005ef3018aedce30000000002".to_string();
        config.application_key = "K005secret".to_string();
        config.bucket_name = "Music-web".to_string();
        config.bucket_id = "bucket-123".to_string();
        config
    }

    async fn mount_authorize(server: &MockServer, expected_calls: u64) {
        Mock::given(method("GET"))
            .and(path("/b2api/v2/b2_authorize_account"))
            .and(header_exists("authorization"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "accountId": "ef3018aedce3",
                "authorizationToken": "4_token_abc",
                "apiUrl": server.uri(),
                "downloadUrl": server.uri(),
                "recommendedPartSize": 100000000
            })))
            .expect(expected_calls)
            .mount(server)
            .await;
    }

    /// Collects formatted log output written on the current thread.
    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl CapturedLogs {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    fn capture_logs() -> (CapturedLogs, tracing::subscriber::DefaultGuard) {
        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::DEBUG)
            .finish();
        (logs, tracing::subscriber::set_default(subscriber))
    }

    fn token_cache(server: &MockServer) -> Arc<TokenCache> {
        let client = build_http_client(Duration::from_secs(5)).unwrap();
        let authorizer = Arc::new(B2Authorizer::new(client, &provider_config(server)));
        Arc::new(TokenCache::new(authorizer, Arc::new(SystemClock)))
    }

    #[tokio::test]
    async fn test_authorize_uses_basic_auth() {
        let server = MockServer::start().await;
        // base64("005ef3018aedce30000000002:K005secret")
        Mock::given(method("GET"))
            .and(path("/b2api/v2/b2_authorize_account"))
            .and(header(
                "authorization",
                "Basic MDA1ZWYzMDE4YWVkY2UzMDAwMDAwMDAwMjpLMDA1c2VjcmV0",
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "authorizationToken": "4_token_abc",
                "apiUrl": "https://api005.backblazeb2.com",
                "downloadUrl": "https://f005.backblazeb2.com"
            })))
            .mount(&server)
            .await;

        let client = build_http_client(Duration::from_secs(5)).unwrap();
        let auth = B2Authorizer::new(client, &provider_config(&server))
            .authorize()
            .await
            .unwrap();
        assert_eq!(auth.authorization_token, "4_token_abc");
        assert_eq!(auth.download_url, "https://f005.backblazeb2.com");
    }

    #[tokio::test]
    async fn test_authorize_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/b2api/v2/b2_authorize_account"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad_auth_token: key K005secret"))
            .mount(&server)
            .await;

        let (logs, _guard) = capture_logs();
        let client = build_http_client(Duration::from_secs(5)).unwrap();
        let err = B2Authorizer::new(client, &provider_config(&server))
            .authorize()
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ProviderError::Auth { status: 401 }));
        assert!(err.is_auth());

        let logs = logs.contents();
        assert!(logs.contains("account authorization rejected"));
        assert!(logs.contains("status=401"));
        assert!(!logs.contains("bad_auth_token"));
        assert!(!err.to_string().contains("bad_auth_token"));
    }

    #[tokio::test]
    async fn test_download_forwards_token_and_range() {
        let server = MockServer::start().await;
        mount_authorize(&server, 1).await;
        Mock::given(method("GET"))
            .and(path("/file/Music-web/Artist%20-%20Song.mp3"))
            .and(header("authorization", "4_token_abc"))
            .and(header("range", "bytes=0-3"))
            .respond_with(
                ResponseTemplate::new(206)
                    .set_body_raw(vec![1u8, 2, 3, 4], "audio/mpeg")
                    .insert_header("accept-ranges", "bytes")
                    .insert_header("content-range", "bytes 0-3/100"),
            )
            .mount(&server)
            .await;

        let tokens = token_cache(&server);
        let client = build_http_client(Duration::from_secs(5)).unwrap();
        let downloader = B2Downloader::new(client, tokens, "Music-web");

        let obj = downloader
            .fetch("  Artist - Song.mp3 ", Some("bytes=0-3"))
            .await
            .unwrap();
        assert_eq!(obj.status, 206);
        assert_eq!(obj.content_type.as_deref(), Some("audio/mpeg"));
        assert_eq!(obj.content_range.as_deref(), Some("bytes 0-3/100"));
        assert_eq!(obj.accept_ranges.as_deref(), Some("bytes"));
        let chunks: Vec<bytes::Bytes> = obj.body.try_collect().await.unwrap();
        assert_eq!(chunks.concat(), vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_download_not_found() {
        let server = MockServer::start().await;
        mount_authorize(&server, 1).await;
        Mock::given(method("GET"))
            .and(path("/file/Music-web/missing.mp3"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({
                "code": "not_found",
                "message": "bucket Music-web internal path /b2/shard-17"
            })))
            .mount(&server)
            .await;

        let (logs, _guard) = capture_logs();
        let client = build_http_client(Duration::from_secs(5)).unwrap();
        let downloader = B2Downloader::new(client, token_cache(&server), "Music-web");
        let err = downloader.fetch("missing.mp3", None).await.err().unwrap();
        assert!(matches!(
            err,
            ProviderError::UpstreamStatus {
                operation: "download",
                status: 404
            }
        ));

        let logs = logs.contents();
        assert!(logs.contains("object download failed"));
        assert!(logs.contains("status=404"));
        assert!(!logs.contains("shard-17"));
        assert!(!err.to_string().contains("shard-17"));
    }

    #[tokio::test]
    async fn test_download_401_invalidates_credential() {
        let server = MockServer::start().await;
        mount_authorize(&server, 2).await;
        Mock::given(method("GET"))
            .and(path("/file/Music-web/song.mp3"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let client = build_http_client(Duration::from_secs(5)).unwrap();
        let downloader = B2Downloader::new(client, token_cache(&server), "Music-web");

        assert!(downloader.fetch("song.mp3", None).await.is_err());
        // Second request has to authorize again.
        assert!(downloader.fetch("song.mp3", None).await.is_err());
    }

    #[tokio::test]
    async fn test_native_listing_pages_and_skips_folders() {
        let server = MockServer::start().await;
        mount_authorize(&server, 1).await;
        Mock::given(method("POST"))
            .and(path("/b2api/v2/b2_list_file_names"))
            .and(body_json(json!({"bucketId": "bucket-123", "maxFileCount": 2})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "files": [
                    {"fileName": "a.mp3", "fileId": "id-a", "contentLength": 100,
                     "uploadTimestamp": 1700000000000i64, "action": "upload"},
                    {"fileName": "albums/", "fileId": null, "contentLength": 0,
                     "uploadTimestamp": 0, "action": "folder"}
                ],
                "nextFileName": "b.mp3"
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/b2api/v2/b2_list_file_names"))
            .and(body_json(json!({
                "bucketId": "bucket-123", "maxFileCount": 2, "startFileName": "b.mp3"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "files": [
                    {"fileName": "b.mp3", "fileId": "id-b", "contentLength": 200,
                     "uploadTimestamp": 1700000001000i64, "action": "upload"}
                ],
                "nextFileName": null
            })))
            .mount(&server)
            .await;

        let client = build_http_client(Duration::from_secs(5)).unwrap();
        let lister = B2NativeLister::new(client, token_cache(&server), &provider_config(&server), 2);
        let objects: Vec<RemoteObject> = list_all(Arc::new(lister)).try_collect().await.unwrap();

        assert_eq!(objects.len(), 2);
        assert_eq!(objects[0].key, "a.mp3");
        assert_eq!(objects[0].etag, "id-a");
        assert_eq!(objects[1].size_bytes, 200);
        assert_eq!(objects[1].last_modified.timestamp(), 1_700_000_001);
    }

    #[tokio::test]
    async fn test_native_listing_error() {
        let server = MockServer::start().await;
        mount_authorize(&server, 1).await;
        Mock::given(method("POST"))
            .and(path("/b2api/v2/b2_list_file_names"))
            .respond_with(ResponseTemplate::new(503).set_body_string("upstream maintenance node-42"))
            .mount(&server)
            .await;

        let client = build_http_client(Duration::from_secs(5)).unwrap();
        let lister = B2NativeLister::new(client, token_cache(&server), &provider_config(&server), 100);
        let err = lister.list_page(None).await.err().unwrap();
        assert!(matches!(err, ProviderError::Listing { .. }));
        assert!(err.to_string().contains("503"));
        assert!(!err.to_string().contains("node-42"));
    }
}
