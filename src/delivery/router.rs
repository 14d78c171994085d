use std::sync::Arc;
use std::time::Instant;

use axum::http::{header, HeaderName, Method};
use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::sync::Mutex;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::core::auth::AdminAuth;
use crate::core::config::AppConfig;
use crate::storage::ObjectDownloader;
use crate::sync::BucketReconciler;

use super::handlers;
use super::middleware::{preflight_no_content, RequestIdLayer};

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub downloader: Arc<dyn ObjectDownloader>,
    pub reconciler: Arc<BucketReconciler>,
    pub auth: Arc<AdminAuth>,
    pub config: Arc<AppConfig>,
    pub start_time: Instant,
    /// `None` when no global recorder is installed (tests).
    pub metrics_handle: Option<PrometheusHandle>,
    /// Held for the duration of a reconciliation run.
    pub sync_lock: Arc<Mutex<()>>,
}

impl AppState {
    pub fn new(
        downloader: Arc<dyn ObjectDownloader>,
        reconciler: Arc<BucketReconciler>,
        config: AppConfig,
    ) -> Self {
        Self {
            downloader,
            reconciler,
            auth: Arc::new(AdminAuth::new(&config.auth)),
            config: Arc::new(config),
            start_time: Instant::now(),
            metrics_handle: None,
            sync_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn with_metrics_handle(mut self, handle: PrometheusHandle) -> Self {
        self.metrics_handle = Some(handle);
        self
    }
}

/// Build the full Axum router.
///
/// - `GET|HEAD /stream-audio?file=<key>`: stream proxy
/// - `GET /sync-backblaze`: status probe (HEAD is refused)
/// - `POST /sync-backblaze`: run a reconciliation (admin)
/// - `OPTIONS` on both: CORS preflight, 204
/// - `GET /healthz`, `GET /metrics`
///
/// Other methods on these paths get axum's 405.
pub fn build_router(state: AppState) -> Router {
    tracing::info!(
        cache_control = %state.config.delivery.cache_control,
        default_content_type = %state.config.delivery.default_content_type,
        "delivery configuration loaded"
    );

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::HEAD, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::AUTHORIZATION,
            HeaderName::from_static("x-client-info"),
            HeaderName::from_static("apikey"),
            header::CONTENT_TYPE,
            header::RANGE,
        ])
        .expose_headers([
            header::ACCEPT_RANGES,
            header::CONTENT_RANGE,
            header::CONTENT_LENGTH,
            header::CONTENT_TYPE,
        ]);

    Router::new()
        .route(
            "/stream-audio",
            get(handlers::stream_audio).options(handlers::preflight),
        )
        .route(
            "/sync-backblaze",
            get(handlers::sync_status)
                .head(handlers::sync_method_not_allowed)
                .post(handlers::trigger_sync)
                .options(handlers::preflight),
        )
        .route("/healthz", get(handlers::healthz))
        .route("/metrics", get(handlers::metrics_handler))
        .layer(cors)
        .layer(axum::middleware::from_fn(preflight_no_content))
        .layer(TraceLayer::new_for_http())
        .layer(RequestIdLayer)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use bytes::Bytes;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use super::*;
    use crate::catalog::memory::InMemoryCatalogStore;
    use crate::core::clock::SystemClock;
    use crate::core::error::ProviderError;
    use crate::storage::memory::InMemoryObjectStore;
    use crate::storage::UpstreamObject;

    struct TestApp {
        router: Router,
        bucket: Arc<InMemoryObjectStore>,
        catalog: Arc<InMemoryCatalogStore>,
    }

    fn test_config(admin_tokens: &[&str]) -> AppConfig {
        let mut config = AppConfig::default();
        config.provider.key_id = "005ef3018aedce30000000002".to_string();
        config.provider.bucket_name = "Music-web".to_string();
        config.provider.bucket_id = "0edfd3f0f1b8fa7e9d6c0e13".to_string();
        config.provider.public_base_url =
            "https://f005.backblazeb2.com/file/Music-web".to_string();
        config.auth.admin_bearer_tokens = admin_tokens.iter().map(|t| t.to_string()).collect();
        config
    }

    fn app_with(bucket: InMemoryObjectStore, admin_tokens: &[&str]) -> TestApp {
        let bucket = Arc::new(bucket);
        let catalog = Arc::new(InMemoryCatalogStore::new());
        let config = test_config(admin_tokens);
        let reconciler = BucketReconciler::new(
            bucket.clone(),
            catalog.clone(),
            Arc::new(SystemClock),
            config.provider.public_base_url.clone(),
        );
        let state = AppState::new(bucket.clone(), Arc::new(reconciler), config);
        TestApp {
            router: build_router(state),
            bucket,
            catalog,
        }
    }

    fn app() -> TestApp {
        app_with(InMemoryObjectStore::new(), &[])
    }

    async fn send(router: &Router, req: Request<Body>) -> (StatusCode, axum::http::HeaderMap, Bytes) {
        let response = router.clone().oneshot(req).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, headers, body)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    // -- Stream proxy --

    #[tokio::test]
    async fn test_range_request_is_relayed_as_partial_content() {
        let app = app();
        let data: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        app.bucket
            .put_object("Artist - Song.mp3", Bytes::from(data.clone()), "audio/mpeg")
            .await;

        let req = Request::builder()
            .uri("/stream-audio?file=Artist%20-%20Song.mp3")
            .header("range", "bytes=1000-1999")
            .body(Body::empty())
            .unwrap();
        let (status, headers, body) = send(&app.router, req).await;

        assert_eq!(status, StatusCode::PARTIAL_CONTENT);
        assert_eq!(headers["content-range"], "bytes 1000-1999/5000");
        assert_eq!(headers["content-length"], "1000");
        assert_eq!(headers["accept-ranges"], "bytes");
        assert_eq!(body.len(), 1000);
        assert_eq!(&body[..], &data[1000..2000]);
    }

    #[tokio::test]
    async fn test_full_request_headers() {
        let app = app();
        app.bucket
            .put_object("song.flac", Bytes::from(vec![1u8; 300]), "audio/flac")
            .await;

        let (status, headers, body) = send(&app.router, get("/stream-audio?file=song.flac")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers["content-type"], "audio/flac");
        assert_eq!(headers["content-length"], "300");
        assert_eq!(headers["cache-control"], "public, max-age=3600");
        assert!(headers.get("content-range").is_none());
        assert!(headers.contains_key("x-request-id"));
        assert_eq!(body.len(), 300);
    }

    #[tokio::test]
    async fn test_file_parameter_is_trimmed() {
        let app = app();
        app.bucket
            .put_object("song.mp3", Bytes::from("abc"), "audio/mpeg")
            .await;

        let (status, _, body) = send(&app.router, get("/stream-audio?file=%20song.mp3%20")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(&body[..], b"abc");
    }

    #[tokio::test]
    async fn test_missing_file_is_rejected_without_upstream_call() {
        let app = app();

        let (status, _, body) = send(&app.router, get("/stream-audio")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "missing_parameter");
        assert_eq!(json["status"], 400);

        let (status, _, _) = send(&app.router, get("/stream-audio?file=%20%20")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        assert_eq!(app.bucket.fetch_calls(), 0);
    }

    #[tokio::test]
    async fn test_upstream_failure_is_generic_500() {
        let app = app();
        let (status, _, body) = send(&app.router, get("/stream-audio?file=missing.mp3")).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "stream_failed");
        assert_eq!(json["message"], "failed to stream audio file");
    }

    struct RejectingDownloader;

    #[async_trait]
    impl ObjectDownloader for RejectingDownloader {
        async fn fetch(&self, _key: &str, _range: Option<&str>) -> Result<UpstreamObject, ProviderError> {
            Err(ProviderError::Auth { status: 401 })
        }
    }

    #[tokio::test]
    async fn test_authorization_failure_is_bad_gateway() {
        let bucket = Arc::new(InMemoryObjectStore::new());
        let config = test_config(&[]);
        let reconciler = BucketReconciler::new(
            bucket,
            Arc::new(InMemoryCatalogStore::new()),
            Arc::new(SystemClock),
            config.provider.public_base_url.clone(),
        );
        let state = AppState::new(Arc::new(RejectingDownloader), Arc::new(reconciler), config);
        let router = build_router(state);

        let (status, _, body) = send(&router, get("/stream-audio?file=song.mp3")).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "upstream_auth_failed");
    }

    /// Sets its flag when the upstream body is dropped.
    struct ReleaseGuard(Arc<AtomicBool>);

    impl Drop for ReleaseGuard {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    /// Serves a body that never ends, one chunk every few milliseconds.
    struct EndlessDownloader {
        released: Arc<AtomicBool>,
    }

    #[async_trait]
    impl ObjectDownloader for EndlessDownloader {
        async fn fetch(&self, _key: &str, _range: Option<&str>) -> Result<UpstreamObject, ProviderError> {
            let guard = ReleaseGuard(self.released.clone());
            let body = async_stream::stream! {
                let _guard = guard;
                loop {
                    yield Ok::<_, ProviderError>(Bytes::from_static(&[7u8; 1024]));
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            };
            Ok(UpstreamObject {
                status: 200,
                content_type: Some("audio/mpeg".to_string()),
                content_length: None,
                accept_ranges: None,
                content_range: None,
                body: Box::pin(body),
            })
        }
    }

    #[tokio::test]
    async fn test_client_disconnect_releases_upstream() {
        let released = Arc::new(AtomicBool::new(false));
        let config = test_config(&[]);
        let reconciler = BucketReconciler::new(
            Arc::new(InMemoryObjectStore::new()),
            Arc::new(InMemoryCatalogStore::new()),
            Arc::new(SystemClock),
            config.provider.public_base_url.clone(),
        );
        let downloader = EndlessDownloader {
            released: released.clone(),
        };
        let state = AppState::new(Arc::new(downloader), Arc::new(reconciler), config);
        let router = build_router(state);

        let response = router
            .oneshot(get("/stream-audio?file=live.mp3"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let mut body = response.into_body();
        let frame = body.frame().await.unwrap().unwrap();
        assert_eq!(frame.into_data().unwrap().len(), 1024);
        assert!(!released.load(Ordering::SeqCst));

        // The client goes away mid-stream.
        drop(body);
        assert!(released.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_head_returns_headers_only() {
        let app = app();
        app.bucket
            .put_object("song.mp3", Bytes::from(vec![0u8; 64]), "audio/mpeg")
            .await;

        let req = Request::builder()
            .method("HEAD")
            .uri("/stream-audio?file=song.mp3")
            .body(Body::empty())
            .unwrap();
        let (status, headers, body) = send(&app.router, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers["content-length"], "64");
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn test_other_methods_not_allowed() {
        let app = app();
        let req = Request::builder()
            .method("POST")
            .uri("/stream-audio?file=song.mp3")
            .body(Body::empty())
            .unwrap();
        let (status, _, _) = send(&app.router, req).await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);

        let req = Request::builder()
            .method("DELETE")
            .uri("/sync-backblaze")
            .body(Body::empty())
            .unwrap();
        let (status, _, _) = send(&app.router, req).await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);

        // Only the stream route treats HEAD like GET.
        let req = Request::builder()
            .method("HEAD")
            .uri("/sync-backblaze")
            .body(Body::empty())
            .unwrap();
        let (status, headers, body) = send(&app.router, req).await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(headers["allow"], "GET,POST,OPTIONS");
        assert!(body.is_empty());
    }

    // -- CORS --

    #[tokio::test]
    async fn test_options_answers_no_content() {
        let app = app();
        for uri in ["/stream-audio", "/sync-backblaze"] {
            let req = Request::builder()
                .method("OPTIONS")
                .uri(uri)
                .header("origin", "https://app.example")
                .body(Body::empty())
                .unwrap();
            let (status, headers, body) = send(&app.router, req).await;
            assert_eq!(status, StatusCode::NO_CONTENT, "{uri}");
            assert_eq!(headers["access-control-allow-origin"], "*");
            assert!(body.is_empty());
        }
    }

    #[tokio::test]
    async fn test_browser_preflight() {
        let app = app();
        let req = Request::builder()
            .method("OPTIONS")
            .uri("/stream-audio?file=song.mp3")
            .header("origin", "https://app.example")
            .header("access-control-request-method", "GET")
            .header("access-control-request-headers", "range")
            .body(Body::empty())
            .unwrap();
        let (status, headers, body) = send(&app.router, req).await;

        assert_eq!(status, StatusCode::NO_CONTENT);
        assert_eq!(headers["access-control-allow-origin"], "*");
        let methods = headers["access-control-allow-methods"].to_str().unwrap();
        assert!(methods.contains("GET") && methods.contains("HEAD"));
        let allowed = headers["access-control-allow-headers"].to_str().unwrap();
        assert!(allowed.contains("range"));
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn test_stream_response_exposes_range_headers() {
        let app = app();
        app.bucket
            .put_object("song.mp3", Bytes::from("abc"), "audio/mpeg")
            .await;
        let req = Request::builder()
            .uri("/stream-audio?file=song.mp3")
            .header("origin", "https://app.example")
            .body(Body::empty())
            .unwrap();
        let (_, headers, _) = send(&app.router, req).await;

        assert_eq!(headers["access-control-allow-origin"], "*");
        let exposed = headers["access-control-expose-headers"]
            .to_str()
            .unwrap()
            .to_ascii_lowercase();
        assert!(exposed.contains("content-range"));
        assert!(exposed.contains("accept-ranges"));
    }

    // -- Synchronization --

    #[tokio::test]
    async fn test_sync_reports_counts() {
        let app = app();
        app.bucket
            .put_object("Artist - Song.mp3", Bytes::from("a"), "audio/mpeg")
            .await;
        app.bucket
            .put_object("cover.jpg", Bytes::from("b"), "image/jpeg")
            .await;

        let req = Request::builder()
            .method("POST")
            .uri("/sync-backblaze")
            .body(Body::empty())
            .unwrap();
        let (status, headers, body) = send(&app.router, req).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers["content-type"], "application/json");
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["processed"], 2);
        assert_eq!(json["added"], 1);
        assert_eq!(json["skipped"], 1);
        assert_eq!(json["errors"], 0);
        assert_eq!(json["details"].as_array().unwrap().len(), 2);
        assert_eq!(app.catalog.len().await, 1);
    }

    #[tokio::test]
    async fn test_sync_listing_failure_reports_error() {
        let app = app_with(InMemoryObjectStore::new().failing_list_page(0), &[]);

        let req = Request::builder()
            .method("POST")
            .uri("/sync-backblaze")
            .body(Body::empty())
            .unwrap();
        let (status, _, body) = send(&app.router, req).await;

        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["success"], false);
        assert!(json["error"].as_str().unwrap().contains("failed to list bucket"));
        assert!(json.get("processed").is_none());
    }

    #[tokio::test]
    async fn test_sync_status_probe() {
        let app = app();
        let (status, _, body) = send(&app.router, get("/sync-backblaze")).await;

        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["config"]["bucket_name"], "Music-web");
        assert_eq!(json["config"]["listing"], "s3");
        assert_eq!(json["config"]["key_id"], "005ef3***");
        assert_eq!(app.bucket.list_calls(), 0);
    }

    #[tokio::test]
    async fn test_sync_admin_tokens() {
        let app = app_with(InMemoryObjectStore::new(), &["at_admin_1"]);
        let post = |auth: Option<&str>| {
            let mut builder = Request::builder().method("POST").uri("/sync-backblaze");
            if let Some(auth) = auth {
                builder = builder.header("authorization", auth);
            }
            builder.body(Body::empty()).unwrap()
        };

        let (status, _, _) = send(&app.router, post(None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _, _) = send(&app.router, post(Some("Bearer wrong"))).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(app.bucket.list_calls(), 0);

        let (status, _, _) = send(&app.router, post(Some("Bearer at_admin_1"))).await;
        assert_eq!(status, StatusCode::OK);
    }

    // -- Health --

    #[tokio::test]
    async fn test_healthz_and_request_id() {
        let app = app();
        let req = Request::builder()
            .uri("/healthz")
            .header("x-request-id", "req-123")
            .body(Body::empty())
            .unwrap();
        let (status, headers, body) = send(&app.router, req).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers["x-request-id"], "req-123");
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["auth_open_mode"], true);
    }

    #[tokio::test]
    async fn test_metrics_without_recorder() {
        let app = app();
        let (status, _, _) = send(&app.router, get("/metrics")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
