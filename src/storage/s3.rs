use async_trait::async_trait;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::Client;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::core::config::ProviderConfig;
use crate::core::error::ProviderError;

use super::{ListPage, ObjectLister, RemoteObject};

/// Lists the bucket through the provider's S3-compatible endpoint.
///
/// Authenticates with the long-lived key pair directly, so it does not touch
/// the bearer-token cache.
pub struct S3ObjectLister {
    client: Client,
    bucket: String,
    page_size: i32,
}

impl S3ObjectLister {
    pub fn new(config: &ProviderConfig, page_size: u32) -> Self {
        let credentials = Credentials::new(
            &config.key_id,
            &config.application_key,
            None,
            None,
            "tunebridge-config",
        );

        let mut s3_config_builder = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .credentials_provider(credentials)
            .force_path_style(true);

        if !config.s3_endpoint.is_empty() {
            s3_config_builder = s3_config_builder.endpoint_url(&config.s3_endpoint);
        }

        Self {
            client: Client::from_conf(s3_config_builder.build()),
            bucket: config.bucket_name.clone(),
            page_size: page_size.min(1000) as i32,
        }
    }
}

#[async_trait]
impl ObjectLister for S3ObjectLister {
    async fn list_page(&self, cursor: Option<String>) -> Result<ListPage, ProviderError> {
        debug!(bucket = %self.bucket, has_cursor = cursor.is_some(), "listing objects");

        let output = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .max_keys(self.page_size)
            .set_continuation_token(cursor)
            .send()
            .await
            .map_err(|e| ProviderError::Listing {
                reason: aws_sdk_s3::error::DisplayErrorContext(&e).to_string(),
            })?;

        let mut objects = Vec::new();
        for obj in output.contents.unwrap_or_default() {
            let Some(key) = obj.key else {
                continue;
            };
            // Zero-byte folder markers.
            if key.ends_with('/') {
                continue;
            }
            let Some(etag) = obj.e_tag else {
                warn!(key = %key, "listing entry without etag, skipping");
                continue;
            };
            let last_modified = obj
                .last_modified
                .and_then(|t| DateTime::from_timestamp(t.secs(), t.subsec_nanos()))
                .unwrap_or_else(Utc::now);

            objects.push(RemoteObject {
                key,
                etag: etag.trim_matches('"').to_string(),
                size_bytes: obj.size.unwrap_or(0).max(0) as u64,
                last_modified,
            });
        }

        let next_cursor = if output.is_truncated.unwrap_or(false) {
            output.next_continuation_token
        } else {
            None
        };

        Ok(ListPage {
            objects,
            next_cursor,
        })
    }
}
