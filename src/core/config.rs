use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

use super::redact::Redacted;

/// Top-level application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub provider: ProviderConfig,
    pub catalog: CatalogConfig,
    pub sync: SyncConfig,
    pub delivery: DeliveryConfig,
    pub auth: AuthConfig,
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// How the reconciler enumerates the bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListingBackend {
    /// S3-compatible `ListObjectsV2` with the long-lived key pair.
    S3,
    /// Native `b2_list_file_names` with the cached bearer token.
    Native,
}

impl fmt::Display for ListingBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListingBackend::S3 => write!(f, "s3"),
            ListingBackend::Native => write!(f, "native"),
        }
    }
}

impl std::str::FromStr for ListingBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "s3" => Ok(ListingBackend::S3),
            "native" => Ok(ListingBackend::Native),
            other => Err(format!("unknown listing backend '{other}'")),
        }
    }
}

/// Object-storage provider (Backblaze B2) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub authorize_url: String,
    pub key_id: String,
    pub application_key: String,
    pub bucket_name: String,
    #[serde(default)]
    pub bucket_id: String,
    pub region: String,
    pub s3_endpoint: String,
    /// Public prefix for object URLs, e.g. `https://f005.backblazeb2.com/file/Music-web`.
    pub public_base_url: String,
    pub listing: ListingBackend,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Kept below the provider's 24h token validity.
    #[serde(default = "default_credential_ttl_secs")]
    pub credential_ttl_secs: u64,
}

fn default_request_timeout_secs() -> u64 {
    30
}
fn default_credential_ttl_secs() -> u64 {
    23 * 60 * 60
}

/// Record-storage (hosted database REST API) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    pub url: String,
    pub service_key: String,
    pub table: String,
    pub default_album: String,
    pub default_genre: String,
    pub default_cover_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    pub page_size: u32,
    /// Number of objects reconciled at once. 1 keeps processing sequential.
    #[serde(default = "default_sync_concurrency")]
    pub concurrency: usize,
}

fn default_sync_concurrency() -> usize {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    pub cache_control: String,
    pub default_content_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub admin_bearer_tokens: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub log_format: String,
}

impl AppConfig {
    /// Load configuration with layered overrides:
    /// 1. config/default.toml (built-in defaults when absent)
    /// 2. config/{env}.toml (based on TUNEBRIDGE_ENV)
    /// 3. Environment variables (TUNEBRIDGE_* prefix)
    pub fn load() -> anyhow::Result<Self> {
        let default_path = Path::new("config/default.toml");
        let mut config = if default_path.exists() {
            let content = std::fs::read_to_string(default_path)
                .map_err(|e| anyhow::anyhow!("failed to read {}: {}", default_path.display(), e))?;
            toml::from_str(&content)
                .map_err(|e| anyhow::anyhow!("failed to parse {}: {}", default_path.display(), e))?
        } else {
            AppConfig::default()
        };

        let env_name =
            std::env::var("TUNEBRIDGE_ENV").unwrap_or_else(|_| "development".to_string());
        let env_path = format!("config/{}.toml", env_name);
        if let Ok(env_content) = std::fs::read_to_string(&env_path) {
            config = toml::from_str(&env_content)
                .map_err(|e| anyhow::anyhow!("failed to parse {}: {}", env_path, e))?;
        }

        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Apply `TUNEBRIDGE_*` overrides, reading values through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("TUNEBRIDGE_SERVER_HOST") {
            self.server.host = v;
        }
        if let Some(port) = lookup("TUNEBRIDGE_SERVER_PORT").and_then(|v| v.parse().ok()) {
            self.server.port = port;
        }
        if let Some(v) = lookup("TUNEBRIDGE_B2_KEY_ID") {
            self.provider.key_id = v;
        }
        if let Some(v) = lookup("TUNEBRIDGE_B2_APPLICATION_KEY") {
            self.provider.application_key = v;
        }
        if let Some(v) = lookup("TUNEBRIDGE_B2_BUCKET_NAME") {
            self.provider.bucket_name = v;
        }
        if let Some(v) = lookup("TUNEBRIDGE_B2_BUCKET_ID") {
            self.provider.bucket_id = v;
        }
        if let Some(v) = lookup("TUNEBRIDGE_B2_REGION") {
            self.provider.region = v;
        }
        if let Some(v) = lookup("TUNEBRIDGE_B2_S3_ENDPOINT") {
            self.provider.s3_endpoint = v;
        }
        if let Some(v) = lookup("TUNEBRIDGE_B2_PUBLIC_BASE_URL") {
            self.provider.public_base_url = v;
        }
        if let Some(backend) = lookup("TUNEBRIDGE_B2_LISTING").and_then(|v| v.parse().ok()) {
            self.provider.listing = backend;
        }
        if let Some(v) = lookup("TUNEBRIDGE_CATALOG_URL") {
            self.catalog.url = v;
        }
        if let Some(v) = lookup("TUNEBRIDGE_CATALOG_SERVICE_KEY") {
            self.catalog.service_key = v;
        }
        if let Some(v) = lookup("TUNEBRIDGE_CATALOG_TABLE") {
            self.catalog.table = v;
        }
        if let Some(v) = lookup("TUNEBRIDGE_ADMIN_BEARER_TOKENS") {
            self.auth.admin_bearer_tokens = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(v) = lookup("TUNEBRIDGE_LOG_LEVEL") {
            self.observability.log_level = v;
        }
    }

    /// Reject configurations the service cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        let required = [
            ("provider.key_id", &self.provider.key_id),
            ("provider.application_key", &self.provider.application_key),
            ("provider.bucket_name", &self.provider.bucket_name),
            ("provider.public_base_url", &self.provider.public_base_url),
            ("catalog.url", &self.catalog.url),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                anyhow::bail!("missing required setting {name}");
            }
        }
        if self.provider.listing == ListingBackend::Native && self.provider.bucket_id.is_empty() {
            anyhow::bail!("provider.bucket_id is required for native listing");
        }
        if self.sync.page_size == 0 || self.sync.page_size > 1000 {
            anyhow::bail!("sync.page_size must be between 1 and 1000");
        }
        Ok(())
    }

    /// Secrets-free summary for startup logging.
    pub fn describe(&self) -> String {
        format!(
            "bucket={} listing={} region={} catalog_table={} application_key={}",
            self.provider.bucket_name,
            self.provider.listing,
            self.provider.region,
            self.catalog.table,
            Redacted::new(&self.provider.application_key),
        )
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
            },
            provider: ProviderConfig {
                authorize_url: "https://api.backblazeb2.com/b2api/v2/b2_authorize_account"
                    .to_string(),
                key_id: String::new(),
                application_key: String::new(),
                bucket_name: String::new(),
                bucket_id: String::new(),
                region: "us-east-005".to_string(),
                s3_endpoint: "https://s3.us-east-005.backblazeb2.com".to_string(),
                public_base_url: String::new(),
                listing: ListingBackend::S3,
                request_timeout_secs: default_request_timeout_secs(),
                credential_ttl_secs: default_credential_ttl_secs(),
            },
            catalog: CatalogConfig {
                url: String::new(),
                service_key: String::new(),
                table: "music_files".to_string(),
                default_album: "Unknown Album".to_string(),
                default_genre: "Unknown".to_string(),
                default_cover_url: "/placeholder.svg".to_string(),
            },
            sync: SyncConfig {
                page_size: 1000,
                concurrency: default_sync_concurrency(),
            },
            delivery: DeliveryConfig {
                cache_control: "public, max-age=3600".to_string(),
                default_content_type: "audio/mpeg".to_string(),
            },
            auth: AuthConfig {
                admin_bearer_tokens: Vec::new(),
            },
            observability: ObservabilityConfig {
                log_level: "info".to_string(),
                log_format: "json".to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn valid_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.provider.key_id = "005keyid".to_string();
        config.provider.application_key = "K005secret".to_string();
        config.provider.bucket_name = "Music-web".to_string();
        config.provider.public_base_url = "https://f005.backblazeb2.com/file/Music-web".to_string();
        config.catalog.url = "https://project.supabase.co".to_string();
        config
    }

    #[test]
    fn test_default_toml_parses() {
        let config: AppConfig = toml::from_str(include_str!("../../config/default.toml")).unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.provider.listing, ListingBackend::S3);
        assert_eq!(config.provider.credential_ttl_secs, 82_800);
        assert_eq!(config.sync.page_size, 1000);
        assert_eq!(config.catalog.table, "music_files");
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("TUNEBRIDGE_SERVER_PORT", "9090"),
            ("TUNEBRIDGE_B2_KEY_ID", "key-from-env"),
            ("TUNEBRIDGE_B2_LISTING", "native"),
            ("TUNEBRIDGE_ADMIN_BEARER_TOKENS", "tok_a, tok_b,"),
        ]
        .into_iter()
        .collect();

        let mut config = AppConfig::default();
        config.apply_overrides(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(config.server.port, 9090);
        assert_eq!(config.provider.key_id, "key-from-env");
        assert_eq!(config.provider.listing, ListingBackend::Native);
        assert_eq!(config.auth.admin_bearer_tokens, vec!["tok_a", "tok_b"]);
    }

    #[test]
    fn test_invalid_port_override_is_ignored() {
        let mut config = AppConfig::default();
        config.apply_overrides(|k| (k == "TUNEBRIDGE_SERVER_PORT").then(|| "nope".to_string()));
        assert_eq!(config.server.port, 8080);
    }

    #[test]
    fn test_validate() {
        assert!(valid_config().validate().is_ok());
        assert!(AppConfig::default().validate().is_err());

        let mut native = valid_config();
        native.provider.listing = ListingBackend::Native;
        assert!(native.validate().is_err());
        native.provider.bucket_id = "0edfd3f0f1b8fa7e9d6c0e13".to_string();
        assert!(native.validate().is_ok());

        let mut oversized = valid_config();
        oversized.sync.page_size = 5000;
        assert!(oversized.validate().is_err());
    }

    #[test]
    fn test_describe_hides_application_key() {
        let summary = valid_config().describe();
        assert!(summary.contains("bucket=Music-web"));
        assert!(!summary.contains("K005secret"));
    }
}
